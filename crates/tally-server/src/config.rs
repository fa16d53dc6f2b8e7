//! Server configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! TOML file (`TALLY_CONFIG`, or `tally.toml` in the working directory),
//! then `TALLY__SECTION__KEY` environment variables.

use crate::services::{OrchestratorConfig, SyncWorkerConfig};
use crate::storage::FastStoreConfig;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tally_core::{Result, TallyError};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub cache: CacheSettings,
    pub orchestrator: OrchestratorSettings,
    pub sync: SyncSettings,
    pub rate_limit: RateLimitSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local collaborators; nothing survives a restart
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub database_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            database_path: "data/tally.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_items: usize,
    pub hot_ttl_secs: u64,
    pub tombstone_retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_items: 100_000,
            hot_ttl_secs: 24 * 60 * 60,
            tombstone_retention_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub list_deadline_ms: u64,
    pub warm_batch_limit: usize,
    pub reconciler_capacity: usize,
    pub health_check_timeout_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            list_deadline_ms: 10_000,
            warm_batch_limit: 10,
            reconciler_capacity: 256,
            health_check_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub tick_secs: u64,
    pub batch_size: usize,
    pub error_backoff_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            tick_secs: 5,
            batch_size: 100,
            error_backoff_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// 0 disables limiting
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: 120,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directives; `RUST_LOG` wins when set
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info,tally_server=debug".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let path = std::env::var("TALLY_CONFIG").ok();
        Self::load_from(path.as_deref().map(Path::new))
    }

    /// `path` must exist when given; otherwise `tally.toml` is optional
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("tally").required(false),
        };

        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("TALLY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| TallyError::Config(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        let checks = [
            (self.cache.max_items == 0, "cache.max_items must be positive"),
            (self.cache.sweep_interval_secs == 0, "cache.sweep_interval_secs must be positive"),
            (self.sync.tick_secs == 0, "sync.tick_secs must be positive"),
            (self.sync.batch_size == 0, "sync.batch_size must be positive"),
            (self.orchestrator.list_deadline_ms == 0, "orchestrator.list_deadline_ms must be positive"),
            (self.orchestrator.reconciler_capacity == 0, "orchestrator.reconciler_capacity must be positive"),
            (
                self.rate_limit.max_requests > 0 && self.rate_limit.window_secs == 0,
                "rate_limit.window_secs must be positive",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(TallyError::Config(message.to_string())),
            None => Ok(()),
        }
    }

    pub fn hot_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache.hot_ttl_secs as i64)
    }

    pub fn fast_store_config(&self) -> FastStoreConfig {
        FastStoreConfig {
            max_items: self.cache.max_items,
            tombstone_retention: chrono::Duration::seconds(
                self.cache.tombstone_retention_secs as i64,
            ),
            sweep_interval: Duration::from_secs(self.cache.sweep_interval_secs),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            hot_ttl: self.hot_ttl(),
            list_deadline: Duration::from_millis(self.orchestrator.list_deadline_ms),
            warm_batch_limit: self.orchestrator.warm_batch_limit,
            health_check_timeout: Duration::from_millis(self.orchestrator.health_check_timeout_ms),
        }
    }

    pub fn sync_worker_config(&self) -> SyncWorkerConfig {
        SyncWorkerConfig {
            tick: Duration::from_secs(self.sync.tick_secs),
            batch_size: self.sync.batch_size,
            error_backoff: Duration::from_secs(self.sync.error_backoff_secs),
            hot_ttl: self.hot_ttl(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.hot_ttl(), chrono::Duration::hours(24));

        let orchestrator = settings.orchestrator_config();
        assert_eq!(orchestrator.list_deadline, Duration::from_secs(10));
        assert_eq!(orchestrator.warm_batch_limit, 10);

        let sync = settings.sync_worker_config();
        assert_eq!(sync.tick, Duration::from_secs(5));
        assert_eq!(sync.batch_size, 100);
        assert_eq!(sync.error_backoff, Duration::from_secs(30));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.toml");
        std::fs::write(
            &path,
            r#"
            [storage]
            backend = "memory"

            [sync]
            batch_size = 25

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        let settings = Settings::load_from(Some(&path)).unwrap();
        assert_eq!(settings.storage.backend, StorageBackend::Memory);
        assert_eq!(settings.sync.batch_size, 25);
        assert_eq!(settings.logging.format, LogFormat::Json);
        // Untouched keys keep their defaults
        assert_eq!(settings.sync.tick_secs, 5);
        assert_eq!(settings.cache.max_items, 100_000);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.toml");
        std::fs::write(&path, "[sync]\nbatch_size = 0\n").unwrap();

        let err = Settings::load_from(Some(&path)).unwrap_err();
        assert!(matches!(err, TallyError::Config(message) if message.contains("batch_size")));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            Settings::load_from(Some(&path)),
            Err(TallyError::Config(_))
        ));
    }
}
