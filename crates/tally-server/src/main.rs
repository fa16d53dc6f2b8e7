//! Tally Server
//!
//! Survey response ingestion over two storage tiers: an in-process fast
//! store for reads and fresh writes, and a durable relational store that is
//! reached through a sync queue drained in the background.

mod config;
mod handlers;
mod services;
mod storage;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tally_core::adapters::{MemoryRelationalStore, MemorySyncQueue};
use tally_core::ports::{Clock, RelationalStore, SyncQueue, SystemClock};
use tally_core::SurveyResponse;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, Settings, StorageBackend};
use services::{RateLimiter, Reconciler, StorageOrchestrator, SyncWorker};
use storage::{Database, FastStore};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<StorageOrchestrator>,
    pub rate_limiter: Arc<RateLimiter>,
}

#[tokio::main]
async fn main() {
    // Set up panic hook to log crashes
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()));
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        eprintln!("[PANIC] at {:?}: {}", location, payload);
        tracing::error!("PANIC at {:?}: {}", location, payload);
    }));

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("[FATAL] Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&settings) {
        eprintln!("[FATAL] Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!("Starting Tally Server v{}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    if let Err(e) = run_server(settings).await {
        error!("Server failed: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(settings: &Settings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.logging.filter))
        .context("Invalid log filter")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match settings.logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("{}", e))
}

async fn run_server(settings: Settings) -> Result<()> {
    info!(
        "Config loaded: bind={}, backend={:?}",
        settings.server.bind_address, settings.storage.backend
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    let (relational, queue): (Arc<dyn RelationalStore>, Arc<dyn SyncQueue>) =
        match settings.storage.backend {
            StorageBackend::Sqlite => {
                info!("Initializing SQLite database...");
                let db = Arc::new(
                    Database::new(&settings.storage.database_path, clock.clone())
                        .await
                        .context("Failed to initialize database")?,
                );
                info!(
                    "SQLite database initialized at: {}",
                    settings.storage.database_path
                );
                let relational: Arc<dyn RelationalStore> = db.clone();
                let queue: Arc<dyn SyncQueue> = db;
                (relational, queue)
            }
            StorageBackend::Memory => {
                info!("Using in-memory collaborators; data will not survive a restart");
                let relational: Arc<dyn RelationalStore> = Arc::new(MemoryRelationalStore::new());
                let queue: Arc<dyn SyncQueue> = Arc::new(MemorySyncQueue::new(clock.clone()));
                (relational, queue)
            }
        };

    let cancel = CancellationToken::new();

    info!("Initializing fast store...");
    let fast: Arc<FastStore<SurveyResponse>> =
        Arc::new(FastStore::new(clock.clone(), settings.fast_store_config()));
    let sweeper = fast.clone().spawn_sweeper(cancel.clone());

    info!("Initializing services...");
    let (reconciler, reconciler_worker) = Reconciler::new(
        fast.clone(),
        settings.hot_ttl(),
        settings.orchestrator.reconciler_capacity,
    );
    let reconciler_task = reconciler_worker.spawn(cancel.clone());

    let sync_worker = SyncWorker::new(
        queue.clone(),
        relational.clone(),
        fast.clone(),
        settings.sync_worker_config(),
    );
    let sync_task = sync_worker.spawn(cancel.clone());

    let orchestrator = Arc::new(StorageOrchestrator::new(
        fast,
        relational,
        queue,
        reconciler,
        clock.clone(),
        settings.orchestrator_config(),
    ));

    let rate_limiter = Arc::new(RateLimiter::new(
        settings.rate_limit.max_requests,
        chrono::Duration::seconds(settings.rate_limit.window_secs as i64),
        clock,
    ));
    let pruner = spawn_rate_limit_pruner(
        rate_limiter.clone(),
        std::time::Duration::from_secs(settings.cache.sweep_interval_secs),
        cancel.clone(),
    );
    info!("Services initialized");

    let state = AppState {
        orchestrator,
        rate_limiter,
    };

    info!("Building HTTP router...");
    let app = handlers::router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = settings
        .server
        .bind_address
        .parse()
        .context("Failed to parse bind address")?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!("Server ready to accept connections");
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    cancel.cancel();
    for task in [sweeper, reconciler_task, sync_task, pruner] {
        if let Err(e) = task.await {
            error!("Background task ended abnormally: {}", e);
        }
    }

    info!("Server stopped");
    Ok(())
}

fn spawn_rate_limit_pruner(
    limiter: Arc<RateLimiter>,
    period: std::time::Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let pruned = limiter.prune();
                    if pruned > 0 {
                        tracing::debug!("Pruned {} idle rate-limit windows", pruned);
                    }
                }
            }
        }
    })
}
