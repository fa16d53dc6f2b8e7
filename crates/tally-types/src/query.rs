//! Result shapes returned to the serving layer

use crate::item::Version;
use crate::response::SurveyResponse;
use serde::{Deserialize, Serialize};

/// Outcome of a fan-out list query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedQueryResult<T> {
    pub items: Vec<T>,
    pub metadata: QueryMetadata,
}

/// Where the results came from and how the query went
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub correlation_id: String,
    pub fast_store_count: usize,
    pub relational_count: usize,
    pub fast_store_latency_ms: Option<u64>,
    pub relational_latency_ms: Option<u64>,
    /// Distinct ids after merging both sources
    pub unique_count: usize,
    /// Records the client has across both tiers. Past the durable window
    /// this uses the durable row count.
    pub total: usize,
    /// Ids handed to the reconciler for warming
    pub cache_warmed_count: usize,
    /// Ids cached but unknown to the source of truth
    pub consistency_issue_count: usize,
    pub fallback_used: bool,
    pub warnings: Vec<String>,
    pub skip: usize,
    pub take: usize,
}

/// Tier availability reported for a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Available,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurableStatus {
    Queued,
}

/// Acknowledgement for an accepted write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub status: String,
    pub cache_status: CacheStatus,
    pub durable_status: DurableStatus,
    pub processing_id: String,
    pub version: Version,
    pub response: SurveyResponse,
}

/// Result of a conditional update
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Updated {
        version: Version,
        processing_id: String,
        response: SurveyResponse,
    },
    Conflict {
        current_version: Option<Version>,
    },
}

/// Result of a forced resync from the source of truth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ForceSyncOutcome {
    Refreshed { version: Version },
    Evicted,
}

/// Fast tier counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FastStoreMetrics {
    /// Physically present entries, including tombstones not yet swept
    pub total_items: usize,
    pub live_items: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub avg_latency_us: f64,
    pub expired_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health result for one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub detail: Option<String>,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            detail: None,
            latency_ms: Some(latency_ms),
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            detail: Some(detail.into()),
            latency_ms: None,
        }
    }
}

/// Sync queue health, with real depths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHealth {
    pub status: HealthStatus,
    pub detail: Option<String>,
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub fast_store: ComponentHealth,
    pub relational_store: ComponentHealth,
    pub sync: SyncHealth,
}

impl HealthReport {
    /// Overall status is the worst of the components
    pub fn new(fast_store: ComponentHealth, relational_store: ComponentHealth, sync: SyncHealth) -> Self {
        let status = [fast_store.status, relational_store.status, sync.status]
            .into_iter()
            .max_by_key(|s| match s {
                HealthStatus::Healthy => 0,
                HealthStatus::Degraded => 1,
                HealthStatus::Unhealthy => 2,
            })
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            fast_store,
            relational_store,
            sync,
        }
    }
}
