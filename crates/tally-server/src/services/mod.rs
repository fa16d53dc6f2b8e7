//! Business logic services

pub mod orchestrator;
pub mod rate_limit;
pub mod reconciler;
pub mod sync_worker;

pub use orchestrator::{OrchestratorConfig, StorageOrchestrator};
pub use rate_limit::RateLimiter;
pub use reconciler::Reconciler;
pub use sync_worker::{SyncWorker, SyncWorkerConfig};
