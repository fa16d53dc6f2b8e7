//! Sync queue types
//!
//! Every durable write intent becomes a queue item. Items move
//! `pending -> processing -> completed`, or `processing -> failed`; a failed
//! item is retried until `retry_count` reaches `max_retries`, after which it
//! stays `failed` for manual remediation. An item left in `processing`
//! past the lease (the worker died mid-item) is reclaimed as a failed
//! attempt.

use crate::response::SurveyResponse;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default retry budget for a queue item
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How long an item may stay `processing` before it is presumed abandoned
pub const PROCESSING_LEASE_SECS: i64 = 300;

pub const LEASE_EXPIRED_ERROR: &str = "processing lease expired";

/// Operation recorded in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOperation::Create => write!(f, "CREATE"),
            SyncOperation::Update => write!(f, "UPDATE"),
            SyncOperation::Delete => write!(f, "DELETE"),
        }
    }
}

impl std::str::FromStr for SyncOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(SyncOperation::Create),
            "UPDATE" => Ok(SyncOperation::Update),
            "DELETE" => Ok(SyncOperation::Delete),
            other => Err(format!("unknown sync operation: {}", other)),
        }
    }
}

/// Lifecycle state of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Pending => write!(f, "pending"),
            SyncStatus::Processing => write!(f, "processing"),
            SyncStatus::Completed => write!(f, "completed"),
            SyncStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "processing" => Ok(SyncStatus::Processing),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(format!("unknown sync status: {}", other)),
        }
    }
}

/// A pending write-through operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: String,
    pub key: String,
    pub partition_key: String,
    pub operation: SyncOperation,
    /// Payload snapshot taken when the write was accepted
    pub payload: Option<SurveyResponse>,
    pub status: SyncStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl SyncQueueItem {
    pub fn new(
        id: String,
        operation: SyncOperation,
        key: String,
        partition_key: String,
        payload: Option<SurveyResponse>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            key,
            partition_key,
            operation,
            payload,
            status: SyncStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    /// Ready to be handed to the worker (fresh, or failed with budget left)
    pub fn is_eligible(&self) -> bool {
        match self.status {
            SyncStatus::Pending => true,
            SyncStatus::Failed => self.retry_count < self.max_retries,
            SyncStatus::Processing | SyncStatus::Completed => false,
        }
    }

    /// Claimed by a worker that never reported back
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == SyncStatus::Processing
            && now - self.updated_at >= Duration::seconds(PROCESSING_LEASE_SECS)
    }

    /// Count an abandoned claim as a failed attempt
    pub fn reclaim(&mut self, now: DateTime<Utc>) {
        self.status = SyncStatus::Failed;
        self.retry_count += 1;
        self.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
        self.updated_at = now;
    }

    /// Failed with no retries left
    pub fn is_dead_lettered(&self) -> bool {
        self.status == SyncStatus::Failed && self.retry_count >= self.max_retries
    }
}

/// Queue depth by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    /// Failed items that will still be retried
    pub failed: u64,
    /// Failed items with no retries left
    pub dead_lettered: u64,
}
