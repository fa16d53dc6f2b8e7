//! Storage traits for the two collaborators of the fast tier

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_types::{QueueStats, SurveyResponse, SyncQueueItem};

/// Durable source of truth for survey responses
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<SurveyResponse>>;

    /// Newest first (`created_at` descending, `id` ascending on ties)
    async fn get_by_client_id(
        &self,
        client_id: &str,
        skip: usize,
        take: usize,
    ) -> Result<Vec<SurveyResponse>>;

    async fn create(&self, response: &SurveyResponse) -> Result<()>;

    /// Fails with `TallyError::NotFound` if the id does not exist
    async fn update(&self, response: &SurveyResponse) -> Result<()>;

    /// Returns whether a record was removed
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn count_by_client_id(&self, client_id: &str) -> Result<u64>;

    /// Mean score of a client's responses created in `[from, to)`
    async fn average_score(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<f64>>;

    /// Cheap liveness check
    async fn ping(&self) -> Result<()>;
}

/// Ordered record of pending write-through operations
#[async_trait]
pub trait SyncQueue: Send + Sync {
    /// Returns the item id (the caller's processing id)
    async fn enqueue(&self, item: SyncQueueItem) -> Result<String>;

    /// Oldest eligible items first: pending, or failed with retries left
    async fn dequeue_batch(&self, limit: usize) -> Result<Vec<SyncQueueItem>>;

    async fn mark_processing(&self, id: &str) -> Result<()>;

    async fn mark_processed(&self, id: &str) -> Result<()>;

    /// Records the error and consumes one retry
    async fn mark_failed(&self, id: &str, error: &str) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<SyncQueueItem>>;

    /// Number of pending items
    async fn len(&self) -> Result<u64>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    async fn stats(&self) -> Result<QueueStats>;
}
