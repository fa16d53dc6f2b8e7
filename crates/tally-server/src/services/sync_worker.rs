//! Background replay of queued durable writes
//!
//! Drains the sync queue on a fixed tick: each item is written through to
//! the relational store and then replayed into the fast store. Failures
//! consume one retry; an item that runs out stays `failed` for good.

use crate::storage::FastStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tally_core::ports::{RelationalStore, SyncQueue};
use tally_core::{Result, SurveyResponse, SyncOperation, SyncQueueItem, TallyError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SyncWorkerConfig {
    pub tick: Duration,
    pub batch_size: usize,
    /// Pause after a loop-level failure (queue unreachable and the like)
    pub error_backoff: Duration,
    /// TTL for records replayed into the fast store
    pub hot_ttl: chrono::Duration,
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            batch_size: 100,
            error_backoff: Duration::from_secs(30),
            hot_ttl: chrono::Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failures that used up the item's last retry
    pub dead_lettered: usize,
}

pub struct SyncWorker {
    queue: Arc<dyn SyncQueue>,
    relational: Arc<dyn RelationalStore>,
    fast: Arc<FastStore<SurveyResponse>>,
    config: SyncWorkerConfig,
}

impl SyncWorker {
    pub fn new(
        queue: Arc<dyn SyncQueue>,
        relational: Arc<dyn RelationalStore>,
        fast: Arc<FastStore<SurveyResponse>>,
        config: SyncWorkerConfig,
    ) -> Self {
        Self {
            queue,
            relational,
            fast,
            config,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Sync worker started (tick {:?}, batch {})",
            self.config.tick, self.config.batch_size
        );
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.process_batch().await {
                Ok(outcome) if outcome.processed > 0 => {
                    info!(
                        "Sync batch: {} processed, {} succeeded, {} failed, {} dead-lettered",
                        outcome.processed,
                        outcome.succeeded,
                        outcome.failed,
                        outcome.dead_lettered
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(
                        "Sync batch failed: {}. Backing off for {:?}",
                        e, self.config.error_backoff
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        info!("Sync worker stopped");
    }

    /// Drain one batch of eligible items.
    ///
    /// Only the dequeue can fail the batch. A queue error on a single item
    /// is logged and the item is left for the processing lease to reclaim.
    pub async fn process_batch(&self) -> Result<BatchOutcome> {
        let batch = self.queue.dequeue_batch(self.config.batch_size).await?;
        let mut outcome = BatchOutcome::default();

        for item in batch {
            outcome.processed += 1;
            if let Err(e) = self.queue.mark_processing(&item.id).await {
                warn!("Could not claim sync item {}: {}", item.id, e);
                outcome.failed += 1;
                continue;
            }

            match self.apply(&item).await {
                Ok(()) => {
                    if let Err(e) = self.queue.mark_processed(&item.id).await {
                        warn!("Synced item {} but could not record it: {}", item.id, e);
                        outcome.failed += 1;
                        continue;
                    }
                    outcome.succeeded += 1;
                    debug!(
                        "Synced {} {}/{} ({})",
                        item.operation, item.partition_key, item.key, item.id
                    );
                }
                Err(e) => {
                    outcome.failed += 1;
                    if let Err(mark_err) = self.queue.mark_failed(&item.id, &e.to_string()).await {
                        warn!(
                            "Sync item {} failed ({}) and could not be marked: {}",
                            item.id, e, mark_err
                        );
                        continue;
                    }
                    if item.retry_count + 1 >= item.max_retries {
                        outcome.dead_lettered += 1;
                        error!(
                            "Sync item {} ({} {}/{}) exhausted {} retries: {}",
                            item.id,
                            item.operation,
                            item.partition_key,
                            item.key,
                            item.max_retries,
                            e
                        );
                    } else {
                        warn!(
                            "Sync item {} failed (attempt {}/{}): {}",
                            item.id,
                            item.retry_count + 1,
                            item.max_retries,
                            e
                        );
                    }
                }
            }
        }

        Ok(outcome)
    }

    async fn apply(&self, item: &SyncQueueItem) -> Result<()> {
        match item.operation {
            SyncOperation::Create => {
                let response = payload(item)?;
                match self.relational.update(response).await {
                    Err(TallyError::NotFound(_)) => self.relational.create(response).await?,
                    other => other?,
                }
                self.replay(response);
            }
            SyncOperation::Update => {
                let response = payload(item)?;
                self.relational.update(response).await?;
                self.replay(response);
            }
            SyncOperation::Delete => {
                self.relational.delete(&item.key).await?;
                self.fast.delete(&item.key, &item.partition_key);
            }
        }
        Ok(())
    }

    /// The durable write already succeeded, so a cache miss here only logs
    fn replay(&self, response: &SurveyResponse) {
        let updated_at = response.updated_at;
        if let Err(e) = self.fast.set_unless(
            &response.id,
            &response.client_id,
            response.clone(),
            Some(self.config.hot_ttl),
            |cached| cached.updated_at > updated_at,
        ) {
            warn!(
                "Failed to replay {}/{} into fast store: {}",
                response.client_id, response.id, e
            );
        }
    }
}

fn payload(item: &SyncQueueItem) -> Result<&SurveyResponse> {
    item.payload.as_ref().ok_or_else(|| {
        TallyError::Serialization(format!("{} sync item {} has no payload", item.operation, item.id))
    })
}
