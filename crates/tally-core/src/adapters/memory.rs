//! In-memory relational store and sync queue
//!
//! Back the `memory` storage backend and the test suites. Both can be told
//! to slow down or fail so degradation paths can be exercised.

use crate::ports::{Clock, RelationalStore, SyncQueue};
use crate::{Result, TallyError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tally_types::{newest_first, QueueStats, SurveyResponse, SyncQueueItem, SyncStatus};
use tokio::sync::RwLock;

const RELATIONAL: &str = "relational_store";
const QUEUE: &str = "sync_queue";

/// HashMap-backed source of truth
#[derive(Default)]
pub struct MemoryRelationalStore {
    rows: RwLock<HashMap<String, SurveyResponse>>,
    latency_ms: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Write a row directly, bypassing fault injection
    pub async fn seed(&self, response: SurveyResponse) {
        self.rows.write().await.insert(response.id.clone(), response);
    }

    async fn before_read(&self) -> Result<()> {
        self.delay().await;
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(TallyError::upstream(RELATIONAL, "read failure injected"));
        }
        Ok(())
    }

    async fn before_write(&self) -> Result<()> {
        self.delay().await;
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(TallyError::upstream(RELATIONAL, "write failure injected"));
        }
        Ok(())
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<SurveyResponse>> {
        self.before_read().await?;
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn get_by_client_id(
        &self,
        client_id: &str,
        skip: usize,
        take: usize,
    ) -> Result<Vec<SurveyResponse>> {
        self.before_read().await?;
        let rows = self.rows.read().await;
        let mut matching: Vec<SurveyResponse> = rows
            .values()
            .filter(|r| r.client_id == client_id)
            .cloned()
            .collect();
        matching.sort_by(newest_first);
        Ok(matching.into_iter().skip(skip).take(take).collect())
    }

    async fn create(&self, response: &SurveyResponse) -> Result<()> {
        self.before_write().await?;
        self.rows
            .write()
            .await
            .insert(response.id.clone(), response.clone());
        Ok(())
    }

    async fn update(&self, response: &SurveyResponse) -> Result<()> {
        self.before_write().await?;
        let mut rows = self.rows.write().await;
        match rows.get_mut(&response.id) {
            Some(row) => {
                *row = response.clone();
                Ok(())
            }
            None => Err(TallyError::NotFound(response.id.clone())),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.before_write().await?;
        Ok(self.rows.write().await.remove(id).is_some())
    }

    async fn count_by_client_id(&self, client_id: &str) -> Result<u64> {
        self.before_read().await?;
        let rows = self.rows.read().await;
        Ok(rows.values().filter(|r| r.client_id == client_id).count() as u64)
    }

    async fn average_score(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        self.before_read().await?;
        let rows = self.rows.read().await;
        let scores: Vec<f64> = rows
            .values()
            .filter(|r| r.client_id == client_id && r.created_at >= from && r.created_at < to)
            .map(|r| r.score as f64)
            .collect();

        if scores.is_empty() {
            return Ok(None);
        }
        Ok(Some(scores.iter().sum::<f64>() / scores.len() as f64))
    }

    async fn ping(&self) -> Result<()> {
        self.before_read().await
    }
}

/// Vec-backed queue preserving enqueue order
pub struct MemorySyncQueue {
    items: RwLock<Vec<SyncQueueItem>>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl MemorySyncQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every call fail, as if the queue backend were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(TallyError::upstream(QUEUE, "queue unavailable"));
        }
        Ok(())
    }

    async fn transition<F>(&self, id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut SyncQueueItem, DateTime<Utc>),
    {
        self.check_available()?;
        let now = self.clock.now();
        let mut items = self.items.write().await;
        let item = items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| TallyError::NotFound(format!("sync item {}", id)))?;
        apply(item, now);
        item.updated_at = now;
        Ok(())
    }
}

#[async_trait]
impl SyncQueue for MemorySyncQueue {
    async fn enqueue(&self, item: SyncQueueItem) -> Result<String> {
        self.check_available()?;
        let id = item.id.clone();
        self.items.write().await.push(item);
        Ok(id)
    }

    async fn dequeue_batch(&self, limit: usize) -> Result<Vec<SyncQueueItem>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut items = self.items.write().await;
        for item in items.iter_mut().filter(|item| item.lease_expired(now)) {
            item.reclaim(now);
        }
        let mut batch = Vec::new();
        for item in items.iter_mut().filter(|item| item.is_eligible()).take(limit) {
            // failed -> pending: the retry is re-armed here
            if item.status == SyncStatus::Failed {
                item.status = SyncStatus::Pending;
                item.updated_at = now;
            }
            batch.push(item.clone());
        }
        Ok(batch)
    }

    async fn mark_processing(&self, id: &str) -> Result<()> {
        self.transition(id, |item, _| item.status = SyncStatus::Processing)
            .await
    }

    async fn mark_processed(&self, id: &str) -> Result<()> {
        self.transition(id, |item, now| {
            item.status = SyncStatus::Completed;
            item.processed_at = Some(now);
            item.last_error = None;
        })
        .await
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        self.transition(id, |item, _| {
            item.status = SyncStatus::Failed;
            item.retry_count += 1;
            item.last_error = Some(error.to_string());
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<SyncQueueItem>> {
        self.check_available()?;
        let items = self.items.read().await;
        Ok(items.iter().find(|item| item.id == id).cloned())
    }

    async fn len(&self) -> Result<u64> {
        self.check_available()?;
        let items = self.items.read().await;
        Ok(items
            .iter()
            .filter(|item| item.status == SyncStatus::Pending)
            .count() as u64)
    }

    async fn stats(&self) -> Result<QueueStats> {
        self.check_available()?;
        let items = self.items.read().await;
        let mut stats = QueueStats::default();
        for item in items.iter() {
            match item.status {
                SyncStatus::Pending => stats.pending += 1,
                SyncStatus::Processing => stats.processing += 1,
                SyncStatus::Completed => stats.completed += 1,
                SyncStatus::Failed if item.is_dead_lettered() => stats.dead_lettered += 1,
                SyncStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
