//! Detached reconciliation work for fan-out reads
//!
//! List calls hand cache-warming and consistency reports to a bounded queue
//! instead of doing them inline. A supervisor restarts the worker if a job
//! panics, so one bad job does not stop later warming.

use crate::storage::{FastStore, PutOutcome};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tally_core::SurveyResponse;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub enum ReconcileJob {
    /// Copy durable records missing from the fast tier into it
    Warm {
        correlation_id: String,
        responses: Vec<SurveyResponse>,
    },
    /// Record ids the fast tier holds but the durable tier did not return
    Report {
        correlation_id: String,
        client_id: String,
        missing_from_durable: Vec<String>,
    },
}

#[derive(Debug, Default)]
pub struct ReconcilerStats {
    jobs_processed: AtomicU64,
    warmed: AtomicU64,
    consistency_issues: AtomicU64,
    failures: AtomicU64,
    dropped: AtomicU64,
    restarts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilerSnapshot {
    pub jobs_processed: u64,
    pub warmed: u64,
    pub consistency_issues: u64,
    pub failures: u64,
    pub dropped: u64,
    pub restarts: u64,
}

impl ReconcilerStats {
    pub fn snapshot(&self) -> ReconcilerSnapshot {
        ReconcilerSnapshot {
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            warmed: self.warmed.load(Ordering::Relaxed),
            consistency_issues: self.consistency_issues.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

/// Submission side, cloned into every orchestrator
#[derive(Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::Sender<ReconcileJob>,
    stats: Arc<ReconcilerStats>,
}

impl ReconcilerHandle {
    /// Never waits. Returns false if the job was dropped.
    pub fn submit(&self, job: ReconcileJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Reconciler queue full, dropping job");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Reconciler stopped, dropping job");
                false
            }
        }
    }

    pub fn stats(&self) -> ReconcilerSnapshot {
        self.stats.snapshot()
    }
}

struct Worker {
    rx: Mutex<mpsc::Receiver<ReconcileJob>>,
    fast: Arc<FastStore<SurveyResponse>>,
    hot_ttl: chrono::Duration,
    stats: Arc<ReconcilerStats>,
}

pub struct Reconciler {
    worker: Arc<Worker>,
}

impl Reconciler {
    pub fn new(
        fast: Arc<FastStore<SurveyResponse>>,
        hot_ttl: chrono::Duration,
        capacity: usize,
    ) -> (ReconcilerHandle, Reconciler) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(ReconcilerStats::default());
        let handle = ReconcilerHandle {
            tx,
            stats: stats.clone(),
        };
        let worker = Arc::new(Worker {
            rx: Mutex::new(rx),
            fast,
            hot_ttl,
            stats,
        });
        (handle, Reconciler { worker })
    }

    /// Start the supervised worker; it stops on cancellation or once every
    /// handle is dropped.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let worker = self.worker;
        tokio::spawn(async move {
            info!("Reconciler started");
            loop {
                let task = tokio::spawn(worker.clone().run(cancel.clone()));
                match task.await {
                    Ok(()) => break,
                    Err(e) if e.is_panic() && !cancel.is_cancelled() => {
                        worker.stats.restarts.fetch_add(1, Ordering::Relaxed);
                        error!("Reconciler worker panicked, restarting");
                    }
                    Err(_) => break,
                }
            }
            info!("Reconciler stopped");
        })
    }
}

impl Worker {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let job = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    job = rx.recv() => job,
                }
            };
            let Some(job) = job else { return };
            self.handle(job);
            self.stats.jobs_processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn handle(&self, job: ReconcileJob) {
        match job {
            ReconcileJob::Warm {
                correlation_id,
                responses,
            } => {
                let mut warmed = 0u64;
                for response in responses {
                    let updated_at = response.updated_at;
                    let id = response.id.clone();
                    let client_id = response.client_id.clone();
                    match self.fast.set_unless(
                        &id,
                        &client_id,
                        response,
                        Some(self.hot_ttl),
                        |cached| cached.updated_at >= updated_at,
                    ) {
                        Ok(PutOutcome::Written(_)) => warmed += 1,
                        Ok(PutOutcome::Kept(_)) => {}
                        Ok(PutOutcome::Deleted) => {
                            debug!("[{}] Skipped warming deleted {}", correlation_id, id);
                        }
                        Err(e) => {
                            self.stats.failures.fetch_add(1, Ordering::Relaxed);
                            warn!("[{}] Failed to warm {}: {}", correlation_id, id, e);
                        }
                    }
                }
                self.stats.warmed.fetch_add(warmed, Ordering::Relaxed);
                debug!("[{}] Warmed {} responses", correlation_id, warmed);
            }
            ReconcileJob::Report {
                correlation_id,
                client_id,
                missing_from_durable,
            } => {
                self.stats
                    .consistency_issues
                    .fetch_add(missing_from_durable.len() as u64, Ordering::Relaxed);
                warn!(
                    "[{}] {} responses for client {} are cached but not durable yet: {:?}",
                    correlation_id,
                    missing_from_durable.len(),
                    client_id,
                    missing_from_durable
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FastStoreConfig;
    use chrono::{Duration, Utc};
    use tally_core::ports::ManualClock;
    use tally_core::{CustomFields, ResponseStatus};

    fn response(id: &str, updated_at: chrono::DateTime<Utc>) -> SurveyResponse {
        SurveyResponse {
            id: id.to_string(),
            client_id: "acme".to_string(),
            survey_id: "q3-nps".to_string(),
            score: 8,
            status: ResponseStatus::Received,
            comment: None,
            custom_fields: CustomFields::new(),
            created_at: updated_at,
            updated_at,
        }
    }

    fn fast_store() -> Arc<FastStore<SurveyResponse>> {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        Arc::new(FastStore::new(clock, FastStoreConfig::default()))
    }

    async fn wait_for_jobs(handle: &ReconcilerHandle, jobs: u64) {
        for _ in 0..100 {
            if handle.stats().jobs_processed >= jobs {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("reconciler did not process {} jobs", jobs);
    }

    #[tokio::test]
    async fn test_warm_never_overwrites_newer_cache() {
        let fast = fast_store();
        let now = Utc::now();
        let mut cached = response("r1", now);
        cached.status = ResponseStatus::Flagged;
        fast.set("r1", "acme", cached, None).unwrap();

        let (handle, reconciler) = Reconciler::new(fast.clone(), Duration::hours(1), 8);
        let cancel = CancellationToken::new();
        let task = reconciler.spawn(cancel.clone());

        assert!(handle.submit(ReconcileJob::Warm {
            correlation_id: "c1".to_string(),
            responses: vec![
                response("r1", now - Duration::seconds(5)),
                response("r2", now),
            ],
        }));
        wait_for_jobs(&handle, 1).await;

        assert_eq!(
            fast.peek("r1", "acme").unwrap().payload.status,
            ResponseStatus::Flagged
        );
        assert!(fast.exists("r2", "acme"));
        assert_eq!(handle.stats().warmed, 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_warm_skips_deleted() {
        let fast = fast_store();
        let now = Utc::now();
        fast.set("r1", "acme", response("r1", now), None).unwrap();
        assert!(fast.delete("r1", "acme"));

        let (handle, reconciler) = Reconciler::new(fast.clone(), Duration::hours(1), 8);
        let cancel = CancellationToken::new();
        let task = reconciler.spawn(cancel.clone());

        assert!(handle.submit(ReconcileJob::Warm {
            correlation_id: "c1".to_string(),
            responses: vec![response("r1", now)],
        }));
        wait_for_jobs(&handle, 1).await;

        assert!(!fast.exists("r1", "acme"));
        assert!(fast.is_tombstoned("r1", "acme"));
        assert_eq!(handle.stats().warmed, 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reports_are_counted() {
        let (handle, reconciler) = Reconciler::new(fast_store(), Duration::hours(1), 8);
        let cancel = CancellationToken::new();
        let task = reconciler.spawn(cancel.clone());

        handle.submit(ReconcileJob::Report {
            correlation_id: "c1".to_string(),
            client_id: "acme".to_string(),
            missing_from_durable: vec!["r1".to_string(), "r2".to_string()],
        });
        wait_for_jobs(&handle, 1).await;
        assert_eq!(handle.stats().consistency_issues, 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        // Worker never started, so the queue only fills
        let (handle, _reconciler) = Reconciler::new(fast_store(), Duration::hours(1), 1);
        let job = ReconcileJob::Warm {
            correlation_id: "c1".to_string(),
            responses: Vec::new(),
        };

        assert!(handle.submit(job.clone()));
        assert!(!handle.submit(job));
        assert_eq!(handle.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_worker_stops_when_handles_drop() {
        let (handle, reconciler) = Reconciler::new(fast_store(), Duration::hours(1), 4);
        let task = reconciler.spawn(CancellationToken::new());
        drop(handle);
        task.await.unwrap();
    }
}
