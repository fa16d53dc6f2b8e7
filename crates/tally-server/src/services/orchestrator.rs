//! Coordination of the fast tier and the durable source of truth
//!
//! Writes land in the fast store first and reach durable storage only
//! through the sync queue. Reads are cache-first; list queries fan out to
//! both tiers under a single deadline and merge what comes back.

use crate::services::reconciler::{ReconcileJob, ReconcilerHandle};
use crate::storage::{CasResult, FastStore, Lookup, PutOutcome};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tally_core::ports::{Clock, RelationalStore, SyncQueue};
use tally_core::{
    newest_first, CacheStatus, ComponentHealth, CreateResponseRequest, DurableStatus,
    FastStoreMetrics, ForceSyncOutcome, HealthReport, HealthStatus, MergedQueryResult,
    QueryMetadata, ResponsePatch, Result, SurveyResponse, SyncHealth, SyncOperation,
    SyncQueueItem, TallyError, UpdateOutcome, Version, WriteReceipt,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// TTL for every fast-store write made by the orchestrator
    pub hot_ttl: chrono::Duration,
    /// Shared deadline for both branches of a list query
    pub list_deadline: Duration,
    /// Most durable-only records handed to the reconciler per list call
    pub warm_batch_limit: usize,
    pub health_check_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            hot_ttl: chrono::Duration::hours(24),
            list_deadline: Duration::from_secs(10),
            warm_batch_limit: 10,
            health_check_timeout: Duration::from_secs(2),
        }
    }
}

pub struct StorageOrchestrator {
    fast: Arc<FastStore<SurveyResponse>>,
    relational: Arc<dyn RelationalStore>,
    queue: Arc<dyn SyncQueue>,
    reconciler: ReconcilerHandle,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

/// Outcome of one fan-out branch
struct Branch {
    items: std::result::Result<Vec<SurveyResponse>, String>,
    latency_ms: Option<u64>,
}

impl StorageOrchestrator {
    pub fn new(
        fast: Arc<FastStore<SurveyResponse>>,
        relational: Arc<dyn RelationalStore>,
        queue: Arc<dyn SyncQueue>,
        reconciler: ReconcilerHandle,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            fast,
            relational,
            queue,
            reconciler,
            clock,
            config,
        }
    }

    /// Accept a new response: cache it, then queue the durable write
    pub async fn process_write(&self, request: CreateResponseRequest) -> Result<WriteReceipt> {
        request.validate()?;

        let now = self.clock.now();
        let id = request
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let response = SurveyResponse::from_request(request, id, now);

        let version = self.fast.set(
            &response.id,
            &response.client_id,
            response.clone(),
            Some(self.config.hot_ttl),
        )?;

        let processing_id = self
            .enqueue(
                SyncOperation::Create,
                &response.id,
                &response.client_id,
                Some(response.clone()),
            )
            .await?;

        info!(
            "Accepted response {} for client {} (version {}, sync {})",
            response.id, response.client_id, version, processing_id
        );

        Ok(WriteReceipt {
            status: "accepted".to_string(),
            cache_status: CacheStatus::Available,
            durable_status: DurableStatus::Queued,
            processing_id,
            version,
            response,
        })
    }

    /// Patch a response's mutable fields under optimistic concurrency.
    ///
    /// Without `expected_version` the version read here is used, which still
    /// guards against a write landing between the read and the swap.
    pub async fn update(
        &self,
        key: &str,
        partition: &str,
        patch: ResponsePatch,
        expected_version: Option<Version>,
    ) -> Result<UpdateOutcome> {
        patch.validate()?;

        let (mut response, current) = self.load_for_update(key, partition).await?;
        let expected = expected_version.unwrap_or(current);
        if expected != current {
            debug!(
                "Version conflict on {}/{}: expected {}, current {}",
                partition, key, expected, current
            );
            return Ok(UpdateOutcome::Conflict {
                current_version: Some(current),
            });
        }

        response.apply(&patch, self.clock.now());
        match self
            .fast
            .compare_and_swap(key, partition, response.clone(), expected)
        {
            CasResult::Swapped(version) => {
                let processing_id = self
                    .enqueue(SyncOperation::Update, key, partition, Some(response.clone()))
                    .await?;
                info!("Updated response {}/{} to version {}", partition, key, version);
                Ok(UpdateOutcome::Updated {
                    version,
                    processing_id,
                    response,
                })
            }
            CasResult::Mismatch { current } => {
                debug!("Lost update race on {}/{}", partition, key);
                Ok(UpdateOutcome::Conflict {
                    current_version: current,
                })
            }
        }
    }

    /// Tombstone the cached copy and queue the durable delete.
    /// Returns whether the response existed in either tier.
    pub async fn delete(&self, key: &str, partition: &str) -> Result<bool> {
        let cached = self.fast.delete(key, partition);
        if !cached && self.fast.is_tombstoned(key, partition) {
            // Already deleted; its DELETE is queued
            return Ok(false);
        }
        let durable = match self.load_durable(key, partition).await {
            Ok(found) => found.is_some(),
            Err(e) if cached => {
                warn!("Durable lookup failed while deleting {}/{}: {}", partition, key, e);
                false
            }
            Err(e) => return Err(e),
        };

        if !cached && !durable {
            return Ok(false);
        }

        self.enqueue(SyncOperation::Delete, key, partition, None)
            .await?;
        info!("Deleted response {}/{}", partition, key);
        Ok(true)
    }

    /// Cache-first read; a miss is served from the durable tier and warmed.
    /// A recent delete wins over a durable copy that has not caught up.
    pub async fn get(&self, key: &str, partition: &str) -> Result<Option<SurveyResponse>> {
        match self.fast.lookup(key, partition) {
            Lookup::Live(item) => {
                debug!("Cache hit for {}/{}", partition, key);
                return Ok(Some(item.payload));
            }
            Lookup::Tombstoned => {
                debug!("{}/{} was deleted", partition, key);
                return Ok(None);
            }
            Lookup::Absent => {}
        }

        let Some(response) = self.load_durable(key, partition).await? else {
            debug!("{}/{} not found in either tier", partition, key);
            return Ok(None);
        };

        match self.warm(response.clone()) {
            Ok(PutOutcome::Deleted) => {
                debug!("{}/{} was deleted while being read", partition, key);
                return Ok(None);
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to warm {}/{}: {}", partition, key, e),
        }
        Ok(Some(response))
    }

    /// Fan-out list across both tiers, merged and paged newest first
    pub async fn list(
        &self,
        client_id: &str,
        skip: usize,
        take: usize,
    ) -> Result<MergedQueryResult<SurveyResponse>> {
        let correlation_id = uuid::Uuid::now_v7().to_string();
        let deadline = tokio::time::Instant::now() + self.config.list_deadline;
        let window = skip.saturating_add(take);

        let fast = self.fast.clone();
        let client = client_id.to_string();
        let fast_task = tokio::spawn(async move {
            let started = Instant::now();
            let items: Vec<SurveyResponse> = fast
                .query(&client, None)
                .into_iter()
                .map(|item| item.payload)
                .collect();
            let deleted = fast.tombstoned_keys(&client);
            (items, deleted, started.elapsed())
        });

        let relational = self.relational.clone();
        let client = client_id.to_string();
        let durable_task = tokio::spawn(async move {
            let started = Instant::now();
            let rows = relational.get_by_client_id(&client, 0, window).await;
            // A full window may not be all of the client's rows
            let count = match &rows {
                Ok(rows) if rows.len() >= window => {
                    match relational.count_by_client_id(&client).await {
                        Ok(count) => Some(count),
                        Err(e) => {
                            warn!("Counting responses for {} failed: {}", client, e);
                            None
                        }
                    }
                }
                _ => None,
            };
            (rows, count, started.elapsed())
        });

        // A branch that misses the deadline keeps running detached; its
        // result is dropped.
        let (fast_joined, durable_joined) = tokio::join!(
            tokio::time::timeout_at(deadline, fast_task),
            tokio::time::timeout_at(deadline, durable_task),
        );

        let mut deleted: HashSet<String> = HashSet::new();
        let fast_branch = match fast_joined {
            Ok(Ok((items, tombstoned, elapsed))) => {
                deleted = tombstoned;
                Branch {
                    items: Ok(items),
                    latency_ms: Some(elapsed.as_millis() as u64),
                }
            }
            Ok(Err(e)) => Branch {
                items: Err(format!("fast store query failed: {}", e)),
                latency_ms: None,
            },
            Err(_) => Branch {
                items: Err(TallyError::Timeout(format!(
                    "fast store query after {:?}",
                    self.config.list_deadline
                ))
                .to_string()),
                latency_ms: None,
            },
        };

        let mut durable_count = None;
        let durable_branch = match durable_joined {
            Ok(Ok((Ok(rows), count, elapsed))) => {
                durable_count = count;
                Branch {
                    items: Ok(rows),
                    latency_ms: Some(elapsed.as_millis() as u64),
                }
            }
            Ok(Ok((Err(e), _, elapsed))) => Branch {
                items: Err(format!("relational store query failed: {}", e)),
                latency_ms: Some(elapsed.as_millis() as u64),
            },
            Ok(Err(e)) => Branch {
                items: Err(format!("relational store query failed: {}", e)),
                latency_ms: None,
            },
            Err(_) => Branch {
                items: Err(TallyError::Timeout(format!(
                    "relational store query after {:?}",
                    self.config.list_deadline
                ))
                .to_string()),
                latency_ms: None,
            },
        };

        let mut metadata = QueryMetadata {
            correlation_id: correlation_id.clone(),
            fast_store_latency_ms: fast_branch.latency_ms,
            relational_latency_ms: durable_branch.latency_ms,
            skip,
            take,
            ..Default::default()
        };

        let (fast_items, durable_items) = match (fast_branch.items, durable_branch.items) {
            (Err(fast_err), Err(durable_err)) => {
                warn!("[{}] Both tiers failed for {}", correlation_id, client_id);
                return Err(TallyError::upstream(
                    "fast_store+relational_store",
                    format!("{}; {}", fast_err, durable_err),
                ));
            }
            (fast, durable) => {
                for err in [fast.as_ref().err(), durable.as_ref().err()]
                    .into_iter()
                    .flatten()
                {
                    warn!("[{}] {}", correlation_id, err);
                    metadata.warnings.push(err.clone());
                    metadata.fallback_used = true;
                }
                (fast.ok(), durable.ok())
            }
        };

        metadata.fast_store_count = fast_items.as_ref().map_or(0, Vec::len);
        metadata.relational_count = durable_items.as_ref().map_or(0, Vec::len);

        // Reconciliation needs both sides
        if let (Some(fast), Some(durable)) = (&fast_items, &durable_items) {
            self.reconcile(
                &correlation_id,
                client_id,
                fast,
                durable,
                &deleted,
                window,
                &mut metadata,
            );
        }

        // Deletes the durable tier has not applied yet
        let mut deleted_in_window = 0;
        let durable_items = durable_items.map(|rows| {
            let before = rows.len();
            let kept: Vec<SurveyResponse> = rows
                .into_iter()
                .filter(|r| !deleted.contains(&r.id))
                .collect();
            deleted_in_window = before - kept.len();
            kept
        });

        let merged = merge_responses(
            fast_items.unwrap_or_default(),
            durable_items.unwrap_or_default(),
        );
        metadata.unique_count = merged.len();
        metadata.total = match durable_count {
            // Rows past the window are only counted; fast-only records
            // inside it are not in the count yet
            Some(count) => (count as usize)
                .saturating_sub(deleted_in_window)
                .saturating_add(metadata.consistency_issue_count)
                .max(merged.len()),
            None => merged.len(),
        };
        let items: Vec<SurveyResponse> = merged.into_iter().skip(skip).take(take).collect();

        debug!(
            "[{}] Listed {} of {} responses for {} (fast {}, durable {}, fallback {})",
            correlation_id,
            items.len(),
            metadata.total,
            client_id,
            metadata.fast_store_count,
            metadata.relational_count,
            metadata.fallback_used
        );

        Ok(MergedQueryResult { items, metadata })
    }

    /// Whether status and score agree between tiers. Read-only.
    pub async fn check_consistency(&self, key: &str, partition: &str) -> Result<bool> {
        let cached = self.fast.peek(key, partition);
        let durable = self.load_durable(key, partition).await?;

        let consistent = match (&cached, &durable) {
            (None, None) => true,
            (Some(cached), Some(durable)) => cached.payload.same_mutable_fields(durable),
            _ => false,
        };

        if !consistent {
            info!(
                "Inconsistent {}/{}: cached={}, durable={}",
                partition,
                key,
                cached.is_some(),
                durable.is_some()
            );
        }
        Ok(consistent)
    }

    /// Make the fast tier match the durable record. Idempotent.
    pub async fn force_sync(&self, key: &str, partition: &str) -> Result<ForceSyncOutcome> {
        match self.load_durable(key, partition).await? {
            Some(response) => {
                let version = self
                    .fast
                    .set(key, partition, response, Some(self.config.hot_ttl))?;
                info!("Force-synced {}/{} (version {})", partition, key, version);
                Ok(ForceSyncOutcome::Refreshed { version })
            }
            None => {
                self.fast.delete(key, partition);
                info!("Force-sync evicted {}/{}", partition, key);
                Ok(ForceSyncOutcome::Evicted)
            }
        }
    }

    /// Check every component concurrently; each result stands on its own
    pub async fn health(&self) -> HealthReport {
        let timeout = self.config.health_check_timeout;

        let fast_check = async {
            let started = Instant::now();
            let metrics = self.fast.metrics();
            let mut health = ComponentHealth::healthy(started.elapsed().as_millis() as u64);
            if metrics.total_items >= self.fast.capacity() {
                health.status = HealthStatus::Degraded;
                health.detail = Some(format!("at capacity ({} items)", metrics.total_items));
            }
            health
        };

        let relational_check = async {
            let started = Instant::now();
            match tokio::time::timeout(timeout, self.relational.ping()).await {
                Ok(Ok(())) => ComponentHealth::healthy(started.elapsed().as_millis() as u64),
                Ok(Err(e)) => ComponentHealth::unhealthy(e.to_string()),
                Err(_) => ComponentHealth::unhealthy(
                    TallyError::Timeout(format!("ping after {:?}", timeout)).to_string(),
                ),
            }
        };

        let sync_check = async {
            match tokio::time::timeout(timeout, self.queue.stats()).await {
                Ok(Ok(stats)) => {
                    let status = if stats.dead_lettered > 0 || stats.failed > 0 {
                        HealthStatus::Degraded
                    } else {
                        HealthStatus::Healthy
                    };
                    let detail = (stats.dead_lettered > 0)
                        .then(|| format!("{} items exhausted their retries", stats.dead_lettered));
                    SyncHealth {
                        status,
                        detail,
                        pending: stats.pending,
                        processing: stats.processing,
                        failed: stats.failed,
                        dead_lettered: stats.dead_lettered,
                    }
                }
                Ok(Err(e)) => unhealthy_sync(e.to_string()),
                Err(_) => unhealthy_sync(
                    TallyError::Timeout(format!("queue stats after {:?}", timeout)).to_string(),
                ),
            }
        };

        let (fast_store, relational_store, sync) =
            tokio::join!(fast_check, relational_check, sync_check);
        HealthReport::new(fast_store, relational_store, sync)
    }

    pub fn fast_store_metrics(&self) -> FastStoreMetrics {
        self.fast.metrics()
    }

    /// Decide warming and consistency reports for one list call. The
    /// counts land in `metadata`; the work itself goes to the reconciler.
    fn reconcile(
        &self,
        correlation_id: &str,
        client_id: &str,
        fast: &[SurveyResponse],
        durable: &[SurveyResponse],
        deleted: &HashSet<String>,
        window: usize,
        metadata: &mut QueryMetadata,
    ) {
        let fast_ids: HashSet<&str> = fast.iter().map(|r| r.id.as_str()).collect();
        let durable_ids: HashSet<&str> = durable.iter().map(|r| r.id.as_str()).collect();

        let to_warm: Vec<SurveyResponse> = durable
            .iter()
            .filter(|r| !fast_ids.contains(r.id.as_str()) && !deleted.contains(&r.id))
            .take(self.config.warm_batch_limit)
            .cloned()
            .collect();

        // The durable side only returned the newest `window` rows; anything
        // older than its last row was never asked for.
        let complete = durable.len() < window;
        let oldest = durable.last();
        let missing_from_durable: Vec<String> = fast
            .iter()
            .filter(|r| !durable_ids.contains(r.id.as_str()))
            .filter(|r| {
                complete
                    || oldest.map_or(false, |oldest| {
                        newest_first(r, oldest) != std::cmp::Ordering::Greater
                    })
            })
            .map(|r| r.id.clone())
            .collect();

        if !to_warm.is_empty() {
            let count = to_warm.len();
            if self.reconciler.submit(ReconcileJob::Warm {
                correlation_id: correlation_id.to_string(),
                responses: to_warm,
            }) {
                metadata.cache_warmed_count = count;
            } else {
                metadata
                    .warnings
                    .push(format!("cache warming skipped for {} responses", count));
            }
        }

        if !missing_from_durable.is_empty() {
            metadata.consistency_issue_count = missing_from_durable.len();
            if !self.reconciler.submit(ReconcileJob::Report {
                correlation_id: correlation_id.to_string(),
                client_id: client_id.to_string(),
                missing_from_durable,
            }) {
                metadata
                    .warnings
                    .push("consistency report skipped".to_string());
            }
        }
    }

    async fn load_durable(&self, key: &str, partition: &str) -> Result<Option<SurveyResponse>> {
        Ok(self
            .relational
            .get_by_id(key)
            .await?
            .filter(|response| response.client_id == partition))
    }

    /// Current copy plus its version, warming the fast tier on a miss
    async fn load_for_update(&self, key: &str, partition: &str) -> Result<(SurveyResponse, Version)> {
        let not_found = || TallyError::NotFound(format!("response {}/{}", partition, key));
        match self.fast.lookup(key, partition) {
            Lookup::Live(item) => return Ok((item.payload, item.version)),
            Lookup::Tombstoned => return Err(not_found()),
            Lookup::Absent => {}
        }

        let response = self
            .load_durable(key, partition)
            .await?
            .ok_or_else(not_found)?;

        match self.warm(response.clone())? {
            PutOutcome::Written(version) => Ok((response, version)),
            // A newer copy arrived meanwhile; patch that one instead
            PutOutcome::Kept(version) => match self.fast.peek(key, partition) {
                Some(item) => Ok((item.payload, item.version)),
                None => Ok((response, version)),
            },
            PutOutcome::Deleted => Err(not_found()),
        }
    }

    fn warm(&self, response: SurveyResponse) -> Result<PutOutcome> {
        let updated_at = response.updated_at;
        let key = response.id.clone();
        let partition = response.client_id.clone();
        self.fast.set_unless(
            &key,
            &partition,
            response,
            Some(self.config.hot_ttl),
            |cached| cached.updated_at >= updated_at,
        )
    }

    async fn enqueue(
        &self,
        operation: SyncOperation,
        key: &str,
        partition: &str,
        payload: Option<SurveyResponse>,
    ) -> Result<String> {
        let item = SyncQueueItem::new(
            uuid::Uuid::now_v7().to_string(),
            operation,
            key.to_string(),
            partition.to_string(),
            payload,
            self.clock.now(),
        );

        self.queue.enqueue(item).await.map_err(|e| {
            warn!("Failed to queue {} for {}/{}: {}", operation, partition, key, e);
            e
        })
    }
}

fn unhealthy_sync(detail: String) -> SyncHealth {
    SyncHealth {
        status: HealthStatus::Unhealthy,
        detail: Some(detail),
        pending: 0,
        processing: 0,
        failed: 0,
        dead_lettered: 0,
    }
}

/// Dedup by id: the larger `updated_at` wins, ties go to the fast copy.
/// Sorted newest first.
pub fn merge_responses(
    fast: Vec<SurveyResponse>,
    durable: Vec<SurveyResponse>,
) -> Vec<SurveyResponse> {
    let mut merged: HashMap<String, SurveyResponse> = HashMap::with_capacity(durable.len());
    for response in durable {
        merged.insert(response.id.clone(), response);
    }
    for response in fast {
        match merged.get(&response.id) {
            Some(existing) if existing.updated_at > response.updated_at => {}
            _ => {
                merged.insert(response.id.clone(), response);
            }
        }
    }

    let mut merged: Vec<SurveyResponse> = merged.into_values().collect();
    merged.sort_by(newest_first);
    merged
}
