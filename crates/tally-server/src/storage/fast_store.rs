//! In-memory fast tier using DashMap
//!
//! Items are versioned, TTL-aware and tombstoned on delete. Reads fail
//! closed on expiry, so the background sweep only reclaims memory.
//!
//! Secondary index entries are written after the primary entry and outside
//! its shard guard. A reader can briefly observe an index entry whose item
//! moved on; `find_by_index` re-checks the payload to filter those out.

use chrono::Duration;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tally_core::ports::Clock;
use tally_core::{
    FastStoreMetrics, IndexKey, Indexed, ItemKey, Result, StorageItem, TallyError, Version,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct FastStoreConfig {
    /// Upper bound on stored entries, tombstones included
    pub max_items: usize,
    /// How long a tombstone is kept before the sweep may reclaim it
    pub tombstone_retention: Duration,
    pub sweep_interval: std::time::Duration,
}

impl Default for FastStoreConfig {
    fn default() -> Self {
        Self {
            max_items: 100_000,
            tombstone_retention: Duration::minutes(10),
            sweep_interval: std::time::Duration::from_secs(60),
        }
    }
}

/// Result of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written(Version),
    /// The live copy was kept; carries its version
    Kept(Version),
    /// A tombstone still in retention blocked the write
    Deleted,
}

/// What the fast tier knows about one key
#[derive(Debug, Clone)]
pub enum Lookup<T> {
    Live(StorageItem<T>),
    /// Deleted here; the durable tier may still hold the record
    Tombstoned,
    Absent,
}

/// Result of a compare-and-swap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResult {
    Swapped(Version),
    /// Nothing changed; carries the live version, if any
    Mismatch { current: Option<Version> },
}

pub struct FastStore<T> {
    items: DashMap<ItemKey, StorageItem<T>>,
    index: DashMap<IndexKey, DashSet<ItemKey>>,
    clock: Arc<dyn Clock>,
    config: FastStoreConfig,
    last_version: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    lookups: AtomicU64,
    lookup_nanos: AtomicU64,
    expired: AtomicU64,
}

impl<T> FastStore<T>
where
    T: Indexed + Clone + Send + Sync + 'static,
{
    pub fn new(clock: Arc<dyn Clock>, config: FastStoreConfig) -> Self {
        Self {
            items: DashMap::new(),
            index: DashMap::new(),
            clock,
            config,
            last_version: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
            lookup_nanos: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    fn next_version(&self) -> Version {
        self.last_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Get a live item; expired or tombstoned entries read as absent
    pub fn get(&self, key: &str, partition: &str) -> Option<StorageItem<T>> {
        match self.lookup(key, partition) {
            Lookup::Live(item) => Some(item),
            Lookup::Tombstoned | Lookup::Absent => None,
        }
    }

    /// Like `get`, but tells a recent delete apart from a plain miss
    pub fn lookup(&self, key: &str, partition: &str) -> Lookup<T> {
        let started = Instant::now();
        let now = self.clock.now();
        let found = match self.items.get(&ItemKey::new(partition, key)) {
            Some(item) if item.is_live(now) => Lookup::Live(item.clone()),
            Some(item) if item.deleted && !item.is_expired(now) => Lookup::Tombstoned,
            _ => Lookup::Absent,
        };

        self.record_lookup(started, matches!(found, Lookup::Live(_)));
        found
    }

    /// Unconditional overwrite with an optional TTL
    pub fn set(
        &self,
        key: &str,
        partition: &str,
        value: T,
        ttl: Option<Duration>,
    ) -> Result<Version> {
        match self.put(key, partition, value, ttl, false, |_| false)? {
            PutOutcome::Written(version) | PutOutcome::Kept(version) => Ok(version),
            PutOutcome::Deleted => Err(TallyError::NotFound(format!("{}/{}", partition, key))),
        }
    }

    /// Fill from another source: overwrite unless `keep_existing` says the
    /// live copy should stay, and never over a tombstone still in retention.
    ///
    /// The checks run under the entry lock, so a concurrent write or delete
    /// cannot slip in between the check and the overwrite.
    pub fn set_unless<F>(
        &self,
        key: &str,
        partition: &str,
        value: T,
        ttl: Option<Duration>,
        keep_existing: F,
    ) -> Result<PutOutcome>
    where
        F: FnOnce(&T) -> bool,
    {
        self.put(key, partition, value, ttl, true, keep_existing)
    }

    fn put<F>(
        &self,
        key: &str,
        partition: &str,
        value: T,
        ttl: Option<Duration>,
        keep_tombstone: bool,
        keep_existing: F,
    ) -> Result<PutOutcome>
    where
        F: FnOnce(&T) -> bool,
    {
        let item_key = ItemKey::new(partition, key);
        self.ensure_capacity(&item_key)?;

        let now = self.clock.now();
        let expires_at = ttl.map(|ttl| now + ttl);
        let new_index = value.index_keys();

        let (version, old_index) = match self.items.entry(item_key.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                let live = existing.is_live(now);
                if keep_tombstone && existing.deleted && !existing.is_expired(now) {
                    return Ok(PutOutcome::Deleted);
                }
                if live && keep_existing(&existing.payload) {
                    return Ok(PutOutcome::Kept(existing.version));
                }
                // Tombstones were unindexed on delete; expired payloads were not
                let old_index = if existing.deleted {
                    Vec::new()
                } else {
                    existing.payload.index_keys()
                };
                let created_at = if live { existing.created_at } else { now };
                let version = self.next_version();
                *existing = StorageItem {
                    partition_key: item_key.partition_key.clone(),
                    key: item_key.key.clone(),
                    payload: value,
                    created_at,
                    updated_at: now,
                    expires_at,
                    version,
                    deleted: false,
                };
                (version, old_index)
            }
            Entry::Vacant(vacant) => {
                let version = self.next_version();
                vacant.insert(StorageItem {
                    partition_key: item_key.partition_key.clone(),
                    key: item_key.key.clone(),
                    payload: value,
                    created_at: now,
                    updated_at: now,
                    expires_at,
                    version,
                    deleted: false,
                });
                (version, Vec::new())
            }
        };

        self.reindex(&item_key, &old_index, &new_index);
        Ok(PutOutcome::Written(version))
    }

    /// Tombstone a live item. Returns false if it was already absent.
    pub fn delete(&self, key: &str, partition: &str) -> bool {
        let item_key = ItemKey::new(partition, key);
        let now = self.clock.now();

        let removed = match self.items.get_mut(&item_key) {
            Some(mut item) if item.is_live(now) => {
                let old_index = item.payload.index_keys();
                item.deleted = true;
                item.version = self.next_version();
                item.updated_at = now;
                item.expires_at = Some(now + self.config.tombstone_retention);
                Some(old_index)
            }
            _ => None,
        };

        match removed {
            Some(old_index) => {
                self.unindex(&item_key, &old_index);
                true
            }
            None => false,
        }
    }

    /// Compare-and-swap on the version token
    pub fn update_with_version(
        &self,
        key: &str,
        partition: &str,
        value: T,
        expected_version: Version,
    ) -> bool {
        matches!(
            self.compare_and_swap(key, partition, value, expected_version),
            CasResult::Swapped(_)
        )
    }

    /// Like `update_with_version`, reporting the new or the current version.
    /// The item keeps its expiry.
    pub fn compare_and_swap(
        &self,
        key: &str,
        partition: &str,
        value: T,
        expected_version: Version,
    ) -> CasResult {
        let item_key = ItemKey::new(partition, key);
        let now = self.clock.now();

        let (version, old_index, new_index) = {
            let Some(mut item) = self.items.get_mut(&item_key) else {
                return CasResult::Mismatch { current: None };
            };
            if !item.is_live(now) {
                return CasResult::Mismatch { current: None };
            }
            if item.version != expected_version {
                return CasResult::Mismatch {
                    current: Some(item.version),
                };
            }

            let old_index = item.payload.index_keys();
            let new_index = value.index_keys();
            let version = self.next_version();
            item.payload = value;
            item.version = version;
            item.updated_at = now;
            (version, old_index, new_index)
        };

        self.reindex(&item_key, &old_index, &new_index);
        CasResult::Swapped(version)
    }

    /// Live items of a partition whose key starts with `sort_prefix`.
    ///
    /// Linear scan over the whole map; fine for the sizes this tier holds.
    pub fn query(&self, partition: &str, sort_prefix: Option<&str>) -> Vec<StorageItem<T>> {
        let now = self.clock.now();
        let mut found: Vec<StorageItem<T>> = self
            .items
            .iter()
            .filter(|entry| {
                let item = entry.value();
                item.partition_key == partition
                    && sort_prefix.map_or(true, |prefix| item.key.starts_with(prefix))
                    && item.is_live(now)
            })
            .map(|entry| entry.value().clone())
            .collect();

        found.sort_by(|a, b| a.key.cmp(&b.key));
        found
    }

    pub fn find_by_index(&self, name: &str, value: &str) -> Vec<StorageItem<T>> {
        let wanted = IndexKey::new(name, value);
        let keys: Vec<ItemKey> = match self.index.get(&wanted) {
            Some(keys) => keys.iter().map(|key| key.key().clone()).collect(),
            None => return Vec::new(),
        };

        let now = self.clock.now();
        let mut found: Vec<StorageItem<T>> = keys
            .iter()
            .filter_map(|key| self.items.get(key).map(|item| item.clone()))
            .filter(|item| item.is_live(now) && item.payload.index_keys().contains(&wanted))
            .collect();

        found.sort_by(|a, b| a.item_key().cmp(&b.item_key()));
        found
    }

    /// Like `get`, but not counted towards hit/miss metrics
    pub fn peek(&self, key: &str, partition: &str) -> Option<StorageItem<T>> {
        let now = self.clock.now();
        self.items
            .get(&ItemKey::new(partition, key))
            .filter(|item| item.is_live(now))
            .map(|item| item.clone())
    }

    pub fn exists(&self, key: &str, partition: &str) -> bool {
        self.peek(key, partition).is_some()
    }

    /// A tombstone still in retention, not counted towards metrics
    pub fn is_tombstoned(&self, key: &str, partition: &str) -> bool {
        let now = self.clock.now();
        self.items
            .get(&ItemKey::new(partition, key))
            .map_or(false, |item| item.deleted && !item.is_expired(now))
    }

    /// Keys of a partition deleted here within the retention window
    pub fn tombstoned_keys(&self, partition: &str) -> HashSet<String> {
        let now = self.clock.now();
        self.items
            .iter()
            .filter(|entry| {
                let item = entry.value();
                item.partition_key == partition && item.deleted && !item.is_expired(now)
            })
            .map(|entry| entry.value().key.clone())
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.config.max_items
    }

    pub fn metrics(&self) -> FastStoreMetrics {
        let now = self.clock.now();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = self.lookups.load(Ordering::Relaxed);
        let nanos = self.lookup_nanos.load(Ordering::Relaxed);

        FastStoreMetrics {
            total_items: self.items.len(),
            live_items: self.items.iter().filter(|e| e.value().is_live(now)).count(),
            hits,
            misses,
            hit_rate: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
            avg_latency_us: if lookups == 0 {
                0.0
            } else {
                nanos as f64 / lookups as f64 / 1_000.0
            },
            expired_count: self.expired.load(Ordering::Relaxed),
        }
    }

    /// Physically remove entries past their expiry. Returns how many went.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut expired_live: Vec<(ItemKey, Vec<IndexKey>)> = Vec::new();
        let mut removed = 0usize;

        self.items.retain(|key, item| {
            if !item.is_expired(now) {
                return true;
            }
            removed += 1;
            if !item.deleted {
                expired_live.push((key.clone(), item.payload.index_keys()));
            }
            false
        });

        self.expired
            .fetch_add(expired_live.len() as u64, Ordering::Relaxed);
        for (key, index) in &expired_live {
            self.unindex(key, index);
        }

        if removed > 0 {
            debug!(
                "Swept {} entries ({} expired, {} tombstones)",
                removed,
                expired_live.len(),
                removed - expired_live.len()
            );
        }
        removed
    }

    /// Run `sweep_expired` on the configured interval until cancelled
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            info!("Fast store sweeper started (every {:?})", period);
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.sweep_expired();
                    }
                }
            }
            info!("Fast store sweeper stopped");
        })
    }

    fn ensure_capacity(&self, item_key: &ItemKey) -> Result<()> {
        let limit = self.config.max_items;
        if self.items.len() < limit || self.items.contains_key(item_key) {
            return Ok(());
        }
        // Expired entries still occupy slots until swept
        self.sweep_expired();
        if self.items.len() < limit {
            Ok(())
        } else {
            Err(TallyError::CapacityExceeded { limit })
        }
    }

    fn record_lookup(&self, started: Instant, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.lookup_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    fn reindex(&self, key: &ItemKey, old: &[IndexKey], new: &[IndexKey]) {
        let stale: Vec<IndexKey> = old.iter().filter(|i| !new.contains(i)).cloned().collect();
        self.unindex(key, &stale);
        for entry in new.iter().filter(|i| !old.contains(i)) {
            self.index
                .entry(entry.clone())
                .or_default()
                .insert(key.clone());
        }
    }

    fn unindex(&self, key: &ItemKey, entries: &[IndexKey]) {
        for entry in entries {
            if let Some(keys) = self.index.get(entry) {
                keys.remove(key);
            }
            self.index.remove_if(entry, |_, keys| keys.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tally_core::ports::ManualClock;

    #[derive(Debug, Clone, PartialEq)]
    struct Doc {
        status: &'static str,
        body: &'static str,
    }

    impl Indexed for Doc {
        fn index_keys(&self) -> Vec<IndexKey> {
            vec![IndexKey::new("status", self.status)]
        }
    }

    fn doc(status: &'static str, body: &'static str) -> Doc {
        Doc { status, body }
    }

    fn store_with(config: FastStoreConfig) -> (Arc<ManualClock>, FastStore<Doc>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = FastStore::new(clock.clone(), config);
        (clock, store)
    }

    fn store() -> (Arc<ManualClock>, FastStore<Doc>) {
        store_with(FastStoreConfig::default())
    }

    #[test]
    fn test_set_then_get() {
        let (_, store) = store();

        store
            .set("r1", "acme", doc("new", "hello"), Some(Duration::hours(1)))
            .unwrap();

        let item = store.get("r1", "acme").unwrap();
        assert_eq!(item.payload.body, "hello");
        assert_eq!(item.partition_key, "acme");
        assert!(store.get("r1", "other").is_none());
        assert!(store.get("missing", "acme").is_none());
    }

    #[test]
    fn test_ttl_expiry_without_delete() {
        let (clock, store) = store();

        store
            .set("r1", "acme", doc("new", "x"), Some(Duration::seconds(1)))
            .unwrap();
        clock.advance(Duration::seconds(2));

        assert!(store.get("r1", "acme").is_none());
        assert!(!store.exists("r1", "acme"));
        // Not swept yet, only hidden
        assert_eq!(store.metrics().total_items, 1);
        assert_eq!(store.metrics().live_items, 0);
    }

    #[test]
    fn test_versions_strictly_increase() {
        let (_, store) = store();

        let v1 = store.set("r1", "acme", doc("new", "a"), None).unwrap();
        let v2 = store.set("r1", "acme", doc("new", "b"), None).unwrap();
        let v3 = store.set("r2", "acme", doc("new", "c"), None).unwrap();
        assert!(v1 < v2 && v2 < v3);
    }

    #[test]
    fn test_overwrite_keeps_created_at() {
        let (clock, store) = store();

        store.set("r1", "acme", doc("new", "a"), None).unwrap();
        let created = store.get("r1", "acme").unwrap().created_at;
        clock.advance(Duration::seconds(5));
        store.set("r1", "acme", doc("new", "b"), None).unwrap();

        let item = store.get("r1", "acme").unwrap();
        assert_eq!(item.created_at, created);
        assert_eq!(item.updated_at, created + Duration::seconds(5));
    }

    #[test]
    fn test_set_unless_keeps_live_copy() {
        let (_, store) = store();

        let v1 = store.set("r1", "acme", doc("new", "cached"), None).unwrap();
        let outcome = store
            .set_unless("r1", "acme", doc("new", "older"), None, |cached| {
                cached.body == "cached"
            })
            .unwrap();
        assert_eq!(outcome, PutOutcome::Kept(v1));
        assert_eq!(store.peek("r1", "acme").unwrap().payload.body, "cached");

        // Absent keys are always written
        let outcome = store
            .set_unless("r2", "acme", doc("new", "warm"), None, |_| true)
            .unwrap();
        assert!(matches!(outcome, PutOutcome::Written(v) if v > v1));
        assert_eq!(store.metrics().hits + store.metrics().misses, 0);
    }

    #[test]
    fn test_stale_cas_leaves_value_unchanged() {
        let (_, store) = store();

        let v1 = store.set("r1", "acme", doc("new", "first"), None).unwrap();
        let v2 = store.set("r1", "acme", doc("new", "second"), None).unwrap();

        assert!(!store.update_with_version("r1", "acme", doc("new", "stale"), v1));
        let item = store.get("r1", "acme").unwrap();
        assert_eq!(item.payload.body, "second");
        assert_eq!(item.version, v2);

        assert_eq!(
            store.compare_and_swap("r1", "acme", doc("new", "stale"), v1),
            CasResult::Mismatch { current: Some(v2) }
        );

        assert!(store.update_with_version("r1", "acme", doc("new", "fresh"), v2));
        let item = store.get("r1", "acme").unwrap();
        assert_eq!(item.payload.body, "fresh");
        assert!(item.version > v2);
    }

    #[test]
    fn test_cas_on_missing_item() {
        let (_, store) = store();
        assert_eq!(
            store.compare_and_swap("r1", "acme", doc("new", "x"), 1),
            CasResult::Mismatch { current: None }
        );
    }

    #[test]
    fn test_delete_tombstones() {
        let (_, store) = store();

        store.set("r1", "acme", doc("new", "x"), None).unwrap();
        assert!(store.delete("r1", "acme"));
        assert!(store.get("r1", "acme").is_none());
        assert!(!store.delete("r1", "acme"));
        assert!(!store.delete("never", "acme"));

        // A tombstoned key can be written again
        store.set("r1", "acme", doc("new", "y"), None).unwrap();
        assert_eq!(store.get("r1", "acme").unwrap().payload.body, "y");
    }

    #[test]
    fn test_lookup_tells_deleted_from_absent() {
        let (clock, store) = store();

        store.set("r1", "acme", doc("new", "x"), None).unwrap();
        assert!(matches!(store.lookup("r1", "acme"), Lookup::Live(_)));
        assert!(matches!(store.lookup("r2", "acme"), Lookup::Absent));

        store.delete("r1", "acme");
        assert!(matches!(store.lookup("r1", "acme"), Lookup::Tombstoned));
        assert!(store.is_tombstoned("r1", "acme"));
        assert_eq!(
            store.tombstoned_keys("acme"),
            HashSet::from(["r1".to_string()])
        );
        assert!(store.tombstoned_keys("globex").is_empty());

        // Past retention the delete is forgotten
        clock.advance(FastStoreConfig::default().tombstone_retention);
        assert!(matches!(store.lookup("r1", "acme"), Lookup::Absent));
        assert!(!store.is_tombstoned("r1", "acme"));
    }

    #[test]
    fn test_fill_respects_tombstone() {
        let (clock, store) = store();

        store.set("r1", "acme", doc("new", "x"), None).unwrap();
        store.delete("r1", "acme");

        let outcome = store
            .set_unless("r1", "acme", doc("new", "stale"), None, |_| false)
            .unwrap();
        assert_eq!(outcome, PutOutcome::Deleted);
        assert!(store.get("r1", "acme").is_none());

        clock.advance(FastStoreConfig::default().tombstone_retention);
        let outcome = store
            .set_unless("r1", "acme", doc("new", "fresh"), None, |_| false)
            .unwrap();
        assert!(matches!(outcome, PutOutcome::Written(_)));
        assert_eq!(store.get("r1", "acme").unwrap().payload.body, "fresh");
    }

    #[test]
    fn test_overwrite_of_expired_item_drops_its_index_entries() {
        let (clock, store) = store();

        store
            .set("r1", "acme", doc("open", "x"), Some(Duration::seconds(1)))
            .unwrap();
        clock.advance(Duration::seconds(2));
        store.set("r1", "acme", doc("closed", "y"), None).unwrap();

        assert!(!store.index.contains_key(&IndexKey::new("status", "open")));
        assert_eq!(store.find_by_index("status", "closed").len(), 1);
    }

    #[test]
    fn test_query_by_partition_and_prefix() {
        let (clock, store) = store();

        store.set("a-1", "acme", doc("new", "1"), None).unwrap();
        store.set("a-2", "acme", doc("new", "2"), None).unwrap();
        store.set("b-1", "acme", doc("new", "3"), None).unwrap();
        store.set("a-1", "globex", doc("new", "4"), None).unwrap();
        store
            .set("a-3", "acme", doc("new", "5"), Some(Duration::seconds(1)))
            .unwrap();
        store.set("a-4", "acme", doc("new", "6"), None).unwrap();
        store.delete("a-4", "acme");
        clock.advance(Duration::seconds(2));

        let keys: Vec<String> = store
            .query("acme", Some("a-"))
            .into_iter()
            .map(|item| item.key)
            .collect();
        assert_eq!(keys, vec!["a-1", "a-2"]);
        assert_eq!(store.query("acme", None).len(), 3);
    }

    #[test]
    fn test_secondary_index_follows_writes() {
        let (_, store) = store();

        store.set("r1", "acme", doc("new", "x"), None).unwrap();
        store.set("r2", "acme", doc("new", "y"), None).unwrap();
        assert_eq!(store.find_by_index("status", "new").len(), 2);

        let version = store.get("r1", "acme").unwrap().version;
        assert!(store.update_with_version("r1", "acme", doc("flagged", "x"), version));
        assert_eq!(store.find_by_index("status", "new").len(), 1);
        assert_eq!(store.find_by_index("status", "flagged")[0].key, "r1");

        store.delete("r2", "acme");
        assert!(store.find_by_index("status", "new").is_empty());
        assert!(store.find_by_index("status", "unknown").is_empty());
    }

    #[test]
    fn test_capacity_exceeded() {
        let (clock, store) = store_with(FastStoreConfig {
            max_items: 2,
            ..Default::default()
        });

        store.set("r1", "acme", doc("new", "1"), None).unwrap();
        store
            .set("r2", "acme", doc("new", "2"), Some(Duration::seconds(1)))
            .unwrap();

        let err = store.set("r3", "acme", doc("new", "3"), None).unwrap_err();
        assert!(matches!(err, TallyError::CapacityExceeded { limit: 2 }));

        // Overwriting a present key is always allowed
        store.set("r1", "acme", doc("new", "1b"), None).unwrap();

        // Expired entries are reclaimed to make room
        clock.advance(Duration::seconds(2));
        store.set("r3", "acme", doc("new", "3"), None).unwrap();
        assert!(store.exists("r3", "acme"));
    }

    #[test]
    fn test_sweep_reclaims_expired_and_tombstones() {
        let (clock, store) = store();

        store
            .set("r1", "acme", doc("new", "x"), Some(Duration::seconds(1)))
            .unwrap();
        store.set("r2", "acme", doc("new", "y"), None).unwrap();
        store.set("r3", "acme", doc("new", "z"), None).unwrap();
        store.delete("r3", "acme");

        clock.advance(Duration::seconds(2));
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.metrics().expired_count, 1);
        assert!(store.find_by_index("status", "new").iter().all(|i| i.key == "r2"));

        clock.advance(Duration::minutes(11));
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.metrics().total_items, 1);
        // Tombstones are not counted as expirations
        assert_eq!(store.metrics().expired_count, 1);
    }

    #[test]
    fn test_metrics_hit_rate() {
        let (_, store) = store();

        store.set("r1", "acme", doc("new", "x"), None).unwrap();
        store.get("r1", "acme");
        store.get("r1", "acme");
        store.get("r1", "acme");
        store.get("missing", "acme");

        let metrics = store.metrics();
        assert_eq!(metrics.hits, 3);
        assert_eq!(metrics.misses, 1);
        assert!((metrics.hit_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(metrics.live_items, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_runs_until_cancelled() {
        let (clock, store) = store();
        let store = Arc::new(store);

        store
            .set("r1", "acme", doc("new", "x"), Some(Duration::seconds(1)))
            .unwrap();
        clock.advance(Duration::seconds(2));

        let cancel = CancellationToken::new();
        let handle = store.clone().spawn_sweeper(cancel.clone());

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(store.metrics().expired_count, 1);
        assert_eq!(store.metrics().total_items, 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
