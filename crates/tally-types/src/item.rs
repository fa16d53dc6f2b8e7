//! Storage envelope for the fast tier

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version token issued on every write
///
/// Drawn from a store-wide sequence, so any two writes to the same key
/// always observe different values.
pub type Version = u64;

/// Compound address of an item: grouping key + item key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub partition_key: String,
    pub key: String,
}

impl ItemKey {
    pub fn new(partition_key: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.partition_key, self.key)
    }
}

/// An alternate lookup key derived from a payload (e.g. `status = flagged`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    pub name: String,
    pub value: String,
}

impl IndexKey {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Payloads that expose fields for secondary indexing
pub trait Indexed {
    fn index_keys(&self) -> Vec<IndexKey>;
}

/// A stored item with its bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageItem<T> {
    pub partition_key: String,
    pub key: String,
    pub payload: T,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub version: Version,
    /// Tombstone: deleted, as opposed to never written
    pub deleted: bool,
}

impl<T> StorageItem<T> {
    pub fn item_key(&self) -> ItemKey {
        ItemKey::new(self.partition_key.clone(), self.key.clone())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    /// Live means readable: neither tombstoned nor past its expiry
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.deleted && !self.is_expired(now)
    }
}
