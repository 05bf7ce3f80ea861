use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pickup_shared::ParcelRecord;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

use crate::clock::Clock;
use crate::BoxError;

/// A cached snapshot and the instant after which it stops being served
#[derive(Debug, Clone)]
pub struct CachedEntry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

impl<V> CachedEntry<V> {
    pub fn new(value: V, expires_at: DateTime<Utc>) -> Self {
        Self { value, expires_at }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

}

/// In-process TTL cache.
///
/// Readers share the lock; a writer holds it exclusively for one map
/// mutation. Expired entries are not evicted on read, they are simply
/// reported as misses until overwritten or purged.
pub struct TtlCache<K, V> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<K, CachedEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the stored value unless it is absent or expired
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);

        entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Replaces any previous entry; expiry restarts at `now + ttl`, capped at
    /// the latest representable instant
    pub fn set(&self, key: K, value: V, now: DateTime<Utc>) {
        let expires_at = now
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let entry = CachedEntry::new(value, expires_at);

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, entry);
    }

    /// Drops expired entries. Not used on the read path.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache encode failed for parcel {parcel_id}: {source}")]
    Encode {
        parcel_id: i64,
        #[source]
        source: BoxError,
    },

    #[error("{op}: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: BoxError,
    },
}

/// Parcel snapshot cache consulted before the store.
///
/// Only write paths populate it; a miss on the read path falls through to
/// the store without filling the cache.
#[async_trait]
pub trait ParcelCache: Send + Sync {
    async fn get(&self, parcel_id: i64) -> Option<ParcelRecord>;

    async fn set(&self, record: &ParcelRecord, now: DateTime<Utc>) -> Result<(), CacheError>;
}

#[async_trait]
impl ParcelCache for TtlCache<i64, ParcelRecord> {
    async fn get(&self, parcel_id: i64) -> Option<ParcelRecord> {
        TtlCache::get(self, &parcel_id)
    }

    async fn set(&self, record: &ParcelRecord, now: DateTime<Utc>) -> Result<(), CacheError> {
        TtlCache::set(self, record.order_id, record.clone(), now);
        Ok(())
    }
}
