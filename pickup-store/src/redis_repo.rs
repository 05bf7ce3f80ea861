use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pickup_core::{CacheError, ParcelCache};
use pickup_shared::ParcelRecord;
use redis::{AsyncCommands, RedisResult};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64) -> RedisResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl_seconds).await
    }

    pub async fn get(&self, key: &str) -> RedisResult<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.get(key).await
    }
}

/// Parcel cache shared by every replica through Redis.
///
/// Entries are JSON snapshots written with `SET .. EX`, so expiry is left to
/// the server. Read failures count as misses.
pub struct RedisParcelCache {
    client: RedisClient,
    ttl_seconds: u64,
}

pub(crate) fn cache_key(parcel_id: i64) -> String {
    format!("parcel:{}", parcel_id)
}

impl RedisParcelCache {
    pub fn new(client: RedisClient, ttl: Duration) -> Self {
        Self {
            client,
            // SET EX rejects 0
            ttl_seconds: ttl.num_seconds().max(1) as u64,
        }
    }
}

#[async_trait]
impl ParcelCache for RedisParcelCache {
    async fn get(&self, parcel_id: i64) -> Option<ParcelRecord> {
        let raw = match self.client.get(&cache_key(parcel_id)).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(parcel_id, error = %e, "Redis read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(parcel_id, error = %e, "Undecodable cache entry, treating as miss");
                None
            }
        }
    }

    async fn set(&self, record: &ParcelRecord, _now: DateTime<Utc>) -> Result<(), CacheError> {
        let payload = serde_json::to_string(record).map_err(|e| CacheError::Encode {
            parcel_id: record.order_id,
            source: Box::new(e),
        })?;

        self.client
            .set_with_ttl(&cache_key(record.order_id), &payload, self.ttl_seconds)
            .await
            .map_err(|e| CacheError::Backend {
                op: "RedisParcelCache.set",
                source: Box::new(e),
            })?;

        debug!(parcel_id = record.order_id, ttl = self.ttl_seconds, "Parcel cached");
        Ok(())
    }
}
