use pickup_core::{Clock, ParcelCache, SystemClock, TtlCache};
use pickup_order::ParcelManager;
use pickup_shared::ParcelRecord;
use std::sync::Arc;
use tracing::info;

use crate::app_config::Config;
use crate::database::DbClient;
use crate::events::KafkaEventPublisher;
use crate::parcel_repo::PgParcelStore;
use crate::redis_repo::{RedisClient, RedisParcelCache};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Failed to connect to database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to run migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to create Kafka producer: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Failed to connect to Redis: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Connect every adapter named in `config` and assemble the lifecycle
/// manager on top of them.
pub async fn build_manager(config: &Config) -> Result<ParcelManager, BootstrapError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let settings = config.lifecycle_settings()?;
    let cache_ttl = config.cache_ttl()?;

    let db = DbClient::from_config(&config.database).await?;
    db.migrate().await?;
    let store = Arc::new(PgParcelStore::new(db.pool.clone()));

    let cache: Arc<dyn ParcelCache> = if config.redis.enabled {
        let client = RedisClient::new(&config.redis.url).await?;
        info!("Using Redis parcel cache");
        Arc::new(RedisParcelCache::new(client, cache_ttl))
    } else {
        Arc::new(TtlCache::<i64, ParcelRecord>::new(cache_ttl, clock.clone()))
    };

    let publisher = Arc::new(KafkaEventPublisher::from_config(&config.kafka, clock.clone())?);

    info!(
        workers = settings.workers,
        refund_window_hours = settings.refund_window.num_hours(),
        topic = %config.kafka.topic,
        "Parcel lifecycle ready"
    );

    Ok(ParcelManager::new(store, cache, publisher, clock, settings))
}
