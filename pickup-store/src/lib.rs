pub mod app_config;
pub mod database;
pub mod events;
pub mod parcel_repo;
pub mod redis_repo;
pub mod transaction;
pub mod wiring;

pub use app_config::Config;
pub use database::DbClient;
pub use events::{EventProducer, KafkaEventPublisher};
pub use parcel_repo::PgParcelStore;
pub use redis_repo::{RedisClient, RedisParcelCache};
pub use transaction::{IsolationProfile, TxManager};
pub use wiring::{build_manager, BootstrapError};
