pub mod cache;
pub mod clock;
pub mod events;
pub mod memory;
pub mod repository;

pub use cache::{CacheError, CachedEntry, ParcelCache, TtlCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{EventPublisher, PublishError};
pub use memory::MemoryParcelStore;
pub use repository::{ParcelStore, StoreError};

/// Boxed error used to carry driver failures (sqlx, rdkafka, redis) through
/// the core without naming the driver types.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Broad classes of failure, used by front-ends to pick a response code
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Bad input; never retried
    Validation,
    /// Already exists / already done
    Conflict,
    NotFound,
    /// Valid call at the wrong time (not expired yet, window closed, ...)
    BusinessRule,
    /// Database, broker or cache failure
    Infrastructure,
}
