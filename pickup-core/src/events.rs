use async_trait::async_trait;
use pickup_shared::{EventKind, ParcelRecord};

use crate::BoxError;

/// Sink for parcel lifecycle events.
///
/// Delivery is at-least-once from the caller's point of view: a successful
/// return means the broker accepted the event, nothing more. Callers never
/// retry through this trait.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, parcel: &ParcelRecord, kind: EventKind) -> Result<(), PublishError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode {kind} event for parcel {parcel_id}: {source}")]
    Encode {
        parcel_id: i64,
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to deliver {kind} event for parcel {parcel_id} to {topic}: {source}")]
    Delivery {
        parcel_id: i64,
        kind: EventKind,
        topic: String,
        #[source]
        source: BoxError,
    },
}
