use async_trait::async_trait;
use pickup_shared::ParcelRecord;

use crate::{BoxError, ErrorKind};

/// Durable parcel storage.
///
/// Writes (`add_parcel`, `update_parcel`) run serializable so two callers
/// can never apply the same insert or transition concurrently. Reads only
/// need to observe committed data. Each call owns its own transaction; none
/// stays open across calls.
#[async_trait]
pub trait ParcelStore: Send + Sync {
    /// Insert a new parcel; `AlreadyExists` if the id is taken
    async fn add_parcel(&self, parcel: &ParcelRecord) -> Result<(), StoreError>;

    /// Overwrite the mutable columns of an existing parcel
    async fn update_parcel(&self, parcel: &ParcelRecord) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: i64) -> Result<ParcelRecord, StoreError>;

    /// Parcels for the ids that exist, ordered by id. Missing ids are skipped.
    async fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<ParcelRecord>, StoreError>;

    /// Parcels still waiting at the pickup point for this client
    async fn list_by_client(&self, client_id: i64) -> Result<Vec<ParcelRecord>, StoreError>;

    /// Refunded parcels ordered by id. `limit == 0` means no limit.
    async fn list_refunded(&self, limit: u32, offset: u32) -> Result<Vec<ParcelRecord>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("parcel {0} not found")]
    NotFound(i64),

    #[error("parcel {0} already exists")]
    AlreadyExists(i64),

    #[error("parcel {id} has a corrupt row: {reason}")]
    Corrupt { id: i64, reason: String },

    #[error("{op}: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: BoxError,
    },
}

impl StoreError {
    pub fn backend(op: &'static str, source: impl Into<BoxError>) -> Self {
        StoreError::Backend {
            op,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::AlreadyExists(_) => ErrorKind::Conflict,
            StoreError::Corrupt { .. } | StoreError::Backend { .. } => ErrorKind::Infrastructure,
        }
    }
}
