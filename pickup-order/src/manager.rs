use chrono::{DateTime, Duration, Utc};
use pickup_core::{
    Clock, ErrorKind, EventPublisher, ParcelCache, ParcelStore, PublishError, StoreError,
};
use pickup_shared::{EventKind, ParcelRecord, ParcelStatus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::fulfillment::{BatchReport, FulfillmentError, FulfillmentPipeline, DEFAULT_WORKERS};
use crate::models::{DomainError, Parcel, ReceiveRequest};

/// Tunables for the lifecycle rules
#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    /// How long after pickup a client may still refund
    pub refund_window: Duration,
    /// Size of the give-out worker pool
    pub workers: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            refund_window: Duration::hours(48),
            workers: DEFAULT_WORKERS,
        }
    }
}

/// Use-case layer behind the CLI and RPC front-ends.
///
/// Single-parcel operations run on the caller's task: load (cache first,
/// then store), transition in memory, write through the store, refresh the
/// cache, publish the event. Only batch give-out fans out.
pub struct ParcelManager {
    store: Arc<dyn ParcelStore>,
    cache: Arc<dyn ParcelCache>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    pipeline: FulfillmentPipeline,
    settings: LifecycleSettings,
    shutdown: CancellationToken,
}

impl ParcelManager {
    pub fn new(
        store: Arc<dyn ParcelStore>,
        cache: Arc<dyn ParcelCache>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        settings: LifecycleSettings,
    ) -> Self {
        let pipeline = FulfillmentPipeline::new(
            store.clone(),
            cache.clone(),
            publisher.clone(),
            clock.clone(),
            settings.workers,
        );

        Self {
            store,
            cache,
            publisher,
            clock,
            pipeline,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops new work when cancelled; in-flight writes finish
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Courier drops off a parcel
    pub async fn receive(&self, request: ReceiveRequest) -> Result<ParcelRecord, LifecycleError> {
        const OP: &str = "ParcelManager.receive";
        self.ensure_running(OP)?;

        let now = self.clock.now();
        let parcel = Parcel::create(&request, now).map_err(|source| LifecycleError::Domain {
            op: OP,
            source,
        })?;
        let record = parcel.to_record();

        self.store
            .add_parcel(&record)
            .await
            .map_err(|source| LifecycleError::Store {
                op: OP,
                parcel_id: record.order_id,
                source,
            })?;

        self.refresh_cache(&record, now).await;
        self.announce(OP, &record, EventKind::Receive).await?;

        info!(parcel_id = record.order_id, client_id = record.client_id, "parcel received");
        Ok(record)
    }

    /// Courier takes back a parcel nobody collected before its store time
    pub async fn return_to_courier(&self, id: i64) -> Result<ParcelRecord, LifecycleError> {
        const OP: &str = "ParcelManager.return_to_courier";
        self.ensure_running(OP)?;

        let mut parcel = self.load(OP, id).await?;
        let now = self.clock.now();

        match parcel.status() {
            ParcelStatus::PickedUp => return Err(LifecycleError::OrderPickedUp(id)),
            ParcelStatus::Deleted => return Err(LifecycleError::OrderDeleted(id)),
            ParcelStatus::Received if parcel.store_until() > now => {
                return Err(LifecycleError::StoreTimeNotExpired {
                    id,
                    store_until: parcel.store_until(),
                });
            }
            _ => {}
        }

        parcel
            .advance(ParcelStatus::Deleted)
            .map_err(|source| LifecycleError::Domain { op: OP, source })?;
        let record = parcel.to_record();

        self.store
            .update_parcel(&record)
            .await
            .map_err(|source| LifecycleError::Store {
                op: OP,
                parcel_id: id,
                source,
            })?;
        self.refresh_cache(&record, now).await;

        info!(parcel_id = id, "parcel returned to courier");
        Ok(record)
    }

    /// Hand a batch of parcels to their owner
    pub async fn give_out(&self, ids: &[i64]) -> Result<BatchReport, LifecycleError> {
        self.give_out_with_cancel(ids, &self.shutdown.child_token())
            .await
    }

    /// Like [`give_out`](Self::give_out) with a caller-owned cancellation signal
    pub async fn give_out_with_cancel(
        &self,
        ids: &[i64],
        cancel: &CancellationToken,
    ) -> Result<BatchReport, LifecycleError> {
        const OP: &str = "ParcelManager.give_out";
        self.ensure_running(OP)?;

        self.pipeline
            .run(ids, cancel)
            .await
            .map_err(|source| LifecycleError::Fulfillment { op: OP, source })
    }

    /// Client brings a parcel back within the refund window
    pub async fn refund(&self, client_id: i64, id: i64) -> Result<ParcelRecord, LifecycleError> {
        const OP: &str = "ParcelManager.refund";
        self.ensure_running(OP)?;

        let mut parcel = self.load(OP, id).await?;

        if parcel.client_id() != client_id {
            return Err(LifecycleError::ClientMismatch {
                id,
                expected: parcel.client_id(),
                actual: client_id,
            });
        }

        let picked_up_at = match (parcel.status(), parcel.pick_up_time()) {
            (ParcelStatus::PickedUp, Some(at)) => at,
            (status, _) => return Err(LifecycleError::NotRefundable { id, status }),
        };

        let now = self.clock.now();
        // A window reaching past the representable range never closes
        if let Some(deadline) = picked_up_at.checked_add_signed(self.settings.refund_window) {
            if now > deadline {
                return Err(LifecycleError::RefundWindowExpired { id, deadline });
            }
        }

        parcel
            .advance(ParcelStatus::Refunded)
            .map_err(|source| LifecycleError::Domain { op: OP, source })?;
        let record = parcel.to_record();

        self.store
            .update_parcel(&record)
            .await
            .map_err(|source| LifecycleError::Store {
                op: OP,
                parcel_id: id,
                source,
            })?;
        self.refresh_cache(&record, now).await;
        self.announce(OP, &record, EventKind::Refund).await?;

        info!(parcel_id = id, client_id, "parcel refunded");
        Ok(record)
    }

    /// Parcels waiting at the pickup point for a client
    pub async fn list_for_client(&self, client_id: i64) -> Result<Vec<ParcelRecord>, LifecycleError> {
        self.store
            .list_by_client(client_id)
            .await
            .map_err(|source| LifecycleError::Listing {
                op: "ParcelManager.list_for_client",
                source,
            })
    }

    pub async fn list_refunds(&self, limit: u32, offset: u32) -> Result<Vec<ParcelRecord>, LifecycleError> {
        self.store
            .list_refunded(limit, offset)
            .await
            .map_err(|source| LifecycleError::Listing {
                op: "ParcelManager.list_refunds",
                source,
            })
    }

    // Cache first, store on miss. A miss does not fill the cache.
    async fn load(&self, op: &'static str, id: i64) -> Result<Parcel, LifecycleError> {
        let record = match self.cache.get(id).await {
            Some(record) => record,
            None => self
                .store
                .get_by_id(id)
                .await
                .map_err(|source| LifecycleError::Store {
                    op,
                    parcel_id: id,
                    source,
                })?,
        };

        Parcel::from_record(&record).map_err(|source| LifecycleError::Domain { op, source })
    }

    async fn refresh_cache(&self, record: &ParcelRecord, now: DateTime<Utc>) {
        if let Err(err) = self.cache.set(record, now).await {
            warn!(parcel_id = record.order_id, error = %err, "cache not refreshed after write");
        }
    }

    async fn announce(
        &self,
        op: &'static str,
        record: &ParcelRecord,
        kind: EventKind,
    ) -> Result<(), LifecycleError> {
        self.publisher
            .publish(record, kind)
            .await
            .map_err(|source| LifecycleError::Publish {
                op,
                parcel_id: record.order_id,
                source,
            })
    }

    fn ensure_running(&self, op: &'static str) -> Result<(), LifecycleError> {
        if self.shutdown.is_cancelled() {
            return Err(LifecycleError::Cancelled { op });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{op}: {source}")]
    Domain {
        op: &'static str,
        #[source]
        source: DomainError,
    },

    #[error("{op}: parcel {parcel_id}: {source}")]
    Store {
        op: &'static str,
        parcel_id: i64,
        #[source]
        source: StoreError,
    },

    #[error("{op}: {source}")]
    Listing {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("{op}: parcel {parcel_id}: {source}")]
    Publish {
        op: &'static str,
        parcel_id: i64,
        #[source]
        source: PublishError,
    },

    #[error("{op}: {source}")]
    Fulfillment {
        op: &'static str,
        #[source]
        source: FulfillmentError,
    },

    #[error("parcel {0} already picked up")]
    OrderPickedUp(i64),

    #[error("parcel {0} already deleted")]
    OrderDeleted(i64),

    #[error("parcel {id} is stored until {store_until}")]
    StoreTimeNotExpired {
        id: i64,
        store_until: DateTime<Utc>,
    },

    #[error("parcel {id} belongs to client {expected}, not {actual}")]
    ClientMismatch { id: i64, expected: i64, actual: i64 },

    #[error("parcel {id} is not refundable in status {status}")]
    NotRefundable { id: i64, status: ParcelStatus },

    #[error("refund window for parcel {id} closed at {deadline}")]
    RefundWindowExpired { id: i64, deadline: DateTime<Utc> },

    #[error("{op}: shutting down")]
    Cancelled { op: &'static str },
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::Domain { source, .. } => source.kind(),
            LifecycleError::Store { source, .. } | LifecycleError::Listing { source, .. } => {
                source.kind()
            }
            LifecycleError::Fulfillment { source, .. } => source.kind(),
            LifecycleError::Publish { .. } | LifecycleError::Cancelled { .. } => {
                ErrorKind::Infrastructure
            }
            LifecycleError::OrderPickedUp(_)
            | LifecycleError::OrderDeleted(_)
            | LifecycleError::StoreTimeNotExpired { .. }
            | LifecycleError::ClientMismatch { .. }
            | LifecycleError::NotRefundable { .. }
            | LifecycleError::RefundWindowExpired { .. } => ErrorKind::BusinessRule,
        }
    }
}
