use chrono::{DateTime, Utc};
use pickup_core::{
    Clock, ErrorKind, EventPublisher, ParcelCache, ParcelStore, PublishError, StoreError,
};
use pickup_shared::{EventKind, ParcelRecord};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::models::{DomainError, Parcel};

pub const DEFAULT_WORKERS: usize = 4;

/// Hands a batch of parcels to one client.
///
/// Parcels are stamped `PickedUp` in memory, then a fixed pool of workers
/// pulls them from a shared queue and writes each one through the store and
/// the cache. A failure only affects its own parcel.
pub struct FulfillmentPipeline {
    store: Arc<dyn ParcelStore>,
    cache: Arc<dyn ParcelCache>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    workers: usize,
}

/// Per-parcel result of a batch
#[derive(Debug)]
pub struct ItemOutcome {
    pub parcel_id: i64,
    pub result: Result<ParcelRecord, ItemFailure>,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug)]
pub struct BatchReport {
    pub client_id: i64,
    /// One entry per distinct requested id, in request order
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &ParcelRecord> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = (i64, &ItemFailure)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.parcel_id, e)))
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(ItemOutcome::is_success)
    }
}

/// Why a single parcel of a batch was not handed out (or not announced)
#[derive(Debug, thiserror::Error)]
pub enum ItemFailure {
    #[error("transition rejected: {0}")]
    Transition(#[source] DomainError),

    #[error("persist failed: {0}")]
    Persist(#[source] StoreError),

    /// Persisted and cached, but the giveout event was not accepted
    #[error("publish failed: {0}")]
    Publish(#[source] PublishError),

    #[error("cancelled before dispatch")]
    Cancelled,

    #[error("worker stopped before reporting")]
    WorkerLost,
}

/// Errors that abort the whole batch before any parcel is touched
#[derive(Debug, thiserror::Error)]
pub enum FulfillmentError {
    #[error("no order ids given")]
    NoOrderIds,

    #[error("parcel {0} not found")]
    NotFound(i64),

    #[error("parcel {parcel_id} belongs to client {found}, batch is for client {expected}")]
    MultipleClientsInBatch {
        expected: i64,
        found: i64,
        parcel_id: i64,
    },

    #[error("parcel {parcel_id} has an invalid stored state: {source}")]
    InvalidRecord {
        parcel_id: i64,
        #[source]
        source: DomainError,
    },

    #[error("{op}: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },
}

impl FulfillmentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FulfillmentError::NoOrderIds => ErrorKind::Validation,
            FulfillmentError::NotFound(_) => ErrorKind::NotFound,
            FulfillmentError::MultipleClientsInBatch { .. } => ErrorKind::BusinessRule,
            FulfillmentError::InvalidRecord { .. } => ErrorKind::Infrastructure,
            FulfillmentError::Store { source, .. } => source.kind(),
        }
    }
}

type WorkerReport = (i64, Result<ParcelRecord, StoreError>);

impl FulfillmentPipeline {
    pub fn new(
        store: Arc<dyn ParcelStore>,
        cache: Arc<dyn ParcelCache>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        workers: usize,
    ) -> Self {
        Self {
            store,
            cache,
            publisher,
            clock,
            workers: workers.max(1),
        }
    }

    /// Give out every parcel in `ids` to its (single) owner.
    ///
    /// Raising `cancel` lets workers finish the parcel they hold but stops
    /// them from taking new ones; the rest are reported as `Cancelled`.
    pub async fn run(
        &self,
        ids: &[i64],
        cancel: &CancellationToken,
    ) -> Result<BatchReport, FulfillmentError> {
        if ids.is_empty() {
            return Err(FulfillmentError::NoOrderIds);
        }

        let mut seen = HashSet::with_capacity(ids.len());
        let ids: Vec<i64> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        let records = self
            .store
            .get_by_ids(&ids)
            .await
            .map_err(|source| FulfillmentError::Store {
                op: "FulfillmentPipeline.load",
                source,
            })?;
        let mut by_id: HashMap<i64, ParcelRecord> =
            records.into_iter().map(|r| (r.order_id, r)).collect();

        let mut parcels = Vec::with_capacity(ids.len());
        for id in &ids {
            let record = by_id.remove(id).ok_or(FulfillmentError::NotFound(*id))?;
            let parcel = Parcel::from_record(&record).map_err(|source| {
                FulfillmentError::InvalidRecord {
                    parcel_id: *id,
                    source,
                }
            })?;
            parcels.push(parcel);
        }

        let client_id = parcels[0].client_id();
        if let Some(other) = parcels.iter().find(|p| p.client_id() != client_id) {
            return Err(FulfillmentError::MultipleClientsInBatch {
                expected: client_id,
                found: other.client_id(),
                parcel_id: other.id(),
            });
        }

        let now = self.clock.now();
        let mut results: HashMap<i64, Result<ParcelRecord, ItemFailure>> = HashMap::new();
        let mut dispatch = Vec::with_capacity(parcels.len());

        for mut parcel in parcels {
            match parcel.mark_picked_up(now) {
                Ok(()) => dispatch.push(parcel.to_record()),
                Err(err) => {
                    warn!(parcel_id = parcel.id(), error = %err, "parcel not eligible for give-out");
                    results.insert(parcel.id(), Err(ItemFailure::Transition(err)));
                }
            }
        }

        if !dispatch.is_empty() {
            let persisted = self.persist_all(dispatch, now, cancel).await;
            results.extend(persisted);
        }

        // Announce what actually reached the store
        for id in &ids {
            let record = match results.get(id) {
                Some(Ok(record)) => record.clone(),
                _ => continue,
            };

            if let Err(err) = self.publisher.publish(&record, EventKind::GiveOut).await {
                error!(parcel_id = id, error = %err, "giveout event not published");
                results.insert(*id, Err(ItemFailure::Publish(err)));
            }
        }

        let outcomes: Vec<ItemOutcome> = ids
            .iter()
            .map(|id| ItemOutcome {
                parcel_id: *id,
                result: results.remove(id).unwrap_or(Err(ItemFailure::WorkerLost)),
            })
            .collect();

        let issued = outcomes.iter().filter(|o| o.is_success()).count();
        info!(
            client_id,
            issued,
            failed = outcomes.len() - issued,
            "give-out batch finished"
        );

        Ok(BatchReport { client_id, outcomes })
    }

    /// Fan the stamped records out to the worker pool and collect results.
    async fn persist_all(
        &self,
        dispatch: Vec<ParcelRecord>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> HashMap<i64, Result<ParcelRecord, ItemFailure>> {
        let batch_len = dispatch.len();
        let dispatched: Vec<i64> = dispatch.iter().map(|r| r.order_id).collect();

        // Both queues hold the whole batch, so sends never wait
        let (work_tx, work_rx) = mpsc::channel::<ParcelRecord>(batch_len);
        let (report_tx, mut report_rx) = mpsc::channel::<WorkerReport>(batch_len);
        let work_rx = Arc::new(Mutex::new(work_rx));

        for record in dispatch {
            if work_tx.send(record).await.is_err() {
                break;
            }
        }
        drop(work_tx);

        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers.min(batch_len) {
            let queue = work_rx.clone();
            let report = report_tx.clone();
            let store = self.store.clone();
            let cache = self.cache.clone();
            let cancel = cancel.clone();

            workers.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }

                    let next = queue.lock().await.recv().await;
                    let Some(record) = next else {
                        break;
                    };

                    let outcome = persist_one(store.as_ref(), cache.as_ref(), record, now).await;
                    if report.send(outcome).await.is_err() {
                        break;
                    }
                }
                tracing::debug!(worker_id, "give-out worker exiting");
            });
        }
        drop(report_tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "give-out worker failed");
            }
        }

        let mut results = HashMap::with_capacity(batch_len);
        while let Some((id, outcome)) = report_rx.recv().await {
            results.insert(id, outcome.map_err(ItemFailure::Persist));
        }

        // Whatever is still queued was never started
        {
            let mut queue = work_rx.lock().await;
            while let Ok(record) = queue.try_recv() {
                info!(parcel_id = record.order_id, "give-out cancelled before dispatch");
                results.insert(record.order_id, Err(ItemFailure::Cancelled));
            }
        }

        for id in dispatched {
            results.entry(id).or_insert(Err(ItemFailure::WorkerLost));
        }

        results
    }
}

async fn persist_one(
    store: &dyn ParcelStore,
    cache: &dyn ParcelCache,
    record: ParcelRecord,
    now: DateTime<Utc>,
) -> WorkerReport {
    let id = record.order_id;

    if let Err(err) = store.update_parcel(&record).await {
        error!(parcel_id = id, error = %err, "parcel issue failed");
        return (id, Err(err));
    }

    if let Err(err) = cache.set(&record, now).await {
        warn!(parcel_id = id, error = %err, "parcel issued but cache not refreshed");
    }

    info!(parcel_id = id, "parcel issued");
    (id, Ok(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use pickup_core::{ManualClock, MemoryParcelStore, TtlCache};
    use pickup_shared::ParcelStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingPublisher {
        events: StdMutex<Vec<(i64, EventKind)>>,
        fail_for: Option<i64>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, parcel: &ParcelRecord, kind: EventKind) -> Result<(), PublishError> {
            if self.fail_for == Some(parcel.order_id) {
                return Err(PublishError::Delivery {
                    parcel_id: parcel.order_id,
                    kind,
                    topic: "pvz.events-log".to_string(),
                    source: "broker unavailable".into(),
                });
            }
            self.events.lock().unwrap().push((parcel.order_id, kind));
            Ok(())
        }
    }

    /// Store wrapper that fails updates for one id and counts update calls.
    /// It can also raise a cancellation signal from inside the first write.
    struct FlakyStore {
        inner: MemoryParcelStore,
        fail_update_for: Option<i64>,
        cancel_on_update: Option<CancellationToken>,
        updates: AtomicUsize,
    }

    /// Cache whose writes always fail
    struct BrokenCache;

    #[async_trait]
    impl ParcelCache for BrokenCache {
        async fn get(&self, _parcel_id: i64) -> Option<ParcelRecord> {
            None
        }

        async fn set(&self, _record: &ParcelRecord, _now: DateTime<Utc>) -> Result<(), pickup_core::CacheError> {
            Err(pickup_core::CacheError::Backend {
                op: "RedisParcelCache.set",
                source: "connection reset".into(),
            })
        }
    }

    #[async_trait]
    impl ParcelStore for FlakyStore {
        async fn add_parcel(&self, parcel: &ParcelRecord) -> Result<(), StoreError> {
            self.inner.add_parcel(parcel).await
        }

        async fn update_parcel(&self, parcel: &ParcelRecord) -> Result<(), StoreError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if let Some(cancel) = &self.cancel_on_update {
                cancel.cancel();
            }
            if self.fail_update_for == Some(parcel.order_id) {
                return Err(StoreError::backend(
                    "PgParcelStore.update_parcel",
                    "could not serialize access",
                ));
            }
            self.inner.update_parcel(parcel).await
        }

        async fn get_by_id(&self, id: i64) -> Result<ParcelRecord, StoreError> {
            self.inner.get_by_id(id).await
        }

        async fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<ParcelRecord>, StoreError> {
            self.inner.get_by_ids(ids).await
        }

        async fn list_by_client(&self, client_id: i64) -> Result<Vec<ParcelRecord>, StoreError> {
            self.inner.list_by_client(client_id).await
        }

        async fn list_refunded(&self, limit: u32, offset: u32) -> Result<Vec<ParcelRecord>, StoreError> {
            self.inner.list_refunded(limit, offset).await
        }
    }

    struct Harness {
        store: Arc<FlakyStore>,
        cache: Arc<TtlCache<i64, ParcelRecord>>,
        publisher: Arc<RecordingPublisher>,
        clock: Arc<ManualClock>,
        pipeline: FulfillmentPipeline,
    }

    async fn harness(fail_update_for: Option<i64>, fail_publish_for: Option<i64>) -> Harness {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(FlakyStore {
            inner: MemoryParcelStore::new(),
            fail_update_for,
            cancel_on_update: None,
            updates: AtomicUsize::new(0),
        });
        let cache = Arc::new(TtlCache::new(Duration::minutes(5), clock.clone()));
        let publisher = Arc::new(RecordingPublisher {
            fail_for: fail_publish_for,
            ..Default::default()
        });

        let pipeline = FulfillmentPipeline::new(
            store.clone(),
            cache.clone(),
            publisher.clone(),
            clock.clone(),
            DEFAULT_WORKERS,
        );

        Harness {
            store,
            cache,
            publisher,
            clock,
            pipeline,
        }
    }

    async fn seed(h: &Harness, id: i64, client_id: i64, status: ParcelStatus) {
        let now = h.clock.now();
        h.store
            .add_parcel(&ParcelRecord {
                order_id: id,
                client_id,
                store_until: now + Duration::days(2),
                status,
                cost: 100,
                weight: 1,
                packages: vec![],
                pick_up_time: (status != ParcelStatus::Received).then_some(now),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let h = harness(None, None).await;
        let err = h.pipeline.run(&[], &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::NoOrderIds));
    }

    #[tokio::test]
    async fn test_batch_of_ten_all_issued() {
        let h = harness(None, None).await;
        for id in 1..=10 {
            seed(&h, id, 7, ParcelStatus::Received).await;
        }

        let ids: Vec<i64> = (1..=10).collect();
        let report = h.pipeline.run(&ids, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.client_id, 7);
        assert!(report.all_succeeded());
        assert_eq!(report.outcomes.len(), 10);

        let now = h.clock.now();
        for id in 1..=10 {
            let row = h.store.inner.snapshot(id).await.unwrap();
            assert_eq!(row.status, ParcelStatus::PickedUp);
            assert_eq!(row.pick_up_time, Some(now));
            assert_eq!(h.cache.get(&id).unwrap().status, ParcelStatus::PickedUp);
        }

        let events = h.publisher.events.lock().unwrap();
        assert_eq!(events.len(), 10);
        assert!(events.iter().all(|(_, kind)| *kind == EventKind::GiveOut));
    }

    #[tokio::test]
    async fn test_mixed_clients_abort_before_any_write() {
        let h = harness(None, None).await;
        seed(&h, 1, 1, ParcelStatus::Received).await;
        seed(&h, 2, 1, ParcelStatus::Received).await;
        seed(&h, 3, 2, ParcelStatus::Received).await;

        let err = h
            .pipeline
            .run(&[1, 2, 3], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FulfillmentError::MultipleClientsInBatch {
                expected: 1,
                found: 2,
                parcel_id: 3
            }
        ));
        assert_eq!(h.store.updates.load(Ordering::SeqCst), 0);
        assert!(h.publisher.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_aborts_batch() {
        let h = harness(None, None).await;
        seed(&h, 1, 1, ParcelStatus::Received).await;

        let err = h
            .pipeline
            .run(&[1, 404], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::NotFound(404)));
        assert_eq!(h.store.updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_persist_failure_isolated_to_one_parcel() {
        let h = harness(Some(2), None).await;
        for id in 1..=3 {
            seed(&h, id, 1, ParcelStatus::Received).await;
        }

        let report = h.pipeline.run(&[1, 2, 3], &CancellationToken::new()).await.unwrap();

        let failed: Vec<i64> = report.failed().map(|(id, _)| id).collect();
        assert_eq!(failed, vec![2]);
        assert!(matches!(
            report.outcomes[1].result,
            Err(ItemFailure::Persist(StoreError::Backend { .. }))
        ));

        assert_eq!(
            h.store.inner.snapshot(1).await.unwrap().status,
            ParcelStatus::PickedUp
        );
        assert_eq!(
            h.store.inner.snapshot(2).await.unwrap().status,
            ParcelStatus::Received
        );
        assert!(h.cache.get(&2).is_none());

        let events = h.publisher.events.lock().unwrap();
        let announced: Vec<i64> = events.iter().map(|(id, _)| *id).collect();
        assert_eq!(announced.len(), 2);
        assert!(!announced.contains(&2));
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_persisted_state() {
        let h = harness(None, Some(1)).await;
        seed(&h, 1, 1, ParcelStatus::Received).await;
        seed(&h, 2, 1, ParcelStatus::Received).await;

        let report = h.pipeline.run(&[1, 2], &CancellationToken::new()).await.unwrap();

        assert!(matches!(report.outcomes[0].result, Err(ItemFailure::Publish(_))));
        assert!(report.outcomes[1].is_success());
        // Persistence is not re-attempted or undone
        assert_eq!(h.store.updates.load(Ordering::SeqCst), 2);
        assert_eq!(
            h.store.inner.snapshot(1).await.unwrap().status,
            ParcelStatus::PickedUp
        );
    }

    #[tokio::test]
    async fn test_already_picked_up_parcel_not_dispatched() {
        let h = harness(None, None).await;
        seed(&h, 1, 1, ParcelStatus::Received).await;
        seed(&h, 2, 1, ParcelStatus::PickedUp).await;

        let report = h.pipeline.run(&[1, 2], &CancellationToken::new()).await.unwrap();

        assert!(report.outcomes[0].is_success());
        assert!(matches!(
            report.outcomes[1].result,
            Err(ItemFailure::Transition(DomainError::StageAlreadyDone { .. }))
        ));
        assert_eq!(h.store.updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_ids_collapsed() {
        let h = harness(None, None).await;
        seed(&h, 5, 1, ParcelStatus::Received).await;

        let report = h.pipeline.run(&[5, 5, 5], &CancellationToken::new()).await.unwrap();

        assert_eq!(report.outcomes.len(), 1);
        assert!(report.all_succeeded());
        assert_eq!(h.store.updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_batch_dispatches_nothing() {
        let h = harness(None, None).await;
        for id in 1..=3 {
            seed(&h, id, 1, ParcelStatus::Received).await;
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = h.pipeline.run(&[1, 2, 3], &cancel).await.unwrap();

        assert!(report
            .outcomes
            .iter()
            .all(|o| matches!(o.result, Err(ItemFailure::Cancelled))));
        assert_eq!(h.store.updates.load(Ordering::SeqCst), 0);
        assert_eq!(
            h.store.inner.snapshot(1).await.unwrap().status,
            ParcelStatus::Received
        );
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_stops_remaining_dispatch() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cancel = CancellationToken::new();
        let store = Arc::new(FlakyStore {
            inner: MemoryParcelStore::new(),
            fail_update_for: None,
            cancel_on_update: Some(cancel.clone()),
            updates: AtomicUsize::new(0),
        });
        let cache = Arc::new(TtlCache::new(Duration::minutes(5), clock.clone()));
        let publisher = Arc::new(RecordingPublisher::default());
        // One worker so the order of dispatch is fixed
        let pipeline = FulfillmentPipeline::new(
            store.clone(),
            cache,
            publisher.clone(),
            clock.clone(),
            1,
        );

        let ids: Vec<i64> = (1..=20).collect();
        for id in &ids {
            store
                .add_parcel(&ParcelRecord {
                    order_id: *id,
                    client_id: 1,
                    store_until: clock.now() + Duration::days(2),
                    status: ParcelStatus::Received,
                    cost: 100,
                    weight: 1,
                    packages: vec![],
                    pick_up_time: None,
                })
                .await
                .unwrap();
        }

        let report = pipeline.run(&ids, &cancel).await.unwrap();

        // The parcel in flight when the signal was raised still completes
        assert!(report.outcomes[0].is_success());
        assert_eq!(store.inner.snapshot(1).await.unwrap().status, ParcelStatus::PickedUp);
        assert_eq!(*publisher.events.lock().unwrap(), vec![(1, EventKind::GiveOut)]);

        assert!(report.outcomes[1..]
            .iter()
            .all(|o| matches!(o.result, Err(ItemFailure::Cancelled))));
        assert_eq!(store.updates.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.inner.snapshot(20).await.unwrap().status,
            ParcelStatus::Received
        );
    }

    #[tokio::test]
    async fn test_cache_failure_does_not_fail_give_out() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryParcelStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let pipeline = FulfillmentPipeline::new(
            store.clone(),
            Arc::new(BrokenCache),
            publisher.clone(),
            clock.clone(),
            DEFAULT_WORKERS,
        );

        for id in 1..=3 {
            store
                .add_parcel(&ParcelRecord {
                    order_id: id,
                    client_id: 4,
                    store_until: clock.now() + Duration::days(2),
                    status: ParcelStatus::Received,
                    cost: 100,
                    weight: 1,
                    packages: vec![],
                    pick_up_time: None,
                })
                .await
                .unwrap();
        }

        let report = pipeline.run(&[1, 2, 3], &CancellationToken::new()).await.unwrap();

        assert!(report.all_succeeded());
        for id in 1..=3 {
            assert_eq!(store.snapshot(id).await.unwrap().status, ParcelStatus::PickedUp);
        }
        assert_eq!(publisher.events.lock().unwrap().len(), 3);
    }
}
