use async_trait::async_trait;
use chrono::{Duration, Utc};
use pickup_core::{
    Clock, EventPublisher, ManualClock, MemoryParcelStore, PublishError, TtlCache,
};
use pickup_order::{LifecycleError, LifecycleSettings, ParcelManager, ReceiveRequest};
use pickup_shared::{EventKind, PackagingKind, ParcelRecord, ParcelStatus};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<(i64, EventKind, ParcelStatus)>>,
}

impl EventLog {
    fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.1).collect()
    }
}

#[async_trait]
impl EventPublisher for EventLog {
    async fn publish(&self, parcel: &ParcelRecord, kind: EventKind) -> Result<(), PublishError> {
        self.events
            .lock()
            .unwrap()
            .push((parcel.order_id, kind, parcel.status));
        Ok(())
    }
}

struct PickupPoint {
    manager: ParcelManager,
    store: Arc<MemoryParcelStore>,
    events: Arc<EventLog>,
    clock: Arc<ManualClock>,
}

fn pickup_point() -> PickupPoint {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(MemoryParcelStore::new());
    let events = Arc::new(EventLog::default());
    let cache = Arc::new(TtlCache::<i64, ParcelRecord>::new(
        Duration::minutes(5),
        clock.clone(),
    ));

    let manager = ParcelManager::new(
        store.clone(),
        cache,
        events.clone(),
        clock.clone(),
        LifecycleSettings::default(),
    );

    PickupPoint {
        manager,
        store,
        events,
        clock,
    }
}

fn parcel_one(point: &PickupPoint) -> ReceiveRequest {
    ReceiveRequest {
        id: 1,
        client_id: 1,
        store_until: point.clock.now() + Duration::hours(48),
        cost: 1000,
        weight: 5,
        packaging: vec![],
    }
}

#[tokio::test]
async fn scenario_a_receive_persists_waiting_parcel() {
    let point = pickup_point();

    point.manager.receive(parcel_one(&point)).await.unwrap();

    let row = point.store.snapshot(1).await.unwrap();
    assert_eq!(row.status, ParcelStatus::Received);
    assert_eq!(row.cost, 1000);
    assert!(row.pick_up_time.is_none());
    assert_eq!(point.events.kinds(), vec![EventKind::Receive]);
}

#[tokio::test]
async fn scenario_b_give_out_marks_picked_up() {
    let point = pickup_point();
    point.manager.receive(parcel_one(&point)).await.unwrap();

    let report = point.manager.give_out(&[1]).await.unwrap();
    assert!(report.all_succeeded());

    let row = point.store.snapshot(1).await.unwrap();
    assert_eq!(row.status, ParcelStatus::PickedUp);
    assert_eq!(row.pick_up_time, Some(point.clock.now()));

    let giveouts: Vec<_> = point
        .events
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.1 == EventKind::GiveOut)
        .cloned()
        .collect();
    assert_eq!(giveouts, vec![(1, EventKind::GiveOut, ParcelStatus::PickedUp)]);
}

#[tokio::test]
async fn scenario_c_refund_inside_window() {
    let point = pickup_point();
    point.manager.receive(parcel_one(&point)).await.unwrap();
    point.manager.give_out(&[1]).await.unwrap();
    point.clock.advance(Duration::hours(47));

    let refunded = point.manager.refund(1, 1).await.unwrap();

    assert_eq!(refunded.status, ParcelStatus::Refunded);
    assert_eq!(point.store.snapshot(1).await.unwrap().status, ParcelStatus::Refunded);
    assert_eq!(
        point.events.kinds(),
        vec![EventKind::Receive, EventKind::GiveOut, EventKind::Refund]
    );
    assert_eq!(point.manager.list_refunds(0, 0).await.unwrap(), vec![refunded]);
}

#[tokio::test]
async fn scenario_c_refund_after_window_rejected() {
    let point = pickup_point();
    point.manager.receive(parcel_one(&point)).await.unwrap();
    point.manager.give_out(&[1]).await.unwrap();
    point.clock.advance(Duration::hours(49));

    let err = point.manager.refund(1, 1).await.unwrap_err();

    assert!(matches!(err, LifecycleError::RefundWindowExpired { id: 1, .. }));
    assert_eq!(point.store.snapshot(1).await.unwrap().status, ParcelStatus::PickedUp);
}

#[tokio::test]
async fn scenario_d_early_return_rejected() {
    let point = pickup_point();
    point.manager.receive(parcel_one(&point)).await.unwrap();

    let err = point.manager.return_to_courier(1).await.unwrap_err();

    assert!(matches!(err, LifecycleError::StoreTimeNotExpired { id: 1, .. }));
    assert_eq!(point.store.snapshot(1).await.unwrap().status, ParcelStatus::Received);
}

#[tokio::test]
async fn packaged_parcel_full_round() {
    let point = pickup_point();
    let mut request = parcel_one(&point);
    request.weight = 8;
    request.packaging = vec![PackagingKind::Bag, PackagingKind::Tape];

    let record = point.manager.receive(request).await.unwrap();
    assert_eq!(record.cost, 1006);
    assert_eq!(record.package_codes(), vec!["bag", "tape"]);

    assert_eq!(point.manager.list_for_client(1).await.unwrap().len(), 1);
    point.manager.give_out(&[1]).await.unwrap();
    assert!(point.manager.list_for_client(1).await.unwrap().is_empty());
}
