//! In-memory parcel store.
//!
//! Mirrors the observable behaviour of the Postgres facade (duplicate ids,
//! not-found updates, filtering and paging) without persistence. Used by the
//! test suites and for running the use cases locally.

use async_trait::async_trait;
use pickup_shared::{ParcelRecord, ParcelStatus};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::repository::{ParcelStore, StoreError};

#[derive(Default)]
pub struct MemoryParcelStore {
    rows: RwLock<BTreeMap<i64, ParcelRecord>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryParcelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of read calls served so far
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of successful write calls so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Peek at a row without counting it as a read
    pub async fn snapshot(&self, id: i64) -> Option<ParcelRecord> {
        self.rows.read().await.get(&id).cloned()
    }

    fn count_read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ParcelStore for MemoryParcelStore {
    async fn add_parcel(&self, parcel: &ParcelRecord) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&parcel.order_id) {
            return Err(StoreError::AlreadyExists(parcel.order_id));
        }

        rows.insert(parcel.order_id, parcel.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(parcel_id = parcel.order_id, "parcel inserted");
        Ok(())
    }

    async fn update_parcel(&self, parcel: &ParcelRecord) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&parcel.order_id)
            .ok_or(StoreError::NotFound(parcel.order_id))?;

        // client_id is immutable once set
        row.store_until = parcel.store_until;
        row.status = parcel.status;
        row.cost = parcel.cost;
        row.weight = parcel.weight;
        row.packages = parcel.packages.clone();
        row.pick_up_time = parcel.pick_up_time;

        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(parcel_id = parcel.order_id, status = %parcel.status, "parcel updated");
        Ok(())
    }

    async fn get_by_id(&self, id: i64) -> Result<ParcelRecord, StoreError> {
        self.count_read();
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<ParcelRecord>, StoreError> {
        self.count_read();
        let rows = self.rows.read().await;
        // BTreeMap iteration keeps the result ordered by id
        Ok(rows
            .values()
            .filter(|row| ids.contains(&row.order_id))
            .cloned()
            .collect())
    }

    async fn list_by_client(&self, client_id: i64) -> Result<Vec<ParcelRecord>, StoreError> {
        self.count_read();
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|row| row.client_id == client_id && row.status == ParcelStatus::Received)
            .cloned()
            .collect())
    }

    async fn list_refunded(&self, limit: u32, offset: u32) -> Result<Vec<ParcelRecord>, StoreError> {
        self.count_read();
        let rows = self.rows.read().await;
        let refunded = rows
            .values()
            .filter(|row| row.status == ParcelStatus::Refunded)
            .skip(offset as usize)
            .cloned();

        Ok(if limit > 0 {
            refunded.take(limit as usize).collect()
        } else {
            refunded.collect()
        })
    }
}
