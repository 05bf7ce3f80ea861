use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pickup_core::{ParcelStore, StoreError};
use pickup_shared::{PackagingKind, ParcelRecord, ParcelStatus};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::transaction::{IsolationProfile, TxManager};

const PARCEL_COLUMNS: &str =
    "order_id, client_id, store_until, status, cost, weight, packages, pick_up_time";

pub struct PgParcelStore {
    tx: TxManager,
}

impl PgParcelStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            tx: TxManager::new(pool),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ParcelRow {
    order_id: i64,
    client_id: i64,
    store_until: DateTime<Utc>,
    status: String,
    cost: i64,
    weight: i64,
    packages: Vec<String>,
    pick_up_time: Option<DateTime<Utc>>,
}

impl TryFrom<ParcelRow> for ParcelRecord {
    type Error = StoreError;

    fn try_from(row: ParcelRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: row.order_id,
            reason,
        };

        let status = row
            .status
            .parse::<ParcelStatus>()
            .map_err(|e| corrupt(e.to_string()))?;
        let packages = row
            .packages
            .iter()
            .map(|code| code.parse::<PackagingKind>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(ParcelRecord {
            order_id: row.order_id,
            client_id: row.client_id,
            store_until: row.store_until,
            status,
            cost: row.cost,
            weight: row.weight,
            packages,
            pick_up_time: row.pick_up_time,
        })
    }
}

fn decode_all(rows: Vec<ParcelRow>) -> Result<Vec<ParcelRecord>, StoreError> {
    rows.into_iter().map(ParcelRecord::try_from).collect()
}

fn refunded_query(limit: u32, offset: u32) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("SELECT {PARCEL_COLUMNS} FROM orders WHERE status = "));
    qb.push_bind(ParcelStatus::Refunded.as_str());
    qb.push(" ORDER BY order_id");
    if limit > 0 {
        qb.push(" LIMIT ").push_bind(i64::from(limit));
    }
    if offset > 0 {
        qb.push(" OFFSET ").push_bind(i64::from(offset));
    }
    qb
}

#[async_trait]
impl ParcelStore for PgParcelStore {
    async fn add_parcel(&self, parcel: &ParcelRecord) -> Result<(), StoreError> {
        const OP: &str = "PgParcelStore.add_parcel";
        let mut tx = self
            .tx
            .begin(IsolationProfile::SerializableWrite)
            .await
            .map_err(|e| StoreError::backend(OP, e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (order_id, client_id, store_until, status, cost, weight, packages, pick_up_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(parcel.order_id)
        .bind(parcel.client_id)
        .bind(parcel.store_until)
        .bind(parcel.status.as_str())
        .bind(parcel.cost)
        .bind(parcel.weight)
        .bind(parcel.package_codes())
        .bind(parcel.pick_up_time)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(StoreError::AlreadyExists(parcel.order_id));
            }
            Err(e) => return Err(StoreError::backend(OP, e)),
        }

        tx.commit().await.map_err(|e| StoreError::backend(OP, e))?;
        debug!(parcel_id = parcel.order_id, "parcel row inserted");
        Ok(())
    }

    async fn update_parcel(&self, parcel: &ParcelRecord) -> Result<(), StoreError> {
        const OP: &str = "PgParcelStore.update_parcel";
        let mut tx = self
            .tx
            .begin(IsolationProfile::SerializableWrite)
            .await
            .map_err(|e| StoreError::backend(OP, e))?;

        let result = sqlx::query(
            r#"
            UPDATE orders
            SET store_until = $2, status = $3, cost = $4, weight = $5, packages = $6, pick_up_time = $7
            WHERE order_id = $1
            "#,
        )
        .bind(parcel.order_id)
        .bind(parcel.store_until)
        .bind(parcel.status.as_str())
        .bind(parcel.cost)
        .bind(parcel.weight)
        .bind(parcel.package_codes())
        .bind(parcel.pick_up_time)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::backend(OP, e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(parcel.order_id));
        }

        tx.commit().await.map_err(|e| StoreError::backend(OP, e))?;
        debug!(parcel_id = parcel.order_id, status = %parcel.status, "parcel row updated");
        Ok(())
    }

    async fn get_by_id(&self, id: i64) -> Result<ParcelRecord, StoreError> {
        const OP: &str = "PgParcelStore.get_by_id";
        let mut tx = self
            .tx
            .begin(IsolationProfile::ReadCommitted)
            .await
            .map_err(|e| StoreError::backend(OP, e))?;

        let row = sqlx::query_as::<_, ParcelRow>(&format!(
            "SELECT {PARCEL_COLUMNS} FROM orders WHERE order_id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::backend(OP, e))?
        .ok_or(StoreError::NotFound(id))?;

        tx.commit().await.map_err(|e| StoreError::backend(OP, e))?;
        ParcelRecord::try_from(row)
    }

    async fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<ParcelRecord>, StoreError> {
        const OP: &str = "PgParcelStore.get_by_ids";
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self
            .tx
            .begin(IsolationProfile::ReadCommitted)
            .await
            .map_err(|e| StoreError::backend(OP, e))?;

        let rows = sqlx::query_as::<_, ParcelRow>(&format!(
            "SELECT {PARCEL_COLUMNS} FROM orders WHERE order_id = ANY($1) ORDER BY order_id"
        ))
        .bind(ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StoreError::backend(OP, e))?;

        tx.commit().await.map_err(|e| StoreError::backend(OP, e))?;
        decode_all(rows)
    }

    async fn list_by_client(&self, client_id: i64) -> Result<Vec<ParcelRecord>, StoreError> {
        const OP: &str = "PgParcelStore.list_by_client";
        let mut tx = self
            .tx
            .begin(IsolationProfile::ReadCommitted)
            .await
            .map_err(|e| StoreError::backend(OP, e))?;

        let rows = sqlx::query_as::<_, ParcelRow>(&format!(
            "SELECT {PARCEL_COLUMNS} FROM orders WHERE client_id = $1 AND status = $2 ORDER BY order_id"
        ))
        .bind(client_id)
        .bind(ParcelStatus::Received.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StoreError::backend(OP, e))?;

        tx.commit().await.map_err(|e| StoreError::backend(OP, e))?;
        decode_all(rows)
    }

    async fn list_refunded(&self, limit: u32, offset: u32) -> Result<Vec<ParcelRecord>, StoreError> {
        const OP: &str = "PgParcelStore.list_refunded";
        let mut tx = self
            .tx
            .begin(IsolationProfile::ReadCommitted)
            .await
            .map_err(|e| StoreError::backend(OP, e))?;

        let mut qb = refunded_query(limit, offset);
        let rows = qb
            .build_query_as::<ParcelRow>()
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| StoreError::backend(OP, e))?;

        tx.commit().await.map_err(|e| StoreError::backend(OP, e))?;
        decode_all(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn row(status: &str, packages: &[&str]) -> ParcelRow {
        ParcelRow {
            order_id: 7,
            client_id: 3,
            store_until: Utc::now() + Duration::days(1),
            status: status.to_string(),
            cost: 120,
            weight: 12,
            packages: packages.iter().map(|p| p.to_string()).collect(),
            pick_up_time: None,
        }
    }

    #[test]
    fn test_row_decodes_codes() {
        let record = ParcelRecord::try_from(row("received", &["box", "tape"])).unwrap();
        assert_eq!(record.status, ParcelStatus::Received);
        assert_eq!(record.packages, vec![PackagingKind::Box, PackagingKind::Tape]);
    }

    #[test]
    fn test_unknown_status_is_corrupt() {
        let err = ParcelRecord::try_from(row("lost", &[])).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { id: 7, .. }));
    }

    #[test]
    fn test_unknown_packaging_is_corrupt() {
        let err = ParcelRecord::try_from(row("pickedUp", &["crate"])).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { id: 7, .. }));
    }

    #[test]
    fn test_refunded_query_paging() {
        let unbounded = refunded_query(0, 0);
        assert!(unbounded.sql().ends_with("ORDER BY order_id"));

        let page = refunded_query(10, 20);
        assert!(page.sql().ends_with("ORDER BY order_id LIMIT $2 OFFSET $3"));

        let offset_only = refunded_query(0, 5);
        assert!(offset_only.sql().ends_with("ORDER BY order_id OFFSET $2"));
    }
}
