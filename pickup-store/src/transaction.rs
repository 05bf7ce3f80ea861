//! Scoped transactions for the parcel store.
//!
//! Every store call begins its own transaction with one of two profiles and
//! either commits it or lets it drop. sqlx rolls back a transaction that is
//! dropped without `commit`, so an early `?` return never leaves partial
//! state behind.

use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationProfile {
    /// Inserts and transitions
    SerializableWrite,
    /// Lookups and listings
    ReadCommitted,
}

impl IsolationProfile {
    pub fn statement(self) -> &'static str {
        match self {
            IsolationProfile::SerializableWrite => {
                "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ WRITE"
            }
            IsolationProfile::ReadCommitted => {
                "SET TRANSACTION ISOLATION LEVEL READ COMMITTED, READ ONLY"
            }
        }
    }
}

#[derive(Clone)]
pub struct TxManager {
    pool: PgPool,
}

impl TxManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin(
        &self,
        profile: IsolationProfile,
    ) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        // Must be the first statement inside the transaction
        sqlx::query(profile.statement()).execute(&mut *tx).await?;
        debug!(?profile, "transaction started");
        Ok(tx)
    }
}
