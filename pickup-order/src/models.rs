use chrono::{DateTime, Utc};
use pickup_core::ErrorKind;
use pickup_shared::{PackagingKind, ParcelRecord, ParcelStatus};
use serde::{Deserialize, Serialize};

use crate::packaging;

/// Courier's request to hand a parcel over to the pickup point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveRequest {
    pub id: i64,
    pub client_id: i64,
    pub store_until: DateTime<Utc>,
    pub cost: i64,
    pub weight: i64,
    #[serde(default)]
    pub packaging: Vec<PackagingKind>,
}

/// A parcel held by the pickup point.
///
/// Fields are private: the status only changes through [`Parcel::advance`]
/// (or its wrappers), so every transition passes the state-machine check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parcel {
    id: i64,
    client_id: i64,
    store_until: DateTime<Utc>,
    status: ParcelStatus,
    cost: i64,
    weight: i64,
    packaging: Vec<PackagingKind>,
    pick_up_time: Option<DateTime<Utc>>,
}

impl Parcel {
    /// Validate a receive request and build the parcel in `Received` status.
    ///
    /// Checks run in field order (id, client, expiry, cost, weight,
    /// packaging) and stop at the first failure.
    pub fn create(request: &ReceiveRequest, now: DateTime<Utc>) -> Result<Self, DomainError> {
        if request.id < 0 {
            return Err(DomainError::InvalidId(request.id));
        }
        if request.client_id < 0 {
            return Err(DomainError::InvalidClientId(request.client_id));
        }
        if request.store_until <= now {
            return Err(DomainError::StoreTimeExpired {
                store_until: request.store_until,
            });
        }
        if request.cost < 0 {
            return Err(DomainError::InvalidCost(request.cost));
        }
        if request.weight < 0 {
            return Err(DomainError::InvalidWeight(request.weight));
        }

        let mut parcel = Self {
            id: request.id,
            client_id: request.client_id,
            store_until: request.store_until,
            status: ParcelStatus::Received,
            cost: request.cost,
            weight: request.weight,
            packaging: Vec::with_capacity(request.packaging.len()),
            pick_up_time: None,
        };

        for kind in &request.packaging {
            packaging::apply(*kind, &mut parcel)?;
        }

        Ok(parcel)
    }

    /// Rebuild a parcel from its stored form.
    ///
    /// Status is taken as stored; the numeric invariants and the pickup-time
    /// rule are re-checked so a bad row never turns into a live parcel.
    pub fn from_record(record: &ParcelRecord) -> Result<Self, DomainError> {
        if record.order_id < 0 {
            return Err(DomainError::InvalidId(record.order_id));
        }
        if record.client_id < 0 {
            return Err(DomainError::InvalidClientId(record.client_id));
        }
        if record.cost < 0 {
            return Err(DomainError::InvalidCost(record.cost));
        }
        if record.weight < 0 {
            return Err(DomainError::InvalidWeight(record.weight));
        }
        if let Some(extra) = record.packages.iter().filter(|p| p.is_structural()).nth(1) {
            return Err(DomainError::AlreadyPackaged { requested: *extra });
        }

        let picked_up = matches!(record.status, ParcelStatus::PickedUp | ParcelStatus::Refunded);
        if picked_up && record.pick_up_time.is_none() {
            return Err(DomainError::MissingPickUpTime(record.order_id));
        }

        Ok(Self {
            id: record.order_id,
            client_id: record.client_id,
            store_until: record.store_until,
            status: record.status,
            cost: record.cost,
            weight: record.weight,
            packaging: record.packages.clone(),
            pick_up_time: if picked_up { record.pick_up_time } else { None },
        })
    }

    pub fn to_record(&self) -> ParcelRecord {
        ParcelRecord {
            order_id: self.id,
            client_id: self.client_id,
            store_until: self.store_until,
            status: self.status,
            cost: self.cost,
            weight: self.weight,
            packages: self.packaging.clone(),
            pick_up_time: self.pick_up_time,
        }
    }

    /// Move to `next` if the lifecycle allows it.
    ///
    /// Forward order is `Received < PickedUp < Refunded`; `Deleted` is only
    /// reachable from `Received`. Anything else is `StageAlreadyDone` and
    /// leaves the parcel untouched.
    pub fn advance(&mut self, next: ParcelStatus) -> Result<(), DomainError> {
        let allowed = match (self.status, next) {
            (ParcelStatus::Received, ParcelStatus::Deleted) => true,
            (_, ParcelStatus::Deleted) | (ParcelStatus::Deleted, _) => false,
            (current, next) => stage(next) > stage(current),
        };

        if !allowed {
            return Err(DomainError::StageAlreadyDone {
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        Ok(())
    }

    /// Hand-over to the client; records the pickup time
    pub fn mark_picked_up(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.advance(ParcelStatus::PickedUp)?;
        self.pick_up_time = Some(now);
        Ok(())
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    pub fn store_until(&self) -> DateTime<Utc> {
        self.store_until
    }

    pub fn status(&self) -> ParcelStatus {
        self.status
    }

    pub fn cost(&self) -> i64 {
        self.cost
    }

    pub fn weight(&self) -> i64 {
        self.weight
    }

    pub fn packaging(&self) -> &[PackagingKind] {
        &self.packaging
    }

    /// Only set once the parcel has been picked up
    pub fn pick_up_time(&self) -> Option<DateTime<Utc>> {
        self.pick_up_time
    }

    pub(crate) fn push_packaging(&mut self, kind: PackagingKind, cost: i64) {
        self.packaging.push(kind);
        self.cost = cost;
    }
}

// Position in the forward chain. Deleted sits outside it.
fn stage(status: ParcelStatus) -> u8 {
    match status {
        ParcelStatus::Received => 1,
        ParcelStatus::PickedUp => 2,
        ParcelStatus::Refunded => 3,
        ParcelStatus::Deleted => 0,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("invalid parcel id {0}")]
    InvalidId(i64),

    #[error("invalid client id {0}")]
    InvalidClientId(i64),

    #[error("invalid cost {0}")]
    InvalidCost(i64),

    #[error("invalid weight {0}")]
    InvalidWeight(i64),

    #[error("store time {store_until} already expired")]
    StoreTimeExpired { store_until: DateTime<Utc> },

    #[error("parcel already packaged, cannot add {requested}")]
    AlreadyPackaged { requested: PackagingKind },

    #[error("parcel weighs {weight}, {kind} holds at most {max}")]
    TooHeavy {
        kind: PackagingKind,
        weight: i64,
        max: i64,
    },

    #[error("unknown packaging '{0}'")]
    UnknownPackaging(String),

    #[error("status stage already done: {from} -> {to}")]
    StageAlreadyDone {
        from: ParcelStatus,
        to: ParcelStatus,
    },

    #[error("parcel {0} is picked up but has no pickup time")]
    MissingPickUpTime(i64),
}

impl DomainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::StageAlreadyDone { .. } => ErrorKind::Conflict,
            _ => ErrorKind::Validation,
        }
    }
}
