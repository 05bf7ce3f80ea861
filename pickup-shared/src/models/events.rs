use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::parcel::ParcelRecord;

/// Lifecycle moments that are written to the event log
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Receive,
    #[serde(rename = "giveout")]
    GiveOut,
    Refund,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Receive => "receive",
            EventKind::GiveOut => "giveout",
            EventKind::Refund => "refund",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event-log payload: the parcel snapshot after the transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParcelEvent {
    #[serde(rename = "order_info")]
    pub parcel: ParcelRecord,
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub moment: DateTime<Utc>,
}

impl ParcelEvent {
    pub fn new(parcel: ParcelRecord, kind: EventKind, moment: DateTime<Utc>) -> Self {
        Self { parcel, kind, moment }
    }
}
