use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Parcel status in the pickup-point lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ParcelStatus {
    #[serde(rename = "received")]
    Received,
    #[serde(rename = "pickedUp")]
    PickedUp,
    #[serde(rename = "refunded")]
    Refunded,
    #[serde(rename = "deleted")]
    Deleted,
}

/// Packaging applied to a parcel by the courier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PackagingKind {
    Box,
    Bag,
    Tape,
}

// Text codes as stored in the `status` and `packages` columns. Both
// directions of the mapping are read from these tables.
const STATUS_CODES: [(ParcelStatus, &str); 4] = [
    (ParcelStatus::Received, "received"),
    (ParcelStatus::PickedUp, "pickedUp"),
    (ParcelStatus::Refunded, "refunded"),
    (ParcelStatus::Deleted, "deleted"),
];

const PACKAGING_CODES: [(PackagingKind, &str); 3] = [
    (PackagingKind::Box, "box"),
    (PackagingKind::Bag, "bag"),
    (PackagingKind::Tape, "tape"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCode(pub String);

impl fmt::Display for UnknownCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown code '{}'", self.0)
    }
}

impl std::error::Error for UnknownCode {}

impl ParcelStatus {
    pub fn as_str(&self) -> &'static str {
        STATUS_CODES
            .iter()
            .find(|(status, _)| status == self)
            .map(|(_, code)| *code)
            .unwrap_or("unknown")
    }
}

impl FromStr for ParcelStatus {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STATUS_CODES
            .iter()
            .find(|(_, code)| *code == s)
            .map(|(status, _)| *status)
            .ok_or_else(|| UnknownCode(s.to_string()))
    }
}

impl fmt::Display for ParcelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PackagingKind {
    pub fn as_str(&self) -> &'static str {
        PACKAGING_CODES
            .iter()
            .find(|(kind, _)| kind == self)
            .map(|(_, code)| *code)
            .unwrap_or("unknown")
    }

    /// Fixed cost added to the parcel when this packaging is applied
    pub fn surcharge(&self) -> i64 {
        match self {
            PackagingKind::Bag => 5,
            PackagingKind::Box => 20,
            PackagingKind::Tape => 1,
        }
    }

    /// Heaviest parcel the packaging can hold; `None` means no limit
    pub fn max_weight(&self) -> Option<i64> {
        match self {
            PackagingKind::Bag => Some(10),
            PackagingKind::Box => Some(30),
            PackagingKind::Tape => None,
        }
    }

    /// Box and Bag are structural and exclude each other; tape goes on anything
    pub fn is_structural(&self) -> bool {
        matches!(self, PackagingKind::Box | PackagingKind::Bag)
    }
}

impl FromStr for PackagingKind {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PACKAGING_CODES
            .iter()
            .find(|(_, code)| *code == s)
            .map(|(kind, _)| *kind)
            .ok_or_else(|| UnknownCode(s.to_string()))
    }
}

impl fmt::Display for PackagingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted shape of a parcel, one row of the `orders` table.
///
/// The record carries no invariants of its own; it is validated when turned
/// back into a domain parcel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParcelRecord {
    pub order_id: i64,
    pub client_id: i64,
    pub store_until: DateTime<Utc>,
    pub status: ParcelStatus,
    pub cost: i64,
    pub weight: i64,
    #[serde(default)]
    pub packages: Vec<PackagingKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pick_up_time: Option<DateTime<Utc>>,
}

impl ParcelRecord {
    /// Packaging as text codes, the form written to the `packages` column
    pub fn package_codes(&self) -> Vec<String> {
        self.packages.iter().map(|p| p.as_str().to_string()).collect()
    }
}
