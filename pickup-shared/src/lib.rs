pub mod models;
pub mod pii;

pub use models::events::{EventKind, ParcelEvent};
pub use models::parcel::{PackagingKind, ParcelRecord, ParcelStatus, UnknownCode};
pub use pii::Masked;
