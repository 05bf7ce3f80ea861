pub mod fulfillment;
pub mod manager;
pub mod models;
pub mod packaging;

pub use fulfillment::{
    BatchReport, FulfillmentError, FulfillmentPipeline, ItemFailure, ItemOutcome, DEFAULT_WORKERS,
};
pub use manager::{LifecycleError, LifecycleSettings, ParcelManager};
pub use models::{DomainError, Parcel, ReceiveRequest};
