pub mod events;
pub mod parcel;
