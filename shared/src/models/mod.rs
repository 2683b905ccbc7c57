//! Catalog and directory models

pub mod courier;
pub mod sku;

pub use courier::{CourierProfile, WorkingInterval};
pub use sku::Sku;
