//! Inventory: per-SKU sequencing and on-hand mutations
//!
//! Holds (reservations) live in [`crate::orders::OrderStorage`]; this module
//! owns the physical stock side.

pub mod sequencer;
pub mod stock;

pub use sequencer::{SkuGuard, SkuSequencer};
pub use stock::{DeductOutcome, StockError, StockKeeper, StockLease, return_deltas};
