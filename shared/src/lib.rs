//! Shared types for the storefront engine
//!
//! Common types used by the engine and its collaborators: catalog and courier
//! models, order snapshots and events, error codes.

pub mod error;
pub mod models;
pub mod order;
pub mod util;

// Re-exports
pub use serde::{Deserialize, Serialize};

pub use error::{AppError, ErrorCategory, ErrorCode};
pub use models::{CourierProfile, Sku, WorkingInterval};
pub use order::{OrderSnapshot, OrderStatus};
