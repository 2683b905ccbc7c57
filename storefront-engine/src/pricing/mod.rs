//! Order pricing
//!
//! Volume (bulk) unit prices and promo percentages, computed once at order
//! creation and frozen on the order.

mod calculator;

pub use calculator::*;
