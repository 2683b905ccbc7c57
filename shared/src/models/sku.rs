//! SKU Model

use serde::{Deserialize, Serialize};

/// Stock-keeping unit as seen by the engine
///
/// Rows come from the external ledger already mapped to this shape; column
/// aliasing is the adapter's concern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sku {
    pub id: String,
    pub name: String,
    pub unit_price: f64,
    #[serde(default)]
    pub category: String,
    /// Physical stock, never negative
    pub on_hand: i64,
    #[serde(default = "default_active")]
    pub active: bool,
    /// 批量单价（数量达到阈值时使用）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulk_price: Option<f64>,
}

fn default_active() -> bool {
    true
}

impl Sku {
    pub fn new(id: impl Into<String>, name: impl Into<String>, unit_price: f64, on_hand: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            unit_price,
            category: String::new(),
            on_hand,
            active: true,
            bulk_price: None,
        }
    }

    pub fn with_bulk_price(mut self, bulk_price: f64) -> Self {
        self.bulk_price = Some(bulk_price);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}
