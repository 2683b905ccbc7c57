//! Stock reservation (hold)

use serde::{Deserialize, Serialize};

/// Temporary claim against on-hand stock tied to an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub reservation_id: String,
    pub order_id: String,
    pub sku: String,
    pub quantity: u32,
    pub created_at: i64,
    /// Absolute expiry (ms)
    pub expires_at: i64,
    #[serde(default)]
    pub released: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<i64>,
}

impl Reservation {
    /// Counts against availability at `now`
    pub fn is_active(&self, now: i64) -> bool {
        !self.released && self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_active() {
        let mut r = Reservation {
            reservation_id: "r1".into(),
            order_id: "o1".into(),
            sku: "X".into(),
            quantity: 1,
            created_at: 0,
            expires_at: 1_000,
            released: false,
            released_at: None,
        };
        assert!(r.is_active(999));
        assert!(!r.is_active(1_000));
        r.released = true;
        assert!(!r.is_active(0));
    }
}
