//! Courier Model

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// Daily working interval of a courier, `[start, end)`
///
/// An interval whose end is before its start wraps past midnight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkingInterval {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WorkingInterval {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Courier entry of the directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CourierProfile {
    pub courier_id: String,
    #[serde(default)]
    pub name: String,
    pub active: bool,
    /// None = no restriction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_interval: Option<WorkingInterval>,
}

impl CourierProfile {
    /// Whether the courier can take a delivery at the given time of day
    pub fn is_available_at(&self, time: Option<NaiveTime>) -> bool {
        if !self.active {
            return false;
        }
        match (self.working_interval, time) {
            (Some(interval), Some(t)) => interval.contains(t),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_interval_contains() {
        let day = WorkingInterval::new(t(9, 0), t(18, 0));
        assert!(day.contains(t(9, 0)));
        assert!(day.contains(t(17, 59)));
        assert!(!day.contains(t(18, 0)));
        assert!(!day.contains(t(8, 30)));
    }

    #[test]
    fn test_interval_wraps_midnight() {
        let night = WorkingInterval::new(t(22, 0), t(2, 0));
        assert!(night.contains(t(23, 0)));
        assert!(night.contains(t(1, 0)));
        assert!(!night.contains(t(12, 0)));
    }

    #[test]
    fn test_inactive_courier_unavailable() {
        let courier = CourierProfile {
            courier_id: "c1".into(),
            name: "Ana".into(),
            active: false,
            working_interval: None,
        };
        assert!(!courier.is_available_at(None));
        assert!(!courier.is_available_at(Some(t(10, 0))));
    }
}
