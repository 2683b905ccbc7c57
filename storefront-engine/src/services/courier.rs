//! Courier directory
//!
//! The engine only asks "who is this courier and can they work at this time".
//! Where the roster comes from is the directory's business.

use async_trait::async_trait;
use parking_lot::RwLock;
use shared::models::CourierProfile;
use std::collections::HashMap;

/// Courier roster lookup
#[async_trait]
pub trait CourierDirectory: Send + Sync {
    async fn get_courier(&self, courier_id: &str) -> Option<CourierProfile>;
}

/// In-memory roster (configured at startup, editable at runtime)
#[derive(Debug, Default)]
pub struct StaticCourierDirectory {
    couriers: RwLock<HashMap<String, CourierProfile>>,
}

impl StaticCourierDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_couriers(couriers: impl IntoIterator<Item = CourierProfile>) -> Self {
        let directory = Self::new();
        for courier in couriers {
            directory.upsert(courier);
        }
        directory
    }

    pub fn upsert(&self, courier: CourierProfile) {
        self.couriers
            .write()
            .insert(courier.courier_id.clone(), courier);
    }

    pub fn set_active(&self, courier_id: &str, active: bool) -> bool {
        match self.couriers.write().get_mut(courier_id) {
            Some(courier) => {
                courier.active = active;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.couriers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.couriers.read().is_empty()
    }
}

#[async_trait]
impl CourierDirectory for StaticCourierDirectory {
    async fn get_courier(&self, courier_id: &str) -> Option<CourierProfile> {
        self.couriers.read().get(courier_id).cloned()
    }
}

/// Parse `id:name:HH:MM-HH:MM` entries separated by commas
///
/// Name and interval are optional (`c1`, `c1:Ann`, `c1::09:00-18:00`).
pub fn parse_roster(raw: &str) -> Vec<CourierProfile> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let mut parts = entry.splitn(3, ':');
            let courier_id = parts.next()?.trim().to_string();
            if courier_id.is_empty() {
                return None;
            }
            let name = parts.next().unwrap_or_default().trim().to_string();
            let working_interval = parts.next().and_then(parse_interval);
            Some(CourierProfile {
                courier_id,
                name,
                active: true,
                working_interval,
            })
        })
        .collect()
}

fn parse_interval(raw: &str) -> Option<shared::models::WorkingInterval> {
    let (start, end) = raw.trim().split_once('-')?;
    let start = chrono::NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?;
    let end = chrono::NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()?;
    Some(shared::models::WorkingInterval::new(start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[tokio::test]
    async fn test_static_directory_lookup() {
        let directory = StaticCourierDirectory::with_couriers(parse_roster("c1:Ann, c2"));
        assert_eq!(directory.len(), 2);
        let ann = directory.get_courier("c1").await.unwrap();
        assert_eq!(ann.name, "Ann");
        assert!(ann.active);
        assert!(directory.get_courier("c3").await.is_none());

        assert!(directory.set_active("c2", false));
        assert!(!directory.get_courier("c2").await.unwrap().active);
        assert!(!directory.set_active("c3", false));
    }

    #[test]
    fn test_parse_roster_interval() {
        let roster = parse_roster("c1::09:00-18:00,,c2:Bob:bad");
        assert_eq!(roster.len(), 2);
        let interval = roster[0].working_interval.unwrap();
        assert_eq!(interval.start, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(interval.end, NaiveTime::from_hms_opt(18, 0, 0).unwrap());
        assert_eq!(roster[1].name, "Bob");
        assert!(roster[1].working_interval.is_none());
    }
}
