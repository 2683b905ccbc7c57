use super::*;
use crate::services::{RecordingNotifier, StaticCourierDirectory};
use shared::models::{CourierProfile, WorkingInterval};
use shared::order::OrderEventType;

struct TestEngine {
    manager: OrdersManager,
    catalog: Arc<CatalogService>,
    couriers: Arc<StaticCourierDirectory>,
    notifier: Arc<RecordingNotifier>,
}

/// X: 20.00, bulk 15.00 from 3 units, 10 on hand
/// Y: 10.00, 5 on hand
/// Z: inactive
fn test_catalog() -> Vec<Sku> {
    vec![
        Sku::new("X", "Rose", 20.0, 10).with_bulk_price(15.0),
        Sku::new("Y", "Tulip", 10.0, 5),
        Sku::new("Z", "Orchid", 50.0, 3).inactive(),
    ]
}

fn test_courier(id: &str, hours: Option<(u32, u32)>) -> CourierProfile {
    CourierProfile {
        courier_id: id.to_string(),
        name: format!("Courier {}", id),
        active: true,
        working_interval: hours.map(|(start, end)| WorkingInterval::new(t(start, 0), t(end, 0))),
    }
}

fn create_engine_with(skus: Vec<Sku>, config: ManagerConfig) -> TestEngine {
    let storage = OrderStorage::open_in_memory().unwrap();
    let catalog = Arc::new(CatalogService::with_skus(skus));
    let couriers = Arc::new(StaticCourierDirectory::with_couriers([
        test_courier("c1", None),
        test_courier("c2", Some((9, 18))),
    ]));
    let notifier = Arc::new(RecordingNotifier::new());
    let manager = OrdersManager::new(
        storage,
        catalog.clone(),
        couriers.clone(),
        notifier.clone(),
        config,
    )
    .with_pricing(PricingPolicy::default().with_promo("SPRING10", 10.0));
    TestEngine {
        manager,
        catalog,
        couriers,
        notifier,
    }
}

fn create_engine() -> TestEngine {
    create_engine_with(test_catalog(), ManagerConfig::default())
}

fn item(sku: &str, quantity: u32) -> ItemInput {
    ItemInput::new(sku, quantity)
}

fn contact() -> ContactDetails {
    ContactDetails {
        name: "Ann".to_string(),
        phone: "+100200300".to_string(),
        address: Some("Main st 1".to_string()),
        note: None,
    }
}

fn d() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 8).unwrap()
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn create(engine: &TestEngine, customer: &str, items: Vec<ItemInput>) -> String {
    engine
        .manager
        .create_order(customer, items, None, None)
        .unwrap()
        .order_id
}

fn confirmed_order(engine: &TestEngine, customer: &str, items: Vec<ItemInput>) -> String {
    let order_id = create(engine, customer, items);
    engine
        .manager
        .confirm_order(&order_id, customer, DeliveryMethod::Courier, contact())
        .unwrap();
    order_id
}

async fn paid_order(engine: &TestEngine, customer: &str, items: Vec<ItemInput>) -> String {
    let order_id = confirmed_order(engine, customer, items);
    engine
        .manager
        .record_payment(&order_id, customer, PaymentMethod::Card, None, None)
        .await
        .unwrap();
    order_id
}

/// Paid, slot 10:00 on [`d`], courier c1
async fn assigned_order(engine: &TestEngine, customer: &str, items: Vec<ItemInput>) -> String {
    let order_id = paid_order(engine, customer, items).await;
    engine
        .manager
        .set_delivery_slot(&order_id, d(), t(10, 0))
        .await
        .unwrap();
    engine.manager.assign_courier(&order_id, "c1").await.unwrap();
    order_id
}

fn order(engine: &TestEngine, order_id: &str) -> OrderSnapshot {
    engine.manager.get_order(order_id).unwrap().unwrap()
}

fn event_types(engine: &TestEngine, order_id: &str) -> Vec<OrderEventType> {
    engine
        .manager
        .order_events(order_id)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

fn available(engine: &TestEngine, sku: &str) -> i64 {
    engine.manager.get_available_quantity(sku).unwrap()
}

mod test_rules;
