use super::*;
use shared::error::ErrorCode;

// ========================================================================
// 确认
// ========================================================================

#[test]
fn test_confirm_requires_owner_and_buffer() {
    let engine = create_engine();
    let order_id = create(&engine, "cust-1", vec![item("Y", 1)]);
    let m = &engine.manager;

    assert!(matches!(
        m.confirm_order(&order_id, "cust-2", DeliveryMethod::Pickup, contact()),
        Err(ManagerError::NotOwner(_))
    ));
    m.confirm_order(&order_id, "cust-1", DeliveryMethod::Pickup, contact())
        .unwrap();
    assert!(matches!(
        m.confirm_order(&order_id, "cust-1", DeliveryMethod::Pickup, contact()),
        Err(ManagerError::IllegalTransition {
            from: OrderStatus::Pending,
            to: OrderStatus::Pending
        })
    ));
}

#[test]
fn test_confirm_contact_validation() {
    let engine = create_engine();
    let order_id = create(&engine, "cust-1", vec![item("Y", 1)]);
    let m = &engine.manager;

    let no_phone = ContactDetails {
        phone: "  ".into(),
        ..contact()
    };
    assert!(matches!(
        m.confirm_order(&order_id, "cust-1", DeliveryMethod::Pickup, no_phone),
        Err(ManagerError::Validation(_))
    ));
    let no_address = ContactDetails {
        address: None,
        ..contact()
    };
    assert!(matches!(
        m.confirm_order(&order_id, "cust-1", DeliveryMethod::Courier, no_address),
        Err(ManagerError::Validation(_))
    ));
    assert_eq!(order(&engine, &order_id).status, OrderStatus::Buffer);
}

#[test]
fn test_confirm_after_reservation_expiry_rejected() {
    let config = ManagerConfig {
        reservation_ttl_ms: 0,
        ..ManagerConfig::default()
    };
    let engine = create_engine_with(test_catalog(), config);
    let order_id = create(&engine, "cust-1", vec![item("Y", 1)]);

    let err = engine
        .manager
        .confirm_order(&order_id, "cust-1", DeliveryMethod::Pickup, contact())
        .unwrap_err();
    assert!(matches!(err, ManagerError::ReservationExpired(_)));
}

#[test]
fn test_unknown_order() {
    let engine = create_engine();
    assert!(matches!(
        engine
            .manager
            .confirm_order("missing", "cust-1", DeliveryMethod::Pickup, contact()),
        Err(ManagerError::OrderNotFound(_))
    ));
    assert!(engine.manager.get_order("missing").unwrap().is_none());
}

// ========================================================================
// 支付前置条件
// ========================================================================

#[tokio::test]
async fn test_payment_preconditions() {
    let engine = create_engine();
    let order_id = create(&engine, "cust-1", vec![item("Y", 1)]);
    let m = &engine.manager;

    assert!(matches!(
        m.record_payment(&order_id, "cust-1", PaymentMethod::Card, None, None)
            .await,
        Err(ManagerError::NotConfirmed(_))
    ));
    m.confirm_order(&order_id, "cust-1", DeliveryMethod::Pickup, contact())
        .unwrap();
    assert!(matches!(
        m.record_payment(&order_id, "cust-2", PaymentMethod::Card, None, None)
            .await,
        Err(ManagerError::NotOwner(_))
    ));
    assert!(matches!(
        m.record_payment(&order_id, "cust-1", PaymentMethod::Card, Some(-1.0), None)
            .await,
        Err(ManagerError::InvalidBonus(_))
    ));
    assert!(!order(&engine, &order_id).is_paid());

    m.cancel_order(&order_id, &Actor::Customer("cust-1".into()))
        .await
        .unwrap();
    assert!(matches!(
        m.record_payment(&order_id, "cust-1", PaymentMethod::Card, None, None)
            .await,
        Err(ManagerError::IllegalTransition {
            from: OrderStatus::Cancelled,
            ..
        })
    ));
}

#[tokio::test]
async fn test_payment_keeps_status() {
    let engine = create_engine();
    let m = &engine.manager;

    let pending = confirmed_order(&engine, "cust-1", vec![item("Y", 1)]);
    m.record_payment(&pending, "cust-1", PaymentMethod::Card, None, None)
        .await
        .unwrap();
    assert_eq!(order(&engine, &pending).status, OrderStatus::Pending);

    let assigned = confirmed_order(&engine, "cust-2", vec![item("Y", 1)]);
    m.set_delivery_slot(&assigned, d(), t(10, 0)).await.unwrap();
    m.assign_courier(&assigned, "c1").await.unwrap();
    m.record_payment(&assigned, "cust-2", PaymentMethod::Card, None, None)
        .await
        .unwrap();
    let snapshot = order(&engine, &assigned);
    assert_eq!(snapshot.status, OrderStatus::CourierAssigned);
    assert!(snapshot.is_paid());
    assert_eq!(snapshot.courier_id.as_deref(), Some("c1"));
}

// ========================================================================
// 权限
// ========================================================================

#[tokio::test]
async fn test_cancel_authorization() {
    let engine = create_engine();
    let order_id = create(&engine, "cust-1", vec![item("Y", 1)]);
    let m = &engine.manager;

    assert!(matches!(
        m.cancel_order(&order_id, &Actor::Customer("cust-2".into())).await,
        Err(ManagerError::NotOwner(_))
    ));
    assert!(matches!(
        m.cancel_order(&order_id, &Actor::Courier("c1".into())).await,
        Err(ManagerError::NotOwner(_))
    ));
    assert_eq!(order(&engine, &order_id).status, OrderStatus::Buffer);
}

#[tokio::test]
async fn test_delivery_authorization() {
    let engine = create_engine();
    let order_id = assigned_order(&engine, "cust-1", vec![item("Y", 1)]).await;
    let m = &engine.manager;

    assert!(matches!(
        m.mark_delivered(&order_id, &Actor::Courier("c2".into())).await,
        Err(ManagerError::NotAssignedCourier(_))
    ));
    assert!(matches!(
        m.mark_delivered(&order_id, &Actor::Customer("cust-1".into())).await,
        Err(ManagerError::NotAssignedCourier(_))
    ));
    assert!(matches!(
        m.mark_not_issued(&order_id, &Actor::Courier("c2".into()), None).await,
        Err(ManagerError::NotAssignedCourier(_))
    ));
    m.mark_delivered(&order_id, &Actor::Admin).await.unwrap();
}

#[tokio::test]
async fn test_courier_delivery_needs_courier() {
    let engine = create_engine();
    let order_id = paid_order(&engine, "cust-1", vec![item("Y", 1)]).await;

    let err = engine
        .manager
        .mark_delivered(&order_id, &Actor::Admin)
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::NoCourierAssigned(_)));
}

// ========================================================================
// 终态
// ========================================================================

#[tokio::test]
async fn test_terminal_states_are_final() {
    let engine = create_engine();
    let order_id = assigned_order(&engine, "cust-1", vec![item("Y", 1)]).await;
    let m = &engine.manager;
    m.mark_delivered(&order_id, &Actor::Courier("c1".into()))
        .await
        .unwrap();

    let err = m.cancel_order(&order_id, &Actor::Admin).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::OrderAlreadyDelivered);
    assert!(matches!(
        m.mark_not_issued(&order_id, &Actor::Admin, None).await,
        Err(ManagerError::IllegalTransition {
            from: OrderStatus::Delivered,
            to: OrderStatus::NotIssued
        })
    ));
    assert!(matches!(
        m.assign_courier(&order_id, "c1").await,
        Err(ManagerError::IllegalTransition { .. })
    ));
    assert!(matches!(
        m.set_delivery_slot(&order_id, d(), t(12, 0)).await,
        Err(ManagerError::IllegalTransition { .. })
    ));
    assert_eq!(order(&engine, &order_id).status, OrderStatus::Delivered);

    let cancelled = create(&engine, "cust-1", vec![item("Y", 1)]);
    m.cancel_order(&cancelled, &Actor::Admin).await.unwrap();
    let err = m.mark_delivered(&cancelled, &Actor::Admin).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::OrderAlreadyCancelled);
}

// ========================================================================
// 快递员 / 时间段
// ========================================================================

#[tokio::test]
async fn test_assign_courier_checks() {
    let engine = create_engine();
    let m = &engine.manager;

    let buffer = create(&engine, "cust-1", vec![item("Y", 1)]);
    assert!(matches!(
        m.assign_courier(&buffer, "c1").await,
        Err(ManagerError::IllegalTransition {
            from: OrderStatus::Buffer,
            to: OrderStatus::CourierAssigned
        })
    ));

    let order_id = confirmed_order(&engine, "cust-1", vec![item("Y", 1)]);
    assert!(matches!(
        m.assign_courier(&order_id, "nobody").await,
        Err(ManagerError::CourierNotFound(_))
    ));

    // c2 works 09:00-18:00
    m.set_delivery_slot(&order_id, d(), t(20, 0)).await.unwrap();
    assert!(matches!(
        m.assign_courier(&order_id, "c2").await,
        Err(ManagerError::CourierUnavailable(_))
    ));

    engine.couriers.set_active("c1", false);
    assert!(matches!(
        m.assign_courier(&order_id, "c1").await,
        Err(ManagerError::CourierUnavailable(_))
    ));
    engine.couriers.set_active("c1", true);
    m.assign_courier(&order_id, "c1").await.unwrap();

    // Reassignment moves the slot to the new courier
    m.set_delivery_slot(&order_id, d(), t(10, 0)).await.unwrap();
    m.assign_courier(&order_id, "c2").await.unwrap();
    let storage = m.storage();
    assert!(
        storage
            .get_slot_holder(&DeliverySlot::new(d(), t(10, 0)).key_for("c1"))
            .unwrap()
            .is_none()
    );
    assert_eq!(
        storage
            .get_slot_holder(&DeliverySlot::new(d(), t(10, 0)).key_for("c2"))
            .unwrap()
            .as_deref(),
        Some(order_id.as_str())
    );
}

#[tokio::test]
async fn test_slot_exclusive_per_courier() {
    let engine = create_engine();
    let m = &engine.manager;
    let first = assigned_order(&engine, "cust-1", vec![item("Y", 1)]).await;

    let second = paid_order(&engine, "cust-2", vec![item("Y", 1)]).await;
    m.set_delivery_slot(&second, d(), t(10, 0)).await.unwrap();
    assert!(matches!(
        m.assign_courier(&second, "c1").await,
        Err(ManagerError::SlotTaken(_))
    ));

    m.set_delivery_slot(&second, d(), t(11, 0)).await.unwrap();
    m.assign_courier(&second, "c1").await.unwrap();
    assert!(matches!(
        m.set_delivery_slot(&second, d(), t(10, 0)).await,
        Err(ManagerError::SlotTaken(_))
    ));

    // Moving the first order frees 10:00
    m.set_delivery_slot(&first, d(), t(12, 0)).await.unwrap();
    m.set_delivery_slot(&second, d(), t(10, 0)).await.unwrap();
    assert_eq!(
        order(&engine, &second).delivery_slot,
        Some(DeliverySlot::new(d(), t(10, 0)))
    );
}

#[tokio::test]
async fn test_notification_failure_does_not_block_assignment() {
    let engine = create_engine();
    engine.notifier.set_failing(true);
    let order_id = confirmed_order(&engine, "cust-1", vec![item("Y", 1)]);

    let snapshot = engine.manager.assign_courier(&order_id, "c1").await.unwrap();
    assert_eq!(snapshot.status, OrderStatus::CourierAssigned);
    assert!(engine.notifier.sent().is_empty());
}
