use super::super::storage::StorageError;
use crate::inventory::StockError;
use crate::pricing::PricingError;
use shared::error::{AppError, ErrorCode};
use shared::order::OrderStatus;
use thiserror::Error;

/// Manager errors
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // ========== Admission ==========
    #[error("Insufficient stock for {sku}: requested {requested}, available {available}")]
    InsufficientStock {
        sku: String,
        requested: u32,
        available: u64,
    },

    #[error("Invalid quantity {quantity} for {sku}")]
    InvalidQuantity { sku: String, quantity: u32 },

    #[error("Unknown SKU: {0}")]
    UnknownSku(String),

    #[error("SKU is inactive: {0}")]
    InactiveSku(String),

    #[error("Unknown promo code: {0}")]
    UnknownPromoCode(String),

    #[error("Order has no items")]
    EmptyOrder,

    #[error("Validation failed: {0}")]
    Validation(String),

    // ========== Authorization ==========
    #[error("Order {0} belongs to another customer")]
    NotOwner(String),

    #[error("Caller is not the courier assigned to order {0}")]
    NotAssignedCourier(String),

    // ========== Transition ==========
    #[error("Illegal transition: {from} -> {to}")]
    IllegalTransition { from: OrderStatus, to: OrderStatus },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Reservation of order {0} has expired")]
    ReservationExpired(String),

    #[error("Slot already taken: {0}")]
    SlotTaken(String),

    #[error("Courier not found: {0}")]
    CourierNotFound(String),

    #[error("Courier unavailable: {0}")]
    CourierUnavailable(String),

    #[error("Order {0} has no delivery method")]
    NotConfirmed(String),

    #[error("Order {0} has no courier assigned")]
    NoCourierAssigned(String),

    #[error("Invalid bonus amount: {0}")]
    InvalidBonus(String),

    // ========== Integrity ==========
    #[error(transparent)]
    Stock(#[from] StockError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<PricingError> for ManagerError {
    fn from(err: PricingError) -> Self {
        match err {
            PricingError::UnknownPromoCode(code) => ManagerError::UnknownPromoCode(code),
        }
    }
}

/// 将存储错误转换为错误码
fn classify_storage_error(e: &StorageError) -> ErrorCode {
    // 先按枚举变体精确匹配
    if let StorageError::Serialization(_) = e {
        return ErrorCode::InternalError;
    }

    // redb 错误通过字符串匹配分类
    let err_str = e.to_string().to_lowercase();

    if err_str.contains("no space") || err_str.contains("disk full") || err_str.contains("enospc")
    {
        return ErrorCode::StorageFull;
    }

    if err_str.contains("out of memory") || err_str.contains("cannot allocate") {
        return ErrorCode::OutOfMemory;
    }

    if err_str.contains("corrupt") || err_str.contains("invalid database") {
        return ErrorCode::StorageCorrupted;
    }

    // 默认：系统繁忙
    ErrorCode::SystemBusy
}

impl ManagerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ManagerError::Storage(e) => classify_storage_error(e),
            ManagerError::InsufficientStock { .. } => ErrorCode::ProductOutOfStock,
            ManagerError::InvalidQuantity { .. } => ErrorCode::InvalidQuantity,
            ManagerError::UnknownSku(_) => ErrorCode::ProductNotFound,
            ManagerError::InactiveSku(_) => ErrorCode::ProductInactive,
            ManagerError::UnknownPromoCode(_) => ErrorCode::PromoCodeNotFound,
            ManagerError::EmptyOrder => ErrorCode::OrderEmpty,
            ManagerError::Validation(_) => ErrorCode::ValidationFailed,
            ManagerError::NotOwner(_) => ErrorCode::NotOrderOwner,
            ManagerError::NotAssignedCourier(_) => ErrorCode::NotAssignedCourier,
            ManagerError::IllegalTransition { from, .. } => match from {
                OrderStatus::Delivered => ErrorCode::OrderAlreadyDelivered,
                OrderStatus::Cancelled => ErrorCode::OrderAlreadyCancelled,
                _ => ErrorCode::InvalidTransition,
            },
            ManagerError::OrderNotFound(_) => ErrorCode::OrderNotFound,
            ManagerError::ReservationExpired(_) => ErrorCode::InvalidTransition,
            ManagerError::SlotTaken(_) => ErrorCode::SlotTaken,
            ManagerError::CourierNotFound(_) => ErrorCode::CourierNotFound,
            ManagerError::CourierUnavailable(_) => ErrorCode::CourierUnavailable,
            ManagerError::NotConfirmed(_) => ErrorCode::OrderNotConfirmed,
            ManagerError::NoCourierAssigned(_) => ErrorCode::NoCourierAssigned,
            ManagerError::InvalidBonus(_) => ErrorCode::InvalidBonusAmount,
            ManagerError::Stock(StockError::NegativeStock { .. }) => {
                ErrorCode::StockIntegrityViolation
            }
            ManagerError::Stock(StockError::UnknownSku(_)) => ErrorCode::ProductNotFound,
            ManagerError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl From<ManagerError> for AppError {
    fn from(err: ManagerError) -> Self {
        let code = err.code();
        if let ManagerError::Storage(e) = &err {
            tracing::error!(error = %e, error_code = ?code, "Storage error occurred");
        }
        let message = err.to_string();
        match err {
            ManagerError::InsufficientStock {
                sku,
                requested,
                available,
            } => AppError::with_message(code, message)
                .with_detail("sku", sku)
                .with_detail("requested", requested)
                .with_detail("available", available),
            ManagerError::IllegalTransition { from, to } => AppError::with_message(code, message)
                .with_detail("from", from.as_str())
                .with_detail("to", to.as_str()),
            _ => AppError::with_message(code, message),
        }
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_stock_maps_with_details() {
        let err: AppError = ManagerError::InsufficientStock {
            sku: "X".into(),
            requested: 2,
            available: 1,
        }
        .into();
        assert_eq!(err.code, ErrorCode::ProductOutOfStock);
        assert_eq!(err.detail("sku"), Some(&serde_json::json!("X")));
        assert_eq!(err.detail("available"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_terminal_transition_codes() {
        let delivered = ManagerError::IllegalTransition {
            from: OrderStatus::Delivered,
            to: OrderStatus::Cancelled,
        };
        assert_eq!(delivered.code(), ErrorCode::OrderAlreadyDelivered);
        let pending = ManagerError::IllegalTransition {
            from: OrderStatus::Buffer,
            to: OrderStatus::CourierAssigned,
        };
        assert_eq!(pending.code(), ErrorCode::InvalidTransition);
    }

    #[test]
    fn test_storage_errors_classified() {
        let bad_json = serde_json::from_str::<u32>("x").unwrap_err();
        let err = ManagerError::Storage(StorageError::Serialization(bad_json));
        assert_eq!(err.code(), ErrorCode::InternalError);
        let stock = ManagerError::Stock(StockError::NegativeStock {
            sku: "X".into(),
            on_hand: 0,
            delta: -1,
        });
        assert_eq!(stock.code(), ErrorCode::StockIntegrityViolation);
    }
}
