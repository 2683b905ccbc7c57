//! Unified error codes for the storefront engine
//!
//! Error codes are organized by category:
//! - 0xxx: General errors
//! - 2xxx: Permission errors
//! - 4xxx: Order errors
//! - 5xxx: Payment errors
//! - 6xxx: Product / stock errors
//! - 7xxx: Courier / delivery errors
//! - 9xxx: System errors

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error code enum
///
/// All error codes are represented as u16 values for efficient serialization
/// and cross-language compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    // ==================== 0xxx: General ====================
    /// Operation completed successfully
    Success = 0,
    /// Unknown error
    Unknown = 1,
    /// Validation failed
    ValidationFailed = 2,
    /// Resource not found
    NotFound = 3,
    /// Invalid request
    InvalidRequest = 5,
    /// Value out of range
    ValueOutOfRange = 8,

    // ==================== 2xxx: Permission ====================
    /// Permission denied
    PermissionDenied = 2001,
    /// Caller does not own the order
    NotOrderOwner = 2006,
    /// Caller is not the courier assigned to the order
    NotAssignedCourier = 2007,

    // ==================== 4xxx: Order ====================
    /// Order not found
    OrderNotFound = 4001,
    /// Order has already been paid
    OrderAlreadyPaid = 4002,
    /// Order has already been delivered
    OrderAlreadyDelivered = 4003,
    /// Order has already been cancelled
    OrderAlreadyCancelled = 4004,
    /// Order is empty
    OrderEmpty = 4007,
    /// Illegal status transition
    InvalidTransition = 4008,
    /// Order has no delivery method yet
    OrderNotConfirmed = 4009,

    // ==================== 5xxx: Payment ====================
    /// Invalid payment method
    PaymentInvalidMethod = 5003,
    /// Invalid bonus amount
    InvalidBonusAmount = 5006,

    // ==================== 6xxx: Product / Stock ====================
    /// SKU not found in catalog
    ProductNotFound = 6001,
    /// SKU is out of stock
    ProductOutOfStock = 6003,
    /// SKU is inactive
    ProductInactive = 6004,
    /// Quantity is not a positive integer within bounds
    InvalidQuantity = 6005,
    /// Promo code not found
    PromoCodeNotFound = 6901,

    // ==================== 7xxx: Courier ====================
    /// Courier not found
    CourierNotFound = 7001,
    /// Courier is inactive or outside working interval
    CourierUnavailable = 7002,
    /// Delivery slot already taken
    SlotTaken = 7003,
    /// No courier assigned
    NoCourierAssigned = 7004,

    // ==================== 9xxx: System ====================
    /// Internal server error
    InternalError = 9001,
    /// Database error
    DatabaseError = 9002,
    /// Network error
    NetworkError = 9003,
    /// Operation timeout
    TimeoutError = 9004,
    /// Configuration error
    ConfigError = 9005,

    // ==================== 94xx: Storage ====================
    /// Storage full (disk space insufficient)
    StorageFull = 9401,
    /// Out of memory
    OutOfMemory = 9402,
    /// Storage corrupted (data file damaged)
    StorageCorrupted = 9403,
    /// System busy (IO error, retry later)
    SystemBusy = 9404,

    // ==================== 95xx: Integrity ====================
    /// Stock mutation would drive on-hand quantity negative
    StockIntegrityViolation = 9501,
}

impl ErrorCode {
    /// Get the numeric code value
    #[inline]
    pub const fn code(&self) -> u16 {
        *self as u16
    }

    /// Check if this is a success code
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, ErrorCode::Success)
    }

    /// Get the developer-facing English message for this error code
    pub const fn message(&self) -> &'static str {
        match self {
            // General
            ErrorCode::Success => "Operation completed successfully",
            ErrorCode::Unknown => "An unknown error occurred",
            ErrorCode::ValidationFailed => "Validation failed",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::ValueOutOfRange => "Value is out of range",

            // Permission
            ErrorCode::PermissionDenied => "Permission denied",
            ErrorCode::NotOrderOwner => "Order belongs to another customer",
            ErrorCode::NotAssignedCourier => "Caller is not the assigned courier",

            // Order
            ErrorCode::OrderNotFound => "Order not found",
            ErrorCode::OrderAlreadyPaid => "Order has already been paid",
            ErrorCode::OrderAlreadyDelivered => "Order has already been delivered",
            ErrorCode::OrderAlreadyCancelled => "Order has already been cancelled",
            ErrorCode::OrderEmpty => "Order is empty",
            ErrorCode::InvalidTransition => "Illegal order status transition",
            ErrorCode::OrderNotConfirmed => "Order has no delivery method",

            // Payment
            ErrorCode::PaymentInvalidMethod => "Invalid payment method",
            ErrorCode::InvalidBonusAmount => "Invalid bonus amount",

            // Product
            ErrorCode::ProductNotFound => "Product not found",
            ErrorCode::ProductOutOfStock => "Product is out of stock",
            ErrorCode::ProductInactive => "Product is inactive",
            ErrorCode::InvalidQuantity => "Invalid quantity",
            ErrorCode::PromoCodeNotFound => "Promo code not found",

            // Courier
            ErrorCode::CourierNotFound => "Courier not found",
            ErrorCode::CourierUnavailable => "Courier is unavailable",
            ErrorCode::SlotTaken => "Delivery slot is already taken",
            ErrorCode::NoCourierAssigned => "No courier assigned",

            // System
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::DatabaseError => "Database error",
            ErrorCode::NetworkError => "Network error",
            ErrorCode::TimeoutError => "Operation timed out",
            ErrorCode::ConfigError => "Configuration error",
            ErrorCode::StorageFull => "Storage is full",
            ErrorCode::OutOfMemory => "Out of memory",
            ErrorCode::StorageCorrupted => "Storage is corrupted",
            ErrorCode::SystemBusy => "System busy, retry later",
            ErrorCode::StockIntegrityViolation => "Stock would become negative",
        }
    }
}

impl From<ErrorCode> for u16 {
    #[inline]
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

/// Error returned when converting an unknown u16 into [`ErrorCode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidErrorCode(pub u16);

impl fmt::Display for InvalidErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error code: {}", self.0)
    }
}

impl std::error::Error for InvalidErrorCode {}

impl TryFrom<u16> for ErrorCode {
    type Error = InvalidErrorCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let code = match value {
            0 => ErrorCode::Success,
            1 => ErrorCode::Unknown,
            2 => ErrorCode::ValidationFailed,
            3 => ErrorCode::NotFound,
            5 => ErrorCode::InvalidRequest,
            8 => ErrorCode::ValueOutOfRange,

            2001 => ErrorCode::PermissionDenied,
            2006 => ErrorCode::NotOrderOwner,
            2007 => ErrorCode::NotAssignedCourier,

            4001 => ErrorCode::OrderNotFound,
            4002 => ErrorCode::OrderAlreadyPaid,
            4003 => ErrorCode::OrderAlreadyDelivered,
            4004 => ErrorCode::OrderAlreadyCancelled,
            4007 => ErrorCode::OrderEmpty,
            4008 => ErrorCode::InvalidTransition,
            4009 => ErrorCode::OrderNotConfirmed,

            5003 => ErrorCode::PaymentInvalidMethod,
            5006 => ErrorCode::InvalidBonusAmount,

            6001 => ErrorCode::ProductNotFound,
            6003 => ErrorCode::ProductOutOfStock,
            6004 => ErrorCode::ProductInactive,
            6005 => ErrorCode::InvalidQuantity,
            6901 => ErrorCode::PromoCodeNotFound,

            7001 => ErrorCode::CourierNotFound,
            7002 => ErrorCode::CourierUnavailable,
            7003 => ErrorCode::SlotTaken,
            7004 => ErrorCode::NoCourierAssigned,

            9001 => ErrorCode::InternalError,
            9002 => ErrorCode::DatabaseError,
            9003 => ErrorCode::NetworkError,
            9004 => ErrorCode::TimeoutError,
            9005 => ErrorCode::ConfigError,
            9401 => ErrorCode::StorageFull,
            9402 => ErrorCode::OutOfMemory,
            9403 => ErrorCode::StorageCorrupted,
            9404 => ErrorCode::SystemBusy,
            9501 => ErrorCode::StockIntegrityViolation,

            other => return Err(InvalidErrorCode(other)),
        };
        Ok(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{:04}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::Success.code(), 0);
        assert_eq!(ErrorCode::OrderNotFound.code(), 4001);
        assert_eq!(ErrorCode::ProductOutOfStock.code(), 6003);
        assert_eq!(ErrorCode::SlotTaken.code(), 7003);
        assert_eq!(ErrorCode::StockIntegrityViolation.code(), 9501);
    }

    #[test]
    fn test_try_from_valid() {
        assert_eq!(ErrorCode::try_from(4008), Ok(ErrorCode::InvalidTransition));
        assert_eq!(ErrorCode::try_from(2007), Ok(ErrorCode::NotAssignedCourier));
    }

    #[test]
    fn test_try_from_invalid() {
        assert_eq!(ErrorCode::try_from(4242), Err(InvalidErrorCode(4242)));
    }

    #[test]
    fn test_serialize_as_number() {
        let json = serde_json::to_string(&ErrorCode::ProductOutOfStock).unwrap();
        assert_eq!(json, "6003");
        let back: ErrorCode = serde_json::from_str("7003").unwrap();
        assert_eq!(back, ErrorCode::SlotTaken);
    }

    #[test]
    fn test_display() {
        assert_eq!(ErrorCode::Success.to_string(), "E0000");
        assert_eq!(ErrorCode::OrderNotFound.to_string(), "E4001");
    }
}
