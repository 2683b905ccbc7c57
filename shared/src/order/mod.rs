//! Order lifecycle types shared with collaborators

pub mod event;
pub mod reservation;
pub mod snapshot;
pub mod types;

pub use event::{OrderEvent, OrderEventType};
pub use reservation::Reservation;
pub use snapshot::{OrderSnapshot, OrderStatus};
pub use types::{
    Actor, CartLine, ContactDetails, DeductedLine, DeliveryMethod, DeliverySlot, ItemInput,
    LineItem, PaymentMethod, PaymentRecord,
};
