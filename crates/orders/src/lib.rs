//! Orders domain module.
//!
//! The order aggregate (an `Order` owning `OrderItem`s and `Payment`s), the
//! validated input used to create one, and the read views handed to callers.
//! Pure domain logic: no IO, no storage.

pub mod new_order;
pub mod order;
pub mod view;

pub use new_order::{NewOrder, NewOrderItem, NewPayment};
pub use order::{Children, Order, OrderItem, OrderStatus, Payment};
pub use view::{OrderItemView, OrderView, PaymentView};
