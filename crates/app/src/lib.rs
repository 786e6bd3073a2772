//! Process wiring and the in-process order/task contracts.

pub mod context;
pub mod services;

pub use context::{AppContext, ContextError};
pub use services::{CreatedOrder, OrderPage, OrderService, ServiceError, SubmitReceipt};
