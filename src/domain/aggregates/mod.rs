//! Aggregates module
pub mod order;
pub mod payment_session;
pub mod product;

pub use order::{AdminAction, LineItem, Order, OrderDraft, OrderParts, OrderStatus, PaymentMethod};
pub use payment_session::PaymentSession;
pub use product::{Product, ProductStatus};
