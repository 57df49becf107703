//! Storefront order service
//!
//! Keeps order totals consistent with their line items and reconciles order
//! status with asynchronous payment-provider notifications.
//!
//! ## Features
//! - Line-item ledger with snapshotted unit prices
//! - Total recalculation (subtotal, tax, shipping, final amount)
//! - Order status state machine with administrative transitions
//! - Payment sessions with merge-only provider data
//! - Signed webhook reconciliation with an append-only event log

pub mod api;
pub mod config;
pub mod domain;
pub mod store;
pub mod webhook;

use thiserror::Error;
use uuid::Uuid;

pub use config::AppConfig;
pub use domain::aggregates::{LineItem, Order, OrderStatus, PaymentMethod, PaymentSession, Product};
pub use domain::pricing::{OrderTotals, PricingPolicy};
pub use domain::reconciliation::{PaymentEvent, PaymentLogEntry, ReconcileOutcome};
pub use store::{MemoryStore, OrderStore, PgOrderStore};

/// SQLSTATE raised by Postgres when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// SQLSTATEs for transactions that lost a race and may succeed on retry
/// (serialization_failure, deadlock_detected).
const TRANSIENT_SQLSTATES: [&str; 2] = ["40001", "40P01"];

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum StorefrontError {
    #[error("Invalid quantity")]
    InvalidQuantity,

    #[error("Product not found")]
    ProductNotFound { product_id: Uuid },

    #[error("Order not found")]
    OrderNotFound,

    #[error("Line item not found")]
    LineItemNotFound,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Order is being modified concurrently, retry later")]
    ConcurrentModification,

    #[error("Order can no longer be modified")]
    OrderNotEditable,

    #[error("Cannot move order from {from} to {to}")]
    InvalidTransition {
        from: domain::aggregates::OrderStatus,
        to: domain::aggregates::OrderStatus,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorefrontError {
    /// Whether the caller (typically the payment provider) should retry.
    /// Constraint violations, overflows and decode failures are deterministic
    /// and never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConcurrentModification => true,
            Self::Database(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => {
                    db.code().is_some_and(|code| TRANSIENT_SQLSTATES.contains(&&*code))
                }
                _ => false,
            },
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StorefrontError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
                return Self::ConcurrentModification;
            }
        }
        Self::Database(err)
    }
}

pub type Result<T> = std::result::Result<T, StorefrontError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StorefrontError::ConcurrentModification.is_retryable());
        assert!(StorefrontError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!StorefrontError::InvalidSignature.is_retryable());
        assert!(!StorefrontError::MalformedPayload("bad".into()).is_retryable());
        assert!(!StorefrontError::OrderNotFound.is_retryable());
    }

    #[derive(Debug)]
    struct FakeDbError(&'static str);

    impl std::fmt::Display for FakeDbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "database error {}", self.0)
        }
    }

    impl std::error::Error for FakeDbError {}

    impl sqlx::error::DatabaseError for FakeDbError {
        fn message(&self) -> &str { "fake" }
        fn code(&self) -> Option<std::borrow::Cow<'_, str>> { Some(self.0.into()) }
        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) { self }
        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) { self }
        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> { self }
        fn kind(&self) -> sqlx::error::ErrorKind { sqlx::error::ErrorKind::Other }
    }

    fn db_error(code: &'static str) -> StorefrontError {
        sqlx::Error::Database(Box::new(FakeDbError(code))).into()
    }

    #[test]
    fn test_lock_timeout_maps_to_concurrent_modification() {
        let err = db_error("55P03");
        assert!(matches!(err, StorefrontError::ConcurrentModification));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_only_transient_database_errors_are_retryable() {
        assert!(db_error("40001").is_retryable());
        assert!(db_error("40P01").is_retryable());
        // numeric_value_out_of_range and check_violation fail the same way every time
        assert!(!db_error("22003").is_retryable());
        assert!(!db_error("23514").is_retryable());
        assert!(!StorefrontError::Database(sqlx::Error::RowNotFound).is_retryable());
    }

    #[test]
    fn test_product_not_found_hides_identifier() {
        let err = StorefrontError::ProductNotFound { product_id: Uuid::new_v4() };
        assert_eq!(err.to_string(), "Product not found");
    }
}
