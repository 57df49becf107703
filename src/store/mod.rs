//! Order persistence.
//!
//! Every mutating operation is one unit of work: the order is locked, the
//! aggregate is loaded and changed through its domain methods, and the result
//! (items, recomputed totals, status, session, log) is written back before the
//! lock is released. Lock waits are bounded and surface as
//! [`StorefrontError::ConcurrentModification`](crate::StorefrontError).

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgOrderStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::domain::aggregates::{AdminAction, Order, OrderDraft, PaymentMethod, PaymentSession, Product};
use crate::domain::pricing::PricingPolicy;
use crate::domain::reconciliation::{PaymentEvent, PaymentLogEntry, ReconcileOutcome};
use crate::domain::value_objects::Quantity;
use crate::{Result, StorefrontError};

/// Settings shared by every store implementation.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub pricing: PricingPolicy,
    pub currency: String,
    pub lock_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { pricing: PricingPolicy::default(), currency: "NGN".to_string(), lock_timeout: Duration::from_secs(5) }
    }
}

impl From<&AppConfig> for StoreOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            pricing: config.pricing.clone(),
            currency: config.currency.clone(),
            lock_timeout: config.order_lock_timeout,
        }
    }
}

/// Checkout request as handed over by the order-creation API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewOrder {
    pub customer_email: String,
    pub items: Vec<RequestedItem>,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub shipping_address: Value,
    #[serde(default)]
    pub billing_address: Value,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RequestedItem {
    pub product_id: Uuid,
    pub quantity: i64,
}

/// A change to an order's line items.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemChange {
    Add { product_id: Uuid, quantity: i64 },
    SetQuantity { line_item_id: Uuid, quantity: i64 },
    Remove { line_item_id: Uuid },
}

#[derive(Clone, Debug)]
pub struct Reconciliation {
    pub order: Order,
    pub outcome: ReconcileOutcome,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Place an order with all its items, and its payment session for online methods.
    async fn create_order(&self, request: NewOrder) -> Result<Order>;

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>>;

    /// Apply one line-item change and persist the recomputed totals with it.
    async fn change_items(&self, order_id: Uuid, change: ItemChange) -> Result<Order>;

    async fn transition(&self, order_id: Uuid, action: AdminAction) -> Result<Order>;

    /// Log the event, then apply it to the order and its session, atomically.
    /// The log entry is kept even when the reference matches no order.
    async fn reconcile(&self, event: PaymentEvent) -> Result<Reconciliation>;

    async fn payment_session(&self, order_id: Uuid, provider: &str) -> Result<Option<PaymentSession>>;

    async fn payment_sessions(&self, order_id: Uuid) -> Result<Vec<PaymentSession>>;

    async fn payment_log(&self, order_id: Uuid) -> Result<Vec<PaymentLogEntry>>;
}

/// Build a new order from the request and the catalog entries it references.
pub(crate) fn place_order(request: NewOrder, catalog: &HashMap<Uuid, Product>, options: &StoreOptions) -> Result<Order> {
    let lines = request
        .items
        .iter()
        .map(|item| {
            let quantity = Quantity::new(item.quantity)?;
            let product = catalog
                .get(&item.product_id)
                .cloned()
                .ok_or(StorefrontError::ProductNotFound { product_id: item.product_id })?;
            Ok((product, quantity))
        })
        .collect::<Result<Vec<_>>>()?;
    let draft = OrderDraft {
        customer_email: request.customer_email,
        payment_method: request.payment_method,
        currency: options.currency.clone(),
        shipping_address: request.shipping_address,
        billing_address: request.billing_address,
    };
    Order::place(draft, lines, &options.pricing)
}

pub(crate) fn apply_item_change(
    order: &mut Order,
    change: ItemChange,
    product: Option<&Product>,
    pricing: &PricingPolicy,
) -> Result<()> {
    match change {
        ItemChange::Add { product_id, quantity } => {
            let quantity = Quantity::new(quantity)?;
            let product = product.ok_or(StorefrontError::ProductNotFound { product_id })?;
            order.add_item(product, quantity, pricing).map(|_| ())
        }
        ItemChange::SetQuantity { line_item_id, quantity } => {
            order.update_quantity(line_item_id, Quantity::new(quantity)?, pricing)
        }
        ItemChange::Remove { line_item_id } => order.remove_item(line_item_id, pricing).map(|_| ()),
    }
}

/// Run the reconciliation state machine on a locked order. Returns the
/// session patch to merge when the event was accepted.
pub(crate) fn apply_payment_event(order: &mut Order, event: &PaymentEvent) -> (ReconcileOutcome, Option<Map<String, Value>>) {
    let status = event.canonical_status();
    let outcome = order.apply_payment_event(status, event.transaction_id.as_deref());
    log_outcome(order, event, &outcome);
    let patch = outcome.is_applied().then(|| PaymentSession::webhook_patch(event, status));
    (outcome, patch)
}

fn log_outcome(order: &Order, event: &PaymentEvent, outcome: &ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::Applied { from, to } => {
            tracing::info!(order_id = %order.id(), provider = %event.provider, %from, %to, "payment event applied")
        }
        ReconcileOutcome::Redelivered { status } => {
            tracing::info!(order_id = %order.id(), provider = %event.provider, %status, "duplicate payment event")
        }
        ReconcileOutcome::Ignored { current, reported } => tracing::warn!(
            order_id = %order.id(),
            provider = %event.provider,
            %current,
            %reported,
            "payment event would move a settled order backwards; ignored"
        ),
    }
}
