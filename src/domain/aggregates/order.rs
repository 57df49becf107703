//! Order Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::Product;
use crate::domain::events::OrderEvent;
use crate::domain::pricing::{OrderTotals, PricingPolicy};
use crate::domain::reconciliation::{Decision, ReconcileOutcome};
use crate::domain::value_objects::Quantity;
use crate::{Result, StorefrontError};

#[derive(Clone, Debug, Serialize)]
pub struct Order {
    id: Uuid,
    customer_email: String,
    status: OrderStatus,
    payment_method: PaymentMethod,
    payment_transaction_id: Option<String>,
    currency: String,
    items: Vec<LineItem>,
    #[serde(flatten)]
    totals: OrderTotals,
    shipping_address: Value,
    billing_address: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    events: Vec<OrderEvent>,
}

/// A purchased product with its price frozen at insert time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LineItem {
    id: Uuid,
    product_id: Uuid,
    quantity: Quantity,
    unit_price: Decimal,
    line_total: Decimal,
}

impl LineItem {
    pub fn new(product_id: Uuid, unit_price: Decimal, quantity: Quantity) -> Self {
        Self::restore(Uuid::now_v7(), product_id, quantity, unit_price)
    }

    /// Rebuild a stored line; the total is derived from the snapshotted unit price.
    pub fn restore(id: Uuid, product_id: Uuid, quantity: Quantity, unit_price: Decimal) -> Self {
        Self { id, product_id, quantity, unit_price, line_total: unit_price * quantity.as_decimal() }
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn product_id(&self) -> Uuid { self.product_id }
    pub fn quantity(&self) -> Quantity { self.quantity }
    pub fn unit_price(&self) -> Decimal { self.unit_price }
    pub fn line_total(&self) -> Decimal { self.line_total }

    fn set_quantity(&mut self, quantity: Quantity) {
        self.quantity = quantity;
        self.line_total = self.unit_price * quantity.as_decimal();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus { PendingPayment, Pending, Confirmed, PaymentPending, PaymentFailed, Cancelled, Shipped, Delivered }

impl OrderStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PendingPayment => "pending_payment",
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::PaymentPending => "payment_pending",
            Self::PaymentFailed => "payment_failed",
            Self::Cancelled => "cancelled",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
        }
    }

    pub fn initial_for(method: PaymentMethod) -> Self {
        if method.is_online() { Self::PendingPayment } else { Self::Pending }
    }

    /// Past these, reconciliation must not move an order back into a pending state.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Cancelled | Self::PaymentFailed)
    }

    /// Line items may only change while the order still behaves like a cart.
    pub fn is_editable(&self) -> bool {
        matches!(self, Self::PendingPayment | Self::Pending)
    }

    /// Monotonicity guard for provider-reported statuses.
    pub fn payment_decision(self, reported: OrderStatus) -> Decision {
        use OrderStatus::*;
        match (self, reported) {
            (PendingPayment | Pending | PaymentPending, _) => Decision::Apply,
            (current, reported) if current == reported => Decision::Redelivery,
            // a capture after a failed attempt means the customer retried and paid
            (PaymentFailed, Confirmed) => Decision::Apply,
            (Shipped | Delivered, Confirmed) => Decision::Redelivery,
            _ => Decision::Reject,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for OrderStatus {
    type Err = StorefrontError;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending_payment" => Self::PendingPayment,
            "pending" => Self::Pending,
            "confirmed" => Self::Confirmed,
            "payment_pending" => Self::PaymentPending,
            "payment_failed" => Self::PaymentFailed,
            "cancelled" => Self::Cancelled,
            "shipped" => Self::Shipped,
            "delivered" => Self::Delivered,
            other => return Err(StorefrontError::Internal(format!("unknown order status '{other}'"))),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod { Card, MobileMoney, CashOnDelivery }

impl PaymentMethod {
    pub const fn as_str(&self) -> &'static str {
        match self { Self::Card => "card", Self::MobileMoney => "mobile_money", Self::CashOnDelivery => "cash_on_delivery" }
    }
    pub fn is_online(&self) -> bool { !matches!(self, Self::CashOnDelivery) }
    /// Provider that handles sessions and webhooks for this method.
    pub fn provider(&self) -> Option<&'static str> { self.is_online().then(|| self.as_str()) }
}

impl FromStr for PaymentMethod {
    type Err = StorefrontError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "card" => Ok(Self::Card),
            "mobile_money" => Ok(Self::MobileMoney),
            "cash_on_delivery" => Ok(Self::CashOnDelivery),
            other => Err(StorefrontError::Internal(format!("unknown payment method '{other}'"))),
        }
    }
}

/// Checkout data an order is placed with.
#[derive(Clone, Debug)]
pub struct OrderDraft {
    pub customer_email: String,
    pub payment_method: PaymentMethod,
    pub currency: String,
    pub shipping_address: Value,
    pub billing_address: Value,
}

/// Stored columns of an order row.
#[derive(Clone, Debug)]
pub struct OrderParts {
    pub id: Uuid,
    pub customer_email: String,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub payment_transaction_id: Option<String>,
    pub currency: String,
    pub totals: OrderTotals,
    pub shipping_address: Value,
    pub billing_address: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status changes an operator may make by hand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction { ConfirmPayment, Ship, Deliver, Cancel }

impl AdminAction {
    pub fn apply(self, order: &mut Order) -> Result<()> {
        match self {
            Self::ConfirmPayment => order.confirm_manual_payment(),
            Self::Ship => order.ship(),
            Self::Deliver => order.deliver(),
            Self::Cancel => order.cancel(),
        }
    }
}

impl Order {
    /// Build a new order from resolved catalog products. Any failing line fails the whole order.
    pub fn place(draft: OrderDraft, lines: Vec<(Product, Quantity)>, policy: &PricingPolicy) -> Result<Self> {
        if lines.is_empty() { return Err(StorefrontError::Validation("order has no items".into())); }
        let now = Utc::now();
        let mut order = Self {
            id: Uuid::now_v7(),
            customer_email: draft.customer_email,
            status: OrderStatus::initial_for(draft.payment_method),
            payment_method: draft.payment_method,
            payment_transaction_id: None,
            currency: draft.currency,
            items: Vec::with_capacity(lines.len()),
            totals: policy.totals(std::iter::empty()),
            shipping_address: draft.shipping_address,
            billing_address: draft.billing_address,
            created_at: now,
            updated_at: now,
            events: vec![],
        };
        for (product, quantity) in &lines {
            order.add_item(product, *quantity, policy)?;
        }
        order.raise_event(OrderEvent::Placed {
            order_id: order.id,
            status: order.status,
            final_amount: order.totals.final_amount,
        });
        Ok(order)
    }

    pub fn restore(parts: OrderParts, items: Vec<LineItem>) -> Self {
        Self {
            id: parts.id,
            customer_email: parts.customer_email,
            status: parts.status,
            payment_method: parts.payment_method,
            payment_transaction_id: parts.payment_transaction_id,
            currency: parts.currency,
            items,
            totals: parts.totals,
            shipping_address: parts.shipping_address,
            billing_address: parts.billing_address,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
            events: vec![],
        }
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn customer_email(&self) -> &str { &self.customer_email }
    pub fn status(&self) -> OrderStatus { self.status }
    pub fn payment_method(&self) -> PaymentMethod { self.payment_method }
    pub fn payment_transaction_id(&self) -> Option<&str> { self.payment_transaction_id.as_deref() }
    pub fn currency(&self) -> &str { &self.currency }
    pub fn items(&self) -> &[LineItem] { &self.items }
    pub fn totals(&self) -> &OrderTotals { &self.totals }
    pub fn shipping_address(&self) -> &Value { &self.shipping_address }
    pub fn billing_address(&self) -> &Value { &self.billing_address }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

    /// Append a line priced at the product's current catalog price.
    pub fn add_item(&mut self, product: &Product, quantity: Quantity, policy: &PricingPolicy) -> Result<Uuid> {
        self.ensure_editable()?;
        let item = LineItem::new(product.id, product.quote()?, quantity);
        let id = item.id;
        self.items.push(item);
        self.recalculate(policy);
        Ok(id)
    }

    pub fn update_quantity(&mut self, line_item_id: Uuid, quantity: Quantity, policy: &PricingPolicy) -> Result<()> {
        self.ensure_editable()?;
        let item = self.items.iter_mut().find(|i| i.id == line_item_id).ok_or(StorefrontError::LineItemNotFound)?;
        item.set_quantity(quantity);
        self.recalculate(policy);
        Ok(())
    }

    pub fn remove_item(&mut self, line_item_id: Uuid, policy: &PricingPolicy) -> Result<LineItem> {
        self.ensure_editable()?;
        let pos = self.items.iter().position(|i| i.id == line_item_id).ok_or(StorefrontError::LineItemNotFound)?;
        let removed = self.items.remove(pos);
        self.recalculate(policy);
        Ok(removed)
    }

    /// Apply a canonical provider-reported status, subject to the monotonicity guard.
    pub fn apply_payment_event(&mut self, reported: OrderStatus, transaction_id: Option<&str>) -> ReconcileOutcome {
        match self.status.payment_decision(reported) {
            Decision::Apply => {
                let from = self.status;
                // only a confirmation pins the transaction; other attempts stay in the log
                if reported == OrderStatus::Confirmed {
                    self.payment_transaction_id = transaction_id.map(str::to_string);
                }
                self.set_status(reported);
                ReconcileOutcome::Applied { from, to: reported }
            }
            Decision::Redelivery => ReconcileOutcome::Redelivered { status: self.status },
            Decision::Reject => ReconcileOutcome::Ignored { current: self.status, reported },
        }
    }

    pub fn confirm_manual_payment(&mut self) -> Result<()> {
        self.transition(&[OrderStatus::Pending], OrderStatus::Confirmed)
    }

    pub fn ship(&mut self) -> Result<()> {
        self.transition(&[OrderStatus::Confirmed], OrderStatus::Shipped)
    }

    pub fn deliver(&mut self) -> Result<()> {
        self.transition(&[OrderStatus::Shipped], OrderStatus::Delivered)
    }

    pub fn cancel(&mut self) -> Result<()> {
        use OrderStatus::*;
        self.transition(&[PendingPayment, Pending, PaymentPending, PaymentFailed], Cancelled)
    }

    pub fn take_events(&mut self) -> Vec<OrderEvent> { std::mem::take(&mut self.events) }

    fn transition(&mut self, allowed_from: &[OrderStatus], to: OrderStatus) -> Result<()> {
        if !allowed_from.contains(&self.status) {
            return Err(StorefrontError::InvalidTransition { from: self.status, to });
        }
        self.set_status(to);
        Ok(())
    }

    fn set_status(&mut self, to: OrderStatus) {
        if self.status == to { return; }
        self.status = to;
        self.touch();
        let order_id = self.id;
        let event = match to {
            OrderStatus::Confirmed => Some(OrderEvent::Confirmed {
                order_id,
                final_amount: self.totals.final_amount,
                transaction_id: self.payment_transaction_id.clone(),
            }),
            OrderStatus::PaymentFailed => Some(OrderEvent::PaymentFailed { order_id }),
            OrderStatus::Cancelled => Some(OrderEvent::Cancelled { order_id }),
            OrderStatus::Shipped => Some(OrderEvent::Shipped { order_id }),
            OrderStatus::Delivered => Some(OrderEvent::Delivered { order_id }),
            _ => None,
        };
        if let Some(e) = event { self.raise_event(e); }
    }

    fn ensure_editable(&self) -> Result<()> {
        if self.status.is_editable() { Ok(()) } else { Err(StorefrontError::OrderNotEditable) }
    }

    fn recalculate(&mut self, policy: &PricingPolicy) {
        self.totals = policy.totals(self.items.iter().map(LineItem::line_total));
        self.touch();
    }

    fn raise_event(&mut self, e: OrderEvent) { self.events.push(e); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}
