//! Payment Session Aggregate
//!
//! One session per (order, provider). `session_data` only ever grows by keyed
//! merges so fields written by earlier partial updates survive later ones. It
//! is an audit artifact; order status is never derived from it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{Order, OrderStatus};
use crate::domain::reconciliation::PaymentEvent;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PaymentSession {
    pub id: Uuid,
    pub order_id: Uuid,
    pub provider: String,
    pub session_data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentSession {
    pub fn new(order_id: Uuid, provider: impl Into<String>, session_data: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self { id: Uuid::now_v7(), order_id, provider: provider.into(), session_data, created_at: now, updated_at: now }
    }

    /// Session opened at checkout; `None` for offline payment methods.
    pub fn initiate(order: &Order) -> Option<Self> {
        let provider = order.payment_method().provider()?;
        let mut data = Map::new();
        data.insert("amount".into(), json!(order.totals().final_amount));
        data.insert("currency".into(), json!(order.currency()));
        data.insert("payment_method".into(), json!(order.payment_method()));
        data.insert("customer_email".into(), json!(order.customer_email()));
        if let Some(phone) = order.billing_address().get("phone").or_else(|| order.shipping_address().get("phone")) {
            data.insert("phone".into(), phone.clone());
        }
        data.insert("initiated_at".into(), json!(Utc::now()));
        Some(Self::new(order.id(), provider, data))
    }

    /// Keyed merge: keys in `patch` win, every other existing key is kept.
    pub fn merge(&mut self, patch: Map<String, Value>) {
        self.session_data.extend(patch);
        self.updated_at = Utc::now();
    }

    /// Fields recorded for an accepted webhook.
    pub fn webhook_patch(event: &PaymentEvent, status: OrderStatus) -> Map<String, Value> {
        let mut patch = Map::new();
        patch.insert("last_webhook".into(), event.raw_payload.clone());
        patch.insert("last_reported_status".into(), json!(event.reported_status));
        patch.insert("last_status".into(), json!(status));
        patch.insert("last_webhook_at".into(), json!(Utc::now()));
        if let Some(txn) = &event.transaction_id {
            patch.insert("transaction_id".into(), json!(txn));
        }
        patch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{OrderDraft, PaymentMethod, Product};
    use crate::domain::pricing::PricingPolicy;
    use crate::domain::value_objects::Quantity;
    use rust_decimal::Decimal;

    fn event(status: &str, txn: Option<&str>, payload: Value) -> PaymentEvent {
        PaymentEvent {
            provider: "mobile_money".into(),
            order_reference: Uuid::new_v4().to_string(),
            reported_status: status.into(),
            transaction_id: txn.map(String::from),
            raw_payload: payload,
        }
    }

    #[test]
    fn test_merge_preserves_earlier_fields() {
        let mut data = Map::new();
        data.insert("phone".into(), json!("+254700000000"));
        let mut session = PaymentSession::new(Uuid::new_v4(), "mobile_money", data);

        let first = event("PENDING", Some("TX1"), json!({"step": 1}));
        session.merge(PaymentSession::webhook_patch(&first, OrderStatus::PaymentPending));
        let second = event("COMPLETED", None, json!({"step": 2}));
        session.merge(PaymentSession::webhook_patch(&second, OrderStatus::Confirmed));

        assert_eq!(session.session_data["phone"], json!("+254700000000"));
        assert_eq!(session.session_data["transaction_id"], json!("TX1"));
        assert_eq!(session.session_data["last_webhook"], json!({"step": 2}));
        assert_eq!(session.session_data["last_status"], json!("confirmed"));
    }

    #[test]
    fn test_initiate_only_for_online_methods() {
        let product = Product::active(Uuid::new_v4(), "Widget", Decimal::new(100, 0));
        let lines = vec![(product, Quantity::new(1).unwrap())];
        let mut draft = OrderDraft {
            customer_email: "a@b.co".into(),
            payment_method: PaymentMethod::MobileMoney,
            currency: "NGN".into(),
            shipping_address: json!({}),
            billing_address: json!({"phone": "+2348000000000"}),
        };
        let order = Order::place(draft.clone(), lines.clone(), &PricingPolicy::default()).unwrap();
        let session = PaymentSession::initiate(&order).unwrap();
        assert_eq!(session.provider, "mobile_money");
        assert_eq!(session.session_data["phone"], json!("+2348000000000"));

        draft.payment_method = PaymentMethod::CashOnDelivery;
        let cash = Order::place(draft, lines, &PricingPolicy::default()).unwrap();
        assert!(PaymentSession::initiate(&cash).is_none());
    }
}
