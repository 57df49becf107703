//! Payment reconciliation: mapping provider events onto order status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::aggregates::OrderStatus;

/// An inbound provider notification, already signature-checked.
#[derive(Clone, Debug, PartialEq)]
pub struct PaymentEvent {
    pub provider: String,
    pub order_reference: String,
    pub reported_status: String,
    pub transaction_id: Option<String>,
    pub raw_payload: Value,
}

impl PaymentEvent {
    pub fn canonical_status(&self) -> OrderStatus { canonical_status(&self.reported_status) }

    /// The order id the reference points at, if it is one.
    pub fn order_id(&self) -> Option<Uuid> { Uuid::parse_str(self.order_reference.trim()).ok() }
}

/// Map a provider status onto an order status. Unknown values become
/// `payment_pending` so no event is silently dropped.
pub fn canonical_status(reported: &str) -> OrderStatus {
    match reported.trim().to_ascii_uppercase().as_str() {
        "COMPLETE" | "COMPLETED" => OrderStatus::Confirmed,
        "FAILED" | "FAILURE" => OrderStatus::PaymentFailed,
        "CANCELLED" => OrderStatus::Cancelled,
        _ => OrderStatus::PaymentPending,
    }
}

/// What the monotonicity guard allows for a reported status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Apply,
    /// Same settled status delivered again.
    Redelivery,
    Reject,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied { from: OrderStatus, to: OrderStatus },
    Redelivered { status: OrderStatus },
    Ignored { current: OrderStatus, reported: OrderStatus },
}

impl ReconcileOutcome {
    pub fn is_applied(&self) -> bool { matches!(self, Self::Applied { .. }) }
}

/// Immutable record of one inbound provider event, duplicates included.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PaymentLogEntry {
    pub id: Uuid,
    /// `None` when the reference did not resolve to an order.
    pub order_id: Option<Uuid>,
    pub order_reference: String,
    pub provider: String,
    pub reported_status: String,
    pub transaction_id: Option<String>,
    pub raw_payload: Value,
    pub received_at: DateTime<Utc>,
}

impl PaymentLogEntry {
    pub fn record(event: &PaymentEvent, order_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::now_v7(),
            order_id,
            order_reference: event.order_reference.clone(),
            provider: event.provider.clone(),
            reported_status: event.reported_status.clone(),
            transaction_id: event.transaction_id.clone(),
            raw_payload: event.raw_payload.clone(),
            received_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_status_table() {
        assert_eq!(canonical_status("COMPLETE"), OrderStatus::Confirmed);
        assert_eq!(canonical_status("COMPLETED"), OrderStatus::Confirmed);
        assert_eq!(canonical_status(" completed "), OrderStatus::Confirmed);
        assert_eq!(canonical_status("FAILED"), OrderStatus::PaymentFailed);
        assert_eq!(canonical_status("FAILURE"), OrderStatus::PaymentFailed);
        assert_eq!(canonical_status("PENDING"), OrderStatus::PaymentPending);
        assert_eq!(canonical_status("CANCELLED"), OrderStatus::Cancelled);
        assert_eq!(canonical_status("REVERSED"), OrderStatus::PaymentPending);
        assert_eq!(canonical_status(""), OrderStatus::PaymentPending);
    }

    #[test]
    fn test_settled_states_only_accept_redelivery() {
        use OrderStatus::*;
        for settled in [Confirmed, Cancelled, PaymentFailed] {
            assert!(settled.is_settled());
            assert_eq!(settled.payment_decision(settled), Decision::Redelivery);
            assert_eq!(settled.payment_decision(PaymentPending), Decision::Reject);
        }
        assert_eq!(Confirmed.payment_decision(PaymentFailed), Decision::Reject);
        assert_eq!(Cancelled.payment_decision(Confirmed), Decision::Reject);
        assert_eq!(PaymentFailed.payment_decision(Confirmed), Decision::Apply);
        assert_eq!(PendingPayment.payment_decision(PaymentFailed), Decision::Apply);
        assert_eq!(PaymentPending.payment_decision(PaymentPending), Decision::Apply);
    }

    #[test]
    fn test_order_reference_parsing() {
        let id = Uuid::new_v4();
        let event = PaymentEvent {
            provider: "card".into(),
            order_reference: format!(" {id} "),
            reported_status: "COMPLETED".into(),
            transaction_id: None,
            raw_payload: Value::Null,
        };
        assert_eq!(event.order_id(), Some(id));
        assert_eq!(event.canonical_status(), OrderStatus::Confirmed);
        let bogus = PaymentEvent { order_reference: "ORD-1234".into(), ..event };
        assert_eq!(bogus.order_id(), None);
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let outcome = ReconcileOutcome::Applied { from: OrderStatus::PendingPayment, to: OrderStatus::Confirmed };
        assert_eq!(
            serde_json::to_value(outcome).unwrap(),
            serde_json::json!({"outcome": "applied", "from": "pending_payment", "to": "confirmed"})
        );
    }
}
