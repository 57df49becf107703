//! Domain events
//!
//! Raised by the order aggregate and published after the owning transaction
//! commits. `Confirmed` is the hand-off point for fulfilment and notifications.
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::aggregates::OrderStatus;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    Placed { order_id: Uuid, status: OrderStatus, final_amount: Decimal },
    Confirmed { order_id: Uuid, final_amount: Decimal, transaction_id: Option<String> },
    PaymentFailed { order_id: Uuid },
    Cancelled { order_id: Uuid },
    Shipped { order_id: Uuid },
    Delivered { order_id: Uuid },
}

impl OrderEvent {
    pub fn order_id(&self) -> Uuid {
        match self {
            Self::Placed { order_id, .. }
            | Self::Confirmed { order_id, .. }
            | Self::PaymentFailed { order_id }
            | Self::Cancelled { order_id }
            | Self::Shipped { order_id }
            | Self::Delivered { order_id } => *order_id,
        }
    }

    pub fn subject(&self) -> &'static str {
        match self {
            Self::Placed { .. } => "orders.placed",
            Self::Confirmed { .. } => "orders.confirmed",
            Self::PaymentFailed { .. } => "orders.payment_failed",
            Self::Cancelled { .. } => "orders.cancelled",
            Self::Shipped { .. } => "orders.shipped",
            Self::Delivered { .. } => "orders.delivered",
        }
    }
}

/// Publish drained events. Delivery is best effort: the state change has
/// already committed, so failures are only logged.
pub async fn publish(nats: Option<&async_nats::Client>, events: Vec<OrderEvent>) {
    let Some(client) = nats else {
        for event in &events {
            tracing::debug!(subject = event.subject(), order_id = %event.order_id(), "no event bus configured");
        }
        return;
    };
    for event in events {
        let payload = match serde_json::to_vec(&event) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, subject = event.subject(), "failed to encode order event");
                continue;
            }
        };
        if let Err(e) = client.publish(event.subject().to_string(), payload.into()).await {
            tracing::warn!(error = %e, subject = event.subject(), order_id = %event.order_id(), "failed to publish order event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects_and_payload() {
        let id = Uuid::new_v4();
        let event = OrderEvent::Confirmed { order_id: id, final_amount: Decimal::new(5800, 0), transaction_id: Some("TX1".into()) };
        assert_eq!(event.subject(), "orders.confirmed");
        assert_eq!(event.order_id(), id);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "confirmed");
        assert_eq!(json["transaction_id"], "TX1");
    }

    #[tokio::test]
    async fn test_publish_without_bus_is_a_no_op() {
        publish(None, vec![OrderEvent::Shipped { order_id: Uuid::new_v4() }]).await;
    }
}
