//! HTTP surface: checkout, ledger changes, admin transitions and provider webhooks.

mod error;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

use crate::domain::aggregates::{AdminAction, Order, PaymentMethod, PaymentSession};
use crate::domain::events;
use crate::domain::reconciliation::{PaymentLogEntry, ReconcileOutcome};
use crate::store::{ItemChange, NewOrder, OrderStore, RequestedItem};
use crate::webhook::{PaymentNotification, SignatureVerifier, SIGNATURE_HEADER};
use crate::{Result, StorefrontError};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn OrderStore>,
    pub verifier: SignatureVerifier,
    pub payment_base_url: String,
    pub nats: Option<async_nats::Client>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(json!({"status": "healthy", "service": "storefront-orders"})) }))
        .route("/api/v1/orders", post(create_order))
        .route("/api/v1/orders/:id", get(get_order))
        .route("/api/v1/orders/:id/items", post(add_item))
        .route("/api/v1/orders/:id/items/:item_id", put(update_item).delete(remove_item))
        .route("/api/v1/orders/:id/transitions", post(transition_order))
        .route("/api/v1/orders/:id/payments", get(list_payments))
        .route("/api/v1/webhooks/:provider", post(payment_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(email)]
    pub customer_email: String,
    #[validate(length(min = 1, max = 100))]
    pub items: Vec<OrderItemRequest>,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub shipping_address: Value,
    #[serde(default)]
    pub billing_address: Value,
}

#[derive(Debug, Serialize, Deserialize)] pub struct OrderItemRequest { pub product_id: Uuid, pub quantity: i64 }
#[derive(Debug, Deserialize)] pub struct UpdateQuantityRequest { pub quantity: i64 }
#[derive(Debug, Deserialize)] pub struct TransitionRequest { pub action: AdminAction }

#[derive(Debug, Serialize)]
pub struct CheckoutResponse { pub order: Order, pub payment_url: Option<String> }

#[derive(Debug, Serialize)]
pub struct PaymentsResponse { pub sessions: Vec<PaymentSession>, pub log: Vec<PaymentLogEntry> }

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub order_id: Uuid,
    pub order_status: crate::OrderStatus,
    #[serde(flatten)]
    pub outcome: ReconcileOutcome,
}

impl From<CreateOrderRequest> for NewOrder {
    fn from(r: CreateOrderRequest) -> Self {
        NewOrder {
            customer_email: r.customer_email,
            items: r.items.into_iter().map(|i| RequestedItem { product_id: i.product_id, quantity: i.quantity }).collect(),
            payment_method: r.payment_method,
            shipping_address: r.shipping_address,
            billing_address: r.billing_address,
        }
    }
}

impl AppState {
    fn payment_url(&self, order: &Order) -> Option<String> {
        let provider = order.payment_method().provider()?;
        Some(format!("{}/pay/{}?reference={}", self.payment_base_url, provider, order.id()))
    }

    async fn publish(&self, order: &mut Order) {
        events::publish(self.nats.as_ref(), order.take_events()).await;
    }
}

#[instrument(skip(s, r), fields(items = r.items.len()))]
async fn create_order(State(s): State<AppState>, Json(r): Json<CreateOrderRequest>) -> Result<(StatusCode, Json<CheckoutResponse>)> {
    r.validate().map_err(|e| StorefrontError::Validation(e.to_string()))?;
    let mut order = s.store.create_order(r.into()).await?;
    s.publish(&mut order).await;
    let payment_url = s.payment_url(&order);
    Ok((StatusCode::CREATED, Json(CheckoutResponse { order, payment_url })))
}

async fn get_order(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Order>> {
    s.store.find_order(id).await?.map(Json).ok_or(StorefrontError::OrderNotFound)
}

async fn add_item(State(s): State<AppState>, Path(id): Path<Uuid>, Json(r): Json<OrderItemRequest>) -> Result<(StatusCode, Json<Order>)> {
    let order = s.store.change_items(id, ItemChange::Add { product_id: r.product_id, quantity: r.quantity }).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn update_item(State(s): State<AppState>, Path((id, item_id)): Path<(Uuid, Uuid)>, Json(r): Json<UpdateQuantityRequest>) -> Result<Json<Order>> {
    let order = s.store.change_items(id, ItemChange::SetQuantity { line_item_id: item_id, quantity: r.quantity }).await?;
    Ok(Json(order))
}

async fn remove_item(State(s): State<AppState>, Path((id, item_id)): Path<(Uuid, Uuid)>) -> Result<Json<Order>> {
    let order = s.store.change_items(id, ItemChange::Remove { line_item_id: item_id }).await?;
    Ok(Json(order))
}

async fn transition_order(State(s): State<AppState>, Path(id): Path<Uuid>, Json(r): Json<TransitionRequest>) -> Result<Json<Order>> {
    let mut order = s.store.transition(id, r.action).await?;
    tracing::info!(order_id = %id, action = ?r.action, status = %order.status(), "order transitioned");
    s.publish(&mut order).await;
    Ok(Json(order))
}

async fn list_payments(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<PaymentsResponse>> {
    if s.store.find_order(id).await?.is_none() { return Err(StorefrontError::OrderNotFound); }
    let sessions = s.store.payment_sessions(id).await?;
    let log = s.store.payment_log(id).await?;
    Ok(Json(PaymentsResponse { sessions, log }))
}

#[instrument(skip(s, headers, body), fields(size = body.len()))]
async fn payment_webhook(State(s): State<AppState>, Path(provider): Path<String>, headers: HeaderMap, body: Bytes) -> Result<Json<WebhookResponse>> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if let Err(e) = s.verifier.verify(&body, signature) {
        tracing::warn!(%provider, has_signature = signature.is_some(), "rejected webhook with invalid signature");
        return Err(e);
    }
    let event = PaymentNotification::parse(&provider, &body).map_err(|e| {
        tracing::warn!(%provider, error = %e, "rejected malformed webhook");
        e
    })?;
    let mut reconciliation = s.store.reconcile(event).await?;
    s.publish(&mut reconciliation.order).await;
    Ok(Json(WebhookResponse {
        order_id: reconciliation.order.id(),
        order_status: reconciliation.order.status(),
        outcome: reconciliation.outcome,
    }))
}
