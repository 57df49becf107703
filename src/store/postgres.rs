//! Postgres-backed order store.
//!
//! Each mutating call is a single transaction that takes `FOR UPDATE` on the
//! order row under a `SET LOCAL lock_timeout`, so two writers on the same
//! order are serialized and a stuck lock fails fast with `55P03`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sqlx::postgres::PgPool;
use sqlx::PgConnection;
use std::collections::HashMap;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use super::{apply_item_change, apply_payment_event, place_order, ItemChange, NewOrder, OrderStore, Reconciliation, StoreOptions};
use crate::domain::aggregates::{AdminAction, LineItem, Order, OrderParts, PaymentSession, Product};
use crate::domain::pricing::OrderTotals;
use crate::domain::reconciliation::{PaymentEvent, PaymentLogEntry};
use crate::domain::value_objects::Quantity;
use crate::{Result, StorefrontError};

const ORDER_COLUMNS: &str = "id, customer_email, status, payment_method, payment_transaction_id, currency, \
     subtotal, tax_amount, shipping_amount, final_amount, shipping_address, billing_address, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    customer_email: String,
    status: String,
    payment_method: String,
    payment_transaction_id: Option<String>,
    currency: String,
    subtotal: Decimal,
    tax_amount: Decimal,
    shipping_amount: Decimal,
    final_amount: Decimal,
    shipping_address: Value,
    billing_address: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for OrderParts {
    type Error = StorefrontError;
    fn try_from(r: OrderRow) -> Result<Self> {
        Ok(OrderParts {
            id: r.id,
            customer_email: r.customer_email,
            status: r.status.parse()?,
            payment_method: r.payment_method.parse()?,
            payment_transaction_id: r.payment_transaction_id,
            currency: r.currency,
            totals: OrderTotals {
                subtotal: r.subtotal,
                tax_amount: r.tax_amount,
                shipping_amount: r.shipping_amount,
                final_amount: r.final_amount,
            },
            shipping_address: r.shipping_address,
            billing_address: r.billing_address,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LineItemRow { id: Uuid, product_id: Uuid, quantity: i32, unit_price: Decimal }

#[derive(Debug, sqlx::FromRow)]
struct ProductRow { id: Uuid, name: String, price: Option<Decimal>, status: String }

#[derive(Debug, sqlx::FromRow)]
struct SessionRow { id: Uuid, order_id: Uuid, provider: String, session_data: Value, created_at: DateTime<Utc>, updated_at: DateTime<Utc> }

impl From<SessionRow> for PaymentSession {
    fn from(r: SessionRow) -> Self {
        let session_data = match r.session_data { Value::Object(map) => map, _ => Map::new() };
        PaymentSession { id: r.id, order_id: r.order_id, provider: r.provider, session_data, created_at: r.created_at, updated_at: r.updated_at }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LogRow {
    id: Uuid,
    order_id: Option<Uuid>,
    order_reference: String,
    provider: String,
    reported_status: String,
    transaction_id: Option<String>,
    raw_payload: Value,
    received_at: DateTime<Utc>,
}

impl From<LogRow> for PaymentLogEntry {
    fn from(r: LogRow) -> Self {
        PaymentLogEntry {
            id: r.id,
            order_id: r.order_id,
            order_reference: r.order_reference,
            provider: r.provider,
            reported_status: r.reported_status,
            transaction_id: r.transaction_id,
            raw_payload: r.raw_payload,
            received_at: r.received_at,
        }
    }
}

#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
    options: StoreOptions,
}

impl PgOrderStore {
    pub fn new(pool: PgPool, options: StoreOptions) -> Self { Self { pool, options } }

    pub fn pool(&self) -> &PgPool { &self.pool }
}

fn lock_timeout_statement(timeout: Duration) -> String {
    format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis().max(1))
}

async fn set_lock_timeout(conn: &mut PgConnection, timeout: Duration) -> Result<()> {
    sqlx::query(&lock_timeout_statement(timeout)).execute(&mut *conn).await?;
    Ok(())
}

async fn load_order(conn: &mut PgConnection, order_id: Uuid, for_update: bool) -> Result<Option<Order>> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1{}", if for_update { " FOR UPDATE" } else { "" });
    let Some(row) = sqlx::query_as::<_, OrderRow>(&sql).bind(order_id).fetch_optional(&mut *conn).await? else {
        return Ok(None);
    };
    let items = sqlx::query_as::<_, LineItemRow>(
        "SELECT id, product_id, quantity, unit_price FROM order_items WHERE order_id = $1 ORDER BY id",
    )
    .bind(order_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|r| Ok(LineItem::restore(r.id, r.product_id, Quantity::new(r.quantity.into())?, r.unit_price)))
    .collect::<Result<Vec<_>>>()?;
    Ok(Some(Order::restore(row.try_into()?, items)))
}

async fn fetch_products(conn: &mut PgConnection, ids: &[Uuid]) -> Result<HashMap<Uuid, Product>> {
    let rows = sqlx::query_as::<_, ProductRow>("SELECT id, name, price, status FROM products WHERE id = ANY($1)")
        .bind(ids.to_vec())
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter()
        .map(|r| Ok((r.id, Product { id: r.id, name: r.name, price: r.price, status: r.status.parse()? })))
        .collect()
}

async fn insert_order(conn: &mut PgConnection, order: &Order) -> Result<()> {
    let t = order.totals();
    sqlx::query(
        "INSERT INTO orders (id, customer_email, status, payment_method, payment_transaction_id, currency, subtotal, tax_amount, shipping_amount, final_amount, shipping_address, billing_address, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    )
    .bind(order.id()).bind(order.customer_email()).bind(order.status().as_str()).bind(order.payment_method().as_str())
    .bind(order.payment_transaction_id()).bind(order.currency())
    .bind(t.subtotal).bind(t.tax_amount).bind(t.shipping_amount).bind(t.final_amount)
    .bind(order.shipping_address()).bind(order.billing_address()).bind(order.created_at()).bind(order.updated_at())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn save_order(conn: &mut PgConnection, order: &Order) -> Result<()> {
    let t = order.totals();
    sqlx::query(
        "UPDATE orders SET status = $2, payment_transaction_id = $3, subtotal = $4, tax_amount = $5, shipping_amount = $6, final_amount = $7, updated_at = $8 WHERE id = $1",
    )
    .bind(order.id()).bind(order.status().as_str()).bind(order.payment_transaction_id())
    .bind(t.subtotal).bind(t.tax_amount).bind(t.shipping_amount).bind(t.final_amount).bind(order.updated_at())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Make the stored ledger match the aggregate: drop removed lines, upsert the rest.
async fn sync_items(conn: &mut PgConnection, order: &Order) -> Result<()> {
    let ids: Vec<Uuid> = order.items().iter().map(LineItem::id).collect();
    sqlx::query("DELETE FROM order_items WHERE order_id = $1 AND NOT (id = ANY($2))")
        .bind(order.id())
        .bind(&ids)
        .execute(&mut *conn)
        .await?;
    for item in order.items() {
        sqlx::query(
            "INSERT INTO order_items (id, order_id, product_id, quantity, unit_price, line_total) VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO UPDATE SET quantity = EXCLUDED.quantity, line_total = EXCLUDED.line_total",
        )
        .bind(item.id()).bind(order.id()).bind(item.product_id())
        .bind(item.quantity().value() as i32).bind(item.unit_price()).bind(item.line_total())
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Upsert the (order, provider) session, merging `patch` into any existing data.
async fn merge_session(conn: &mut PgConnection, order_id: Uuid, provider: &str, patch: Map<String, Value>) -> Result<()> {
    sqlx::query(
        "INSERT INTO payment_sessions (id, order_id, provider, session_data, created_at, updated_at) VALUES ($1, $2, $3, $4, NOW(), NOW()) \
         ON CONFLICT (order_id, provider) DO UPDATE SET session_data = payment_sessions.session_data || EXCLUDED.session_data, updated_at = NOW()",
    )
    .bind(Uuid::now_v7()).bind(order_id).bind(provider).bind(Value::Object(patch))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn append_log(conn: &mut PgConnection, entry: &PaymentLogEntry) -> Result<()> {
    sqlx::query(
        "INSERT INTO payment_logs (id, order_id, order_reference, provider, reported_status, transaction_id, raw_payload, received_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(entry.id).bind(entry.order_id).bind(&entry.order_reference).bind(&entry.provider)
    .bind(&entry.reported_status).bind(&entry.transaction_id).bind(&entry.raw_payload).bind(entry.received_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl OrderStore for PgOrderStore {
    #[instrument(skip(self, request), fields(items = request.items.len()))]
    async fn create_order(&self, request: NewOrder) -> Result<Order> {
        let mut tx = self.pool.begin().await?;
        let product_ids: Vec<Uuid> = request.items.iter().map(|i| i.product_id).collect();
        let catalog = fetch_products(&mut tx, &product_ids).await?;
        let order = place_order(request, &catalog, &self.options)?;
        insert_order(&mut tx, &order).await?;
        sync_items(&mut tx, &order).await?;
        if let Some(session) = PaymentSession::initiate(&order) {
            merge_session(&mut tx, order.id(), &session.provider, session.session_data).await?;
        }
        tx.commit().await?;
        tracing::info!(order_id = %order.id(), status = %order.status(), "order placed");
        Ok(order)
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        load_order(&mut conn, order_id, false).await
    }

    #[instrument(skip(self))]
    async fn change_items(&self, order_id: Uuid, change: ItemChange) -> Result<Order> {
        let mut tx = self.pool.begin().await?;
        set_lock_timeout(&mut tx, self.options.lock_timeout).await?;
        let mut order = load_order(&mut tx, order_id, true).await?.ok_or(StorefrontError::OrderNotFound)?;
        let product = match change {
            ItemChange::Add { product_id, .. } => fetch_products(&mut tx, &[product_id]).await?.remove(&product_id),
            _ => None,
        };
        apply_item_change(&mut order, change, product.as_ref(), &self.options.pricing)?;
        sync_items(&mut tx, &order).await?;
        save_order(&mut tx, &order).await?;
        tx.commit().await?;
        Ok(order)
    }

    #[instrument(skip(self))]
    async fn transition(&self, order_id: Uuid, action: AdminAction) -> Result<Order> {
        let mut tx = self.pool.begin().await?;
        set_lock_timeout(&mut tx, self.options.lock_timeout).await?;
        let mut order = load_order(&mut tx, order_id, true).await?.ok_or(StorefrontError::OrderNotFound)?;
        action.apply(&mut order)?;
        save_order(&mut tx, &order).await?;
        tx.commit().await?;
        Ok(order)
    }

    #[instrument(skip(self, event), fields(provider = %event.provider, reference = %event.order_reference))]
    async fn reconcile(&self, event: PaymentEvent) -> Result<Reconciliation> {
        let mut tx = self.pool.begin().await?;
        set_lock_timeout(&mut tx, self.options.lock_timeout).await?;
        let locked = match event.order_id() {
            Some(id) => load_order(&mut tx, id, true).await?,
            None => None,
        };
        append_log(&mut tx, &PaymentLogEntry::record(&event, locked.as_ref().map(Order::id))).await?;

        let Some(mut order) = locked else {
            tx.commit().await?;
            tracing::warn!("payment event for unknown order");
            return Err(StorefrontError::OrderNotFound);
        };
        let (outcome, patch) = apply_payment_event(&mut order, &event);
        if let Some(patch) = patch {
            save_order(&mut tx, &order).await?;
            merge_session(&mut tx, order.id(), &event.provider, patch).await?;
        }
        tx.commit().await?;
        Ok(Reconciliation { order, outcome })
    }

    async fn payment_session(&self, order_id: Uuid, provider: &str) -> Result<Option<PaymentSession>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT id, order_id, provider, session_data, created_at, updated_at FROM payment_sessions WHERE order_id = $1 AND provider = $2",
        )
        .bind(order_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn payment_sessions(&self, order_id: Uuid) -> Result<Vec<PaymentSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT id, order_id, provider, session_data, created_at, updated_at FROM payment_sessions WHERE order_id = $1 ORDER BY created_at",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn payment_log(&self, order_id: Uuid) -> Result<Vec<PaymentLogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT id, order_id, order_reference, provider, reported_status, transaction_id, raw_payload, received_at \
             FROM payment_logs WHERE order_id = $1 ORDER BY received_at, id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{OrderStatus, PaymentMethod};
    use serde_json::json;

    #[test]
    fn test_lock_timeout_statement() {
        assert_eq!(lock_timeout_statement(Duration::from_millis(2500)), "SET LOCAL lock_timeout = '2500ms'");
        assert_eq!(lock_timeout_statement(Duration::ZERO), "SET LOCAL lock_timeout = '1ms'");
    }

    #[test]
    fn test_order_row_conversion() {
        let now = Utc::now();
        let row = OrderRow {
            id: Uuid::new_v4(),
            customer_email: "a@b.co".into(),
            status: "payment_failed".into(),
            payment_method: "mobile_money".into(),
            payment_transaction_id: None,
            currency: "NGN".into(),
            subtotal: Decimal::new(4000, 0),
            tax_amount: Decimal::new(640, 0),
            shipping_amount: Decimal::new(500, 0),
            final_amount: Decimal::new(5140, 0),
            shipping_address: json!({}),
            billing_address: json!({}),
            created_at: now,
            updated_at: now,
        };
        let parts = OrderParts::try_from(row).unwrap();
        assert_eq!(parts.status, OrderStatus::PaymentFailed);
        assert_eq!(parts.payment_method, PaymentMethod::MobileMoney);
        assert!(parts.totals.is_consistent());
    }

    #[test]
    fn test_unknown_stored_status_is_an_error() {
        let now = Utc::now();
        let row = OrderRow {
            id: Uuid::new_v4(),
            customer_email: String::new(),
            status: "paid".into(),
            payment_method: "card".into(),
            payment_transaction_id: None,
            currency: "NGN".into(),
            subtotal: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
            shipping_amount: Decimal::ZERO,
            final_amount: Decimal::ZERO,
            shipping_address: Value::Null,
            billing_address: Value::Null,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(OrderParts::try_from(row), Err(StorefrontError::Internal(_))));
    }

    async fn live_store() -> (PgOrderStore, Uuid) {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = sqlx::postgres::PgPoolOptions::new().max_connections(4).connect(&url).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let product = Uuid::new_v4();
        sqlx::query("INSERT INTO products (id, name, price, status) VALUES ($1, 'Kettle', $2, 'active')")
            .bind(product)
            .bind(Decimal::new(2500, 0))
            .execute(&pool)
            .await
            .unwrap();
        (PgOrderStore::new(pool, StoreOptions::default()), product)
    }

    fn checkout(product: Uuid, quantity: i64) -> NewOrder {
        NewOrder {
            customer_email: "buyer@example.com".into(),
            items: vec![crate::store::RequestedItem { product_id: product, quantity }],
            payment_method: PaymentMethod::Card,
            shipping_address: json!({"phone": "+2348000000000"}),
            billing_address: json!({}),
        }
    }

    #[tokio::test]
    #[ignore = "Requires a Postgres DATABASE_URL"]
    async fn test_webhook_merges_into_existing_session() {
        let (store, product) = live_store().await;
        let order = store.create_order(checkout(product, 2)).await.unwrap();
        let event = PaymentEvent {
            provider: "card".into(),
            order_reference: order.id().to_string(),
            reported_status: "COMPLETE".into(),
            transaction_id: Some("TX1".into()),
            raw_payload: json!({"status": "COMPLETE"}),
        };
        let done = store.reconcile(event).await.unwrap();
        assert_eq!(done.order.status(), OrderStatus::Confirmed);

        let session = store.payment_session(order.id(), "card").await.unwrap().unwrap();
        assert_eq!(session.session_data["transaction_id"], json!("TX1"));
        assert_eq!(session.session_data["phone"], json!("+2348000000000"));
        assert_eq!(session.session_data["currency"], json!("NGN"));
        assert_eq!(store.payment_log(order.id()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[ignore = "Requires a Postgres DATABASE_URL"]
    async fn test_removing_last_line_deletes_its_row() {
        let (store, product) = live_store().await;
        let order = store.create_order(checkout(product, 2)).await.unwrap();
        let line = order.items()[0].id();
        store.change_items(order.id(), ItemChange::Remove { line_item_id: line }).await.unwrap();

        let stored = store.find_order(order.id()).await.unwrap().unwrap();
        assert!(stored.items().is_empty());
        assert_eq!(stored.totals().subtotal, Decimal::ZERO);
        assert_eq!(stored.totals().final_amount, Decimal::new(500, 0));
        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM order_items WHERE order_id = $1")
            .bind(order.id())
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_session_row_ignores_non_object_data() {
        let now = Utc::now();
        let row = SessionRow { id: Uuid::new_v4(), order_id: Uuid::new_v4(), provider: "card".into(), session_data: json!([1, 2]), created_at: now, updated_at: now };
        assert!(PaymentSession::from(row).session_data.is_empty());
    }
}
