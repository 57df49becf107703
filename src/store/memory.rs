//! In-process store for tests and database-less local runs.
//!
//! Each order has its own async mutex standing in for the row lock, taken
//! with the configured timeout. Shared maps sit behind a second mutex that is
//! only held for synchronous sections. Every operation works on a copy of the
//! order and only writes it back once all fallible steps succeeded, which
//! gives the same all-or-nothing behaviour as a database transaction.

use async_trait::async_trait;
use serde_json::Map;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tracing::instrument;
use uuid::Uuid;

use super::{apply_item_change, apply_payment_event, place_order, ItemChange, NewOrder, OrderStore, Reconciliation, StoreOptions};
use crate::domain::aggregates::{AdminAction, Order, PaymentSession, Product};
use crate::domain::reconciliation::{PaymentEvent, PaymentLogEntry};
use crate::{Result, StorefrontError};

#[derive(Default)]
struct MemoryState {
    products: HashMap<Uuid, Product>,
    orders: HashMap<Uuid, Order>,
    sessions: HashMap<(Uuid, String), PaymentSession>,
    log: Vec<PaymentLogEntry>,
    order_locks: HashMap<Uuid, Arc<Mutex<()>>>,
}

pub struct MemoryStore {
    options: StoreOptions,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new(options: StoreOptions) -> Self {
        Self { options, state: Mutex::new(MemoryState::default()) }
    }

    pub fn options(&self) -> &StoreOptions { &self.options }

    /// Add or replace a catalog entry.
    pub async fn put_product(&self, product: Product) -> Result<()> {
        self.state().await.products.insert(product.id, product);
        Ok(())
    }

    async fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().await
    }

    /// Exclusive access to one order, held for the whole operation.
    async fn lock_order(&self, order_id: Uuid) -> Result<OwnedMutexGuard<()>> {
        let lock = self.state().await.order_locks.entry(order_id).or_default().clone();
        tokio::time::timeout(self.options.lock_timeout, lock.lock_owned()).await.map_err(|_| {
            tracing::warn!(%order_id, timeout_ms = self.options.lock_timeout.as_millis() as u64, "order lock wait timed out");
            StorefrontError::ConcurrentModification
        })
    }
}

/// Copy kept in the store; pending events belong to the caller.
fn stored(order: &Order) -> Order {
    let mut copy = order.clone();
    copy.take_events();
    copy
}

#[async_trait]
impl OrderStore for MemoryStore {
    #[instrument(skip(self, request), fields(items = request.items.len()))]
    async fn create_order(&self, request: NewOrder) -> Result<Order> {
        let mut state = self.state().await;
        let order = place_order(request, &state.products, &self.options)?;
        if let Some(session) = PaymentSession::initiate(&order) {
            state.sessions.insert((order.id(), session.provider.clone()), session);
        }
        state.orders.insert(order.id(), stored(&order));
        tracing::info!(order_id = %order.id(), status = %order.status(), "order placed");
        Ok(order)
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        Ok(self.state().await.orders.get(&order_id).cloned())
    }

    #[instrument(skip(self))]
    async fn change_items(&self, order_id: Uuid, change: ItemChange) -> Result<Order> {
        let _order_lock = self.lock_order(order_id).await?;
        let mut state = self.state().await;
        let mut order = state.orders.get(&order_id).cloned().ok_or(StorefrontError::OrderNotFound)?;
        let product = match change {
            ItemChange::Add { product_id, .. } => state.products.get(&product_id),
            _ => None,
        };
        apply_item_change(&mut order, change, product, &self.options.pricing)?;
        state.orders.insert(order_id, stored(&order));
        Ok(order)
    }

    #[instrument(skip(self))]
    async fn transition(&self, order_id: Uuid, action: AdminAction) -> Result<Order> {
        let _order_lock = self.lock_order(order_id).await?;
        let mut state = self.state().await;
        let mut order = state.orders.get(&order_id).cloned().ok_or(StorefrontError::OrderNotFound)?;
        action.apply(&mut order)?;
        state.orders.insert(order_id, stored(&order));
        Ok(order)
    }

    #[instrument(skip(self, event), fields(provider = %event.provider, reference = %event.order_reference))]
    async fn reconcile(&self, event: PaymentEvent) -> Result<Reconciliation> {
        let _order_lock = match event.order_id() {
            Some(id) => Some(self.lock_order(id).await?),
            None => None,
        };
        let mut state = self.state().await;
        let order_id = event.order_id().filter(|id| state.orders.contains_key(id));
        state.log.push(PaymentLogEntry::record(&event, order_id));

        let Some(mut order) = order_id.and_then(|id| state.orders.get(&id).cloned()) else {
            tracing::warn!("payment event for unknown order");
            return Err(StorefrontError::OrderNotFound);
        };
        let (outcome, patch) = apply_payment_event(&mut order, &event);
        if let Some(patch) = patch {
            state
                .sessions
                .entry((order.id(), event.provider.clone()))
                .or_insert_with(|| PaymentSession::new(order.id(), event.provider.clone(), Map::new()))
                .merge(patch);
            state.orders.insert(order.id(), stored(&order));
        }
        Ok(Reconciliation { order, outcome })
    }

    async fn payment_session(&self, order_id: Uuid, provider: &str) -> Result<Option<PaymentSession>> {
        Ok(self.state().await.sessions.get(&(order_id, provider.to_string())).cloned())
    }

    async fn payment_sessions(&self, order_id: Uuid) -> Result<Vec<PaymentSession>> {
        let state = self.state().await;
        let mut sessions: Vec<_> = state.sessions.values().filter(|s| s.order_id == order_id).cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn payment_log(&self, order_id: Uuid) -> Result<Vec<PaymentLogEntry>> {
        let state = self.state().await;
        Ok(state.log.iter().filter(|e| e.order_id == Some(order_id)).cloned().collect())
    }
}
