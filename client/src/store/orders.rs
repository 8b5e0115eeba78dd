//! Order store and the cart being assembled at a table.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{lock, Collection, Entity, LoadState};
use crate::api::OrderApi;
use crate::dispatcher::{EventDispatcher, Subscription};
use crate::error::ApiError;
use crate::types::{OrderData, OrderItem, OrderStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    #[serde(default)]
    pub table_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default)]
    pub total: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for Order {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Order {
    /// Merge the fields an event carries.
    fn merge(&mut self, data: &OrderData) {
        if let Some(table_id) = &data.table_id {
            self.table_id = table_id.clone();
        }
        if let Some(items) = &data.items {
            self.items = items.clone();
        }
        if let Some(status) = data.status {
            self.status = status;
        }
        if let Some(total) = data.total {
            self.total = total;
        }
        if data.created_at.is_some() {
            self.created_at = data.created_at;
        }
        if data.updated_at.is_some() {
            self.updated_at = data.updated_at;
        }
    }

    fn from_event(data: &OrderData) -> Self {
        let mut order = Order {
            id: data.id.clone(),
            ..Default::default()
        };
        order.merge(data);
        order
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub table_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    pub items: Vec<OrderItem>,
    pub status: OrderStatus,
    pub total: f64,
}

#[derive(Debug, Default)]
struct OrderState {
    orders: Collection<Order>,
    cart: Option<Vec<OrderItem>>,
    load: LoadState,
}

pub struct OrderStore {
    api: Arc<dyn OrderApi>,
    state: Mutex<OrderState>,
}

impl OrderStore {
    pub fn new(api: Arc<dyn OrderApi>) -> Arc<Self> {
        Arc::new(Self {
            api,
            state: Mutex::new(OrderState::default()),
        })
    }

    pub fn orders(&self) -> Vec<Order> {
        lock(&self.state).orders.items().to_vec()
    }

    pub fn order_by_id(&self, id: &str) -> Option<Order> {
        lock(&self.state).orders.get(id).cloned()
    }

    pub fn load_state(&self) -> LoadState {
        lock(&self.state).load.clone()
    }

    pub fn orders_by_table(&self, table_id: &str) -> Vec<Order> {
        lock(&self.state)
            .orders
            .items()
            .iter()
            .filter(|o| o.table_id == table_id)
            .cloned()
            .collect()
    }

    pub fn orders_by_customer(&self, customer_id: &str) -> Vec<Order> {
        lock(&self.state)
            .orders
            .items()
            .iter()
            .filter(|o| o.customer_id.as_deref() == Some(customer_id))
            .cloned()
            .collect()
    }

    // ── REST ────────────────────────────────────────────────

    pub async fn fetch_orders(&self) -> Result<(), ApiError> {
        self.begin();
        match self.api.get_orders().await {
            Ok(orders) => {
                info!(count = orders.len(), "orders loaded");
                let mut state = lock(&self.state);
                state.orders.replace(orders);
                state.load = LoadState::Idle;
                Ok(())
            }
            Err(e) => Err(self.fail("failed to load orders", e)),
        }
    }

    /// Reload one table's orders. Orders of other tables stay as they are.
    pub async fn fetch_orders_by_table(&self, table_id: &str) -> Result<(), ApiError> {
        self.begin();
        match self.api.get_orders_by_table(table_id).await {
            Ok(fresh) => {
                let mut state = lock(&self.state);
                state.orders.retain(|o| o.table_id != table_id);
                for order in fresh {
                    state.orders.push(order);
                }
                state.load = LoadState::Idle;
                Ok(())
            }
            Err(e) => Err(self.fail(&format!("failed to load orders of table {table_id}"), e)),
        }
    }

    /// Place an order. Clears the cart and returns the new order's id.
    pub async fn create_order(&self, order: &NewOrder) -> Result<String, ApiError> {
        self.begin();
        match self.api.create_order(order).await {
            Ok(created) => {
                let id = created.id.clone();
                let mut state = lock(&self.state);
                // The server may have echoed it already through `order-created`.
                state.orders.upsert(&id, |existing| *existing = created.clone(), || created.clone());
                state.cart = None;
                state.load = LoadState::Idle;
                Ok(id)
            }
            Err(e) => Err(self.fail("failed to create order", e)),
        }
    }

    pub async fn update_order_status(&self, id: &str, status: OrderStatus) -> Result<(), ApiError> {
        self.begin();
        match self.api.update_order_status(id, status).await {
            Ok(_) => {
                let mut state = lock(&self.state);
                state.orders.patch(id, |o| {
                    o.status = status;
                    o.updated_at = Some(Utc::now());
                });
                state.load = LoadState::Idle;
                Ok(())
            }
            Err(e) => Err(self.fail("failed to update order status", e)),
        }
    }

    // ── Cart ────────────────────────────────────────────────

    pub fn current_order(&self) -> Option<Vec<OrderItem>> {
        lock(&self.state).cart.clone()
    }

    /// Add a line. A product already in the cart has its quantity raised,
    /// capped at `u32::MAX`.
    pub fn add_to_current_order(&self, item: OrderItem) {
        let mut state = lock(&self.state);
        let cart = state.cart.get_or_insert_with(Vec::new);
        match cart.iter_mut().find(|i| i.product_id == item.product_id) {
            Some(existing) => existing.quantity = existing.quantity.saturating_add(item.quantity),
            None => cart.push(item),
        }
    }

    /// Set a line's quantity. Zero removes the line.
    pub fn update_current_order_item(&self, product_id: &str, quantity: u32) {
        let mut state = lock(&self.state);
        let Some(cart) = state.cart.as_mut() else { return };
        if quantity == 0 {
            cart.retain(|i| i.product_id != product_id);
        } else if let Some(line) = cart.iter_mut().find(|i| i.product_id == product_id) {
            line.quantity = quantity;
        }
    }

    pub fn remove_from_current_order(&self, product_id: &str) {
        if let Some(cart) = lock(&self.state).cart.as_mut() {
            cart.retain(|i| i.product_id != product_id);
        }
    }

    pub fn clear_current_order(&self) {
        lock(&self.state).cart = None;
    }

    pub fn current_order_total(&self) -> f64 {
        lock(&self.state)
            .cart
            .as_ref()
            .map(|cart| cart.iter().map(|i| i.price * f64::from(i.quantity)).sum())
            .unwrap_or(0.0)
    }

    // ── Event patches ───────────────────────────────────────

    /// `new-order` / `order-created`: merge into a known order or append.
    pub fn apply_created(&self, data: &OrderData) -> bool {
        let appended = lock(&self.state)
            .orders
            .upsert(&data.id, |o| o.merge(data), || Order::from_event(data));
        debug!(order = %data.id, appended, "order creation applied");
        appended
    }

    /// `order-updated`: merge into a known order. Unknown ids are ignored.
    pub fn apply_updated(&self, data: &OrderData) -> bool {
        let applied = lock(&self.state).orders.patch(&data.id, |o| o.merge(data));
        if !applied {
            debug!(order = %data.id, "update for unknown order ignored");
        }
        applied
    }

    pub fn attach(self: &Arc<Self>, dispatcher: &EventDispatcher) -> Vec<Subscription> {
        let weak = Arc::downgrade(self);
        let new_order = dispatcher.on_new_order(move |data| {
            if let Some(store) = weak.upgrade() {
                store.apply_created(data);
            }
        });
        let weak = Arc::downgrade(self);
        let created = dispatcher.on_order_created(move |data| {
            if let Some(store) = weak.upgrade() {
                store.apply_created(data);
            }
        });
        let weak = Arc::downgrade(self);
        let updated = dispatcher.on_order_updated(move |data| {
            if let Some(store) = weak.upgrade() {
                store.apply_updated(data);
            }
        });
        vec![new_order, created, updated]
    }

    // ── Internal ────────────────────────────────────────────

    fn begin(&self) {
        lock(&self.state).load = LoadState::Loading;
    }

    fn fail(&self, what: &str, err: ApiError) -> ApiError {
        warn!("{what}: {err}");
        lock(&self.state).load = LoadState::Error(format!("{what}: {err}"));
        err
    }
}
