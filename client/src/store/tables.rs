//! Table and customer store.

use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{lock, Collection, Entity, LoadState};
use crate::api::TableApi;
use crate::dispatcher::{EventDispatcher, Subscription};
use crate::error::ApiError;
use crate::types::{CustomerData, TableStatus, TableStatusData};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: String,
    #[serde(default)]
    pub number: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_occupied: bool,
    #[serde(default)]
    pub customers: Vec<Customer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for Table {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub table_id: Option<String>,
}

impl From<&CustomerData> for Customer {
    fn from(data: &CustomerData) -> Self {
        Self {
            id: Some(data.id.clone()),
            name: data.name.clone(),
            table_id: data.table_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTable {
    pub number: u32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_occupied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

/// Partial table edit. Only `Some` fields are sent, and the server's
/// answer is read back the same way so absent fields stay untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TableUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_occupied: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(skip_serializing)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TableUpdate {
    fn apply(&self, table: &mut Table) {
        if let Some(number) = self.number {
            table.number = number;
        }
        if let Some(name) = &self.name {
            table.name = name.clone();
        }
        if self.description.is_some() {
            table.description = self.description.clone();
        }
        if let Some(occupied) = self.is_occupied {
            table.is_occupied = occupied;
        }
        if self.is_active.is_some() {
            table.is_active = self.is_active;
        }
        if self.updated_at.is_some() {
            table.updated_at = self.updated_at;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCustomer {
    pub name: String,
    pub table_id: String,
}

/// Response of customer creation. The token lets the table device act as
/// that customer.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedCustomer {
    pub customer: CustomerData,
    #[serde(default, alias = "accessToken")]
    pub access_token: Option<String>,
}

#[derive(Debug, Default)]
struct TableState {
    tables: Collection<Table>,
    load: LoadState,
}

pub struct TableStore {
    api: Arc<dyn TableApi>,
    state: Mutex<TableState>,
}

impl TableStore {
    pub fn new(api: Arc<dyn TableApi>) -> Arc<Self> {
        Arc::new(Self {
            api,
            state: Mutex::new(TableState::default()),
        })
    }

    pub fn tables(&self) -> Vec<Table> {
        lock(&self.state).tables.items().to_vec()
    }

    pub fn load_state(&self) -> LoadState {
        lock(&self.state).load.clone()
    }

    pub fn table_by_id(&self, id: &str) -> Option<Table> {
        lock(&self.state).tables.get(id).cloned()
    }

    pub fn customers_by_table(&self, table_id: &str) -> Vec<Customer> {
        lock(&self.state)
            .tables
            .get(table_id)
            .map(|t| t.customers.clone())
            .unwrap_or_default()
    }

    // ── REST ────────────────────────────────────────────────

    /// Baseline load. Replaces every table, then pulls the customer list of
    /// each occupied table. A failed customer lookup only logs.
    pub async fn fetch_tables(&self) -> Result<(), ApiError> {
        self.begin();
        let tables = match self.api.get_tables().await {
            Ok(t) => t,
            Err(e) => return Err(self.fail("failed to load tables", e)),
        };
        let occupied: Vec<String> = tables.iter().filter(|t| t.is_occupied).map(|t| t.id.clone()).collect();
        {
            let mut state = lock(&self.state);
            state.tables.replace(tables);
            state.load = LoadState::Idle;
        }
        info!(occupied = occupied.len(), "tables loaded");

        let lookups = occupied.iter().map(move |id| async move { (id, self.api.get_customers_by_table(id).await) });
        for (id, result) in join_all(lookups).await {
            match result {
                Ok(customers) => {
                    lock(&self.state).tables.patch(id, |t| t.customers = customers);
                }
                Err(e) => warn!(table = %id, "failed to load customers: {e}"),
            }
        }
        Ok(())
    }

    pub async fn add_table(&self, table: &NewTable) -> Result<Table, ApiError> {
        self.begin();
        match self.api.create_table(table).await {
            Ok(mut created) => {
                created.customers.clear();
                let mut state = lock(&self.state);
                state.tables.push(created.clone());
                state.load = LoadState::Idle;
                Ok(created)
            }
            Err(e) => Err(self.fail("failed to create table", e)),
        }
    }

    /// Apply an edit. The requested fields are merged first, then whatever
    /// the server echoed back. Fields neither side carries, and the
    /// customer list, are kept.
    pub async fn update_table(&self, id: &str, update: &TableUpdate) -> Result<(), ApiError> {
        self.begin();
        match self.api.update_table(id, update).await {
            Ok(echoed) => {
                let mut state = lock(&self.state);
                state.tables.patch(id, |t| {
                    update.apply(t);
                    echoed.apply(t);
                });
                state.load = LoadState::Idle;
                Ok(())
            }
            Err(e) => Err(self.fail("failed to update table", e)),
        }
    }

    pub async fn remove_table(&self, id: &str) -> Result<(), ApiError> {
        self.begin();
        match self.api.delete_table(id).await {
            Ok(()) => {
                let mut state = lock(&self.state);
                state.tables.remove(id);
                state.load = LoadState::Idle;
                Ok(())
            }
            Err(e) => Err(self.fail("failed to delete table", e)),
        }
    }

    /// Seat a customer. On success the customer is appended and the table
    /// marked occupied.
    pub async fn add_customer_to_table(&self, table_id: &str, name: &str) -> Result<CreatedCustomer, ApiError> {
        self.begin();
        let request = NewCustomer {
            name: name.to_string(),
            table_id: table_id.to_string(),
        };
        match self.api.create_customer(&request).await {
            Ok(created) => {
                let mut state = lock(&self.state);
                state.tables.patch(table_id, |t| {
                    t.customers.push(Customer::from(&created.customer));
                    t.is_occupied = true;
                });
                state.load = LoadState::Idle;
                Ok(created)
            }
            Err(e) => Err(self.fail("failed to add customer", e)),
        }
    }

    pub async fn remove_customer_from_table(&self, table_id: &str, customer_id: &str) -> Result<(), ApiError> {
        self.begin();
        match self.api.delete_customer(customer_id).await {
            Ok(()) => {
                let mut state = lock(&self.state);
                state.tables.patch(table_id, |t| {
                    t.customers.retain(|c| c.id.as_deref() != Some(customer_id));
                });
                state.load = LoadState::Idle;
                Ok(())
            }
            Err(e) => Err(self.fail("failed to remove customer", e)),
        }
    }

    // ── Event patches ───────────────────────────────────────

    /// Merge a `table-status-updated` payload. Unknown ids are ignored.
    /// An absent or empty name keeps the local one.
    pub fn update_table_status(&self, data: &TableStatusData) -> bool {
        let applied = lock(&self.state).tables.patch(&data.id, |t| {
            if let Some(name) = data.name.as_deref().filter(|n| !n.is_empty()) {
                t.name = name.to_string();
            }
            if let Some(status) = data.status {
                t.is_occupied = status == TableStatus::Occupied;
            }
            if let Some(customers) = &data.customers {
                t.customers = customers.iter().map(Customer::from).collect();
            }
        });
        if !applied {
            debug!(table = %data.id, "status update for unknown table ignored");
        }
        applied
    }

    /// Wire the store to pushed events. Dropping the store does not
    /// unsubscribe; callbacks then become no-ops.
    pub fn attach(self: &Arc<Self>, dispatcher: &EventDispatcher) -> Vec<Subscription> {
        let weak = Arc::downgrade(self);
        let status = dispatcher.on_table_status_updated(move |data| {
            if let Some(store) = weak.upgrade() {
                store.update_table_status(data);
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let customer = dispatcher.on_new_customer(move |data| {
            let Some(store) = weak.upgrade() else { return };
            debug!(customer = %data.id, "new customer, reloading tables");
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = store.fetch_tables().await {
                            warn!("table reload after new customer failed: {e}");
                        }
                    });
                }
                Err(_) => warn!("no runtime, table reload skipped"),
            }
        });

        vec![status, customer]
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
