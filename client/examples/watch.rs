//! Admin dashboard feed: log in, load tables and orders, then print every
//! pushed event and the store state it produces.
//!
//! ```bash
//! POS_API_URL=http://localhost:3000/api POS_USER=admin POS_PASSWORD=secret \
//!     cargo run --example watch
//! ```

use std::sync::Arc;

use pos_client::{
    ClientConfig, ConnectionManager, CredentialStore, HttpApi, OrderStore, ProductStore, SessionStatus, TableStore,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let config = ClientConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(true)
        .init();

    let credentials = CredentialStore::new();
    let api = Arc::new(HttpApi::new(&config, credentials.clone())?);

    let user = std::env::var("POS_USER").unwrap_or_else(|_| "admin".into());
    let password = std::env::var("POS_PASSWORD").unwrap_or_default();
    if let Err(e) = api.login(&user, &password).await {
        error!("login failed, continuing without real-time updates: {e}");
    }

    let sync = ConnectionManager::new(&config, credentials.clone());
    info!(url = %sync.url(), api = %config.api_url, "realtime endpoint");
    let tables = TableStore::new(api.clone());
    let orders = OrderStore::new(api.clone());
    let products = ProductStore::new(api.clone());
    let _table_subs = tables.attach(sync.dispatcher());
    let _order_subs = orders.attach(sync.dispatcher());

    let _print_orders = sync.dispatcher().on_new_order(|order| {
        println!("new order {} for table {}", order.id, order.table_id.as_deref().unwrap_or("?"));
    });
    let tables_view = Arc::clone(&tables);
    let _print_tables = sync.dispatcher().on_table_status_updated(move |update| {
        if let Some(table) = tables_view.table_by_id(&update.id) {
            println!(
                "table {} ({}) occupied={} customers={}",
                table.id,
                table.name,
                table.is_occupied,
                table.customers.len()
            );
        }
    });

    if let Err(e) = tables.fetch_tables().await {
        error!("initial table load failed: {e}");
    }
    if let Err(e) = orders.fetch_orders().await {
        error!("initial order load failed: {e}");
    }
    if let Err(e) = products.fetch_products().await {
        error!("initial product load failed: {e}");
    }
    info!(
        tables = tables.tables().len(),
        orders = orders.orders().len(),
        products = products.products().len(),
        categories = ?products.categories(),
        "baseline loaded"
    );

    sync.register_admin();

    let mut session = credentials.status();
    let mut connection = sync.state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = session.changed() => {
                if changed.is_err() || *session.borrow() == SessionStatus::Expired {
                    error!("session expired, log in again");
                    break;
                }
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                info!(state = ?*connection.borrow(), "connection state");
            }
        }
    }

    sync.disconnect();
    sync.dispatcher().clear_listeners();
    Ok(())
}
