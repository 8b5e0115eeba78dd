//! Real-time sync layer for the restaurant POS client.
//!
//! One authenticated WebSocket session per process, room registration that
//! survives reconnects, typed fan-out of pushed events, and local stores
//! that merge those events into REST-loaded state.
//!
//! ```ignore
//! let credentials = CredentialStore::new();
//! let api = Arc::new(HttpApi::new(&config, credentials.clone())?);
//! api.login("admin", "secret").await?;
//!
//! let sync = ConnectionManager::new(&config, credentials);
//! let tables = TableStore::new(api.clone());
//! let _subs = tables.attach(sync.dispatcher());
//! tables.fetch_tables().await?;
//! sync.register_admin();
//! ```
//!
//! Without a credential or outside a tokio runtime the connection manager
//! stays idle and the stores keep working from REST alone.

pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod store;
pub mod types;

pub use api::{HttpApi, OrderApi, ProductApi, SongApi, TableApi};
pub use auth::{CredentialStore, SessionStatus};
pub use config::{ClientConfig, ReconnectPolicy};
pub use connection::{Connection, ConnectionManager, ConnectionState};
pub use dispatcher::{EventDispatcher, Subscription};
pub use error::{ApiError, SyncError};
pub use registry::{Interest, RegistrationRegistry};
pub use store::{LoadState, OrderStore, ProductStore, SongStore, TableStore};
pub use types::{Event, EventKind};
