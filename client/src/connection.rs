//! Connection manager: one authenticated WebSocket session per client.
//!
//! The socket is owned by a background tokio task. API methods talk to it
//! through a channel and never block on I/O. The task reconnects with
//! exponential backoff + jitter and, after every successful handshake,
//! replays all declared interests before anything else is sent.
//!
//! Without a stored credential `initialize()` returns `None` and the client
//! stays in REST-only mode. That is not an error.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::auth::CredentialStore;
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::dispatcher::{Binding, EventDispatcher};
use crate::error::SyncError;
use crate::registry::{Interest, RegistrationRegistry};
use crate::types::{parse_frame, ClientFrame, Inbound};

const OUTBOUND_CAPACITY: usize = 256;

// ═══════════════════════════════════════════════════════════════
// Public types
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Cloneable handle onto the live session.
#[derive(Clone)]
pub struct Connection {
    tx: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    binding: u64,
}

impl Connection {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether both handles talk to the same background task.
    pub fn same_session(&self, other: &Connection) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Message sent from API methods to the background task.
enum Command {
    Declare(Interest),
}

struct Session {
    registry: RegistrationRegistry,
    /// Binding id of the connection that has replayed the registry.
    live: Option<u64>,
}

struct Shared {
    session: Mutex<Session>,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct Active {
    connection: Connection,
    binding: Binding,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

// ═══════════════════════════════════════════════════════════════
// Manager
// ═══════════════════════════════════════════════════════════════

/// Owns the transport, the registration registry and the event dispatcher.
///
/// Construct one per process session and hand it (or an `Arc` of it) to the
/// stores that need live updates.
pub struct ConnectionManager {
    url: String,
    handshake_timeout: Duration,
    reconnect: ReconnectPolicy,
    credentials: CredentialStore,
    dispatcher: EventDispatcher,
    shared: Arc<Shared>,
    active: Mutex<Option<Active>>,
}

impl ConnectionManager {
    pub fn new(config: &ClientConfig, credentials: CredentialStore) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url: normalize_ws_url(&config.socket_url),
            handshake_timeout: config.handshake_timeout,
            reconnect: config.reconnect,
            credentials,
            dispatcher: EventDispatcher::new(),
            shared: Arc::new(Shared {
                session: Mutex::new(Session {
                    registry: RegistrationRegistry::new(),
                    live: None,
                }),
                state,
            }),
            active: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.dispatcher.is_bound() && *self.shared.state.borrow() == ConnectionState::Connected
    }

    /// Currently declared interests, in declaration order.
    pub fn interests(&self) -> Vec<Interest> {
        self.shared.lock_session().registry.replay_all()
    }

    /// Ensure the background connection exists. Returns `None` when no
    /// credential is stored (or no tokio runtime is available); the client
    /// then works over REST only.
    pub fn initialize(&self) -> Option<Connection> {
        let mut active = self.lock_active();
        if let Some(existing) = active.as_ref() {
            if !existing.task.is_finished() && self.dispatcher.is_current(existing.binding) {
                return Some(existing.connection.clone());
            }
        }
        // Finished, or detached by `clear_listeners`: replace it.
        if let Some(stale) = active.take() {
            let _ = stale.shutdown.send(());
            debug!("replacing stale connection");
        }

        let token = match self.credentials.token() {
            Some(t) => t,
            None => {
                warn!("no credential stored, real-time updates disabled");
                return None;
            }
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(e) => {
                warn!("no tokio runtime, real-time updates disabled: {e}");
                return None;
            }
        };
        debug!(url = %self.url, "credential found, connecting");

        let (tx, rx) = mpsc::channel::<Command>(OUTBOUND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let binding = self.dispatcher.bind();

        let ctx = TaskContext {
            url: self.url.clone(),
            initial_token: token,
            credentials: self.credentials.clone(),
            dispatcher: self.dispatcher.clone(),
            binding,
            shared: Arc::clone(&self.shared),
            handshake_timeout: self.handshake_timeout,
            reconnect: self.reconnect,
        };
        let task = runtime.spawn(connection_task(ctx, rx, shutdown_rx));

        let connection = Connection {
            tx,
            state: self.shared.state.subscribe(),
            binding: binding.id(),
        };
        *active = Some(Active {
            connection: connection.clone(),
            binding,
            shutdown: shutdown_tx,
            task,
        });
        Some(connection)
    }

    /// Close the transport, forget the connection and every declared
    /// interest. Subscribers registered on the dispatcher are kept; use
    /// [`EventDispatcher::clear_listeners`] to drop them too.
    pub fn disconnect(&self) {
        let active = self.lock_active().take();
        self.dispatcher.detach();
        {
            let mut session = self.shared.lock_session();
            session.registry.clear();
            session.live = None;
        }
        self.shared.state.send_replace(ConnectionState::Disconnected);

        if let Some(active) = active {
            let _ = active.shutdown.send(());
            info!("disconnected");
        }
    }

    /// Join the admin room: every order, table and customer event.
    pub fn register_admin(&self) {
        self.declare(Interest::Admin);
    }

    /// Join one table's room.
    pub fn register_for_table(&self, table_id: impl Into<String>) {
        self.declare(Interest::Table(table_id.into()));
    }

    fn declare(&self, interest: Interest) {
        let connection = self.initialize();

        let mut session = self.shared.lock_session();
        if !session.registry.declare(interest.clone()) {
            debug!(%interest, "already registered");
            return;
        }

        match connection {
            Some(conn) if session.live == Some(conn.binding) => {
                // A declaration lost here is still in the registry and goes
                // out with the next replay.
                if conn.tx.try_send(Command::Declare(interest.clone())).is_err() {
                    debug!(%interest, "declaration deferred to next connect");
                } else {
                    debug!(%interest, "declaration queued");
                }
            }
            _ => debug!(%interest, "remembered until connected"),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Convert an endpoint to a ws:// URL suitable for tungstenite.
/// Handles: ws://, wss://, http://, https://. Adds `/ws` when no path is given.
pub fn normalize_ws_url(ep: &str) -> String {
    let ep = ep.trim().trim_end_matches('/');
    let url = if let Some(rest) = ep.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = ep.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        ep.to_string()
    };
    let has_path = url
        .split_once("://")
        .map(|(_, rest)| rest.contains('/'))
        .unwrap_or(false);
    if has_path {
        url
    } else {
        format!("{url}/ws")
    }
}

// ═══════════════════════════════════════════════════════════════
// Background WebSocket task
// ═══════════════════════════════════════════════════════════════

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

struct TaskContext {
    url: String,
    initial_token: String,
    credentials: CredentialStore,
    dispatcher: EventDispatcher,
    binding: Binding,
    shared: Arc<Shared>,
    handshake_timeout: Duration,
    reconnect: ReconnectPolicy,
}

impl TaskContext {
    /// State changes from a task that has been replaced are ignored.
    fn publish(&self, state: ConnectionState) {
        if self.dispatcher.is_current(self.binding) {
            self.shared.state.send_replace(state);
        }
    }

    /// Mark the session live and take the interests to replay. Done under
    /// one lock so a concurrent declaration is either in the snapshot or
    /// queued behind it, never both and never neither.
    fn go_live(&self) -> Vec<Interest> {
        let mut session = self.shared.lock_session();
        session.live = Some(self.binding.id());
        session.registry.replay_all()
    }

    /// Also run when this task was detached or shut down: the state then
    /// drops to `Disconnected` unless a newer task owns it.
    fn mark_down(&self) {
        {
            let mut session = self.shared.lock_session();
            if session.live == Some(self.binding.id()) {
                session.live = None;
            }
        }
        if self.dispatcher.is_current(self.binding) || !self.dispatcher.is_bound() {
            self.shared.state.send_replace(ConnectionState::Disconnected);
        }
    }

    /// Re-read the store on every attempt so a refreshed token is used.
    fn token(&self) -> String {
        self.credentials
            .token()
            .unwrap_or_else(|| self.initial_token.clone())
    }

    /// Sleep before the next attempt. Returns false when the task must stop.
    async fn backoff(&self, stop: &mut StopSignal, attempt: u32) -> bool {
        let delay = self.reconnect.delay(attempt);
        debug!(ms = delay.as_millis() as u64, attempt, "backoff sleep");
        tokio::select! {
            _ = stop.wait() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Fires on `disconnect()` (or the manager being dropped) and when the
/// dispatcher no longer holds this task's binding.
struct StopSignal {
    shutdown: oneshot::Receiver<()>,
    bound: watch::Receiver<u64>,
    binding: u64,
}

impl StopSignal {
    async fn wait(&mut self) {
        tokio::select! {
            _ = &mut self.shutdown => {}
            _ = detached(&mut self.bound, self.binding) => {}
        }
    }
}

async fn detached(bound: &mut watch::Receiver<u64>, binding: u64) {
    loop {
        if *bound.borrow_and_update() != binding {
            return;
        }
        if bound.changed().await.is_err() {
            return;
        }
    }
}

/// Owns the WebSocket, handles send/recv, reconnects.
async fn connection_task(ctx: TaskContext, mut rx: mpsc::Receiver<Command>, shutdown: oneshot::Receiver<()>) {
    let mut stop = StopSignal {
        shutdown,
        bound: ctx.dispatcher.watch_binding(),
        binding: ctx.binding.id(),
    };
    let mut attempt: u32 = 0;

    loop {
        // ── Connect + authenticate ──────────────────────────
        ctx.publish(ConnectionState::Connecting);
        let token = ctx.token();
        let opened = tokio::select! {
            _ = stop.wait() => {
                ctx.mark_down();
                return;
            }
            r = open_session(&ctx.url, &token, ctx.handshake_timeout) => r,
        };

        let (mut ws_tx, mut ws_rx) = match opened {
            Ok((ws_tx, ws_rx, sid)) => {
                info!(url = %ctx.url, sid = sid.as_deref().unwrap_or("-"), "WebSocket connected");
                attempt = 0;
                (ws_tx, ws_rx)
            }
            Err(e) => {
                // Credentials stay untouched: a failed socket handshake is
                // usually the network, not the token.
                warn!(url = %ctx.url, attempt, "connect error: {e}");
                ctx.mark_down();
                if !ctx.backoff(&mut stop, attempt).await {
                    ctx.mark_down();
                    return;
                }
                attempt = attempt.saturating_add(1);
                continue;
            }
        };

        // ── Replay interests ────────────────────────────────
        let interests = ctx.go_live();
        ctx.publish(ConnectionState::Connected);
        let mut healthy = true;
        for interest in &interests {
            if let Err(e) = send_frame(&mut ws_tx, &interest.frame()).await {
                warn!(%interest, "replay failed: {e}");
                healthy = false;
                break;
            }
        }
        if healthy {
            debug!(count = interests.len(), "interests replayed");
        }

        // ── Message loop ────────────────────────────────────
        while healthy {
            tokio::select! {
                _ = stop.wait() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    ctx.mark_down();
                    info!("session closed");
                    return;
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(Command::Declare(interest)) => {
                            if let Err(e) = send_frame(&mut ws_tx, &interest.frame()).await {
                                warn!(%interest, "send error: {e}");
                                break; // reconnect
                            }
                            debug!(%interest, "declared");
                        }
                        None => {
                            // Every handle dropped.
                            let _ = ws_tx.send(Message::Close(None)).await;
                            ctx.mark_down();
                            return;
                        }
                    }
                }
                frame = ws_rx.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => ctx.dispatcher.receive_text(ctx.binding, &text),
                        Some(Ok(Message::Close(_))) => {
                            info!("server closed connection");
                            break; // reconnect
                        }
                        Some(Ok(_)) => {} // ping/pong/binary
                        Some(Err(e)) => {
                            warn!("ws recv error: {e}");
                            break; // reconnect
                        }
                        None => {
                            info!("ws stream ended");
                            break; // reconnect
                        }
                    }
                }
            }
        }

        // Connection lost. Queued declarations are in the registry and go
        // out with the replay, so drop them here.
        ctx.mark_down();
        while rx.try_recv().is_ok() {}
        if !ctx.backoff(&mut stop, attempt).await {
            ctx.mark_down();
            return;
        }
        attempt = attempt.saturating_add(1);
    }
}

/// Open the socket and run the auth handshake. The token travels in the
/// first frame, not in a header.
async fn open_session(
    url: &str,
    token: &str,
    timeout: Duration,
) -> Result<(WsSink, WsSource, Option<String>), SyncError> {
    let (stream, _) = tokio_tungstenite::connect_async(url).await?;
    let (mut ws_tx, mut ws_rx) = stream.split();

    send_frame(&mut ws_tx, &ClientFrame::Auth { token }).await?;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let frame = tokio::time::timeout_at(deadline, ws_rx.next())
            .await
            .map_err(|_| SyncError::HandshakeTimeout)?;
        match frame {
            Some(Ok(Message::Text(text))) => {
                return match parse_frame(&text) {
                    Ok(Inbound::Connected { sid }) => Ok((ws_tx, ws_rx, sid)),
                    Ok(Inbound::ConnectError { message }) => Err(SyncError::Rejected(message)),
                    Ok(Inbound::Event(event)) => Err(SyncError::Protocol(format!(
                        "'{}' received before handshake completed",
                        event.kind()
                    ))),
                    Err(e) => Err(SyncError::Protocol(e.to_string())),
                };
            }
            Some(Ok(Message::Close(_))) | None => return Err(SyncError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn send_frame(ws_tx: &mut WsSink, frame: &ClientFrame<'_>) -> Result<(), SyncError> {
    let text = frame.to_text()?;
    ws_tx.send(Message::Text(text.into())).await?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> ClientConfig {
        let mut config = ClientConfig::new("ws://127.0.0.1:9/ws", "http://127.0.0.1:9");
        config.reconnect = ReconnectPolicy {
            base: Duration::from_secs(5),
            max: Duration::from_secs(5),
        };
        config
    }

    #[test]
    fn test_normalize_ws_url() {
        assert_eq!(normalize_ws_url("ws://localhost:3000/ws"), "ws://localhost:3000/ws");
        assert_eq!(normalize_ws_url("http://localhost:3000"), "ws://localhost:3000/ws");
        assert_eq!(normalize_ws_url("http://localhost:3000/"), "ws://localhost:3000/ws");
        assert_eq!(
            normalize_ws_url("https://pos.example.com/realtime"),
            "wss://pos.example.com/realtime"
        );
        assert_eq!(normalize_ws_url("wss://pos.example.com"), "wss://pos.example.com/ws");
    }

    #[test]
    fn test_manager_exposes_normalized_url() {
        let config = ClientConfig::new("http://localhost:3000/", "http://localhost:3000/api");
        let manager = ConnectionManager::new(&config, CredentialStore::new());
        assert_eq!(manager.url(), "ws://localhost:3000/ws");
    }

    #[tokio::test]
    async fn test_initialize_without_credential_returns_none() {
        let manager = ConnectionManager::new(&unreachable_config(), CredentialStore::new());
        assert!(manager.initialize().is_none());
        assert!(!manager.is_connected());
        assert_eq!(*manager.state().borrow(), ConnectionState::Disconnected);
        assert!(!manager.dispatcher().is_bound());
    }

    #[test]
    fn test_initialize_without_runtime_returns_none() {
        let manager = ConnectionManager::new(&unreachable_config(), CredentialStore::with_token("t"));
        assert!(manager.initialize().is_none());
    }

    #[tokio::test]
    async fn test_registrations_remembered_without_connection() {
        let manager = ConnectionManager::new(&unreachable_config(), CredentialStore::new());
        manager.register_for_table("3");
        manager.register_admin();
        manager.register_for_table("3");
        manager.register_admin();

        assert_eq!(
            manager.interests(),
            vec![Interest::Table("3".into()), Interest::Admin]
        );
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let manager = ConnectionManager::new(&unreachable_config(), CredentialStore::with_token("t"));
        let first = manager.initialize().expect("credential present");
        let second = manager.initialize().expect("credential present");
        assert!(first.same_session(&second));
        assert!(manager.dispatcher().is_bound());
        manager.disconnect();
    }

    #[tokio::test]
    async fn test_cleared_listeners_force_a_fresh_session() {
        let manager = ConnectionManager::new(&unreachable_config(), CredentialStore::with_token("t"));
        manager.register_for_table("2");
        let first = manager.initialize().expect("credential present");

        manager.dispatcher().clear_listeners();
        assert!(!manager.is_connected());

        let second = manager.initialize().expect("credential present");
        assert!(!first.same_session(&second));
        assert!(manager.dispatcher().is_bound());
        // Interests survive; only the transport binding was dropped.
        assert_eq!(manager.interests(), vec![Interest::Table("2".into())]);
        manager.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_clears_interests_and_binding() {
        let manager = ConnectionManager::new(&unreachable_config(), CredentialStore::with_token("t"));
        manager.register_admin();
        manager.register_for_table("8");
        assert_eq!(manager.interests().len(), 2);

        manager.disconnect();
        manager.disconnect();

        assert!(manager.interests().is_empty());
        assert!(!manager.dispatcher().is_bound());
        assert_eq!(*manager.state().borrow(), ConnectionState::Disconnected);

        // A fresh initialize opens a new session.
        let again = manager.initialize().expect("credential present");
        assert!(manager.dispatcher().is_bound());
        assert!(!again.is_connected());
        manager.disconnect();
    }
}
