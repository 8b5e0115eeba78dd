//! Event dispatcher: fan-out of server-pushed events to local subscribers.
//!
//! The transport task holds a single [`Binding`] per physical connection and
//! hands every inbound text frame to [`EventDispatcher::receive_text`]. Fan-out
//! to the registered callbacks happens here, one typed list per event kind.
//!
//! Callback lists are snapshotted before invocation, so callbacks may
//! subscribe or unsubscribe re-entrantly. A panicking callback is caught and
//! logged; the remaining callbacks for the same event still run.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::types::{parse_frame, CustomerData, Event, EventKind, Inbound, OrderData, TableStatusData};

pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slot<T> {
    entries: Vec<(u64, Callback<T>)>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> Slot<T> {
    fn snapshot(&self) -> Vec<Callback<T>> {
        self.entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }
}

#[derive(Default)]
struct Callbacks {
    new_order: Slot<OrderData>,
    order_updated: Slot<OrderData>,
    order_created: Slot<OrderData>,
    new_customer: Slot<CustomerData>,
    table_status_updated: Slot<TableStatusData>,
}

impl Callbacks {
    fn remove(&mut self, kind: EventKind, id: u64) -> bool {
        match kind {
            EventKind::NewOrder => self.new_order.remove(id),
            EventKind::OrderUpdated => self.order_updated.remove(id),
            EventKind::OrderCreated => self.order_created.remove(id),
            EventKind::NewCustomer => self.new_customer.remove(id),
            EventKind::TableStatusUpdated => self.table_status_updated.remove(id),
        }
    }

    fn count(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::NewOrder => self.new_order.entries.len(),
            EventKind::OrderUpdated => self.order_updated.entries.len(),
            EventKind::OrderCreated => self.order_created.entries.len(),
            EventKind::NewCustomer => self.new_customer.entries.len(),
            EventKind::TableStatusUpdated => self.table_status_updated.entries.len(),
        }
    }
}

struct DispatcherInner {
    callbacks: Mutex<Callbacks>,
    next_id: AtomicU64,
    /// Id of the binding currently allowed to deliver; 0 = detached.
    /// Watched by the transport task so a detach tears the session down.
    active_binding: watch::Sender<u64>,
    next_binding: AtomicU64,
}

/// Identifies one attachment of the dispatcher to a physical connection.
/// Frames delivered under a stale binding are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Binding(u64);

impl Binding {
    pub(crate) fn id(&self) -> u64 {
        self.0
    }
}

/// Per-kind subscriber registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

/// Handle returned by the `on_*` methods. Removes exactly the callback it
/// was created for. Dropping it does *not* unsubscribe.
#[must_use = "keep the handle to be able to unsubscribe"]
#[derive(Debug)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
    inner: Weak<DispatcherInner>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Remove the callback. Safe to call repeatedly, after the callback has
    /// fired, or after the dispatcher was cleared or dropped.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let removed = lock(&inner).remove(self.kind, self.id);
            if removed {
                debug!(kind = %self.kind, id = self.id, "unsubscribed");
            }
        }
    }
}

impl std::fmt::Debug for DispatcherInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherInner").finish_non_exhaustive()
    }
}

fn lock(inner: &DispatcherInner) -> MutexGuard<'_, Callbacks> {
    inner.callbacks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                callbacks: Mutex::new(Callbacks::default()),
                next_id: AtomicU64::new(1),
                active_binding: watch::channel(0).0,
                next_binding: AtomicU64::new(0),
            }),
        }
    }

    // ── Subscriptions ───────────────────────────────────────

    pub fn on_new_order<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&OrderData) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::NewOrder, |c| &mut c.new_order, callback)
    }

    pub fn on_order_updated<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&OrderData) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::OrderUpdated, |c| &mut c.order_updated, callback)
    }

    pub fn on_order_created<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&OrderData) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::OrderCreated, |c| &mut c.order_created, callback)
    }

    pub fn on_new_customer<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CustomerData) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::NewCustomer, |c| &mut c.new_customer, callback)
    }

    pub fn on_table_status_updated<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TableStatusData) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::TableStatusUpdated, |c| &mut c.table_status_updated, callback)
    }

    fn subscribe<T, F>(
        &self,
        kind: EventKind,
        pick: impl FnOnce(&mut Callbacks) -> &mut Slot<T>,
        callback: F,
    ) -> Subscription
    where
        T: 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback<T> = Arc::new(callback);
        let mut guard = lock(&self.inner);
        pick(&mut *guard).entries.push((id, callback));
        drop(guard);
        debug!(kind = %kind, id, "subscribed");
        Subscription {
            kind,
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        lock(&self.inner).count(kind)
    }

    // ── Fan-out ─────────────────────────────────────────────

    /// Invoke every callback registered for the event's kind, in
    /// subscription order. Returns the number of callbacks invoked
    /// (panicked ones included).
    pub fn dispatch(&self, event: &Event) -> usize {
        let kind = event.kind();
        match event {
            Event::NewOrder(p) => fan_out(kind, self.snapshot(|c| &c.new_order), p),
            Event::OrderUpdated(p) => fan_out(kind, self.snapshot(|c| &c.order_updated), p),
            Event::OrderCreated(p) => fan_out(kind, self.snapshot(|c| &c.order_created), p),
            Event::NewCustomer(p) => fan_out(kind, self.snapshot(|c| &c.new_customer), p),
            Event::TableStatusUpdated(p) => fan_out(kind, self.snapshot(|c| &c.table_status_updated), p),
        }
    }

    fn snapshot<T>(&self, pick: impl FnOnce(&Callbacks) -> &Slot<T>) -> Vec<Callback<T>> {
        let guard = lock(&self.inner);
        pick(&*guard).snapshot()
    }

    // ── Transport binding ───────────────────────────────────

    /// Attach to a new physical connection. Any earlier binding goes stale.
    pub(crate) fn bind(&self) -> Binding {
        let id = self.inner.next_binding.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.active_binding.send_replace(id);
        Binding(id)
    }

    /// Stop accepting frames from the transport. Subscribers are kept.
    pub fn detach(&self) {
        self.inner.active_binding.send_replace(0);
    }

    /// Whether `binding` is still the one allowed to deliver.
    pub(crate) fn is_current(&self, binding: Binding) -> bool {
        *self.inner.active_binding.borrow() == binding.0
    }

    pub fn is_bound(&self) -> bool {
        *self.inner.active_binding.borrow() != 0
    }

    /// Follows binding changes; used by the transport task.
    pub(crate) fn watch_binding(&self) -> watch::Receiver<u64> {
        self.inner.active_binding.subscribe()
    }

    /// Detach from the transport and drop every subscriber. Idempotent.
    pub fn clear_listeners(&self) {
        self.detach();
        *lock(&self.inner) = Callbacks::default();
        debug!("all listeners cleared");
    }

    /// Entry point for the transport task: shape one text frame and fan it
    /// out. Unknown kinds and malformed payloads are logged and dropped.
    pub(crate) fn receive_text(&self, binding: Binding, text: &str) {
        if !self.is_current(binding) {
            debug!("frame from detached connection dropped");
            return;
        }
        match parse_frame(text) {
            Ok(Inbound::Event(event)) => {
                let kind = event.kind();
                let invoked = self.dispatch(&event);
                debug!(kind = %kind, invoked, "event dispatched");
            }
            Ok(other) => debug!("ignoring control frame after handshake: {other:?}"),
            Err(e) => warn!("dropping inbound frame: {e}"),
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn fan_out<T>(kind: EventKind, callbacks: Vec<Callback<T>>, payload: &T) -> usize {
    for callback in &callbacks {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| callback(payload))) {
            error!(kind = %kind, "subscriber callback panicked: {}", panic_message(&*panic));
        }
    }
    callbacks.len()
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}
