//! Client-side stores: REST baseline merged with pushed event patches.
//!
//! Each domain store owns exactly one collection. A baseline load replaces
//! it wholesale; event patches touch only the entity with the matching id
//! and only the fields the payload carries. Patches for ids the store does
//! not know are dropped silently: that is the expected race between the
//! baseline load and event arrival.

pub mod orders;
pub mod products;
pub mod songs;
pub mod tables;

use std::sync::{Mutex, MutexGuard};

pub use orders::{NewOrder, Order, OrderStore};
pub use products::{NewProduct, Product, ProductStore, ProductUpdate, StockChange, StockMovement, DEFAULT_CATEGORIES};
pub use songs::{NewSongRequest, Requester, SongRequest, SongStatus, SongStore};
pub use tables::{CreatedCustomer, Customer, NewCustomer, NewTable, Table, TableStore, TableUpdate};

/// Anything tracked by id.
pub trait Entity {
    fn id(&self) -> &str;
}

/// Loading field of a store. Moves `Idle → Loading → (Idle | Error)` around
/// each REST call; event patches never touch it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LoadState {
    #[default]
    Idle,
    Loading,
    Error(String),
}

impl LoadState {
    pub fn is_loading(&self) -> bool {
        matches!(self, LoadState::Loading)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            LoadState::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Ordered collection keyed by entity id.
#[derive(Debug, Clone)]
pub struct Collection<E> {
    items: Vec<E>,
}

impl<E> Default for Collection<E> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<E: Entity> Collection<E> {
    /// Baseline load: drop everything, take the new set.
    pub fn replace(&mut self, items: Vec<E>) {
        self.items = items;
    }

    pub fn items(&self) -> &[E] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&E> {
        self.items.iter().find(|e| e.id() == id)
    }

    pub fn push(&mut self, entity: E) {
        self.items.push(entity);
    }

    /// Update-only patch. Returns false when the id is unknown.
    pub fn patch(&mut self, id: &str, apply: impl FnOnce(&mut E)) -> bool {
        match self.items.iter_mut().find(|e| e.id() == id) {
            Some(entity) => {
                apply(entity);
                true
            }
            None => false,
        }
    }

    /// Creation patch: merge into the existing entity or append a new one.
    /// Returns true when an entity was appended.
    pub fn upsert(&mut self, id: &str, apply: impl FnOnce(&mut E), create: impl FnOnce() -> E) -> bool {
        match self.items.iter_mut().find(|e| e.id() == id) {
            Some(entity) => {
                apply(entity);
                false
            }
            None => {
                self.items.push(create());
                true
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<E> {
        let pos = self.items.iter().position(|e| e.id() == id)?;
        Some(self.items.remove(pos))
    }

    pub fn retain(&mut self, keep: impl FnMut(&E) -> bool) {
        self.items.retain(keep);
    }
}

pub(crate) fn lock<S>(state: &Mutex<S>) -> MutexGuard<'_, S> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
