//! Registration registry: which rooms this client wants events for.
//!
//! The server forgets room membership whenever the physical connection
//! drops, so every held interest is re-declared after each (re)connect.

use crate::types::ClientFrame;

/// A declared subscription scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Interest {
    /// Every order, table and customer event.
    Admin,
    /// Only events scoped to one table.
    Table(String),
}

impl Interest {
    pub(crate) fn frame(&self) -> ClientFrame<'_> {
        match self {
            Interest::Admin => ClientFrame::RegisterAdmin,
            Interest::Table(id) => ClientFrame::RegisterTable { table_id: id },
        }
    }
}

impl std::fmt::Display for Interest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interest::Admin => f.write_str("admin"),
            Interest::Table(id) => write!(f, "table:{id}"),
        }
    }
}

/// Deduplicated, insertion-ordered set of interests.
#[derive(Debug, Default)]
pub struct RegistrationRegistry {
    interests: Vec<Interest>,
}

impl RegistrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interest. Returns false if it was already held.
    pub fn declare(&mut self, interest: Interest) -> bool {
        if self.interests.contains(&interest) {
            return false;
        }
        self.interests.push(interest);
        true
    }

    pub fn contains(&self, interest: &Interest) -> bool {
        self.interests.contains(interest)
    }

    /// Everything to re-emit after a reconnect, each interest once.
    pub fn replay_all(&self) -> Vec<Interest> {
        self.interests.clone()
    }

    pub fn clear(&mut self) {
        self.interests.clear();
    }

    pub fn len(&self) -> usize {
        self.interests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }
}
