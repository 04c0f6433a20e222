//! Pending handler set
//!
//! Handlers are identified by play index and position in that play's
//! `handlers:` list, so iterating the set yields declaration order across
//! plays and a handler notified many times is held once.

use std::collections::BTreeSet;

/// Position of a handler in the playbook
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId {
    pub play: usize,
    pub index: usize,
}

#[derive(Debug, Default)]
pub struct PendingHandlers {
    pending: BTreeSet<HandlerId>,
}

impl PendingHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a handler pending; returns false when it already was
    pub fn notify(&mut self, id: HandlerId) -> bool {
        self.pending.insert(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take every pending handler in declaration order
    pub fn drain(&mut self) -> Vec<HandlerId> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }
}
