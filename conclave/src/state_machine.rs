//! The replicated state machine fed by committed log entries.
//!
//! Engines agree on an ordered sequence of [`Command`]s; the node runtime
//! applies each committed command here in strict slot order, exactly once.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::Slot;

/// A replicated command. Opaque to the consensus engines; only the state
/// machine interprets it.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Command {
    Put { key: String, value: String },
    Delete { key: String },
    Noop,
}

impl Command {
    #[must_use]
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// Deterministic apply-in-order consumer of committed commands.
///
/// `apply` is invoked with strictly increasing slots; implementations must
/// treat a replayed slot as a no-op so that a restarted node can rebuild by
/// replaying its log from the start.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, slot: Slot, command: &Command);

    /// Point read of the materialized state.
    fn read(&self, key: &str) -> Option<String>;

    /// Full materialized state, for the coordinator's observation API.
    fn contents(&self) -> BTreeMap<String, String>;

    fn last_applied(&self) -> Slot;
}

/// In-memory key-value store, the default state machine for the harness.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KvStore {
    data: BTreeMap<String, String>,
    applied: Slot,
}

impl KvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, slot: Slot, command: &Command) {
        // Replays of already-applied slots must not mutate state.
        if slot <= self.applied {
            return;
        }
        self.applied = slot;
        match command {
            Command::Put { key, value } => {
                self.data.insert(key.clone(), value.clone());
            }
            Command::Delete { key } => {
                self.data.remove(key);
            }
            Command::Noop => {}
        }
    }

    fn read(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    fn contents(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }

    fn last_applied(&self) -> Slot {
        self.applied
    }
}
