//! Operation counters for nodes and the wire.
//!
//! The cores stay counter-free so that model checking compares pure protocol
//! state; the runtime derives these from what each event observably did.

use crate::core::engine::{EngineStatus, Outbox, Role};

/// Per-node counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NodeStats {
    pub messages_in: u64,
    pub messages_out: u64,
    pub elections_started: u64,
    /// Times this node won a leadership it did not already hold.
    pub leader_transitions: u64,
    pub committed: u64,
}

impl NodeStats {
    /// Fold one handled event into the counters.
    pub fn record(&mut self, before: &EngineStatus, after: &EngineStatus, out: &Outbox) {
        self.messages_out += out.messages.len() as u64;
        self.committed += out.committed.len() as u64;
        let fresh_campaign = after.role == Role::Candidate
            && (before.role != Role::Candidate || after.term != before.term);
        if fresh_campaign {
            self.elections_started += 1;
        }
        if after.role == Role::Leader && before.role != Role::Leader {
            self.leader_transitions += 1;
        }
    }
}

/// Wire counters kept by the router.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NetStats {
    pub sent: u64,
    pub delivered: u64,
    pub duplicated: u64,
    pub dropped_loss: u64,
    pub dropped_partition: u64,
    /// Addressed to a node that was killed or never attached.
    pub dropped_dead: u64,
}
