//! Seam between the pure cores and the runtime.
//!
//! Engines are pure state machines: an event goes in (message, timer expiry,
//! or a client command), actions come out through the [`Outbox`]. The node
//! runtime and the Stateright models drive the exact same transitions, so
//! what the checker verifies is what runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::{Ballot, NodeId, Slot, Term};
use crate::error::ProposeError;
use crate::log::{Log, LogEntry};
use crate::messages::Message;
use crate::state_machine::Command;

/// Timer events the runtime delivers to an engine.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TimerKind {
    /// The randomized election deadline elapsed without leader contact.
    Election,
    /// The fixed heartbeat interval ticked. Non-leaders ignore it.
    Heartbeat,
}

/// Timer re-arm requests an engine emits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerCmd {
    /// Re-arm the election deadline with a fresh randomized duration.
    /// Emitted on leader contact or a granted vote.
    ResetElection,
    /// Re-arm the election deadline with jittered exponential backoff,
    /// which pulls dueling proposers apart.
    Backoff { attempt: u32 },
}

/// Everything an engine asks the runtime to do after handling one event.
#[derive(Debug, Default)]
pub struct Outbox {
    /// Outbound messages, fire-and-forget.
    pub messages: Vec<(NodeId, Message)>,
    /// Entries that just became committed, in apply order.
    pub committed: Vec<(Slot, LogEntry)>,
    /// At most one timer request per event.
    pub timer: Option<TimerCmd>,
}

impl Outbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, to: NodeId, msg: impl Into<Message>) {
        self.messages.push((to, msg.into()));
    }

    pub fn commit(&mut self, slot: Slot, entry: LogEntry) {
        self.committed.push((slot, entry));
    }

    pub fn reset_election(&mut self) {
        self.timer = Some(TimerCmd::ResetElection);
    }

    pub fn backoff(&mut self, attempt: u32) {
        self.timer = Some(TimerCmd::Backoff { attempt });
    }
}

/// Node role as seen by the coordinator. Paxos maps onto the same three:
/// a preparing proposer reports `Candidate`, the distinguished proposer
/// `Leader`, everyone else `Follower`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Engine-agnostic observation summary.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub role: Role,
    /// Raft term, or the round of the highest Paxos ballot seen.
    pub term: Term,
    /// The ballot this node currently recognizes as leading, Paxos only.
    pub ballot: Option<Ballot>,
    pub leader: Option<NodeId>,
    pub commit_index: Slot,
    pub last_log_index: Slot,
}

/// State that must survive a kill/restart cycle, alongside the log.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Durable {
    Raft {
        term: Term,
        voted_for: Option<NodeId>,
    },
    Paxos {
        promised: Ballot,
        accepted: BTreeMap<Slot, (Ballot, Command)>,
        round: u64,
    },
}

/// A pluggable consensus engine.
pub trait Engine: Send + 'static {
    /// Arm initial timers. Called once before the event loop starts.
    fn bootstrap(&mut self, out: &mut Outbox);

    fn handle_message(&mut self, from: NodeId, msg: Message, out: &mut Outbox);

    fn handle_timer(&mut self, kind: TimerKind, out: &mut Outbox);

    /// Submit a command for replication.
    ///
    /// # Errors
    /// [`ProposeError::NotLeader`] when this node cannot take the command;
    /// the hint (if any) names where to retry.
    fn propose(&mut self, command: Command, out: &mut Outbox) -> Result<(), ProposeError>;

    fn status(&self) -> EngineStatus;

    /// The node's log, for snapshots and assertions.
    fn log(&self) -> &Log;

    /// State that must survive restart.
    fn durable(&self) -> Durable;
}
