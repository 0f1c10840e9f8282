//! Wire messages for both protocols.
//!
//! Everything here is plain data: engines build these, the transport encodes
//! them with postcard, and the addressed node's engine consumes them. The
//! transport may drop, delay, or duplicate any of them, so every handler
//! treats re-delivery as a no-op.

use serde::{Deserialize, Serialize};

use crate::core::types::{Ballot, NodeId, Slot, Term};
use crate::log::LogEntry;
use crate::state_machine::Command;

/// Tagged union of everything that crosses the simulated wire.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Message {
    Raft(RaftMessage),
    Paxos(PaxosMessage),
}

impl From<RaftMessage> for Message {
    fn from(msg: RaftMessage) -> Self {
        Self::Raft(msg)
    }
}

impl From<PaxosMessage> for Message {
    fn from(msg: PaxosMessage) -> Self {
        Self::Paxos(msg)
    }
}

// =============================================================================
// RAFT
// =============================================================================

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate: NodeId,
    pub last_log_index: Slot,
    pub last_log_term: Term,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub granted: bool,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub leader: NodeId,
    pub prev_index: Slot,
    pub prev_term: Term,
    pub entries: Vec<LogEntry>,
    /// Leader's commit index at send time.
    pub commit: Slot,
}

impl AppendEntries {
    /// Heartbeats are append calls with no entries.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On success, the highest slot this follower now matches the leader on.
    /// On failure, the follower's last index, as a backtracking hint.
    pub match_index: Slot,
}

// =============================================================================
// PAXOS
// =============================================================================

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum PaxosMessage {
    Prepare(Prepare),
    Promise(Promise),
    Accept(Accept),
    Accepted(Accepted),
    Heartbeat(Heartbeat),
    Learn(Learn),
    LearnReply(LearnReply),
}

/// Phase 1a. `slot` is the start of the promised range: a promise covers
/// this slot and every higher one, which is what lets the winner skip
/// Prepare for subsequent slots.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Prepare {
    pub ballot: Ballot,
    pub slot: Slot,
}

/// One accepted `(slot, ballot, command)` triple reported by an acceptor.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct AcceptedValue {
    pub slot: Slot,
    pub ballot: Ballot,
    pub command: Command,
}

/// Phase 1b. The promise was granted iff `promised` equals the prepared
/// ballot; otherwise `promised` is the higher ballot to beat. `accepted`
/// lists everything this acceptor has accepted at or above the range start,
/// so a quorum of promises exposes every possibly-chosen value.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Promise {
    pub promised: Ballot,
    pub accepted: Vec<AcceptedValue>,
}

/// Phase 2a.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Accept {
    pub ballot: Ballot,
    pub slot: Slot,
    pub command: Command,
}

/// Phase 2b, broadcast to every node so all learners converge. The accept
/// succeeded iff `accepted` carries the proposal's own ballot; otherwise
/// `promised` names the ballot that superseded it.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Accepted {
    pub promised: Ballot,
    pub slot: Slot,
    pub accepted: Option<(Ballot, Command)>,
}

/// Distinguished-proposer keepalive. `chosen` is the leader's contiguous
/// chosen watermark; a follower further back asks for a `Learn` catch-up.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Heartbeat {
    pub ballot: Ballot,
    pub chosen: Slot,
}

/// Learner catch-up request: send me your chosen entries from this slot on.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Learn {
    pub from_slot: Slot,
}

/// Contiguous chosen entries starting at `from_slot`. The sender only
/// reports slots it has itself learned as chosen, so the receiver can adopt
/// them without re-counting votes.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct LearnReply {
    pub from_slot: Slot,
    pub entries: Vec<LogEntry>,
}
