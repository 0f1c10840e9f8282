//! Identity and ordering types shared by both engines.
//!
//! These are plain newtypes so the model checker can hash and compare
//! whole-node states structurally.

use serde::{Deserialize, Serialize};

// =============================================================================
// NODE IDENTITY
// =============================================================================

/// Unique node identity.
///
/// The transport and the coordinator address nodes by id only; nodes never
/// hold references to each other.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl NodeId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

// =============================================================================
// RAFT TERM
// =============================================================================

/// Raft leadership epoch. A node's term only ever increases.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(term: u64) -> Self {
        Self(term)
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

// =============================================================================
// LOG SLOT
// =============================================================================

/// Log index / Paxos decision slot. Entries are contiguous from slot 1;
/// `Slot::ZERO` is the sentinel "before the first entry".
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct Slot(pub u64);

impl Slot {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

// =============================================================================
// PAXOS BALLOT
// =============================================================================

/// Paxos ballot: `(round, node)` under lexicographic order, so two proposers
/// can never produce equal ballots and every pair is comparable.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct Ballot {
    pub round: u64,
    pub node: NodeId,
}

impl Ballot {
    /// Smaller than any ballot a real proposer issues (rounds start at 1).
    pub const ZERO: Self = Self {
        round: 0,
        node: NodeId(0),
    };

    #[must_use]
    pub const fn new(round: u64, node: NodeId) -> Self {
        Self { round, node }
    }

    /// The lowest ballot owned by `node` that orders above `self`.
    #[must_use]
    pub const fn successor(self, node: NodeId) -> Self {
        Self {
            round: self.round + 1,
            node,
        }
    }
}
