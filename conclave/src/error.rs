//! Caller-visible error types.
//!
//! Protocol-internal conditions (stale terms and ballots, log mismatches,
//! lost quorum, duplicated delivery) never surface here; the algorithms
//! resolve them internally.

use std::fmt;

use crate::core::types::NodeId;

/// Why a proposed command was not taken.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProposeError {
    /// This node is not the leader. `hint` is its best guess at who is.
    NotLeader { hint: Option<NodeId> },
    /// The targeted node's task is gone (killed or never started).
    Unavailable,
    /// The whole cluster has been shut down.
    Shutdown,
}

impl fmt::Display for ProposeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLeader { hint: Some(leader) } => {
                write!(f, "not the leader, try node {}", leader.get())
            }
            Self::NotLeader { hint: None } => write!(f, "not the leader"),
            Self::Unavailable => write!(f, "node unavailable"),
            Self::Shutdown => write!(f, "cluster is shut down"),
        }
    }
}

impl std::error::Error for ProposeError {}

/// A coordinator wait gave up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitError {
    /// The condition did not hold within the deadline.
    Timeout,
    /// The observed node's task is gone.
    Closed,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "condition not reached in time"),
            Self::Closed => write!(f, "node task is gone"),
        }
    }
}

impl std::error::Error for WaitError {}

impl From<tokio::sync::watch::error::RecvError> for WaitError {
    fn from(_: tokio::sync::watch::error::RecvError) -> Self {
        Self::Closed
    }
}

impl From<tokio::time::error::Elapsed> for WaitError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}
