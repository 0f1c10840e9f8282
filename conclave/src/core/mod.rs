//! Pure state machine cores for both consensus engines - no I/O, no async
//!
//! This module contains the state transition logic that is shared between:
//! - The async node runtime
//! - The Stateright model checker tests
//!
//! By extracting this logic, we ensure the model checker verifies the exact
//! same state transitions as the running cluster.
//!
//! # Modules
//!
//! - [`types`]: Identity and ordering types (`NodeId`, `Term`, `Slot`, `Ballot`)
//! - [`engine`]: The [`Engine`](engine::Engine) seam plus the [`Outbox`](engine::Outbox)
//! - [`raft`]: Raft election and replication (`RaftCore`)
//! - [`paxos`]: Multi-Paxos with a distinguished proposer (`PaxosCore`)
//! - [`quorum`]: Majority vote tracking (`QuorumCore`)

pub mod engine;
pub mod paxos;
pub mod quorum;
pub mod raft;
pub mod types;

pub use engine::{Durable, Engine, EngineStatus, Outbox, Role, TimerCmd, TimerKind};
pub use paxos::{AcceptorCore, PaxosCore, PaxosRole};
pub use quorum::QuorumCore;
pub use raft::{RaftCore, RaftRole};
pub use types::{Ballot, NodeId, Slot, Term};
