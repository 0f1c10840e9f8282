//! Pluggable distributed consensus over a simulated lossy network
//!
//! This library implements two consensus engines behind one seam: Raft
//! (leader election plus log replication) and Multi-Paxos (ballots and
//! slots with a distinguished proposer). Both run over an in-process
//! network that delays, drops, duplicates, and partitions messages
//! deterministically under a fixed seed.
//!
//! # Architecture
//!
//! - **Cores**: [`RaftCore`] and [`PaxosCore`], pure state machines behind
//!   the [`Engine`] trait; no I/O, driven identically by the runtime and
//!   the Stateright models
//! - **Runtime**: one task per node owning its engine and state machine,
//!   one router task owning every delivery decision
//! - **Harness**: [`Cluster`] spawns it all, injects faults (kill, restart,
//!   partition), and observes every node through snapshots
//!
//! # Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use conclave::{Cluster, ClusterConfig, Command, EngineKind, Slot};
//!
//! let mut cluster = Cluster::new(EngineKind::Raft, ClusterConfig::with_seed(5, 42));
//! let leader = cluster.await_leader(Duration::from_secs(5)).await?;
//! cluster.propose(Command::put("k", "v")).await?;
//! let snap = cluster.await_applied(leader, Slot::new(1), Duration::from_secs(5)).await?;
//! assert_eq!(snap.kv["k"], "v");
//! ```

#![warn(clippy::pedantic)]

// Submodules
pub mod cluster;
pub mod codec;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod messages;
pub mod net;
pub mod node;
pub mod state_machine;
pub mod stats;
pub mod timer;

pub use cluster::{Cluster, EngineKind};
pub use config::{BackoffConfig, ClusterConfig, NetworkConfig, TimingConfig};
pub use crate::core::{
    Ballot, Durable, Engine, EngineStatus, NodeId, PaxosCore, RaftCore, Role, Slot, Term,
};
pub use error::{ProposeError, WaitError};
pub use log::{Log, LogEntry};
pub use messages::{Message, PaxosMessage, RaftMessage};
pub use node::{NodeCommand, NodeSnapshot};
pub use state_machine::{Command, KvStore, StateMachine};
pub use stats::{NetStats, NodeStats};
