//! Cluster coordinator: spawns the node and router tasks, injects faults,
//! and exposes the observation surface the scenario tests drive.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::task::JoinMap;
use tracing::{debug, trace, warn};

use crate::config::ClusterConfig;
use crate::core::engine::{Durable, Engine, Role};
use crate::core::paxos::PaxosCore;
use crate::core::raft::RaftCore;
use crate::core::types::{NodeId, Slot};
use crate::error::{ProposeError, WaitError};
use crate::log::Log;
use crate::net::{Router, RouterHandle};
use crate::node::{Node, NodeCommand, NodeContext, NodeSnapshot};
use crate::state_machine::{Command, KvStore, StateMachine};
use crate::stats::{NetStats, NodeStats};

// =============================================================================
// ENGINE SELECTION
// =============================================================================

/// Which consensus engine every node in a cluster runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EngineKind {
    Raft,
    Paxos,
}

impl EngineKind {
    fn build(self, id: NodeId, members: &[NodeId]) -> Box<dyn Engine> {
        match self {
            Self::Raft => Box::new(RaftCore::new(id, members.iter().copied())),
            Self::Paxos => Box::new(PaxosCore::new(id, members.iter().copied())),
        }
    }

    fn restore(self, id: NodeId, members: &[NodeId], durable: Durable, log: Log) -> Box<dyn Engine> {
        match (self, durable) {
            (Self::Raft, Durable::Raft { term, voted_for }) => Box::new(RaftCore::restore(
                id,
                members.iter().copied(),
                term,
                voted_for,
                log,
            )),
            (
                Self::Paxos,
                Durable::Paxos {
                    promised,
                    accepted,
                    round,
                },
            ) => Box::new(PaxosCore::restore(
                id,
                members.iter().copied(),
                promised,
                accepted,
                round,
                log,
            )),
            (kind, _) => {
                warn!(?kind, "durable state is from a different engine, starting fresh");
                kind.build(id, members)
            }
        }
    }
}

// =============================================================================
// CLUSTER
// =============================================================================

/// The router rng must not share a stream with any node's timer rng.
const ROUTER_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

struct Member {
    commands: mpsc::UnboundedSender<NodeCommand>,
    snapshots: watch::Receiver<NodeSnapshot>,
}

/// A whole simulated cluster: N node tasks, one router task, and the
/// handles to poke and observe them. Dropping it aborts every node task;
/// the router exits once the last handle is gone.
pub struct Cluster {
    kind: EngineKind,
    config: ClusterConfig,
    ids: Vec<NodeId>,
    router: RouterHandle,
    members: BTreeMap<NodeId, Member>,
    tasks: JoinMap<NodeId, ()>,
    dead: BTreeSet<NodeId>,
    down: bool,
}

impl Cluster {
    /// Spawn a cluster. Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(kind: EngineKind, config: ClusterConfig) -> Self {
        let ids: Vec<NodeId> = config.members().collect();
        let mut mailboxes = BTreeMap::new();
        let mut inboxes = Vec::new();
        for &id in &ids {
            let (mail_tx, mail_rx) = mpsc::unbounded_channel();
            mailboxes.insert(id, mail_tx);
            inboxes.push((id, mail_rx));
        }
        let (router, handle) = Router::new(
            config.network.clone(),
            config.seed ^ ROUTER_SEED,
            mailboxes,
        );
        tokio::spawn(router.run());

        let mut cluster = Self {
            kind,
            config,
            ids,
            router: handle,
            members: BTreeMap::new(),
            tasks: JoinMap::new(),
            dead: BTreeSet::new(),
            down: false,
        };
        for (id, mail_rx) in inboxes {
            let member = cluster.spawn_node(id, mail_rx, None);
            cluster.members.insert(id, member);
        }
        debug!(size = cluster.ids.len(), ?kind, "cluster started");
        cluster
    }

    fn spawn_node(
        &mut self,
        id: NodeId,
        inbox: mpsc::UnboundedReceiver<Bytes>,
        restore: Option<(Durable, Log)>,
    ) -> Member {
        let engine = match restore {
            None => self.kind.build(id, &self.ids),
            Some((durable, log)) => self.kind.restore(id, &self.ids, durable, log),
        };
        let machine: Box<dyn StateMachine> = Box::new(KvStore::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snap_tx, snap_rx) = watch::channel(NodeSnapshot::capture(
            id,
            0,
            engine.as_ref(),
            machine.as_ref(),
            NodeStats::default(),
        ));
        let node = Node::new(
            NodeContext {
                id,
                config: self.config.clone(),
                router: self.router.clone(),
                inbox,
                commands: cmd_rx,
                snapshots: snap_tx,
            },
            engine,
            machine,
        );
        self.tasks.spawn(id, node.run());
        Member {
            commands: cmd_tx,
            snapshots: snap_rx,
        }
    }

    #[must_use]
    pub fn members(&self) -> &[NodeId] {
        &self.ids
    }

    #[must_use]
    pub fn is_live(&self, node: NodeId) -> bool {
        self.members.contains_key(&node) && !self.dead.contains(&node)
    }

    // =========================================================================
    // FAULT INJECTION
    // =========================================================================

    /// Abort a node's task mid-flight. Its durable state survives in the
    /// last published snapshot, ready for [`Cluster::restart`].
    pub fn kill(&mut self, node: NodeId) {
        if self.tasks.abort(&node) {
            debug!(node_id = ?node, "node killed");
        }
        self.dead.insert(node);
    }

    /// Bring a killed node back from its durable state: term and vote (or
    /// promise floor and accepted values) plus the log. It resumes as a
    /// follower and catches up from its peers.
    pub fn restart(&mut self, node: NodeId) {
        let Some(member) = self.members.get(&node) else {
            return;
        };
        let snap = member.snapshots.borrow().clone();
        debug!(node_id = ?node, term = snap.status.term.get(), "node restarting");
        let (mail_tx, mail_rx) = mpsc::unbounded_channel();
        self.router.attach(node, mail_tx);
        let member = self.spawn_node(node, mail_rx, Some((snap.durable, snap.log)));
        self.members.insert(node, member);
        self.dead.remove(&node);
    }

    /// Sever the network between `island` and everyone else.
    pub fn partition(&self, island: impl IntoIterator<Item = NodeId>) {
        self.router.partition(island);
    }

    pub fn heal(&self) {
        self.router.heal();
    }

    /// Abort every node task. Further proposals fail with
    /// [`ProposeError::Shutdown`].
    pub fn shutdown(&mut self) {
        debug!("cluster shutting down");
        self.down = true;
        self.tasks.abort_all();
        self.dead.extend(self.members.keys().copied());
    }

    // =========================================================================
    // PROPOSALS
    // =========================================================================

    /// Submit a command to the node currently leading, following
    /// `NotLeader` redirect hints for at most one lap around the cluster.
    ///
    /// # Errors
    /// [`ProposeError::NotLeader`] when no live node will take the command,
    /// [`ProposeError::Shutdown`] after [`Cluster::shutdown`].
    pub async fn propose(&self, command: Command) -> Result<(), ProposeError> {
        if self.down {
            return Err(ProposeError::Shutdown);
        }
        let mut target = self.leader().ok_or(ProposeError::NotLeader { hint: None })?;
        for _ in 0..self.members.len() {
            match self.propose_to(target, command.clone()).await {
                Err(ProposeError::NotLeader { hint: Some(next) }) if next != target => {
                    trace!(from = ?target, to = ?next, "proposal redirected");
                    target = next;
                }
                other => return other,
            }
        }
        Err(ProposeError::NotLeader { hint: Some(target) })
    }

    /// Submit a command to one specific node.
    ///
    /// # Errors
    /// Whatever the node's engine answers, or
    /// [`ProposeError::Unavailable`] if its task is gone.
    pub async fn propose_to(&self, node: NodeId, command: Command) -> Result<(), ProposeError> {
        if self.down {
            return Err(ProposeError::Shutdown);
        }
        let Some(member) = self.members.get(&node) else {
            return Err(ProposeError::Unavailable);
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        member
            .commands
            .send(NodeCommand::Propose {
                command,
                reply: reply_tx,
            })
            .map_err(|_| ProposeError::Unavailable)?;
        reply_rx.await.map_err(|_| ProposeError::Unavailable)?
    }

    // =========================================================================
    // OBSERVATION
    // =========================================================================

    /// The live node currently claiming leadership, preferring the highest
    /// term. A Paxos cluster reports its distinguished proposer here.
    #[must_use]
    pub fn leader(&self) -> Option<NodeId> {
        self.members
            .iter()
            .filter(|(id, _)| !self.dead.contains(id))
            .filter_map(|(id, member)| {
                let snap = member.snapshots.borrow();
                (snap.status.role == Role::Leader).then_some((snap.status.term, *id))
            })
            .max()
            .map(|(_, id)| id)
    }

    /// Wait until some live node claims leadership.
    ///
    /// # Errors
    /// [`WaitError::Timeout`] past the deadline, [`WaitError::Closed`] if
    /// every node is dead.
    pub async fn await_leader(&mut self, within: Duration) -> Result<NodeId, WaitError> {
        let waits: Vec<_> = self
            .members
            .iter_mut()
            .filter(|(id, _)| !self.dead.contains(id))
            .map(|(_, member)| {
                Box::pin(async move {
                    member
                        .snapshots
                        .wait_for(|snap| snap.status.role == Role::Leader)
                        .await
                        .map(|snap| snap.id)
                })
            })
            .collect();
        if waits.is_empty() {
            return Err(WaitError::Closed);
        }
        let (first, _, _) = timeout(within, futures::future::select_all(waits)).await?;
        Ok(first?)
    }

    /// Wait until a node has applied the entry in `slot` to its state
    /// machine, and return the snapshot that shows it.
    ///
    /// # Errors
    /// [`WaitError::Timeout`] past the deadline, [`WaitError::Closed`] if
    /// the node's task is gone.
    pub async fn await_applied(
        &mut self,
        node: NodeId,
        slot: Slot,
        within: Duration,
    ) -> Result<NodeSnapshot, WaitError> {
        let Some(member) = self.members.get_mut(&node) else {
            return Err(WaitError::Closed);
        };
        let snap = timeout(within, member.snapshots.wait_for(|snap| snap.applied >= slot)).await??;
        Ok(snap.clone())
    }

    /// The last snapshot a node published, even if it is dead now.
    #[must_use]
    pub fn snapshot(&self, node: NodeId) -> Option<NodeSnapshot> {
        self.members
            .get(&node)
            .map(|member| member.snapshots.borrow().clone())
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.members
            .values()
            .map(|member| member.snapshots.borrow().clone())
            .collect()
    }

    #[must_use]
    pub fn net_stats(&self) -> NetStats {
        self.router.stats()
    }
}

// =============================================================================
// TESTS
// =============================================================================
