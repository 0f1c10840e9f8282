//! The per-node runtime task.
//!
//! One task owns everything a node is: its [`Engine`], its [`StateMachine`],
//! its election timer, and its heartbeat. Every input arrives over a channel
//! (frames from the router, commands from the coordinator) or from a timer,
//! and events are handled strictly one at a time, so the engine never needs
//! a lock and every transition has a single serialized history.
//!
//! After each event the node publishes a [`NodeSnapshot`] on a watch
//! channel. The coordinator observes, waits, and restarts nodes purely
//! through those snapshots.

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Interval;
use tracing::{debug, instrument, trace, warn};

use crate::codec::{self, Envelope};
use crate::config::ClusterConfig;
use crate::core::engine::{Durable, Engine, EngineStatus, Outbox, TimerKind};
use crate::core::types::{NodeId, Slot};
use crate::error::ProposeError;
use crate::log::Log;
use crate::net::RouterHandle;
use crate::state_machine::{Command, StateMachine};
use crate::stats::NodeStats;
use crate::timer::{ElectionTimer, heartbeat_interval};

// =============================================================================
// COMMANDS AND SNAPSHOTS
// =============================================================================

/// Requests a coordinator sends into a node task.
#[derive(Debug)]
pub enum NodeCommand {
    /// Submit a command for replication.
    ///
    /// The reply reports acceptance into the leader's log, not commitment;
    /// watch the node's snapshots for the commit itself.
    Propose {
        command: Command,
        reply: oneshot::Sender<Result<(), ProposeError>>,
    },
}

/// A point-in-time view of one node, published after every handled event.
#[derive(Clone, Debug)]
pub struct NodeSnapshot {
    pub id: NodeId,
    /// Bumped on every publish; lets an observer tell "unchanged" from
    /// "not yet republished".
    pub seq: u64,
    pub status: EngineStatus,
    pub log: Log,
    /// Materialized key-value state.
    pub kv: BTreeMap<String, String>,
    /// Highest slot applied to the state machine.
    pub applied: Slot,
    pub stats: NodeStats,
    /// What the node would reload from if it were killed right now.
    pub durable: Durable,
}

impl NodeSnapshot {
    #[must_use]
    pub fn capture(
        id: NodeId,
        seq: u64,
        engine: &dyn Engine,
        machine: &dyn StateMachine,
        stats: NodeStats,
    ) -> Self {
        Self {
            id,
            seq,
            status: engine.status(),
            log: engine.log().clone(),
            kv: machine.contents(),
            applied: machine.last_applied(),
            stats,
            durable: engine.durable(),
        }
    }
}

// =============================================================================
// NODE TASK
// =============================================================================

/// Channel wiring a node task needs before it can run.
pub struct NodeContext {
    pub id: NodeId,
    pub config: ClusterConfig,
    pub router: RouterHandle,
    /// Frames the router delivers to this node.
    pub inbox: mpsc::UnboundedReceiver<Bytes>,
    pub commands: mpsc::UnboundedReceiver<NodeCommand>,
    pub snapshots: watch::Sender<NodeSnapshot>,
}

pub struct Node {
    id: NodeId,
    engine: Box<dyn Engine>,
    machine: Box<dyn StateMachine>,
    timer: ElectionTimer,
    heartbeat: Interval,
    router: RouterHandle,
    inbox: mpsc::UnboundedReceiver<Bytes>,
    commands: mpsc::UnboundedReceiver<NodeCommand>,
    snapshots: watch::Sender<NodeSnapshot>,
    stats: NodeStats,
    seq: u64,
}

impl Node {
    #[must_use]
    pub fn new(ctx: NodeContext, engine: Box<dyn Engine>, machine: Box<dyn StateMachine>) -> Self {
        // Fork the timer rng off the master seed per node, so a whole
        // cluster run replays identically from one seed.
        let timer = ElectionTimer::new(
            ctx.config.timing.clone(),
            ctx.config.backoff.clone(),
            ctx.config.seed.wrapping_add(ctx.id.get()),
        );
        let heartbeat = heartbeat_interval(&ctx.config.timing);
        Self {
            id: ctx.id,
            engine,
            machine,
            timer,
            heartbeat,
            router: ctx.router,
            inbox: ctx.inbox,
            commands: ctx.commands,
            snapshots: ctx.snapshots,
            stats: NodeStats::default(),
            seq: 0,
        }
    }

    /// Drive the node until the coordinator drops its channels.
    #[instrument(skip_all, name = "node", fields(node_id = ?self.id))]
    pub async fn run(mut self) {
        debug!("node started");
        self.replay();

        let before = self.engine.status();
        let mut out = Outbox::new();
        self.engine.bootstrap(&mut out);
        self.finish(&before, out);

        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("command channel closed, node exiting");
                        break;
                    };
                    self.on_command(cmd);
                }
                frame = self.inbox.recv() => {
                    let Some(frame) = frame else {
                        debug!("mailbox closed, node exiting");
                        break;
                    };
                    self.on_frame(&frame);
                }
                () = self.timer.fired() => self.on_timer(TimerKind::Election),
                _ = self.heartbeat.tick() => self.on_timer(TimerKind::Heartbeat),
            }
        }
    }

    /// Rebuild the state machine from the committed prefix of a restored
    /// log. A fresh node has an empty log and this is a no-op.
    fn replay(&mut self) {
        let commit = self.engine.status().commit_index;
        for n in 1..=commit.get() {
            let slot = Slot::new(n);
            if let Some(entry) = self.engine.log().get(slot) {
                self.machine.apply(slot, &entry.command);
            }
        }
    }

    fn on_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Propose { command, reply } => {
                let before = self.engine.status();
                let mut out = Outbox::new();
                let result = self.engine.propose(command, &mut out);
                // The coordinator may have stopped waiting for the answer.
                let _ = reply.send(result);
                self.finish(&before, out);
            }
        }
    }

    fn on_frame(&mut self, frame: &Bytes) {
        let envelope = match codec::decode(frame) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "undecodable frame dropped");
                return;
            }
        };
        trace!(from = ?envelope.from, "frame in");
        self.stats.messages_in += 1;
        let before = self.engine.status();
        let mut out = Outbox::new();
        self.engine
            .handle_message(envelope.from, envelope.message, &mut out);
        self.finish(&before, out);
    }

    fn on_timer(&mut self, kind: TimerKind) {
        let before = self.engine.status();
        let mut out = Outbox::new();
        self.engine.handle_timer(kind, &mut out);
        self.finish(&before, out);
    }

    /// Carry out everything the engine asked for, then publish a snapshot.
    fn finish(&mut self, before: &EngineStatus, out: Outbox) {
        for (slot, entry) in &out.committed {
            self.machine.apply(*slot, &entry.command);
        }
        let after = self.engine.status();
        self.stats.record(before, &after, &out);
        if after.role != before.role {
            debug!(role = ?after.role, term = after.term.get(), "role change");
        }
        if let Some(cmd) = out.timer {
            self.timer.apply(cmd);
        }
        for (to, message) in out.messages {
            self.router.send(Envelope {
                from: self.id,
                to,
                message,
            });
        }
        self.publish();
    }

    fn publish(&mut self) {
        self.seq += 1;
        let snapshot = NodeSnapshot::capture(
            self.id,
            self.seq,
            self.engine.as_ref(),
            self.machine.as_ref(),
            self.stats,
        );
        self.snapshots.send_replace(snapshot);
    }
}

// =============================================================================
// TESTS
// =============================================================================
