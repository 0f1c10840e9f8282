//! Simulated lossy network.
//!
//! One router task owns all routing state: mailboxes, the partition table,
//! the fault rng, and a [`DelayQueue`] of in-flight frames. Senders never
//! block and never learn a message's fate; drops, duplicates, and delays
//! happen here and only here. Partition verdicts are taken at send time, so
//! a heal does not resurrect frames that were already doomed.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio_util::time::DelayQueue;
use tracing::{debug, trace, warn};

use crate::codec::{self, Envelope};
use crate::config::NetworkConfig;
use crate::core::types::NodeId;
use crate::stats::NetStats;

/// Control messages from the coordinator.
pub enum NetCommand {
    /// Point `node`'s deliveries at a fresh mailbox, after a restart.
    Attach {
        node: NodeId,
        mailbox: mpsc::UnboundedSender<Bytes>,
    },
    /// Cut the island off from everyone else.
    Partition { island: BTreeSet<NodeId> },
    Heal,
}

/// Cheap-to-clone handle held by the coordinator and every node.
#[derive(Clone)]
pub struct RouterHandle {
    outbound: mpsc::UnboundedSender<Envelope>,
    commands: mpsc::UnboundedSender<NetCommand>,
    stats: watch::Receiver<NetStats>,
}

impl RouterHandle {
    /// Fire-and-forget send. The router decides what actually happens.
    pub fn send(&self, envelope: Envelope) {
        let _ = self.outbound.send(envelope);
    }

    pub fn attach(&self, node: NodeId, mailbox: mpsc::UnboundedSender<Bytes>) {
        let _ = self.commands.send(NetCommand::Attach { node, mailbox });
    }

    pub fn partition(&self, island: impl IntoIterator<Item = NodeId>) {
        let island = island.into_iter().collect();
        let _ = self.commands.send(NetCommand::Partition { island });
    }

    pub fn heal(&self) {
        let _ = self.commands.send(NetCommand::Heal);
    }

    #[must_use]
    pub fn stats(&self) -> NetStats {
        *self.stats.borrow()
    }
}

/// The single dispatching task.
pub struct Router {
    config: NetworkConfig,
    rng: StdRng,
    mailboxes: BTreeMap<NodeId, mpsc::UnboundedSender<Bytes>>,
    island: Option<BTreeSet<NodeId>>,
    queue: DelayQueue<(NodeId, Bytes)>,
    stats: NetStats,
    stats_tx: watch::Sender<NetStats>,
    outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    commands_rx: mpsc::UnboundedReceiver<NetCommand>,
}

impl Router {
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        seed: u64,
        mailboxes: BTreeMap<NodeId, mpsc::UnboundedSender<Bytes>>,
    ) -> (Self, RouterHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(NetStats::default());
        let router = Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            mailboxes,
            island: None,
            queue: DelayQueue::new(),
            stats: NetStats::default(),
            stats_tx,
            outbound_rx,
            commands_rx,
        };
        let handle = RouterHandle {
            outbound: outbound_tx,
            commands: commands_tx,
            stats: stats_rx,
        };
        (router, handle)
    }

    /// Run until every handle is gone.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                cmd = self.commands_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(expired) = self.queue.next() => {
                    let (to, frame) = expired.into_inner();
                    self.deliver(to, frame);
                }
                Some(envelope) = self.outbound_rx.recv() => self.route(envelope),
            }
        }
        debug!("router shut down");
    }

    fn handle_command(&mut self, cmd: NetCommand) {
        match cmd {
            NetCommand::Attach { node, mailbox } => {
                trace!(?node, "attached mailbox");
                self.mailboxes.insert(node, mailbox);
            }
            NetCommand::Partition { island } => {
                debug!(?island, "partitioned");
                self.island = Some(island);
            }
            NetCommand::Heal => {
                debug!("healed");
                self.island = None;
            }
        }
    }

    fn severed(&self, from: NodeId, to: NodeId) -> bool {
        self.island
            .as_ref()
            .is_some_and(|island| island.contains(&from) != island.contains(&to))
    }

    fn route(&mut self, envelope: Envelope) {
        self.stats.sent += 1;
        let (from, to) = (envelope.from, envelope.to);
        let frame = match codec::encode(&envelope) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "unencodable frame dropped");
                self.publish();
                return;
            }
        };
        if self.severed(from, to) {
            trace!(?from, ?to, "dropped by partition");
            self.stats.dropped_partition += 1;
        } else if self.rng.random_bool(self.config.loss) {
            trace!(?from, ?to, "dropped by loss");
            self.stats.dropped_loss += 1;
        } else {
            let copies = if self.rng.random_bool(self.config.duplicate) {
                self.stats.duplicated += 1;
                2
            } else {
                1
            };
            for _ in 0..copies {
                let delay = self.config.delay(&mut self.rng);
                self.queue.insert((to, frame.clone()), delay);
            }
        }
        self.publish();
    }

    fn deliver(&mut self, to: NodeId, frame: Bytes) {
        let delivered = self
            .mailboxes
            .get(&to)
            .is_some_and(|mailbox| mailbox.send(frame).is_ok());
        if delivered {
            self.stats.delivered += 1;
        } else {
            trace!(?to, "dropped at dead node");
            self.stats.dropped_dead += 1;
        }
        self.publish();
    }

    fn publish(&self) {
        self.stats_tx.send_replace(self.stats);
    }
}
