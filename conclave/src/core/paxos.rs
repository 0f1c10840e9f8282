//! Multi-Paxos with a distinguished proposer.
//!
//! Every node runs all three Paxos roles: an acceptor (the durable half),
//! a learner counting accepted votes per `(slot, ballot)`, and a proposer
//! that campaigns only when the election timer fires. A prepare covers a
//! whole range of slots, so the winner keeps proposing with bare accepts
//! until someone outbids it.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use crate::core::engine::{Durable, Engine, EngineStatus, Outbox, Role, TimerKind};
use crate::core::quorum::QuorumCore;
use crate::core::types::{Ballot, NodeId, Slot, Term};
use crate::error::ProposeError;
use crate::log::{Log, LogEntry};
use crate::messages::{
    Accept, Accepted, AcceptedValue, Heartbeat, Learn, LearnReply, Message, PaxosMessage, Prepare,
    Promise,
};
use crate::state_machine::Command;

// =============================================================================
// ACCEPTOR
// =============================================================================

/// The durable half of a node: a single promise floor covering every slot,
/// plus the highest-ballot value accepted per slot. Replies double as the
/// wire messages.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct AcceptorCore {
    promised: Ballot,
    accepted: BTreeMap<Slot, (Ballot, Command)>,
}

impl AcceptorCore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn restore(promised: Ballot, accepted: BTreeMap<Slot, (Ballot, Command)>) -> Self {
        Self { promised, accepted }
    }

    #[must_use]
    pub fn promised(&self) -> Ballot {
        self.promised
    }

    #[must_use]
    pub fn accepted(&self) -> &BTreeMap<Slot, (Ballot, Command)> {
        &self.accepted
    }

    /// Phase 1b. Grants iff `ballot` is at least the current floor; the
    /// reply reports everything accepted from `from_slot` up so the caller
    /// can tell a grant (`promised == ballot`) from a rejection.
    pub fn prepare(&mut self, ballot: Ballot, from_slot: Slot) -> Promise {
        if ballot >= self.promised {
            self.promised = ballot;
        }
        Promise {
            promised: self.promised,
            accepted: self
                .accepted
                .range(from_slot..)
                .map(|(&slot, &(ballot, ref command))| AcceptedValue {
                    slot,
                    ballot,
                    command: command.clone(),
                })
                .collect(),
        }
    }

    /// Phase 2b. Accepting also raises the floor, so an older proposer
    /// cannot sneak a value in behind a newer one.
    pub fn accept(&mut self, ballot: Ballot, slot: Slot, command: Command) -> Accepted {
        if ballot >= self.promised {
            self.promised = ballot;
            self.accepted.insert(slot, (ballot, command));
        }
        Accepted {
            promised: self.promised,
            slot,
            accepted: self.accepted.get(&slot).cloned(),
        }
    }
}

// =============================================================================
// ROLE
// =============================================================================

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum PaxosRole {
    Follower {
        /// The distinguished proposer we last heard from, with its ballot.
        leader: Option<(NodeId, Ballot)>,
    },
    Preparing {
        ballot: Ballot,
        /// Granted promises so far, self included.
        promises: BTreeMap<NodeId, Vec<AcceptedValue>>,
    },
    Leading {
        ballot: Ballot,
        /// First slot never assigned to any command.
        next_slot: Slot,
        /// Proposed at our ballot but not yet chosen; retransmitted on
        /// every heartbeat tick.
        inflight: BTreeMap<Slot, Command>,
    },
}

// =============================================================================
// CORE
// =============================================================================

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PaxosCore {
    id: NodeId,
    peers: BTreeSet<NodeId>,
    cluster_size: usize,
    acceptor: AcceptorCore,
    /// Accepted votes per `(slot, ballot)`, deduplicated by acceptor.
    learner: QuorumCore<(Slot, Ballot), Command>,
    /// Chosen entries, contiguous from slot 1.
    log: Log,
    /// Chosen out of order, waiting for the slots below them.
    chosen_gap: BTreeMap<Slot, LogEntry>,
    /// Highest ballot round seen anywhere; the next campaign outbids it.
    round: u64,
    backoff_attempt: u32,
    role: PaxosRole,
}

impl PaxosCore {
    #[must_use]
    pub fn new(id: NodeId, members: impl IntoIterator<Item = NodeId>) -> Self {
        Self::restore(id, members, Ballot::ZERO, BTreeMap::new(), 0, Log::default())
    }

    /// Rebuild a node from its durable state after a restart. Learner
    /// progress is not durable; chosen slots are re-learned from peers.
    #[must_use]
    pub fn restore(
        id: NodeId,
        members: impl IntoIterator<Item = NodeId>,
        promised: Ballot,
        accepted: BTreeMap<Slot, (Ballot, Command)>,
        round: u64,
        log: Log,
    ) -> Self {
        let peers: BTreeSet<NodeId> = members.into_iter().filter(|&m| m != id).collect();
        let cluster_size = peers.len() + 1;
        Self {
            id,
            peers,
            cluster_size,
            acceptor: AcceptorCore::restore(promised, accepted),
            learner: QuorumCore::new(cluster_size),
            log,
            chosen_gap: BTreeMap::new(),
            round,
            backoff_attempt: 0,
            role: PaxosRole::Follower { leader: None },
        }
    }

    fn quorum(&self) -> usize {
        self.cluster_size / 2 + 1
    }

    fn observe_round(&mut self, ballot: Ballot) {
        self.round = self.round.max(ballot.round);
    }

    fn current_ballot(&self) -> Option<Ballot> {
        match &self.role {
            PaxosRole::Follower { .. } => None,
            PaxosRole::Preparing { ballot, .. } | PaxosRole::Leading { ballot, .. } => {
                Some(*ballot)
            }
        }
    }

    /// A ballot above ours ends this node's campaign or reign; the retry
    /// comes on the next election fire, pushed out by backoff.
    fn maybe_superseded(&mut self, seen: Ballot, out: &mut Outbox) {
        let Some(mine) = self.current_ballot() else {
            return;
        };
        if seen > mine {
            self.role = PaxosRole::Follower { leader: None };
            self.backoff_attempt += 1;
            out.backoff(self.backoff_attempt);
        }
    }

    /// Valid contact from the distinguished proposer.
    fn follow(&mut self, leader: NodeId, ballot: Ballot, out: &mut Outbox) {
        self.role = PaxosRole::Follower {
            leader: Some((leader, ballot)),
        };
        self.backoff_attempt = 0;
        out.reset_election();
    }

    // =========================================================================
    // PROPOSER
    // =========================================================================

    fn start_prepare(&mut self, out: &mut Outbox) {
        self.round += 1;
        let ballot = Ballot::new(self.round, self.id);
        let from_slot = self.log.last_index().next();
        // `round` never trails a ballot we have seen, so our own floor
        // cannot refuse this prepare.
        let reply = self.acceptor.prepare(ballot, from_slot);
        let mut promises = BTreeMap::new();
        promises.insert(self.id, reply.accepted);
        let quorum_now = promises.len() >= self.quorum();
        self.role = PaxosRole::Preparing { ballot, promises };
        for &peer in &self.peers {
            out.send(
                peer,
                PaxosMessage::Prepare(Prepare {
                    ballot,
                    slot: from_slot,
                }),
            );
        }
        if quorum_now {
            self.become_leader(out);
        }
    }

    fn become_leader(&mut self, out: &mut Outbox) {
        let PaxosRole::Preparing { ballot, promises } = &self.role else {
            return;
        };
        let ballot = *ballot;
        // Highest-ballot accepted value per slot across the promise quorum.
        // Any value that might already be chosen is in here.
        let mut repairs: BTreeMap<Slot, (Ballot, Command)> = BTreeMap::new();
        for report in promises.values().flatten() {
            match repairs.entry(report.slot) {
                Entry::Vacant(entry) => {
                    entry.insert((report.ballot, report.command.clone()));
                }
                Entry::Occupied(mut entry) => {
                    if report.ballot > entry.get().0 {
                        entry.insert((report.ballot, report.command.clone()));
                    }
                }
            }
        }
        let chosen = self.log.last_index();
        repairs.retain(|&slot, _| slot > chosen);
        let horizon = repairs.keys().next_back().copied().unwrap_or(chosen);

        self.role = PaxosRole::Leading {
            ballot,
            next_slot: horizon.next(),
            inflight: BTreeMap::new(),
        };
        self.backoff_attempt = 0;

        // Re-propose every reported value at our ballot and plug the holes
        // with no-ops, then announce ourselves.
        let mut slot = chosen.next();
        while slot <= horizon {
            let command = repairs.remove(&slot).map_or(Command::Noop, |(_, c)| c);
            self.propose_at(slot, command, out);
            slot = slot.next();
        }
        let watermark = self.log.last_index();
        for &peer in &self.peers {
            out.send(
                peer,
                PaxosMessage::Heartbeat(Heartbeat {
                    ballot,
                    chosen: watermark,
                }),
            );
        }
    }

    fn propose_at(&mut self, slot: Slot, command: Command, out: &mut Outbox) {
        let PaxosRole::Leading {
            ballot, inflight, ..
        } = &mut self.role
        else {
            return;
        };
        let ballot = *ballot;
        inflight.insert(slot, command.clone());
        // Self-accept, then fan out the accept and our own vote together.
        let vote = self.acceptor.accept(ballot, slot, command.clone());
        for &peer in &self.peers {
            out.send(
                peer,
                PaxosMessage::Accept(Accept {
                    ballot,
                    slot,
                    command: command.clone(),
                }),
            );
            out.send(peer, PaxosMessage::Accepted(vote.clone()));
        }
        self.record_vote(self.id, slot, ballot, command, out);
    }

    // =========================================================================
    // LEARNER
    // =========================================================================

    fn record_vote(
        &mut self,
        voter: NodeId,
        slot: Slot,
        ballot: Ballot,
        command: Command,
        out: &mut Outbox,
    ) {
        let chosen = self.learner.track((slot, ballot), voter, command).cloned();
        if let Some(command) = chosen {
            self.adopt_chosen(slot, LogEntry::new(Term::new(ballot.round), command), out);
        }
    }

    /// Record a slot as chosen and commit the contiguous prefix.
    fn adopt_chosen(&mut self, slot: Slot, entry: LogEntry, out: &mut Outbox) {
        if slot <= self.log.last_index() {
            return;
        }
        if let PaxosRole::Leading { inflight, .. } = &mut self.role {
            inflight.remove(&slot);
        }
        self.chosen_gap.insert(slot, entry);
        while let Some(entry) = self.chosen_gap.remove(&self.log.last_index().next()) {
            let slot = self.log.append(entry.clone());
            out.commit(slot, entry);
        }
    }

    // =========================================================================
    // HANDLERS
    // =========================================================================

    fn handle_prepare(&mut self, from: NodeId, req: Prepare, out: &mut Outbox) {
        self.observe_round(req.ballot);
        let reply = self.acceptor.prepare(req.ballot, req.slot);
        if reply.promised == req.ballot {
            // Promised: stand down from any competing campaign, though the
            // proposer is not leader until its accepts arrive.
            if self.current_ballot().is_some_and(|mine| req.ballot > mine) {
                self.role = PaxosRole::Follower { leader: None };
            }
            out.reset_election();
        }
        out.send(from, PaxosMessage::Promise(reply));
    }

    fn handle_promise(&mut self, from: NodeId, promise: Promise, out: &mut Outbox) {
        self.observe_round(promise.promised);
        let quorum = self.quorum();
        let PaxosRole::Preparing { ballot, promises } = &mut self.role else {
            return;
        };
        if promise.promised == *ballot {
            promises.insert(from, promise.accepted);
            if promises.len() >= quorum {
                self.become_leader(out);
            }
        } else if promise.promised > *ballot {
            self.role = PaxosRole::Follower { leader: None };
            self.backoff_attempt += 1;
            out.backoff(self.backoff_attempt);
        }
        // A promise below our ballot is a straggler from an old campaign.
    }

    fn handle_accept(&mut self, from: NodeId, req: Accept, out: &mut Outbox) {
        self.observe_round(req.ballot);
        let reply = self.acceptor.accept(req.ballot, req.slot, req.command.clone());
        if reply.promised == req.ballot {
            // The sender holds a quorum promise at this ballot: it is the
            // distinguished proposer until outbid.
            self.follow(from, req.ballot, out);
            for &peer in &self.peers {
                out.send(peer, PaxosMessage::Accepted(reply.clone()));
            }
            self.record_vote(self.id, req.slot, req.ballot, req.command, out);
        } else {
            out.send(from, PaxosMessage::Accepted(reply));
        }
    }

    fn handle_accepted(&mut self, from: NodeId, note: Accepted, out: &mut Outbox) {
        self.observe_round(note.promised);
        if let Some((ballot, command)) = note.accepted.clone() {
            self.record_vote(from, note.slot, ballot, command, out);
        }
        self.maybe_superseded(note.promised, out);
    }

    fn handle_heartbeat(&mut self, from: NodeId, hb: Heartbeat, out: &mut Outbox) {
        self.observe_round(hb.ballot);
        let stale = match &self.role {
            PaxosRole::Follower { leader } => leader.is_some_and(|(_, b)| hb.ballot < b),
            PaxosRole::Preparing { ballot, .. } | PaxosRole::Leading { ballot, .. } => {
                hb.ballot < *ballot
            }
        };
        if stale || hb.ballot < self.acceptor.promised() {
            return;
        }
        self.follow(from, hb.ballot, out);
        if hb.chosen > self.log.last_index() {
            out.send(
                from,
                PaxosMessage::Learn(Learn {
                    from_slot: self.log.last_index().next(),
                }),
            );
        }
    }

    fn handle_learn(&mut self, from: NodeId, req: Learn, out: &mut Outbox) {
        let entries = self.log.entries_from(req.from_slot).to_vec();
        if !entries.is_empty() {
            out.send(
                from,
                PaxosMessage::LearnReply(LearnReply {
                    from_slot: req.from_slot,
                    entries,
                }),
            );
        }
    }

    fn handle_learn_reply(&mut self, reply: LearnReply, out: &mut Outbox) {
        let mut slot = reply.from_slot;
        for entry in reply.entries {
            self.adopt_chosen(slot, entry, out);
            slot = slot.next();
        }
    }

    fn broadcast_heartbeat(&self, out: &mut Outbox) {
        let PaxosRole::Leading {
            ballot, inflight, ..
        } = &self.role
        else {
            return;
        };
        let ballot = *ballot;
        let chosen = self.log.last_index();
        for &peer in &self.peers {
            out.send(peer, PaxosMessage::Heartbeat(Heartbeat { ballot, chosen }));
        }
        // Nudge anything still unchosen; re-accepting is a no-op.
        for (&slot, command) in inflight {
            for &peer in &self.peers {
                out.send(
                    peer,
                    PaxosMessage::Accept(Accept {
                        ballot,
                        slot,
                        command: command.clone(),
                    }),
                );
            }
        }
    }
}

// =============================================================================
// ENGINE
// =============================================================================

impl Engine for PaxosCore {
    fn bootstrap(&mut self, out: &mut Outbox) {
        out.reset_election();
    }

    fn handle_message(&mut self, from: NodeId, msg: Message, out: &mut Outbox) {
        let Message::Paxos(msg) = msg else {
            return;
        };
        match msg {
            PaxosMessage::Prepare(req) => self.handle_prepare(from, req, out),
            PaxosMessage::Promise(promise) => self.handle_promise(from, promise, out),
            PaxosMessage::Accept(req) => self.handle_accept(from, req, out),
            PaxosMessage::Accepted(note) => self.handle_accepted(from, note, out),
            PaxosMessage::Heartbeat(hb) => self.handle_heartbeat(from, hb, out),
            PaxosMessage::Learn(req) => self.handle_learn(from, req, out),
            PaxosMessage::LearnReply(reply) => self.handle_learn_reply(reply, out),
        }
    }

    fn handle_timer(&mut self, kind: TimerKind, out: &mut Outbox) {
        match kind {
            TimerKind::Election => {
                if !matches!(self.role, PaxosRole::Leading { .. }) {
                    self.start_prepare(out);
                }
            }
            TimerKind::Heartbeat => self.broadcast_heartbeat(out),
        }
    }

    fn propose(&mut self, command: Command, out: &mut Outbox) -> Result<(), ProposeError> {
        match &mut self.role {
            PaxosRole::Leading { next_slot, .. } => {
                let slot = *next_slot;
                *next_slot = next_slot.next();
                self.propose_at(slot, command, out);
                Ok(())
            }
            PaxosRole::Follower { leader } => Err(ProposeError::NotLeader {
                hint: leader.map(|(node, _)| node),
            }),
            PaxosRole::Preparing { .. } => Err(ProposeError::NotLeader { hint: None }),
        }
    }

    fn status(&self) -> EngineStatus {
        let (role, ballot, leader) = match &self.role {
            PaxosRole::Follower { leader } => (
                Role::Follower,
                leader.map(|(_, ballot)| ballot),
                leader.map(|(node, _)| node),
            ),
            PaxosRole::Preparing { ballot, .. } => (Role::Candidate, Some(*ballot), None),
            PaxosRole::Leading { ballot, .. } => (Role::Leader, Some(*ballot), Some(self.id)),
        };
        EngineStatus {
            role,
            term: Term::new(self.round),
            ballot,
            leader,
            commit_index: self.log.last_index(),
            last_log_index: self.log.last_index(),
        }
    }

    fn log(&self) -> &Log {
        &self.log
    }

    fn durable(&self) -> Durable {
        Durable::Paxos {
            promised: self.acceptor.promised,
            accepted: self.acceptor.accepted.clone(),
            round: self.round,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
