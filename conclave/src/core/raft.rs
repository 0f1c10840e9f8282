//! Raft leader election and log replication.
//!
//! One struct holds the whole per-node state; every transition is a plain
//! method taking an [`Outbox`]. Section references are to the Raft paper
//! (Ongaro & Ousterhout, 2014).

use std::collections::{BTreeMap, BTreeSet};

use crate::core::engine::{Durable, Engine, EngineStatus, Outbox, Role, TimerKind};
use crate::core::types::{NodeId, Slot, Term};
use crate::error::ProposeError;
use crate::log::{Log, LogEntry};
use crate::messages::{
    AppendEntries, AppendEntriesResponse, Message, RaftMessage, RequestVote, RequestVoteResponse,
};
use crate::state_machine::Command;

// =============================================================================
// ROLE
// =============================================================================

/// Volatile per-role state. Dropping the variant on a role change is what
/// resets it.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum RaftRole {
    Follower {
        /// Last known leader for this term, used as a redirect hint.
        leader: Option<NodeId>,
    },
    Candidate {
        /// Who granted us a vote this term, self included.
        votes: BTreeSet<NodeId>,
    },
    Leader {
        /// Next slot to send each peer (§5.3).
        next_index: BTreeMap<NodeId, Slot>,
        /// Highest slot known replicated on each peer (§5.3).
        match_index: BTreeMap<NodeId, Slot>,
    },
}

// =============================================================================
// CORE
// =============================================================================

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RaftCore {
    id: NodeId,
    /// Every other member. The full cluster is `peers ∪ {id}`.
    peers: BTreeSet<NodeId>,
    cluster_size: usize,
    term: Term,
    voted_for: Option<NodeId>,
    log: Log,
    commit_index: Slot,
    role: RaftRole,
}

impl RaftCore {
    #[must_use]
    pub fn new(id: NodeId, members: impl IntoIterator<Item = NodeId>) -> Self {
        Self::restore(id, members, Term::ZERO, None, Log::default())
    }

    /// Rebuild a node from its durable state after a restart.
    #[must_use]
    pub fn restore(
        id: NodeId,
        members: impl IntoIterator<Item = NodeId>,
        term: Term,
        voted_for: Option<NodeId>,
        log: Log,
    ) -> Self {
        let peers: BTreeSet<NodeId> = members.into_iter().filter(|&m| m != id).collect();
        Self {
            id,
            cluster_size: peers.len() + 1,
            peers,
            term,
            voted_for,
            log,
            commit_index: Slot::ZERO,
            role: RaftRole::Follower { leader: None },
        }
    }

    fn quorum(&self) -> usize {
        self.cluster_size / 2 + 1
    }

    #[must_use]
    pub fn commit_index(&self) -> Slot {
        self.commit_index
    }

    /// Adopt a higher term and fall back to follower (§5.1). Everything
    /// else about the message is handled by the caller afterwards.
    fn observe_term(&mut self, term: Term) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.role = RaftRole::Follower { leader: None };
        }
    }

    // =========================================================================
    // ELECTION
    // =========================================================================

    fn handle_request_vote(&mut self, from: NodeId, req: RequestVote, out: &mut Outbox) {
        self.observe_term(req.term);

        // Grant iff terms match, we have at most this vote this term, and
        // the candidate's log is at least as up to date as ours (§5.4.1).
        let granted = req.term == self.term
            && self.voted_for.is_none_or(|v| v == req.candidate)
            && self
                .log
                .candidate_up_to_date(req.last_log_index, req.last_log_term);
        if granted {
            self.voted_for = Some(req.candidate);
            out.reset_election();
        }
        out.send(
            from,
            RaftMessage::RequestVoteResponse(RequestVoteResponse {
                term: self.term,
                granted,
            }),
        );
    }

    fn handle_vote_response(&mut self, from: NodeId, resp: RequestVoteResponse, out: &mut Outbox) {
        self.observe_term(resp.term);
        let RaftRole::Candidate { votes } = &mut self.role else {
            return;
        };
        // A vote from an old election means nothing now.
        if resp.term != self.term || !resp.granted {
            return;
        }
        if votes.insert(from) && votes.len() >= self.quorum() {
            self.become_leader(out);
        }
    }

    fn start_election(&mut self, out: &mut Outbox) {
        self.term = self.term.next();
        self.voted_for = Some(self.id);
        self.role = RaftRole::Candidate {
            votes: BTreeSet::from([self.id]),
        };
        if self.quorum() == 1 {
            self.become_leader(out);
            return;
        }
        let req = RequestVote {
            term: self.term,
            candidate: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for &peer in &self.peers {
            out.send(peer, RaftMessage::RequestVote(req));
        }
    }

    fn become_leader(&mut self, out: &mut Outbox) {
        let next = self.log.last_index().next();
        self.role = RaftRole::Leader {
            next_index: self.peers.iter().map(|&p| (p, next)).collect(),
            match_index: self.peers.iter().map(|&p| (p, Slot::ZERO)).collect(),
        };
        // Announce immediately; the heartbeat timer takes over from here.
        for peer in self.peers.clone() {
            self.send_append(peer, out);
        }
    }

    // =========================================================================
    // REPLICATION
    // =========================================================================

    fn handle_append_entries(&mut self, from: NodeId, req: AppendEntries, out: &mut Outbox) {
        self.observe_term(req.term);

        if req.term < self.term {
            out.send(
                from,
                RaftMessage::AppendEntriesResponse(AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    match_index: self.log.last_index(),
                }),
            );
            return;
        }
        if matches!(self.role, RaftRole::Leader { .. }) {
            // Same term, two leaders: impossible (§5.2). Stale duplicate of
            // our own old broadcast at best.
            return;
        }
        // Valid leader contact defers the next election regardless of
        // whether the consistency check below passes.
        self.role = RaftRole::Follower {
            leader: Some(req.leader),
        };
        out.reset_election();

        if !self.log.matches(req.prev_index, req.prev_term) {
            // Consistency check failed (§5.3). Our last index is the hint
            // for how far back the leader should jump.
            out.send(
                from,
                RaftMessage::AppendEntriesResponse(AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    match_index: self.log.last_index(),
                }),
            );
            return;
        }

        let last = self.log.reconcile(req.prev_index, req.entries);
        if req.commit > self.commit_index {
            self.advance_commit_to(req.commit.min(last), out);
        }
        out.send(
            from,
            RaftMessage::AppendEntriesResponse(AppendEntriesResponse {
                term: self.term,
                success: true,
                match_index: last,
            }),
        );
    }

    fn handle_append_response(
        &mut self,
        from: NodeId,
        resp: AppendEntriesResponse,
        out: &mut Outbox,
    ) {
        self.observe_term(resp.term);
        let RaftRole::Leader {
            next_index,
            match_index,
        } = &mut self.role
        else {
            return;
        };
        if resp.term != self.term {
            return;
        }
        if resp.success {
            // Responses can arrive out of order; only move forward.
            let matched = match_index.entry(from).or_insert(Slot::ZERO);
            *matched = (*matched).max(resp.match_index);
            let next = next_index.entry(from).or_insert(Slot::new(1));
            *next = (*next).max(resp.match_index.next());
            self.try_advance_commit(out);
        } else {
            // Back up past the conflict, no further than the follower says
            // is useful, and resend right away.
            let next = next_index.entry(from).or_insert(Slot::new(1));
            *next = Slot::new(1).max((*next).prev().min(resp.match_index.next()));
            self.send_append(from, out);
        }
    }

    /// Commit the highest slot replicated on a quorum, but only if that
    /// slot belongs to the current term (§5.4.2). Older-term entries commit
    /// as a side effect.
    fn try_advance_commit(&mut self, out: &mut Outbox) {
        let RaftRole::Leader { match_index, .. } = &self.role else {
            return;
        };
        let mut target = None;
        let mut n = self.log.last_index();
        while n > self.commit_index {
            let replicated = 1 + match_index.values().filter(|&&m| m >= n).count();
            if replicated >= self.quorum() && self.log.term_at(n) == Some(self.term) {
                target = Some(n);
                break;
            }
            n = n.prev();
        }
        if let Some(target) = target {
            self.advance_commit_to(target, out);
        }
    }

    fn advance_commit_to(&mut self, target: Slot, out: &mut Outbox) {
        while self.commit_index < target {
            let next = self.commit_index.next();
            let Some(entry) = self.log.get(next) else {
                break;
            };
            self.commit_index = next;
            out.commit(next, entry.clone());
        }
    }

    fn send_append(&mut self, peer: NodeId, out: &mut Outbox) {
        let RaftRole::Leader { next_index, .. } = &self.role else {
            return;
        };
        let next = next_index.get(&peer).copied().unwrap_or(Slot::new(1));
        let prev = next.prev();
        out.send(
            peer,
            RaftMessage::AppendEntries(AppendEntries {
                term: self.term,
                leader: self.id,
                prev_index: prev,
                prev_term: self.log.term_at(prev).unwrap_or(Term::ZERO),
                entries: self.log.entries_from(next).to_vec(),
                commit: self.commit_index,
            }),
        );
    }
}

// =============================================================================
// ENGINE
// =============================================================================

impl Engine for RaftCore {
    fn bootstrap(&mut self, out: &mut Outbox) {
        out.reset_election();
    }

    fn handle_message(&mut self, from: NodeId, msg: Message, out: &mut Outbox) {
        let Message::Raft(msg) = msg else {
            return;
        };
        match msg {
            RaftMessage::RequestVote(req) => self.handle_request_vote(from, req, out),
            RaftMessage::RequestVoteResponse(resp) => self.handle_vote_response(from, resp, out),
            RaftMessage::AppendEntries(req) => self.handle_append_entries(from, req, out),
            RaftMessage::AppendEntriesResponse(resp) => {
                self.handle_append_response(from, resp, out);
            }
        }
    }

    fn handle_timer(&mut self, kind: TimerKind, out: &mut Outbox) {
        match kind {
            TimerKind::Election => {
                if !matches!(self.role, RaftRole::Leader { .. }) {
                    self.start_election(out);
                }
            }
            TimerKind::Heartbeat => {
                if matches!(self.role, RaftRole::Leader { .. }) {
                    for peer in self.peers.clone() {
                        self.send_append(peer, out);
                    }
                }
            }
        }
    }

    fn propose(&mut self, command: Command, out: &mut Outbox) -> Result<(), ProposeError> {
        match &self.role {
            RaftRole::Leader { .. } => {
                self.log.append(LogEntry::new(self.term, command));
                for peer in self.peers.clone() {
                    self.send_append(peer, out);
                }
                // A singleton cluster commits without waiting for anyone.
                self.try_advance_commit(out);
                Ok(())
            }
            RaftRole::Follower { leader } => Err(ProposeError::NotLeader { hint: *leader }),
            RaftRole::Candidate { .. } => Err(ProposeError::NotLeader { hint: None }),
        }
    }

    fn status(&self) -> EngineStatus {
        let (role, leader) = match &self.role {
            RaftRole::Follower { leader } => (Role::Follower, *leader),
            RaftRole::Candidate { .. } => (Role::Candidate, None),
            RaftRole::Leader { .. } => (Role::Leader, Some(self.id)),
        };
        EngineStatus {
            role,
            term: self.term,
            ballot: None,
            leader,
            commit_index: self.commit_index,
            last_log_index: self.log.last_index(),
        }
    }

    fn log(&self) -> &Log {
        &self.log
    }

    fn durable(&self) -> Durable {
        Durable::Raft {
            term: self.term,
            voted_for: self.voted_for,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn trio() -> (RaftCore, RaftCore, RaftCore) {
        let members = [NodeId::new(0), NodeId::new(1), NodeId::new(2)];
        (
            RaftCore::new(NodeId::new(0), members),
            RaftCore::new(NodeId::new(1), members),
            RaftCore::new(NodeId::new(2), members),
        )
    }

    /// Route every queued message to its destination until quiescent.
    /// Messages to nodes absent from `nodes` are dropped, like a partition.
    fn settle(nodes: &mut [&mut RaftCore], mut pending: Vec<(NodeId, NodeId, Message)>) {
        while let Some((from, to, msg)) = pending.pop() {
            let Some(node) = nodes.iter_mut().find(|n| n.id == to) else {
                continue;
            };
            let mut out = Outbox::new();
            node.handle_message(from, msg, &mut out);
            pending.extend(out.messages.into_iter().map(|(dest, m)| (to, dest, m)));
        }
    }

    fn drain(from: NodeId, out: Outbox) -> Vec<(NodeId, NodeId, Message)> {
        out.messages
            .into_iter()
            .map(|(to, msg)| (from, to, msg))
            .collect()
    }

    fn elect(leader: &mut RaftCore, followers: &mut [&mut RaftCore]) {
        let mut out = Outbox::new();
        leader.handle_timer(TimerKind::Election, &mut out);
        let pending = drain(leader.id, out);
        let mut all: Vec<&mut RaftCore> = followers.iter_mut().map(|f| &mut **f).collect();
        all.push(leader);
        settle(&mut all, pending);
    }

    #[test]
    fn timeout_starts_election() {
        let (mut a, _, _) = trio();
        let mut out = Outbox::new();
        a.handle_timer(TimerKind::Election, &mut out);

        assert_eq!(a.term, Term::ZERO.next());
        assert_eq!(a.voted_for, Some(a.id));
        assert!(matches!(a.role, RaftRole::Candidate { .. }));
        assert_eq!(out.messages.len(), 2);
    }

    #[test]
    fn quorum_of_votes_wins() {
        let (mut a, mut b, mut c) = trio();
        elect(&mut a, &mut [&mut b, &mut c]);

        assert!(matches!(a.role, RaftRole::Leader { .. }));
        assert_eq!(b.status().leader, Some(a.id));
        assert_eq!(c.status().leader, Some(a.id));
    }

    #[test]
    fn one_vote_per_term() {
        let (_, mut b, _) = trio();
        let req = |candidate: NodeId| RequestVote {
            term: Term::new(1),
            candidate,
            last_log_index: Slot::ZERO,
            last_log_term: Term::ZERO,
        };

        let mut out = Outbox::new();
        b.handle_request_vote(NodeId::new(0), req(NodeId::new(0)), &mut out);
        let first = out.messages.remove(0).1;
        assert!(matches!(
            first,
            Message::Raft(RaftMessage::RequestVoteResponse(RequestVoteResponse {
                granted: true,
                ..
            }))
        ));

        // Same term, different candidate: refused.
        let mut out = Outbox::new();
        b.handle_request_vote(NodeId::new(2), req(NodeId::new(2)), &mut out);
        let second = out.messages.remove(0).1;
        assert!(matches!(
            second,
            Message::Raft(RaftMessage::RequestVoteResponse(RequestVoteResponse {
                granted: false,
                ..
            }))
        ));

        // Duplicate of the first request: granted again, no state change.
        let mut out = Outbox::new();
        b.handle_request_vote(NodeId::new(0), req(NodeId::new(0)), &mut out);
        let again = out.messages.remove(0).1;
        assert!(matches!(
            again,
            Message::Raft(RaftMessage::RequestVoteResponse(RequestVoteResponse {
                granted: true,
                ..
            }))
        ));
        assert_eq!(b.voted_for, Some(NodeId::new(0)));
    }

    #[test]
    fn stale_candidate_rejected() {
        let (mut a, mut b, mut c) = trio();
        elect(&mut a, &mut [&mut b, &mut c]);
        let mut out = Outbox::new();
        a.propose(Command::put("k", "v"), &mut out)
            .expect("leader accepts");
        let pending = drain(a.id, out);
        settle(&mut [&mut a, &mut b, &mut c], pending);

        // c restarts with an empty log, times out, and solicits votes at a
        // higher term. Nobody grants: its log is behind (§5.4.1).
        let mut c = RaftCore::restore(c.id, [a.id, b.id, c.id], c.term, None, Log::default());
        let mut out = Outbox::new();
        c.handle_timer(TimerKind::Election, &mut out);
        let pending = drain(c.id, out);
        settle(&mut [&mut a, &mut b, &mut c], pending);

        assert!(matches!(c.role, RaftRole::Candidate { .. }));
        assert_eq!(b.voted_for, None);
    }

    #[test]
    fn higher_term_dethrones_leader() {
        let (mut a, mut b, mut c) = trio();
        elect(&mut a, &mut [&mut b, &mut c]);
        assert!(matches!(a.role, RaftRole::Leader { .. }));

        let mut out = Outbox::new();
        a.handle_message(
            b.id,
            RaftMessage::RequestVote(RequestVote {
                term: a.term.next(),
                candidate: b.id,
                last_log_index: Slot::ZERO,
                last_log_term: Term::ZERO,
            })
            .into(),
            &mut out,
        );
        assert!(matches!(a.role, RaftRole::Follower { .. }));
    }

    #[test]
    fn replication_commits_on_quorum() {
        let (mut a, mut b, mut c) = trio();
        elect(&mut a, &mut [&mut b, &mut c]);

        let mut out = Outbox::new();
        a.propose(Command::put("x", "1"), &mut out)
            .expect("leader accepts");
        let pending = drain(a.id, out);
        settle(&mut [&mut a, &mut b, &mut c], pending);

        assert_eq!(a.commit_index, Slot::new(1));
        // Followers commit on the next heartbeat carrying the new index.
        let mut out = Outbox::new();
        a.handle_timer(TimerKind::Heartbeat, &mut out);
        let pending = drain(a.id, out);
        settle(&mut [&mut a, &mut b, &mut c], pending);
        assert_eq!(b.commit_index, Slot::new(1));
        assert_eq!(c.commit_index, Slot::new(1));
    }

    #[test]
    fn follower_rejects_then_leader_backs_up() {
        let (mut a, mut b, mut c) = trio();
        elect(&mut a, &mut [&mut b, &mut c]);
        // Replicate two entries to b only; c misses them.
        for i in 0..2 {
            let mut out = Outbox::new();
            a.propose(Command::put("k", i.to_string()), &mut out)
                .expect("leader accepts");
            let pending = drain(a.id, out);
            settle(&mut [&mut a, &mut b], pending);
        }
        assert_eq!(c.log.last_index(), Slot::ZERO);

        // One heartbeat exchange is enough: c's rejection carries its last
        // index, the leader jumps straight there and resends everything.
        let mut out = Outbox::new();
        a.handle_timer(TimerKind::Heartbeat, &mut out);
        let pending = drain(a.id, out);
        settle(&mut [&mut a, &mut b, &mut c], pending);
        assert_eq!(c.log.last_index(), Slot::new(2));
        assert_eq!(c.commit_index, Slot::new(2));
    }

    #[test]
    fn conflicting_suffix_overwritten() {
        let (mut a, mut b, mut c) = trio();
        elect(&mut a, &mut [&mut b, &mut c]);

        // b accumulates an uncommitted entry from a deposed term.
        b.log.append(LogEntry::new(Term::new(99), Command::Noop));
        b.term = Term::new(99);

        // A fresh election at a higher term restores a as leader; its
        // append overwrites b's divergent entry.
        let mut out = Outbox::new();
        a.handle_message(
            b.id,
            RaftMessage::AppendEntriesResponse(AppendEntriesResponse {
                term: Term::new(99),
                success: false,
                match_index: Slot::ZERO,
            })
            .into(),
            &mut out,
        );
        assert!(matches!(a.role, RaftRole::Follower { .. }));
        elect(&mut a, &mut [&mut b, &mut c]);
        let mut out = Outbox::new();
        a.propose(Command::put("fresh", "entry"), &mut out)
            .expect("leader accepts");
        let pending = drain(a.id, out);
        settle(&mut [&mut a, &mut b, &mut c], pending);

        assert_eq!(b.log.entries(), a.log.entries());
        assert_eq!(b.log.term_at(Slot::new(1)), Some(a.term));
    }

    #[test]
    fn stale_term_entries_not_committed_directly() {
        let (mut a, mut b, mut c) = trio();
        elect(&mut a, &mut [&mut b, &mut c]);
        let mut out = Outbox::new();
        a.propose(Command::put("old", "term"), &mut out)
            .expect("leader accepts");
        // The entry reaches nobody; a is deposed and re-elected at a
        // higher term with its entry intact.
        drop(out);
        let reelect_term = a.term.next();
        a.observe_term(reelect_term);
        elect(&mut a, &mut [&mut b, &mut c]);
        assert!(matches!(a.role, RaftRole::Leader { .. }));
        assert_eq!(a.commit_index, Slot::ZERO);

        // Replicating the old entry alone gains a quorum but must not
        // commit it: its term is not the current one (§5.4.2).
        let mut out = Outbox::new();
        a.handle_timer(TimerKind::Heartbeat, &mut out);
        let pending = drain(a.id, out);
        settle(&mut [&mut a, &mut b, &mut c], pending);
        assert_eq!(a.commit_index, Slot::ZERO);

        // A current-term entry on top commits both.
        let mut out = Outbox::new();
        a.propose(Command::put("new", "term"), &mut out)
            .expect("leader accepts");
        let pending = drain(a.id, out);
        settle(&mut [&mut a, &mut b, &mut c], pending);
        assert_eq!(a.commit_index, Slot::new(2));
    }

    #[test]
    fn duplicate_append_is_idempotent() {
        let (mut a, mut b, mut c) = trio();
        elect(&mut a, &mut [&mut b, &mut c]);
        let mut out = Outbox::new();
        a.propose(Command::put("x", "1"), &mut out)
            .expect("leader accepts");
        let pending = drain(a.id, out);
        let duplicated: Vec<_> = pending.iter().chain(pending.iter()).cloned().collect();
        settle(&mut [&mut a, &mut b, &mut c], duplicated);

        assert_eq!(b.log.last_index(), Slot::new(1));
        assert_eq!(a.commit_index, Slot::new(1));
    }

    #[test]
    fn leader_log_grows_by_append_only() {
        let (mut a, mut b, mut c) = trio();
        elect(&mut b, &mut [&mut a, &mut c]);
        let stale = AppendEntries {
            term: b.term,
            leader: b.id,
            prev_index: Slot::ZERO,
            prev_term: Term::ZERO,
            entries: vec![LogEntry::new(b.term, Command::put("stale", "leader"))],
            commit: Slot::ZERO,
        };

        elect(&mut a, &mut [&mut b, &mut c]);
        let mut out = Outbox::new();
        a.propose(Command::put("x", "1"), &mut out)
            .expect("leader accepts");
        let pending = drain(a.id, out);
        settle(&mut [&mut a, &mut b, &mut c], pending);
        let before = a.log.entries().to_vec();

        // The deposed leader's replication arrives late and is rejected
        // without rewriting anything.
        let mut out = Outbox::new();
        a.handle_message(b.id, RaftMessage::AppendEntries(stale).into(), &mut out);
        assert!(matches!(a.role, RaftRole::Leader { .. }));
        assert_eq!(a.log.entries(), &before[..]);

        let mut out = Outbox::new();
        a.propose(Command::put("y", "2"), &mut out)
            .expect("leader accepts");
        assert_eq!(&a.log.entries()[..before.len()], &before[..]);
        assert_eq!(a.log.last_index(), Slot::new(2));
    }

    #[test]
    fn proposals_refused_off_leader() {
        let (mut a, mut b, mut c) = trio();
        elect(&mut a, &mut [&mut b, &mut c]);

        let mut out = Outbox::new();
        let err = b
            .propose(Command::put("x", "1"), &mut out)
            .expect_err("follower refuses");
        assert_eq!(err, ProposeError::NotLeader { hint: Some(a.id) });

        let mut out = Outbox::new();
        c.handle_timer(TimerKind::Election, &mut out);
        let err = c
            .propose(Command::put("x", "1"), &mut out)
            .expect_err("candidate refuses");
        assert_eq!(err, ProposeError::NotLeader { hint: None });
    }

    #[test]
    fn singleton_cluster_self_commits() {
        let mut solo = RaftCore::new(NodeId::new(0), [NodeId::new(0)]);
        let mut out = Outbox::new();
        solo.handle_timer(TimerKind::Election, &mut out);
        assert!(matches!(solo.role, RaftRole::Leader { .. }));

        let mut out = Outbox::new();
        solo.propose(Command::put("only", "one"), &mut out)
            .expect("leader accepts");
        assert_eq!(solo.commit_index, Slot::new(1));
        assert_eq!(out.committed.len(), 1);
    }
}
