//! Majority counting with per-sender de-duplication.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::types::NodeId;

/// Counts votes per key and detects the moment a majority is reached.
///
/// Voters are remembered per key so a duplicated or re-sent message can
/// never count twice; the transport re-delivers at will.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct QuorumCore<K, V>
where
    K: Ord,
{
    votes: BTreeMap<K, (BTreeSet<NodeId>, V)>,
    quorum: usize,
}

impl<K, V> QuorumCore<K, V>
where
    K: Ord,
{
    /// Tracker for a cluster of `cluster_size` nodes; quorum is a strict
    /// majority, `cluster_size / 2 + 1`.
    #[must_use]
    pub fn new(cluster_size: usize) -> Self {
        Self {
            votes: BTreeMap::new(),
            quorum: cluster_size / 2 + 1,
        }
    }

    #[must_use]
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Record `voter`'s vote for `key`. The first value tracked for a key is
    /// kept. Returns the value exactly when the majority is crossed, not
    /// before, and not again on later or duplicated votes.
    pub fn track(&mut self, key: K, voter: NodeId, value: V) -> Option<&V> {
        let (voters, kept) = self
            .votes
            .entry(key)
            .or_insert_with(|| (BTreeSet::new(), value));
        if voters.insert(voter) && voters.len() == self.quorum {
            Some(kept)
        } else {
            None
        }
    }

    /// Whether `key` has reached quorum already.
    #[must_use]
    pub fn reached(&self, key: &K) -> Option<&V> {
        self.votes
            .get(key)
            .filter(|(voters, _)| voters.len() >= self.quorum)
            .map(|(_, value)| value)
    }
}
