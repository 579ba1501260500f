//! The in-memory round graph and the rules for advancing it.
//!
//! The graph is owned exclusively by the dispatcher. Every mutation goes
//! through `assign_new_graph_round`, which enforces strictly contiguous
//! history; a violation there means the process must stop.

use crate::application::dispatcher::CosiDispatcher;
use crate::domain::round::{CacheRound, FinalRound};
use crate::domain::snapshot::Snapshot;
use crate::foundation::constants::{ROUND_LIVENESS_FLOOR, SNAPSHOT_VERSION};
use crate::foundation::{KernelError, NodeId, Result};
use crate::infrastructure::storage::PersistStore;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
pub struct RoundGraph {
    cache_rounds: HashMap<NodeId, CacheRound>,
    final_rounds: HashMap<NodeId, FinalRound>,
    round_history: HashMap<NodeId, Vec<FinalRound>>,
    reverse_round_links: HashMap<NodeId, u64>,
    final_cache: Vec<FinalRound>,
    graph_timestamp: u64,
}

impl RoundGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the graph with per-node head rounds, e.g. at startup.
    pub fn bootstrap(entries: impl IntoIterator<Item = (CacheRound, FinalRound)>) -> Self {
        let mut graph = Self::new();
        for (cache, last_final) in entries {
            let node_id = last_final.node_id;
            graph.round_history.insert(node_id, vec![last_final]);
            graph.final_rounds.insert(node_id, last_final);
            graph.cache_rounds.insert(node_id, cache);
        }
        graph
    }

    pub fn cache_round(&self, node_id: &NodeId) -> Option<&CacheRound> {
        self.cache_rounds.get(node_id)
    }

    pub fn final_round(&self, node_id: &NodeId) -> Option<&FinalRound> {
        self.final_rounds.get(node_id)
    }

    pub fn set_cache_round(&mut self, cache: CacheRound) {
        self.cache_rounds.insert(cache.node_id, cache);
    }

    pub fn round_history(&self, node_id: &NodeId) -> &[FinalRound] {
        self.round_history.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn reverse_link(&self, node_id: &NodeId) -> u64 {
        self.reverse_round_links.get(node_id).copied().unwrap_or(0)
    }

    pub fn set_reverse_link(&mut self, node_id: NodeId, number: u64) {
        self.reverse_round_links.insert(node_id, number);
    }

    pub fn graph_timestamp(&self) -> u64 {
        self.graph_timestamp
    }

    pub fn final_cache(&self) -> &[FinalRound] {
        &self.final_cache
    }

    /// Atomically replace a node's head rounds and extend its history.
    /// History must advance by exactly one round (or start at zero).
    pub fn assign_new_graph_round(&mut self, final_round: FinalRound, cache: CacheRound) -> Result<()> {
        if final_round.node_id != cache.node_id {
            return Err(KernelError::invariant(format!(
                "graph round assignment across nodes {} {}",
                final_round.node_id, cache.node_id
            )));
        }
        let node_id = final_round.node_id;
        let history = self.round_history.entry(node_id).or_default();
        match history.last().copied() {
            None if final_round.number == 0 => history.push(final_round),
            None => {
                return Err(KernelError::invariant(format!(
                    "history for {} starts at round {}",
                    node_id, final_round.number
                )))
            }
            Some(last) if last.number > final_round.number => {
                return Err(KernelError::invariant(format!(
                    "history for {} moved backwards {} {}",
                    node_id, last.number, final_round.number
                )))
            }
            Some(last) if last.number + 1 < final_round.number => {
                return Err(KernelError::invariant(format!(
                    "history for {} skipped rounds {} {}",
                    node_id, last.number, final_round.number
                )))
            }
            Some(last) if last.number + 1 == final_round.number => history.push(final_round),
            Some(_) => {}
        }
        self.cache_rounds.insert(node_id, cache);
        self.final_rounds.insert(node_id, final_round);
        Ok(())
    }

    /// Refresh the final-round summaries and the graph timestamp. Invoked
    /// after every consumed action.
    pub fn update_final_cache(&mut self, self_id: NodeId) {
        let mut cache: Vec<FinalRound> = self.final_rounds.values().copied().collect();
        cache.sort_by_key(|round| round.node_id);
        self.final_cache = cache;

        let mut timestamp = self.final_rounds.values().map(|round| round.end).max().unwrap_or(0);
        if let Some(head) = self.cache_rounds.get(&self_id) {
            timestamp = timestamp.max(head.timestamp);
        }
        self.graph_timestamp = timestamp;
    }

    /// The freshest eligible external round `node_id` could reference at
    /// `timestamp`: the latest-starting final round of any other eligible
    /// chain that is not ahead of the snapshot in time.
    pub fn determine_best_round(&self, node_id: NodeId, timestamp: u64, eligible: &HashSet<NodeId>) -> Option<FinalRound> {
        self.final_rounds
            .values()
            .filter(|round| round.node_id != node_id)
            .filter(|round| eligible.contains(&round.node_id))
            .filter(|round| round.start < timestamp)
            .max_by_key(|round| (round.start, round.node_id))
            .copied()
    }
}

/// Rebuild the graph from stored head rounds.
pub fn load_round_graph(persist: &Arc<dyn PersistStore>, node_ids: impl IntoIterator<Item = NodeId>) -> Result<RoundGraph> {
    let mut entries = Vec::new();
    for node_id in node_ids {
        if let Some((cache, last_final)) = persist.read_round_heads(node_id)? {
            entries.push((cache, last_final));
        }
    }
    Ok(RoundGraph::bootstrap(entries))
}

impl CosiDispatcher {
    /// Transition a node's head when `s.round_number == cache.number + 1`.
    ///
    /// `Ok(Some((final, dummy)))` advances the round; `dummy` means the
    /// external reference is still missing but the snapshot is already
    /// finalized and `allow_dummy` was set. `Ok(None)` drops silently.
    /// `Err` reports why the advance is not (yet) legal.
    pub(crate) fn start_new_round(
        &mut self,
        s: &Snapshot,
        cache: &CacheRound,
        allow_dummy: bool,
    ) -> Result<Option<(FinalRound, bool)>> {
        if s.round_number != cache.number + 1 {
            return Err(KernelError::invariant(format!(
                "start round {} against head {}",
                s.round_number, cache.number
            )));
        }
        let final_round = cache
            .as_final()
            .ok_or(KernelError::RoundNotCollected { node: s.node_id, round: s.round_number })?;
        let references = s
            .references
            .ok_or_else(|| KernelError::invalid_snapshot("round advance without references".to_string()))?;
        if references.self_ref != final_round.hash {
            return Err(KernelError::RoundReferenceMismatch { node: s.node_id, reference: references.self_ref });
        }

        let consensus = &self.shared.config.consensus;
        let finalized = self.shared.verify_finalization(s)?;
        let external = self.shared.persist.read_round(&references.external)?;
        let Some(external) = external else {
            if finalized && allow_dummy {
                return Ok(Some((final_round, true)));
            }
            return Err(KernelError::ExternalRoundMissing(references.external));
        };
        if final_round.node_id == external.node_id {
            return Ok(None);
        }
        if !self.shared.is_genesis(&external.node_id)?
            && external.number < ROUND_LIVENESS_FLOOR + consensus.snapshot_reference_threshold
        {
            return Ok(None);
        }
        if !finalized {
            if let Some(head) = self.graph.final_round(&external.node_id) {
                if external.number + consensus.snapshot_sync_round_threshold < head.number {
                    return Err(KernelError::ExternalRoundTooEarly {
                        reference: references.external,
                        number: external.number,
                        head: head.number,
                    });
                }
            }
            if external.timestamp > s.timestamp {
                return Err(KernelError::ExternalReferenceAhead { external: external.timestamp, snapshot: s.timestamp });
            }
            let threshold = external.timestamp
                + consensus.snapshot_reference_threshold * consensus.snapshot_round_gap * 64;
            let eligible = self.shared.accepted_node_ids()?;
            if let Some(best) = self.graph.determine_best_round(s.node_id, s.timestamp, &eligible) {
                if threshold < best.start {
                    return Err(KernelError::ExternalReferenceStale { reference: references.external, best_start: best.start });
                }
            }
        }
        let link = self.shared.persist.read_link(s.node_id, external.node_id)?;
        if external.number < link {
            return Ok(None);
        }
        if external.node_id == self.shared.id {
            let reverse = self.graph.reverse_link(&s.node_id);
            if external.number < reverse {
                return Err(KernelError::ReverseLinkViolation { node: s.node_id, number: external.number, link: reverse });
            }
            self.graph.set_reverse_link(s.node_id, external.number);
        }
        Ok(Some((final_round, false)))
    }

    /// A pledging node's very first snapshot, before it appears in the
    /// consensus set. The weak form skips the transaction check.
    pub(crate) fn check_initial_accept_snapshot(&self, s: &Snapshot, transaction: &crate::domain::Transaction) -> Result<bool> {
        if self.graph.final_round(&s.node_id).is_some() {
            return Ok(false);
        }
        Ok(self.shared.check_initial_accept_snapshot_weak(s)? && transaction.is_node_accept())
    }

    /// Park a snapshot for retry once its prerequisites appear.
    pub(crate) fn queue_snapshot(&self, peer_id: NodeId, s: &Snapshot) -> Result<()> {
        debug!("queueing snapshot {} of {} round {} for retry", s.hash, s.node_id, s.round_number);
        self.shared.persist.queue_append_snapshot(peer_id, s, false)
    }

    /// Abandon in-flight signing state for the snapshot and requeue a bare
    /// self snapshot carrying only its transaction.
    pub(crate) async fn clear_and_queue_snapshot(&mut self, s: &Snapshot) -> Result<()> {
        self.verifiers.remove(&s.hash);
        self.shared.aggregators.remove(&s.hash).await;
        let bare = Snapshot::new(SNAPSHOT_VERSION, s.node_id, s.transaction);
        self.queue_snapshot(self.shared.id, &bare)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::RoundHash;

    fn final_round(node: NodeId, number: u64, start: u64) -> FinalRound {
        FinalRound { node_id: node, number, hash: RoundHash::new([number as u8; 32]), start, end: start + 100 }
    }

    fn cache_round(node: NodeId, number: u64) -> CacheRound {
        CacheRound::new(node, number, 0, None)
    }

    #[test]
    fn history_advances_by_exactly_one() {
        let node = NodeId::new([1; 32]);
        let mut graph = RoundGraph::bootstrap([(cache_round(node, 5), final_round(node, 5, 1_000))]);

        graph
            .assign_new_graph_round(final_round(node, 6, 2_000), cache_round(node, 6))
            .expect("contiguous advance");
        assert_eq!(graph.round_history(&node).len(), 2);

        // Re-assigning the same round only replaces the heads.
        graph
            .assign_new_graph_round(final_round(node, 6, 2_000), cache_round(node, 6))
            .expect("idempotent assign");
        assert_eq!(graph.round_history(&node).len(), 2);

        let skipped = graph.assign_new_graph_round(final_round(node, 8, 3_000), cache_round(node, 8));
        assert!(skipped.expect_err("skipped round").is_fatal());

        let backwards = graph.assign_new_graph_round(final_round(node, 5, 1_000), cache_round(node, 5));
        assert!(backwards.expect_err("backwards round").is_fatal());
    }

    #[test]
    fn first_history_entry_must_be_round_zero() {
        let node = NodeId::new([2; 32]);
        let mut graph = RoundGraph::new();
        assert!(graph.assign_new_graph_round(final_round(node, 3, 0), cache_round(node, 3)).is_err());
        graph.assign_new_graph_round(final_round(node, 0, 0), cache_round(node, 0)).expect("genesis round");
    }

    #[test]
    fn cross_node_assignment_is_fatal() {
        let mut graph = RoundGraph::new();
        let err = graph
            .assign_new_graph_round(final_round(NodeId::new([1; 32]), 0, 0), cache_round(NodeId::new([2; 32]), 0))
            .expect_err("node mismatch");
        assert!(err.is_fatal());
    }

    #[test]
    fn best_round_prefers_latest_start_among_eligible_peers() {
        let (a, b, c) = (NodeId::new([1; 32]), NodeId::new([2; 32]), NodeId::new([3; 32]));
        let graph = RoundGraph::bootstrap([
            (cache_round(a, 4), final_round(a, 4, 5_000)),
            (cache_round(b, 9), final_round(b, 9, 7_000)),
            (cache_round(c, 2), final_round(c, 2, 9_000)),
        ]);
        let eligible: HashSet<NodeId> = [a, b, c].into_iter().collect();

        let best = graph.determine_best_round(a, 10_000, &eligible).expect("best round");
        assert_eq!(best.node_id, c);

        // Rounds starting at or after the snapshot timestamp are not
        // referenceable.
        let best = graph.determine_best_round(a, 8_000, &eligible).expect("best round");
        assert_eq!(best.node_id, b);

        // Never reference our own chain.
        let only_self: HashSet<NodeId> = [a].into_iter().collect();
        assert!(graph.determine_best_round(a, 10_000, &only_self).is_none());
    }

    #[test]
    fn update_final_cache_tracks_graph_timestamp() {
        let (a, b) = (NodeId::new([1; 32]), NodeId::new([2; 32]));
        let mut graph = RoundGraph::bootstrap([
            (cache_round(a, 4), final_round(a, 4, 5_000)),
            (cache_round(b, 9), final_round(b, 9, 7_000)),
        ]);
        graph.update_final_cache(a);
        assert_eq!(graph.final_cache().len(), 2);
        assert_eq!(graph.graph_timestamp(), 7_100);
    }
}
