//! Phase A: announcing a snapshot, and witnessing another node's
//! announcement.

use crate::application::aggregator::{CosiAggregator, CosiVerifier};
use crate::application::dispatcher::CosiDispatcher;
use crate::domain::crypto::{Commitment, PrivateKey};
use crate::domain::round::CacheRound;
use crate::domain::snapshot::{RoundLink, Snapshot};
use crate::foundation::constants::{
    ROUND_GAP_LATE_DENOMINATOR, ROUND_GAP_LATE_NUMERATOR, SNAPSHOT_VERSION, TIMESTAMP_ADVANCE_SLICE_MS,
};
use crate::foundation::{KernelError, NodeId, Result};
use log::{debug, warn};
use std::time::Duration;

impl CosiDispatcher {
    /// Announce a locally produced snapshot: align it with the head round,
    /// stamp it, register the proposer's own commitment and broadcast.
    pub(crate) async fn cosi_send_announcement(&mut self, peer_id: NodeId, mut s: Snapshot) -> Result<()> {
        debug!("cosi_send_announcement {} {}", s.node_id, s.transaction);
        if s.node_id != self.shared.id || s.node_id != peer_id {
            return Err(KernelError::invariant(format!("self announcement for foreign chain {}", s.node_id)));
        }
        if s.version != SNAPSHOT_VERSION || s.signature.is_some() || s.timestamp != 0 {
            return Ok(());
        }
        if !self.shared.check_catch_up_with_peers() && !self.shared.check_initial_accept_snapshot_weak(&s)? {
            debug!("cosi_send_announcement not caught up with peers");
            return Ok(());
        }

        let Some((Some(transaction), false)) = self.shared.cache_snapshot_transaction(&s) else {
            return Ok(());
        };

        if self.check_initial_accept_snapshot(&s, &transaction)? {
            s.timestamp = self.shared.now_nanos();
            s.hash = s.payload_hash();
            let random = PrivateKey::generate(&mut rand::rngs::OsRng);
            let commitment = Commitment::from(random.public());
            let mut aggregator = CosiAggregator::new(s.clone(), transaction);
            aggregator.commitments.insert(self.shared.sorted_consensus_nodes()?.len(), commitment);
            aggregator.responded.insert(self.shared.id);
            self.verifiers.insert(s.hash, CosiVerifier::new(s.clone(), random));
            self.shared.aggregators.insert(s.hash, aggregator).await;
            for id in self.shared.sorted_consensus_nodes()? {
                self.shared.peer.send_snapshot_announcement(id, &s, commitment).await?;
            }
            return Ok(());
        }

        let Some(consensus_index) = self.shared.consensus_index()? else {
            return Ok(());
        };
        let Some(mut final_round) = self.graph.final_round(&s.node_id).copied() else {
            return Ok(());
        };
        let mut cache = self
            .graph
            .cache_round(&s.node_id)
            .cloned()
            .ok_or_else(|| KernelError::invariant(format!("head round missing for {}", s.node_id)))?;

        if cache.snapshots.is_empty() && !self.shared.check_broadcasted_to_peers() {
            return self.clear_and_queue_snapshot(&s).await;
        }
        loop {
            s.timestamp = self.shared.now_nanos();
            if s.timestamp > cache.timestamp {
                break;
            }
            tokio::time::sleep(Duration::from_millis(TIMESTAMP_ADVANCE_SLICE_MS)).await;
        }

        let consensus = self.shared.config.consensus.clone();
        if cache.snapshots.is_empty() {
            // An empty head round may re-reference a fresher external round
            // before this snapshot lands in it.
            if let Some(references) = cache.references {
                let external = self
                    .shared
                    .persist
                    .read_round(&references.external)?
                    .ok_or(KernelError::ExternalRoundMissing(references.external))?;
                let eligible = self.shared.accepted_node_ids()?;
                let best = self.graph.determine_best_round(s.node_id, s.timestamp, &eligible);
                let threshold =
                    external.timestamp + consensus.snapshot_reference_threshold * consensus.snapshot_round_gap * 36;
                if let Some(best) = best {
                    if best.node_id != final_round.node_id && threshold < best.start {
                        debug!(
                            "new best external {}:{}:{} => {}:{}:{}",
                            external.node_id, external.number, external.timestamp, best.node_id, best.number, best.start
                        );
                        let link = self.shared.persist.read_link(cache.node_id, best.node_id)?;
                        if best.number <= link {
                            return self.clear_and_queue_snapshot(&s).await;
                        }
                        let new_refs = RoundLink::new(final_round.hash, best.hash);
                        cache.references = Some(new_refs);
                        self.shared.persist.update_empty_head_round(cache.node_id, cache.number, &new_refs)?;
                        self.graph.assign_new_graph_round(final_round, cache)?;
                        return self.clear_and_queue_snapshot(&s).await;
                    }
                }
            }
        } else if s.timestamp >= cache.gap().0 + consensus.snapshot_round_gap {
            let eligible = self.shared.accepted_node_ids()?;
            let Some(best) = self.graph.determine_best_round(s.node_id, s.timestamp, &eligible) else {
                debug!("cosi_send_announcement no best round available");
                return self.clear_and_queue_snapshot(&s).await;
            };
            if best.node_id == final_round.node_id {
                return Err(KernelError::invariant("best round resolved to own chain".to_string()));
            }

            final_round = cache
                .as_final()
                .ok_or_else(|| KernelError::invariant("sealing an empty round".to_string()))?;
            let new_refs = RoundLink::new(final_round.hash, best.hash);
            cache = CacheRound::new(s.node_id, final_round.number + 1, 0, Some(new_refs));
            self.shared.persist.start_new_round(cache.node_id, cache.number, &new_refs, final_round.start)?;
        }
        cache.timestamp = s.timestamp;

        if let Some(first) = cache.snapshots.first() {
            let late = first.timestamp + consensus.snapshot_round_gap * ROUND_GAP_LATE_NUMERATOR / ROUND_GAP_LATE_DENOMINATOR;
            if s.timestamp > late {
                return self.clear_and_queue_snapshot(&s).await;
            }
        }

        s.round_number = cache.number;
        s.references = cache.references;
        s.hash = s.payload_hash();
        let random = PrivateKey::generate(&mut rand::rngs::OsRng);
        let commitment = Commitment::from(random.public());
        self.verifiers.insert(s.hash, CosiVerifier::new(s.clone(), random));
        let mut aggregator = CosiAggregator::new(s.clone(), transaction);
        aggregator.commitments.insert(consensus_index, commitment);
        aggregator.responded.insert(self.shared.id);
        self.graph.assign_new_graph_round(final_round, cache)?;
        self.shared.aggregators.insert(s.hash, aggregator).await;
        for id in self.shared.sorted_consensus_nodes()? {
            self.shared.peer.send_snapshot_announcement(id, &s, commitment).await?;
        }
        Ok(())
    }

    /// Witness another node's announcement: align our view of its chain,
    /// validate the snapshot against the head round, and answer with a
    /// commitment.
    pub(crate) async fn cosi_handle_announcement(&mut self, peer_id: NodeId, s: Snapshot, _commitment: Commitment) -> Result<()> {
        debug!("cosi_handle_announcement {} {}", peer_id, s.hash);
        if self.shared.consensus_index()?.is_none() || !self.shared.check_catch_up_with_peers() {
            debug!("cosi_handle_announcement not caught up with peers");
            return Ok(());
        }
        let Some(consensus_node) = self.shared.get_peer_consensus_node(&peer_id)? else {
            return Ok(());
        };
        let accept_period = self.shared.config.consensus.node_accept_period_minimum;
        if consensus_node.timestamp + accept_period >= s.timestamp && !self.shared.is_genesis(&peer_id)? {
            return Ok(());
        }

        if s.node_id == self.shared.id || s.node_id != peer_id {
            return Err(KernelError::invariant(format!("announcement for chain {} from {}", s.node_id, peer_id)));
        }
        if s.version != SNAPSHOT_VERSION || s.signature.is_some() || s.timestamp == 0 {
            return Ok(());
        }
        let threshold = self.shared.config.consensus.timestamp_threshold();
        if s.timestamp > self.shared.now_nanos() + threshold {
            return Ok(());
        }
        if s.timestamp + threshold * 2 < self.graph.graph_timestamp() {
            return Ok(());
        }

        let Some((transaction, false)) = self.shared.cache_snapshot_transaction(&s) else {
            return Ok(());
        };

        let random = PrivateKey::generate(&mut rand::rngs::OsRng);
        let commitment = Commitment::from(random.public());
        if self.shared.check_initial_accept_snapshot_weak(&s)? {
            self.verifiers.insert(s.hash, CosiVerifier::new(s.clone(), random));
            return self
                .shared
                .peer
                .send_snapshot_commitment(s.node_id, s.hash, commitment, transaction.is_none())
                .await;
        }

        if s.round_number == 0 {
            return Ok(());
        }
        let Some(mut final_round) = self.graph.final_round(&s.node_id).copied() else {
            return Ok(());
        };
        let mut cache = self
            .graph
            .cache_round(&s.node_id)
            .cloned()
            .ok_or_else(|| KernelError::invariant(format!("head round missing for {}", s.node_id)))?;

        if s.round_number < cache.number {
            return Ok(());
        }
        if s.round_number > cache.number + 1 {
            return self.queue_snapshot(peer_id, &s);
        }
        if s.timestamp <= final_round.start + self.shared.config.consensus.snapshot_round_gap {
            return Ok(());
        }
        if s.round_number == cache.number && !s.references_equal(&cache.references) {
            if !cache.snapshots.is_empty() {
                return Ok(());
            }
            let (Some(new_refs), Some(head_refs)) = (s.references, cache.references) else {
                return Ok(());
            };
            if new_refs.self_ref != head_refs.self_ref {
                return Ok(());
            }
            let Some(external) = self.shared.persist.read_round(&new_refs.external)? else {
                return Ok(());
            };
            let link = self.shared.persist.read_link(cache.node_id, external.node_id)?;
            if external.number < link {
                return Ok(());
            }
            cache.references = Some(new_refs);
            self.shared.persist.update_empty_head_round(cache.node_id, cache.number, &new_refs)?;
            self.graph.assign_new_graph_round(final_round, cache)?;
            return self.queue_snapshot(peer_id, &s);
        }
        if s.round_number == cache.number + 1 {
            match self.start_new_round(&s, &cache, false) {
                Err(err) => {
                    warn!("announcement round advance failed {} {} {}: {}", s.node_id, s.round_number, s.transaction, err);
                    return self.queue_snapshot(peer_id, &s);
                }
                Ok(None) => return Ok(()),
                Ok(Some((round, _))) => final_round = round,
            }
            let new_refs = s
                .references
                .ok_or_else(|| KernelError::invalid_snapshot("round advance without references".to_string()))?;
            cache = CacheRound { node_id: s.node_id, number: s.round_number, timestamp: s.timestamp, references: Some(new_refs), snapshots: Vec::new() };
            self.shared.persist.start_new_round(cache.node_id, cache.number, &new_refs, final_round.start)?;
        }
        self.graph.assign_new_graph_round(final_round, cache.clone())?;

        if let Err(err) = cache.validate_snapshot(&s, false) {
            debug!("announcement snapshot rejected for {}: {}", s.hash, err);
            return Ok(());
        }

        self.verifiers.insert(s.hash, CosiVerifier::new(s.clone(), random));
        self.shared
            .peer
            .send_snapshot_commitment(s.node_id, s.hash, commitment, transaction.is_none())
            .await
    }
}
