//! Phase D: aggregating peer responses and finalizing the snapshot.

use crate::application::dispatcher::CosiDispatcher;
use crate::domain::crypto::Response;
use crate::domain::snapshot::SnapshotWithTopologicalOrder;
use crate::foundation::{KernelError, NodeId, Result, SnapshotHash};
use log::debug;

impl CosiDispatcher {
    /// Fold one peer response into the aggregate. Once every committed
    /// peer has responded and the aggregate verifies, the snapshot is
    /// finalized, persisted and gossiped.
    pub(crate) async fn cosi_handle_response(&mut self, peer_id: NodeId, snapshot_hash: SnapshotHash, response: Response) -> Result<()> {
        debug!("cosi_handle_response {} {}", peer_id, snapshot_hash);
        if self.shared.consensus_node(&peer_id)?.is_none() {
            return Ok(());
        }

        let mut aggregators = self.shared.aggregators.write().await;
        let Some(aggregator) = aggregators.get_mut(&snapshot_hash) else {
            return Ok(());
        };
        if aggregator.snapshot.hash != snapshot_hash {
            return Ok(());
        }
        if aggregator.responded.contains(&peer_id) {
            return Ok(());
        }
        if !self.shared.check_catch_up_with_peers() && !self.shared.check_initial_accept_snapshot_weak(&aggregator.snapshot)? {
            debug!("cosi_handle_response not caught up with peers");
            return Ok(());
        }
        if aggregator.responded.len() >= aggregator.commitments.len() {
            return Ok(());
        }
        let base = self.shared.consensus_threshold(aggregator.snapshot.timestamp)?;
        if aggregator.commitments.len() < base {
            return Ok(());
        }

        let Some((Some(transaction), false)) = self.shared.cache_snapshot_transaction(&aggregator.snapshot) else {
            return Ok(());
        };

        if let Some(index) = self.shared.signer_index_of(&peer_id)? {
            let Some(commitment) = aggregator.commitments.get(&index).copied() else {
                return Ok(());
            };
            let Some(signature) = aggregator.snapshot.signature.as_mut() else {
                return Ok(());
            };
            let sig = signature.load_response_signature(&commitment, &response)?;
            signature.aggregate_signature(index, &sig)?;
            aggregator.responses.insert(index, response);
        }
        aggregator.responded.insert(peer_id);
        if aggregator.responded.len() != aggregator.commitments.len() {
            return Ok(());
        }

        let s = aggregator.snapshot.clone();
        let responded = aggregator.responded.clone();
        drop(aggregators);

        let initial_accept = self.check_initial_accept_snapshot(&s, &transaction)?;
        let mut publics = self.shared.consensus_keys(s.timestamp)?;
        if initial_accept {
            if let Some((_, pledging)) = self.shared.pledging()? {
                publics.push(pledging.signer);
            }
        }
        let Some(signature) = s.signature.as_ref() else {
            return Ok(());
        };
        if !self.shared.cache.verify_cosi(&snapshot_hash, signature, &publics, base) {
            debug!("cosi_handle_response aggregate verification failed for {}", snapshot_hash);
            return Ok(());
        }

        if initial_accept {
            self.finalize_node_accept_snapshot(&s)?;
            for id in self.shared.sorted_consensus_nodes()? {
                self.shared.peer.send_snapshot_finalization(id, &s).await?;
            }
            self.reload_consensus_nodes_list(&s, &transaction)?;
            self.shared.aggregators.remove(&snapshot_hash).await;
            self.verifiers.remove(&snapshot_hash);
            return Ok(());
        }

        let mut cache = self
            .graph
            .cache_round(&s.node_id)
            .cloned()
            .ok_or_else(|| KernelError::invariant(format!("head round missing for {}", s.node_id)))?;
        if s.round_number > cache.number {
            return Err(KernelError::invariant(format!(
                "finalizing snapshot round {} past head {}",
                s.round_number, cache.number
            )));
        }
        if s.round_number < cache.number {
            return self.clear_and_queue_snapshot(&s).await;
        }
        if !s.references_equal(&cache.references) {
            return self.clear_and_queue_snapshot(&s).await;
        }
        if cache.validate_snapshot(&s, false).is_err() {
            return self.clear_and_queue_snapshot(&s).await;
        }

        let topo = SnapshotWithTopologicalOrder { snapshot: s.clone(), topological_order: self.shared.next_topological_order() };
        self.shared.persist.write_snapshot(&topo)?;
        cache
            .validate_snapshot(&s, true)
            .map_err(|err| KernelError::invariant(format!("persisted snapshot rejected by head round: {}", err)))?;
        self.graph.set_cache_round(cache);

        for id in self.shared.sorted_consensus_nodes()? {
            if !responded.contains(&id) {
                self.shared.peer.send_transaction(id, &transaction).await?;
            }
            self.shared.peer.send_snapshot_finalization(id, &s).await?;
        }
        self.reload_consensus_nodes_list(&s, &transaction)?;
        self.shared.aggregators.remove(&snapshot_hash).await;
        self.verifiers.remove(&snapshot_hash);
        Ok(())
    }
}
