//! Accepting finalized snapshots from peers and reconciling them with the
//! local round graph.

use crate::application::dispatcher::CosiDispatcher;
use crate::application::kernel::KernelShared;
use crate::domain::round::CacheRound;
use crate::domain::snapshot::{Snapshot, SnapshotWithTopologicalOrder};
use crate::domain::transaction::{Transaction, TransactionKind};
use crate::foundation::constants::SNAPSHOT_VERSION;
use crate::foundation::{KernelError, NodeId, Result};
use log::{debug, warn};

impl KernelShared {
    /// Whether a snapshot carries a finalization proof acceptable under
    /// the consensus keys active at its timestamp. Covers the narrow
    /// window after a node removal by retrying with the removed node's
    /// key inserted at each position.
    pub(crate) fn verify_finalization(&self, s: &Snapshot) -> Result<bool> {
        if s.version == 0 {
            return self.legacy_verify_finalization(s.timestamp, s.legacy_signatures.as_deref().unwrap_or(&[]));
        }
        if s.version != SNAPSHOT_VERSION {
            return Ok(false);
        }
        let Some(signature) = s.signature.as_ref() else {
            return Ok(false);
        };
        let mut publics = self.consensus_keys(s.timestamp)?;
        if self.check_initial_accept_snapshot_weak(s)? {
            if let Some((_, pledging)) = self.pledging()? {
                publics.push(pledging.signer);
            }
        }
        let base = self.consensus_threshold(s.timestamp)?;
        if self.cache.verify_cosi(&s.payload_hash(), signature, &publics, base) {
            return Ok(true);
        }
        if let Some(removed) = self.consensus_removed_recently(s.timestamp)? {
            for position in 0..publics.len() {
                let mut with_removed = Vec::with_capacity(publics.len() + 1);
                with_removed.extend_from_slice(&publics[..position]);
                with_removed.push(removed.signer);
                with_removed.extend_from_slice(&publics[position..]);
                if self.cache.verify_cosi(&s.payload_hash(), signature, &with_removed, base) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Version-0 snapshots: a bare signature count against the threshold.
    pub(crate) fn legacy_verify_finalization(&self, timestamp: u64, signatures: &[crate::domain::crypto::Signature]) -> Result<bool> {
        Ok(signatures.len() >= self.consensus_threshold(timestamp)?)
    }
}

impl CosiDispatcher {
    /// Entry point for `Finalization` actions: re-verify, bound against
    /// the head round, resolve the transaction, then reconcile.
    pub(crate) async fn handle_finalization(&mut self, peer_id: NodeId, mut s: Snapshot) -> Result<()> {
        debug!("handle_finalization {} {}", peer_id, s.hash);
        s.hash = s.payload_hash();
        if !self.shared.verify_finalization(&s)? {
            warn!("handle_finalization verification failed {} {}", peer_id, s.hash);
            return Ok(());
        }

        if let Some(cache) = self.graph.cache_round(&s.node_id) {
            if s.round_number < cache.number {
                debug!("handle_finalization expired round {} {} {} {}", peer_id, s.hash, s.round_number, cache.number);
                return Ok(());
            }
            if s.round_number > cache.number + 1 {
                return self.shared.persist.queue_append_snapshot(peer_id, &s, true);
            }
        }

        match self.try_to_start_new_round(&s) {
            Err(err) => {
                warn!("handle_finalization round advance failed {} {}: {}", peer_id, s.hash, err);
                return self.shared.persist.queue_append_snapshot(peer_id, &s, true);
            }
            Ok(true) => {
                debug!("handle_finalization dummy round deferred {} {}", peer_id, s.hash);
                return self.shared.persist.queue_append_snapshot(peer_id, &s, true);
            }
            Ok(false) => {}
        }

        let transaction = match self.shared.transactions.check_final_snapshot_transaction(&s) {
            Err(err) => {
                warn!("handle_finalization transaction lookup failed {} {}: {}", peer_id, s.hash, err);
                return self.shared.persist.queue_append_snapshot(peer_id, &s, true);
            }
            Ok(None) => {
                debug!("handle_finalization transaction not available {} {}", peer_id, s.hash);
                return Ok(());
            }
            Ok(Some(transaction)) => transaction,
        };
        if s.round_number == 0 && !transaction.is_node_accept() {
            return Err(KernelError::InvalidTransaction {
                details: format!("initial round transaction kind {:?}", transaction.kind),
            });
        }

        self.cosi_handle_finalization(peer_id, s, transaction).await
    }

    /// Probe whether the snapshot legally advances its chain, allowing a
    /// dummy round when the external reference is still missing. `true`
    /// means the advance must wait.
    pub(crate) fn try_to_start_new_round(&mut self, s: &Snapshot) -> Result<bool> {
        let Some(cache) = self.graph.cache_round(&s.node_id).cloned() else {
            return Ok(false);
        };
        if s.round_number != cache.number + 1 {
            return Ok(false);
        }
        match self.start_new_round(s, &cache, true)? {
            Some((_, dummy)) => Ok(dummy),
            None => Ok(false),
        }
    }

    /// Mirror of the external-announcement round alignment, applied to a
    /// confirmed-finalized snapshot.
    pub(crate) async fn cosi_handle_finalization(&mut self, peer_id: NodeId, s: Snapshot, transaction: Transaction) -> Result<()> {
        debug!("cosi_handle_finalization {} {}", peer_id, s.hash);
        if self.check_initial_accept_snapshot(&s, &transaction)? {
            self.finalize_node_accept_snapshot(&s)?;
            return self.reload_consensus_nodes_list(&s, &transaction);
        }

        let Some(mut cache) = self.graph.cache_round(&s.node_id).cloned() else {
            return self.shared.persist.queue_append_snapshot(peer_id, &s, true);
        };
        let mut final_round = self
            .graph
            .final_round(&s.node_id)
            .copied()
            .ok_or_else(|| KernelError::invariant(format!("final round missing for {}", s.node_id)))?;

        if s.round_number < cache.number {
            debug!("cosi_handle_finalization expired round {} {} {} {}", peer_id, s.hash, s.round_number, cache.number);
            return Ok(());
        }
        if s.round_number > cache.number + 1 {
            return self.shared.persist.queue_append_snapshot(peer_id, &s, true);
        }
        if s.round_number == cache.number && !s.references_equal(&cache.references) {
            if !cache.snapshots.is_empty() {
                debug!("cosi_handle_finalization head references differ on non-empty round {} {}", peer_id, s.hash);
                return Ok(());
            }
            let (Some(new_refs), Some(head_refs)) = (s.references, cache.references) else {
                return Ok(());
            };
            if new_refs.self_ref != head_refs.self_ref {
                debug!("cosi_handle_finalization head references self diff {} {}", peer_id, s.hash);
                return Ok(());
            }
            if self.shared.persist.read_round(&new_refs.external)?.is_none() {
                debug!("cosi_handle_finalization external reference not ready {} {}", peer_id, s.hash);
                return self.shared.persist.queue_append_snapshot(peer_id, &s, true);
            }
            self.shared.persist.update_empty_head_round(cache.node_id, cache.number, &new_refs)?;
            cache.references = Some(new_refs);
            self.graph.assign_new_graph_round(final_round, cache)?;
            return self.shared.persist.queue_append_snapshot(peer_id, &s, true);
        }
        if s.round_number == cache.number + 1 {
            match self.start_new_round(&s, &cache, false) {
                Err(err) => {
                    debug!("cosi_handle_finalization round advance deferred {} {}: {}", peer_id, s.hash, err);
                    return self.shared.persist.queue_append_snapshot(peer_id, &s, true);
                }
                Ok(None) => {
                    debug!("cosi_handle_finalization round advance empty {} {}", peer_id, s.hash);
                    return Ok(());
                }
                Ok(Some((round, _))) => final_round = round,
            }
            let new_refs = s
                .references
                .ok_or_else(|| KernelError::invalid_snapshot("round advance without references".to_string()))?;
            cache = CacheRound {
                node_id: s.node_id,
                number: s.round_number,
                timestamp: s.timestamp,
                references: Some(new_refs),
                snapshots: Vec::new(),
            };
            self.shared.persist.start_new_round(cache.node_id, cache.number, &new_refs, final_round.start)?;
        }
        self.graph.assign_new_graph_round(final_round, cache.clone())?;

        if let Err(err) = cache.validate_snapshot(&s, false) {
            debug!("cosi_handle_finalization snapshot rejected {} {}: {}", peer_id, s.hash, err);
            return Ok(());
        }
        let topo = SnapshotWithTopologicalOrder { snapshot: s.clone(), topological_order: self.shared.next_topological_order() };
        self.shared.persist.write_snapshot(&topo)?;
        cache
            .validate_snapshot(&s, true)
            .map_err(|err| KernelError::invariant(format!("persisted snapshot rejected by head round: {}", err)))?;
        self.graph.assign_new_graph_round(final_round, cache)?;
        self.reload_consensus_nodes_list(&s, &transaction)
    }

    /// Seal the pledging node's bootstrap snapshot as its round zero.
    pub(crate) fn finalize_node_accept_snapshot(&mut self, s: &Snapshot) -> Result<()> {
        let Some((pledging_id, _)) = self.shared.pledging()? else {
            return Err(KernelError::invariant("node accept finalization without a pledging node".to_string()));
        };
        if pledging_id != s.node_id {
            return Err(KernelError::invariant(format!(
                "node accept finalization for {} while {} is pledging",
                s.node_id, pledging_id
            )));
        }
        if self.graph.final_round(&s.node_id).is_some() {
            return Err(KernelError::invariant(format!("node {} already has a sealed round", s.node_id)));
        }

        let topo = SnapshotWithTopologicalOrder { snapshot: s.clone(), topological_order: self.shared.next_topological_order() };
        self.shared.persist.write_snapshot(&topo)?;

        let mut cache = CacheRound::new(s.node_id, s.round_number, s.timestamp, s.references);
        cache.snapshots.push(s.clone());
        let final_round = cache
            .as_final()
            .ok_or_else(|| KernelError::invariant("bootstrap round sealed empty".to_string()))?;
        self.graph.assign_new_graph_round(final_round, cache)?;
        Ok(())
    }

    /// Apply finalized node lifecycle transactions to the consensus
    /// tables.
    pub(crate) fn reload_consensus_nodes_list(&mut self, s: &Snapshot, transaction: &Transaction) -> Result<()> {
        match transaction.kind {
            TransactionKind::NodeAccept => self.shared.accept_pledging_node(s.node_id, s.timestamp),
            TransactionKind::NodeRemove => self.shared.remove_consensus_node(s.node_id, s.timestamp),
            _ => Ok(()),
        }
    }
}
