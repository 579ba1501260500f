//! Phase B: collecting peer commitments and issuing the challenge.

use crate::application::dispatcher::CosiDispatcher;
use crate::domain::crypto::{Commitment, CosiSignature};
use crate::foundation::{NodeId, Result, SnapshotHash};
use log::debug;

impl CosiDispatcher {
    /// Record one peer commitment for a snapshot we proposed. Crossing the
    /// threshold aggregates the commitments, derives the challenge, signs
    /// our own response and challenges every committed peer.
    pub(crate) async fn cosi_handle_commitment(
        &mut self,
        peer_id: NodeId,
        snapshot_hash: SnapshotHash,
        commitment: Commitment,
        want_tx: bool,
    ) -> Result<()> {
        debug!("cosi_handle_commitment {} {}", peer_id, snapshot_hash);
        let Some(consensus_node) = self.shared.consensus_node(&peer_id)? else {
            return Ok(());
        };

        let mut aggregators = self.shared.aggregators.write().await;
        let Some(aggregator) = aggregators.get_mut(&snapshot_hash) else {
            return Ok(());
        };
        if aggregator.snapshot.hash != snapshot_hash {
            return Ok(());
        }
        if aggregator.committed.contains(&peer_id) {
            return Ok(());
        }
        if !self.shared.check_catch_up_with_peers() && !self.shared.check_initial_accept_snapshot_weak(&aggregator.snapshot)? {
            debug!("cosi_handle_commitment not caught up with peers");
            return Ok(());
        }
        let accept_period = self.shared.config.consensus.node_accept_period_minimum;
        if consensus_node.timestamp + accept_period >= aggregator.snapshot.timestamp && !self.shared.is_genesis(&peer_id)? {
            return Ok(());
        }
        aggregator.committed.insert(peer_id);

        let base = self.shared.consensus_threshold(aggregator.snapshot.timestamp)?;
        if aggregator.commitments.len() >= base {
            return Ok(());
        }
        if let Some(index) = self.shared.signer_index_of(&peer_id)? {
            aggregator.commitments.insert(index, commitment);
            aggregator.want_txs.insert(peer_id, want_tx);
        }
        if aggregator.commitments.len() < base {
            return Ok(());
        }

        let Some((Some(transaction), false)) = self.shared.cache_snapshot_transaction(&aggregator.snapshot) else {
            return Ok(());
        };

        let mut cosi = CosiSignature::aggregate_commitments(&aggregator.commitments)?;
        let initial_accept = self.check_initial_accept_snapshot(&aggregator.snapshot, &transaction)?;
        let mut publics = self.shared.consensus_keys(aggregator.snapshot.timestamp)?;
        if initial_accept {
            if let Some((_, pledging)) = self.shared.pledging()? {
                publics.push(pledging.signer);
            }
        }
        let challenge = cosi.challenge(&publics, snapshot_hash.as_ref())?;

        let Some(verifier) = self.verifiers.get(&snapshot_hash) else {
            debug!("cosi_handle_commitment verifier missing for {}", snapshot_hash);
            return Ok(());
        };
        let signature = self.shared.signer.sign_with_challenge(&verifier.random, &challenge);
        if initial_accept {
            cosi.aggregate_signature(self.shared.sorted_consensus_nodes()?.len(), &signature)?;
        } else {
            let Some(index) = self.shared.consensus_index()? else {
                return Ok(());
            };
            cosi.aggregate_signature(index, &signature)?;
        }
        aggregator.snapshot.signature = Some(cosi.clone());

        let want_txs = aggregator.want_txs.clone();
        drop(aggregators);

        for id in self.shared.sorted_consensus_nodes()? {
            let Some(&wants_transaction) = want_txs.get(&id) else {
                continue;
            };
            let payload = wants_transaction.then_some(&transaction);
            self.shared
                .peer
                .send_transaction_challenge(id, snapshot_hash, &cosi, payload)
                .await?;
        }
        Ok(())
    }
}
