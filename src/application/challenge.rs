//! Phase C: verifying the proposer's challenge and answering with our
//! response scalar.

use crate::application::dispatcher::CosiDispatcher;
use crate::domain::crypto::{CosiSignature, Signature};
use crate::domain::transaction::Transaction;
use crate::foundation::{KernelError, NodeId, Result, SnapshotHash};
use log::debug;

impl CosiDispatcher {
    pub(crate) async fn cosi_handle_challenge(
        &mut self,
        peer_id: NodeId,
        snapshot_hash: SnapshotHash,
        cosi: CosiSignature,
        transaction: Option<Transaction>,
    ) -> Result<()> {
        debug!("cosi_handle_challenge {} {}", peer_id, snapshot_hash);
        if self.shared.consensus_index()?.is_none() || !self.shared.check_catch_up_with_peers() {
            debug!("cosi_handle_challenge not caught up with peers");
            return Ok(());
        }
        if self.shared.get_peer_consensus_node(&peer_id)?.is_none() {
            return Ok(());
        }

        let Some(verifier) = self.verifiers.get(&snapshot_hash) else {
            return Ok(());
        };
        if verifier.snapshot.hash != snapshot_hash {
            return Ok(());
        }
        let s = verifier.snapshot.clone();
        let random = verifier.random.clone();

        if let Some(transaction) = transaction.as_ref() {
            self.shared.transactions.cache_put_transaction(peer_id, transaction)?;
        }

        let threshold = self.shared.config.consensus.timestamp_threshold();
        if s.timestamp > self.shared.now_nanos() + threshold {
            return Ok(());
        }
        if s.timestamp + threshold * 2 < self.graph.graph_timestamp() {
            return Ok(());
        }

        let Some((Some(tx), false)) = self.shared.cache_snapshot_transaction(&s) else {
            return Ok(());
        };

        let Some(proposer) = self.shared.get_peer_consensus_node(&s.node_id)? else {
            return Ok(());
        };
        let mut publics = self.shared.consensus_keys(s.timestamp)?;
        if self.check_initial_accept_snapshot(&s, &tx)? {
            if let Some((_, pledging)) = self.shared.pledging()? {
                publics.push(pledging.signer);
            }
        }
        let Ok(challenge) = cosi.challenge(&publics, snapshot_hash.as_ref()) else {
            return Ok(());
        };

        // The challenge must carry exactly the proposer's own response.
        let responses = cosi.responses();
        if responses.len() != 1 {
            return Err(KernelError::InvalidResponseCount { count: responses.len() });
        }
        let proposer_response = responses.values().next().expect("response count checked above");
        let Some(announced_commitment) = s.commitment else {
            return Ok(());
        };
        let proposer_sig = Signature::from_parts(announced_commitment.as_bytes(), proposer_response.as_bytes());
        if !proposer.signer.verify_with_challenge(&proposer_sig, &challenge) {
            debug!("cosi_handle_challenge proposer response rejected for {}", snapshot_hash);
            return Ok(());
        }

        let signature = self.shared.signer.sign_with_challenge(&random, &challenge);
        let response = CosiSignature::dump_signature_response(&signature);
        self.shared.peer.send_snapshot_response(peer_id, snapshot_hash, response).await
    }
}
