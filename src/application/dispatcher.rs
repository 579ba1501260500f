//! Single-consumer action loop.
//!
//! The dispatcher is the only writer to the round graph, the verifier map
//! and the aggregator table. Every `CosiAction` runs to completion before
//! the next one starts, which serializes all per-snapshot state machine
//! transitions.

use crate::application::action::CosiAction;
use crate::application::aggregator::CosiVerifier;
use crate::application::graph::RoundGraph;
use crate::application::kernel::KernelShared;
use crate::foundation::{Result, SnapshotHash};
use log::{debug, error};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub struct CosiDispatcher {
    pub(crate) shared: Arc<KernelShared>,
    pub(crate) graph: RoundGraph,
    pub(crate) verifiers: HashMap<SnapshotHash, CosiVerifier>,
    actions: mpsc::UnboundedReceiver<CosiAction>,
    shutdown: watch::Receiver<bool>,
}

impl CosiDispatcher {
    pub(crate) fn new(
        shared: Arc<KernelShared>,
        graph: RoundGraph,
        actions: mpsc::UnboundedReceiver<CosiAction>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { shared, graph, verifiers: HashMap::new(), actions, shutdown }
    }

    /// Consume actions until shutdown, then drain whatever is still
    /// queued and exit. A handler error is surfaced and stops the loop;
    /// the caller decides whether the process survives.
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        self.process_queued().await?;
                        return Ok(());
                    }
                }
                action = self.actions.recv() => {
                    let Some(action) = action else {
                        return Ok(());
                    };
                    if let Err(err) = self.handle_action(action).await {
                        error!("cosi loop stopping on {:?}: {}", err.code(), err);
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Run one action to completion. The final-round cache is refreshed
    /// after every action regardless of the handler outcome.
    pub async fn handle_action(&mut self, action: CosiAction) -> Result<()> {
        debug!("cosi action {} from {}", action.kind(), action.peer_id());
        let result = match action {
            CosiAction::SelfEmpty { peer_id, snapshot } => self.cosi_send_announcement(peer_id, snapshot).await,
            CosiAction::SelfCommitment { peer_id, snapshot_hash, commitment, want_tx } => {
                self.cosi_handle_commitment(peer_id, snapshot_hash, commitment, want_tx).await
            }
            CosiAction::SelfResponse { peer_id, snapshot_hash, response } => {
                self.cosi_handle_response(peer_id, snapshot_hash, response).await
            }
            CosiAction::ExternalAnnouncement { peer_id, snapshot, commitment } => {
                self.cosi_handle_announcement(peer_id, snapshot, commitment).await
            }
            CosiAction::ExternalChallenge { peer_id, snapshot_hash, cosi, transaction } => {
                self.cosi_handle_challenge(peer_id, snapshot_hash, cosi, transaction).await
            }
            CosiAction::Finalization { peer_id, snapshot } => self.handle_finalization(peer_id, snapshot).await,
        };
        self.graph.update_final_cache(self.shared.id);
        result
    }

    /// Handle whatever is already sitting in the channel, without waiting
    /// for more. Useful for embedders that interleave the loop with other
    /// work, and for deterministic tests.
    pub async fn process_queued(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Ok(action) = self.actions.try_recv() {
            self.handle_action(action).await?;
            handled += 1;
        }
        Ok(handled)
    }

    pub fn round_graph(&self) -> &RoundGraph {
        &self.graph
    }

    pub fn has_verifier(&self, hash: &SnapshotHash) -> bool {
        self.verifiers.contains_key(hash)
    }
}
