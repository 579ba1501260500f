//! Finalization handling, reference freshness, and requeue liveness.

mod fixtures;

use chorus_core::application::CosiAction;
use chorus_core::domain::{Round, RoundLink, Snapshot};
use chorus_core::foundation::constants::NANOS_PER_SECOND;
use chorus_core::foundation::RoundHash;
use fixtures::*;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;

fn seed_chain_b(store: &chorus_core::infrastructure::storage::MemoryStore, members: &[Member]) -> RoundHash {
    let b = members[1].id;
    let c = members[2].id;
    let refs = RoundLink::new([6u8; 32].into(), [7u8; 32].into());
    let cache_b = seeded_cache_round(b, 7, Some(refs), &[BASE_TIMESTAMP - NANOS_PER_SECOND]);
    let sealed = cache_b.as_final().expect("round seven seals").hash;
    store
        .seed_round_heads(b, cache_b, final_round_at(b, 6, 6, BASE_TIMESTAMP - 20 * NANOS_PER_SECOND))
        .expect("seed node b");
    store
        .seed_round_heads(c, seeded_cache_round(c, 6, None, &[]), final_round_at(c, 5, 5, BASE_TIMESTAMP - 15 * NANOS_PER_SECOND))
        .expect("seed node c");
    sealed
}

fn cosigned_by_all(harness: &Harness, snapshot: &mut Snapshot) {
    let mut rng = ChaCha20Rng::seed_from_u64(0xF17A);
    let publics = harness.kernel.consensus_keys(snapshot.timestamp).expect("consensus keys");
    let signers: Vec<(usize, &chorus_core::domain::crypto::PrivateKey)> =
        harness.members.iter().map(|member| (harness.member_index(member), &member.key)).collect();
    snapshot.signature = Some(cosign(&snapshot.hash, &signers, &publics, &mut rng));
}

/// S3: a finalization two rounds ahead of our view of the chain is
/// deferred through the snapshot queue, never written.
#[tokio::test]
async fn out_of_order_finalization_is_requeued() {
    let mut harness = genesis_harness(3, |store, members| {
        seed_chain_b(store, members);
    });
    let b = harness.members[1].id;

    let transaction = transfer_transaction(0x51);
    harness.pool.insert(transaction).expect("seed transaction");
    let mut snapshot = snapshot_on(
        b,
        10,
        Some(RoundLink::new([10u8; 32].into(), [11u8; 32].into())),
        BASE_TIMESTAMP + NANOS_PER_SECOND,
        transaction.hash,
    );
    cosigned_by_all(&harness, &mut snapshot);

    harness
        .dispatcher
        .handle_action(CosiAction::Finalization { peer_id: b, snapshot: snapshot.clone() })
        .await
        .expect("finalization handled");

    assert!(harness.store.written_snapshots().expect("written").is_empty());
    let queued = harness.store.queued_snapshots().expect("queued");
    assert_eq!(queued.len(), 1);
    assert!(queued[0].finalized);
    assert_eq!(queued[0].snapshot.hash, snapshot.hash);
}

/// S4: an external announcement timestamped far in the future is dropped
/// silently, with no verifier registered and nothing queued.
#[tokio::test]
async fn stale_timestamp_announcement_is_dropped() {
    let mut harness = genesis_harness(3, |store, members| {
        seed_chain_b(store, members);
    });
    let b = harness.members[1].id;

    let threshold = 10 * chorus_core::foundation::constants::SNAPSHOT_ROUND_GAP
        * chorus_core::foundation::constants::SNAPSHOT_REFERENCE_THRESHOLD;
    let snapshot = snapshot_on(
        b,
        8,
        Some(RoundLink::new([6u8; 32].into(), [7u8; 32].into())),
        BASE_TIMESTAMP + threshold,
        transfer_transaction(0x52).hash,
    );
    let hash = snapshot.hash;

    harness
        .dispatcher
        .handle_action(CosiAction::ExternalAnnouncement {
            peer_id: b,
            snapshot,
            commitment: chorus_core::domain::crypto::Commitment::from_bytes([1; 32]),
        })
        .await
        .expect("announcement handled");

    assert!(commitments_of(&harness.peer).is_empty());
    assert!(!harness.dispatcher.has_verifier(&hash));
    assert!(harness.store.queued_snapshots().expect("queued").is_empty());
}

/// An external reference timestamped after the snapshot violates
/// causality; the announcement is parked for retry instead of advancing
/// the round.
#[tokio::test]
async fn external_reference_ahead_is_rejected() {
    let mut sealed = None;
    let mut harness = genesis_harness(3, |store, members| {
        sealed = Some(seed_chain_b(store, members));
    });
    let b = harness.members[1].id;
    let c = harness.members[2].id;

    let timestamp = BASE_TIMESTAMP + NANOS_PER_SECOND;
    let external = RoundHash::new([0xC1; 32]);
    harness
        .store
        .insert_round(
            external,
            Round {
                node_id: c,
                number: 5,
                timestamp: timestamp + NANOS_PER_SECOND,
                references: RoundLink::new([0u8; 32].into(), [0u8; 32].into()),
            },
        )
        .expect("seed external round");

    let snapshot = snapshot_on(
        b,
        8,
        Some(RoundLink::new(sealed.expect("sealed hash"), external)),
        timestamp,
        transfer_transaction(0x53).hash,
    );
    let hash = snapshot.hash;

    harness
        .dispatcher
        .handle_action(CosiAction::ExternalAnnouncement {
            peer_id: b,
            snapshot,
            commitment: chorus_core::domain::crypto::Commitment::from_bytes([1; 32]),
        })
        .await
        .expect("announcement handled");

    assert!(commitments_of(&harness.peer).is_empty());
    assert!(!harness.dispatcher.has_verifier(&hash));
    let queued = harness.store.queued_snapshots().expect("queued");
    assert_eq!(queued.len(), 1);
    assert!(!queued[0].finalized);
}

/// An external reference lagging more than the sync threshold behind the
/// referenced node's head is rejected the same way.
#[tokio::test]
async fn external_reference_too_old_is_rejected() {
    let mut sealed = None;
    let mut harness = genesis_harness(3, |store, members| {
        let b = members[1].id;
        let c = members[2].id;
        let refs = RoundLink::new([6u8; 32].into(), [7u8; 32].into());
        let cache_b = seeded_cache_round(b, 7, Some(refs), &[BASE_TIMESTAMP - NANOS_PER_SECOND]);
        sealed = cache_b.as_final().map(|round| round.hash);
        store
            .seed_round_heads(b, cache_b, final_round_at(b, 6, 6, BASE_TIMESTAMP - 20 * NANOS_PER_SECOND))
            .expect("seed node b");
        // Node c's chain is far ahead of the referenced round.
        store
            .seed_round_heads(c, seeded_cache_round(c, 201, None, &[]), final_round_at(c, 200, 5, BASE_TIMESTAMP - 15 * NANOS_PER_SECOND))
            .expect("seed node c");
    });
    let b = harness.members[1].id;
    let c = harness.members[2].id;

    let timestamp = BASE_TIMESTAMP + NANOS_PER_SECOND;
    let external = RoundHash::new([0xC2; 32]);
    harness
        .store
        .insert_round(
            external,
            Round {
                node_id: c,
                number: 50,
                timestamp: BASE_TIMESTAMP - 30 * NANOS_PER_SECOND,
                references: RoundLink::new([0u8; 32].into(), [0u8; 32].into()),
            },
        )
        .expect("seed external round");

    let snapshot = snapshot_on(
        b,
        8,
        Some(RoundLink::new(sealed.expect("sealed hash"), external)),
        timestamp,
        transfer_transaction(0x54).hash,
    );

    harness
        .dispatcher
        .handle_action(CosiAction::ExternalAnnouncement {
            peer_id: b,
            snapshot,
            commitment: chorus_core::domain::crypto::Commitment::from_bytes([1; 32]),
        })
        .await
        .expect("announcement handled");

    assert!(commitments_of(&harness.peer).is_empty());
    let queued = harness.store.queued_snapshots().expect("queued");
    assert_eq!(queued.len(), 1);
}

/// Requeue liveness: a finalization deferred on a missing external round
/// applies once the round appears and the queue drains.
#[tokio::test]
async fn queued_finalization_retries_until_prerequisites_appear() {
    let mut sealed = None;
    let mut harness = genesis_harness(3, |store, members| {
        sealed = Some(seed_chain_b(store, members));
    });
    let b = harness.members[1].id;
    let c = harness.members[2].id;

    let transaction = transfer_transaction(0x55);
    harness.pool.insert(transaction).expect("seed transaction");

    let external = RoundHash::new([0xC3; 32]);
    let mut snapshot = snapshot_on(
        b,
        8,
        Some(RoundLink::new(sealed.expect("sealed hash"), external)),
        BASE_TIMESTAMP + NANOS_PER_SECOND,
        transaction.hash,
    );
    cosigned_by_all(&harness, &mut snapshot);

    harness
        .dispatcher
        .handle_action(CosiAction::Finalization { peer_id: b, snapshot: snapshot.clone() })
        .await
        .expect("finalization handled");
    assert!(harness.store.written_snapshots().expect("written").is_empty());
    assert_eq!(harness.store.queued_snapshots().expect("queued").len(), 1);

    // The missing external round arrives.
    harness
        .store
        .insert_round(
            external,
            Round {
                node_id: c,
                number: 20,
                timestamp: BASE_TIMESTAMP,
                references: RoundLink::new([0u8; 32].into(), [0u8; 32].into()),
            },
        )
        .expect("seed external round");

    let drained = harness.kernel.drain_snapshot_queue(16).expect("drain queue");
    assert_eq!(drained, 1);
    harness.dispatcher.process_queued().await.expect("replay queued finalization");

    let written = harness.store.written_snapshots().expect("written");
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].snapshot.hash, snapshot.hash);

    let graph = harness.dispatcher.round_graph();
    let head = graph.cache_round(&b).expect("head round");
    assert_eq!(head.number, 8);
    assert_eq!(head.snapshots.len(), 1);
    assert_eq!(graph.round_history(&b).last().expect("history").number, 7);

    // Replaying the same finalization is cut off by the transaction
    // already being in the node.
    harness
        .kernel
        .verify_and_queue_append_snapshot_finalization(b, snapshot.clone())
        .await
        .expect("replay finalization");
    assert!(harness.store.queued_snapshots().expect("queued").is_empty());
    assert_eq!(harness.store.written_snapshots().expect("written").len(), 1);
}

/// The witness side of a full round: external announcement earns a
/// commitment, the proposer's challenge earns a response.
#[tokio::test]
async fn witness_answers_announcement_and_challenge() {
    let mut sealed = None;
    let mut harness = genesis_harness(3, |store, members| {
        sealed = Some(seed_chain_b(store, members));
    });
    let proposer = &harness.members[1];
    let b = proposer.id;
    let c = harness.members[2].id;

    let transaction = transfer_transaction(0x56);
    harness.pool.insert(transaction).expect("seed transaction");

    let external = RoundHash::new([0xC4; 32]);
    harness
        .store
        .insert_round(
            external,
            Round {
                node_id: c,
                number: 20,
                timestamp: BASE_TIMESTAMP,
                references: RoundLink::new([0u8; 32].into(), [0u8; 32].into()),
            },
        )
        .expect("seed external round");

    let mut rng = ChaCha20Rng::seed_from_u64(0xB0B);
    let proposer_nonce = chorus_core::domain::crypto::PrivateKey::generate(&mut rng);
    let proposer_commitment = chorus_core::domain::crypto::Commitment::from(proposer_nonce.public());
    let snapshot = snapshot_on(
        b,
        8,
        Some(RoundLink::new(sealed.expect("sealed hash"), external)),
        BASE_TIMESTAMP + NANOS_PER_SECOND,
        transaction.hash,
    );
    let hash = snapshot.hash;

    harness
        .kernel
        .cosi_queue_external_announcement(b, snapshot, proposer_commitment)
        .expect("announcement queued");
    assert_eq!(harness.kernel.drain_snapshot_queue(16).expect("drain"), 1);
    harness.dispatcher.process_queued().await.expect("announcement handled");

    let commitments = commitments_of(&harness.peer);
    assert_eq!(commitments.len(), 1);
    let (to, committed_hash, our_commitment, want_tx) = commitments[0].clone();
    assert_eq!((to, committed_hash, want_tx), (b, hash, false));
    assert!(harness.dispatcher.has_verifier(&hash));

    // The proposer aggregates three commitments and challenges us.
    let witness_index = harness.member_index(&harness.members[0]);
    let proposer_index = harness.member_index(proposer);
    let third_index = harness.member_index(&harness.members[2]);
    let third_nonce = chorus_core::domain::crypto::PrivateKey::generate(&mut rng);
    let commitment_set: std::collections::BTreeMap<usize, chorus_core::domain::crypto::Commitment> = [
        (witness_index, our_commitment),
        (proposer_index, proposer_commitment),
        (third_index, chorus_core::domain::crypto::Commitment::from(third_nonce.public())),
    ]
    .into();
    let mut cosi =
        chorus_core::domain::crypto::CosiSignature::aggregate_commitments(&commitment_set).expect("aggregate");
    let publics = harness.kernel.consensus_keys(BASE_TIMESTAMP + NANOS_PER_SECOND).expect("consensus keys");
    let challenge = cosi.challenge(&publics, hash.as_ref()).expect("challenge");
    let proposer_signature = proposer.key.sign_with_challenge(&proposer_nonce, &challenge);
    cosi.aggregate_signature(proposer_index, &proposer_signature).expect("proposer response");

    harness
        .kernel
        .cosi_queue_external_challenge(b, hash, cosi, None)
        .expect("challenge queued");
    harness.dispatcher.process_queued().await.expect("challenge handled");

    let responses: Vec<_> = harness
        .peer
        .sent()
        .into_iter()
        .filter_map(|(id, message)| match message {
            chorus_core::infrastructure::transport::OutboundMessage::SnapshotResponse { snapshot_hash, response } => {
                Some((id, snapshot_hash, response))
            }
            _ => None,
        })
        .collect();
    assert_eq!(responses.len(), 1);
    assert_eq!((responses[0].0, responses[0].1), (b, hash));

    // Our response verifies against our commitment under the challenge.
    let our_signature = chorus_core::domain::crypto::Signature::from_parts(our_commitment.as_bytes(), responses[0].2.as_bytes());
    assert!(publics[witness_index].verify_with_challenge(&our_signature, &challenge));
}

/// Confirmation plumbing: a pre-verified finalization confirms back to
/// the sending peer before anything else happens.
#[tokio::test]
async fn finalization_preverify_confirms_to_peer() {
    let mut harness = genesis_harness(3, |store, members| {
        seed_chain_b(store, members);
    });
    let b = harness.members[1].id;

    // An unverifiable snapshot is confirmed but not queued.
    let snapshot = snapshot_on(b, 8, Some(RoundLink::new([1u8; 32].into(), [2u8; 32].into())), BASE_TIMESTAMP, transfer_transaction(0x57).hash);
    harness
        .kernel
        .verify_and_queue_append_snapshot_finalization(b, snapshot)
        .await
        .expect("pre-verify");

    let sent = harness.peer.sent();
    let confirm_count = sent
        .iter()
        .filter(|(_, message)| {
            matches!(
                message,
                chorus_core::infrastructure::transport::OutboundMessage::SnapshotConfirm { .. }
                    | chorus_core::infrastructure::transport::OutboundMessage::PeerConfirmation { .. }
            )
        })
        .count();
    assert_eq!(confirm_count, 2);
    assert!(harness.store.queued_snapshots().expect("queued").is_empty());
}
