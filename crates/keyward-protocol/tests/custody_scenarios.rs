/// End-to-end custody scenarios over the pure state machines.
///
/// No channel and no runtime: actions are applied by hand, the way a
/// device would apply them, so every step is visible.
use keyward_protocol::{
    reconstruct, split, AckDisposition, AckOutcome, BackupConfigManager, BackupStatus,
    ConfigUpdate, CustodyMessage, DistributionAction, DistributionCoordinator, DistributionEvent,
    FileDistributionTracker, FileState, HeldShards, Identity, KeyIdentity, KeywardError,
    NewBackupConfig, ProtocolError, RecoveryCoordinator, RecoveryParams, RecoveryStatus,
    ResponseOutcome, SendOutcome, ShardAcceptance, ShardData, Steward, StewardStatus, VaultId,
    DISTRIBUTION_WINDOW_MS,
};

const HOUR: u64 = 60 * 60 * 1000;

fn identity(seed: u8) -> Identity {
    KeyIdentity::from_seed([seed; 32]).identity()
}

fn vault() -> VaultId {
    VaultId::from("family-photos")
}

fn new_config(stewards: Vec<Steward>, threshold: usize) -> NewBackupConfig {
    NewBackupConfig {
        vault_id: vault(),
        threshold,
        stewards,
        channels: vec!["wss://relay.example.com".into()],
        instructions: Some("call me first".into()),
    }
}

/// Extract `(recipient, shard)` pairs from distribution actions.
fn shard_sends(actions: &[DistributionAction]) -> Vec<(Identity, ShardData)> {
    actions
        .iter()
        .filter_map(|a| match a {
            DistributionAction::SendShard {
                to,
                message: CustodyMessage::ShardDistribution { shard },
                ..
            } => Some((*to, shard.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn two_of_three_any_pair_reconstructs() {
    let shards = split(b"K", 2, 3, identity(1), 1_000).unwrap();
    assert_eq!(shards.len(), 3);

    let first_third = vec![shards[0].clone(), shards[2].clone()];
    let second_third = vec![shards[1].clone(), shards[2].clone()];
    assert_eq!(reconstruct(&first_third).unwrap(), b"K");
    assert_eq!(reconstruct(&second_third).unwrap(), b"K");

    let err = reconstruct(&shards[..1]).unwrap_err();
    assert!(matches!(
        err,
        KeywardError::Protocol(ProtocolError::InsufficientShares { have: 1, need: 2 })
    ));
}

#[test]
fn distribution_waits_for_every_invitation() {
    let mut manager = BackupConfigManager::new();
    let invites: Vec<_> = (0..3)
        .map(|i| Steward::invited(Some(format!("steward {i}")), format!("code-{i}")))
        .collect();
    manager.create(new_config(invites, 2), 100).unwrap();

    for (i, seed) in [2u8, 3, 4].into_iter().enumerate() {
        assert!(!manager.can_distribute(&vault()).unwrap());
        manager
            .accept_invitation(&vault(), &format!("code-{i}"), identity(seed), 200 + i as u64)
            .unwrap();
    }
    assert!(manager.can_distribute(&vault()).unwrap());

    let config = manager.get(&vault()).unwrap();
    assert!(config
        .stewards
        .iter()
        .all(|s| s.status == StewardStatus::AwaitingKey && s.invite_code.is_none()));
    assert!(!config.is_ready());
}

#[test]
fn unknown_invitation_code_is_rejected() {
    let mut manager = BackupConfigManager::new();
    manager
        .create(new_config(vec![Steward::invited(None, "abc")], 1), 100)
        .unwrap();
    let err = manager
        .accept_invitation(&vault(), "nope", identity(2), 150)
        .unwrap_err();
    assert!(matches!(err, KeywardError::NotFound { .. }));
}

#[test]
fn full_custody_cycle() {
    let owner = identity(1);
    let stewards = [identity(2), identity(3), identity(4)];
    let mut manager = BackupConfigManager::new();
    manager
        .create(
            new_config(
                stewards
                    .iter()
                    .map(|id| Steward::with_identity(*id, None))
                    .collect(),
                2,
            ),
            100,
        )
        .unwrap();

    // ── Step 1: owner prepares and sends ──
    let mut dist = DistributionCoordinator::new(owner).with_owner_name(Some("Ada".into()));
    let actions = dist
        .prepare(manager.get(&vault()).unwrap(), b"vault master key", None, 1_000)
        .unwrap();
    let sends = shard_sends(&actions);
    assert_eq!(sends.len(), 3);
    assert!(sends
        .iter()
        .all(|(to, shard)| shard.recipient == Some(*to) && shard.distribution_version == 1));

    let mut last_events = Vec::new();
    for (i, (to, _)) in sends.iter().enumerate() {
        last_events = dist
            .record_send(
                &vault(),
                to,
                SendOutcome::Accepted {
                    message_ref: format!("msg-{i}"),
                },
                &mut manager,
                1_100,
            )
            .unwrap();
    }
    assert!(last_events.iter().any(|a| matches!(
        a,
        DistributionAction::Event(DistributionEvent::Completed { version: 1, .. })
    )));
    let config = manager.get(&vault()).unwrap();
    assert_eq!(config.distribution_version, 1);
    assert_eq!(config.status, BackupStatus::Active);
    assert!(!config.is_ready(), "no acknowledgments yet");

    // ── Step 2: stewards store and acknowledge ──
    let mut holders: Vec<HeldShards> = stewards.iter().map(|_| HeldShards::new()).collect();
    for (to, held) in stewards.iter().zip(holders.iter_mut()) {
        let (_, shard) = sends.iter().find(|(recipient, _)| recipient == to).unwrap();
        let (acceptance, ack) = held.accept_shard(shard.clone(), &owner, to, 1_200).unwrap();
        assert_eq!(acceptance, ShardAcceptance::Stored);
        let Some(CustodyMessage::ShardAck {
            distribution_version,
            ack_ref,
            ..
        }) = ack
        else {
            panic!("expected an ack");
        };
        let disposition = dist
            .record_ack(&vault(), to, distribution_version, Some(ack_ref), &mut manager, 1_300)
            .unwrap();
        assert_eq!(disposition, AckDisposition::Recorded(AckOutcome::Accepted));
    }
    let config = manager.get(&vault()).unwrap();
    assert!(config.is_ready());
    assert!(!config.has_version_mismatch());
    assert!(!config.needs_redistribution());

    // ── Step 3: recovery with one denial ──
    let mut recovery = RecoveryCoordinator::new(owner);
    let (request_id, _) = recovery
        .initiate(
            RecoveryParams {
                vault_id: vault(),
                stewards: stewards.to_vec(),
                threshold: 2,
                expires_at: None,
            },
            2_000,
        )
        .unwrap();

    let shard_of = |i: usize| holders[i].get(&vault()).cloned();
    let first = recovery
        .record_response(&request_id, &stewards[0], true, shard_of(0), 2_100, 2_100)
        .unwrap();
    assert_eq!(first, ResponseOutcome::Recorded);
    let denied = recovery
        .record_response(&request_id, &stewards[1], false, None, 2_200, 2_200)
        .unwrap();
    assert_eq!(denied, ResponseOutcome::Recorded);
    assert_eq!(recovery.get(&request_id).unwrap().status, RecoveryStatus::InProgress);

    let third = recovery
        .record_response(&request_id, &stewards[2], true, shard_of(2), 2_300, 2_300)
        .unwrap();
    assert_eq!(third, ResponseOutcome::ThresholdReached);

    let secret = recovery.perform_recovery(&request_id, 2_400).unwrap();
    assert_eq!(secret, b"vault master key");
    assert_eq!(recovery.get(&request_id).unwrap().status, RecoveryStatus::Completed);
}

#[test]
fn content_change_forces_new_version() {
    let owner = identity(1);
    let stewards = [identity(2), identity(3)];
    let mut manager = BackupConfigManager::new();
    manager
        .create(
            new_config(
                stewards
                    .iter()
                    .map(|id| Steward::with_identity(*id, None))
                    .collect(),
                2,
            ),
            100,
        )
        .unwrap();
    let mut dist = DistributionCoordinator::new(owner);
    let mut holders = [HeldShards::new(), HeldShards::new()];

    let mut run = |manager: &mut BackupConfigManager, secret: &[u8], now: u64| {
        let actions = dist
            .prepare(manager.get(&vault()).unwrap(), secret, None, now)
            .unwrap();
        let sends = shard_sends(&actions);
        for (to, _) in &sends {
            dist.record_send(
                &vault(),
                to,
                SendOutcome::Accepted {
                    message_ref: "ref".into(),
                },
                manager,
                now + 1,
            )
            .unwrap();
        }
        for ((to, shard), held) in sends.iter().zip(holders.iter_mut()) {
            let (_, ack) = held.accept_shard(shard.clone(), &owner, to, now + 2).unwrap();
            let Some(CustodyMessage::ShardAck {
                distribution_version,
                ack_ref,
                ..
            }) = ack
            else {
                panic!("expected an ack");
            };
            dist.record_ack(&vault(), to, distribution_version, Some(ack_ref), manager, now + 3)
                .unwrap();
        }
    };

    run(&mut manager, b"first", 1_000);
    assert_eq!(manager.get(&vault()).unwrap().distribution_version, 1);
    assert!(!manager.needs_redistribution(&vault()).unwrap());

    assert!(manager
        .on_content_changed(&vault(), Some("hash-2".into()), 2_000)
        .unwrap());
    assert!(manager.needs_redistribution(&vault()).unwrap());
    assert_eq!(manager.get(&vault()).unwrap().status, BackupStatus::Pending);

    // Same fingerprint again is a no-op.
    assert!(!manager
        .on_content_changed(&vault(), Some("hash-2".into()), 2_100)
        .unwrap());

    run(&mut manager, b"second", 3_000);
    let config = manager.get(&vault()).unwrap();
    assert_eq!(config.distribution_version, 2);
    assert!(config.is_ready());
    assert!(!config.needs_redistribution());
    assert!(config
        .stewards
        .iter()
        .all(|s| s.acknowledged_version == Some(2)));
}

#[test]
fn late_ack_for_old_version_does_not_regress() {
    let mut manager = BackupConfigManager::new();
    let steward = identity(2);
    manager
        .create(new_config(vec![Steward::with_identity(steward, None)], 1), 100)
        .unwrap();
    manager.mark_redistributed(&vault(), 200).unwrap();
    manager.mark_redistributed(&vault(), 300).unwrap();

    let outcome = manager
        .record_acknowledgment(&vault(), &steward, 2, Some("b".into()), 400)
        .unwrap();
    assert_eq!(outcome, AckOutcome::Accepted);
    let outcome = manager
        .record_acknowledgment(&vault(), &steward, 1, Some("a".into()), 500)
        .unwrap();
    assert_eq!(outcome, AckOutcome::Stale);

    let config = manager.get(&vault()).unwrap();
    assert_eq!(config.stewards.iter().next().unwrap().acknowledged_version, Some(2));
    assert!(config.is_ready());
}

#[test]
fn ack_ahead_of_config_is_rejected() {
    let mut manager = BackupConfigManager::new();
    let steward = identity(2);
    manager
        .create(new_config(vec![Steward::with_identity(steward, None)], 1), 100)
        .unwrap();
    let err = manager
        .record_acknowledgment(&vault(), &steward, 3, None, 200)
        .unwrap_err();
    assert!(matches!(
        err,
        KeywardError::Protocol(ProtocolError::VersionMismatch { .. })
    ));
}

#[test]
fn denials_beyond_tolerance_fail_the_request() {
    let stewards = [identity(2), identity(3), identity(4)];
    let mut recovery = RecoveryCoordinator::new(identity(1));
    let (id, _) = recovery
        .initiate(
            RecoveryParams {
                vault_id: vault(),
                stewards: stewards.to_vec(),
                threshold: 2,
                expires_at: None,
            },
            10,
        )
        .unwrap();
    recovery
        .record_response(&id, &stewards[0], false, None, 11, 11)
        .unwrap();
    let outcome = recovery
        .record_response(&id, &stewards[1], false, None, 12, 12)
        .unwrap();
    assert!(matches!(outcome, ResponseOutcome::Failed(_)));
    assert_eq!(recovery.get(&id).unwrap().status, RecoveryStatus::Failed);

    let err = recovery.perform_recovery(&id, 13).unwrap_err();
    assert!(matches!(
        err,
        KeywardError::Protocol(ProtocolError::InvalidTransition { .. })
    ));
    recovery.archive(&id).unwrap();
    assert_eq!(recovery.get(&id).unwrap().status, RecoveryStatus::Archived);
}

#[test]
fn file_window_resolves_blob_deletion() {
    let a = identity(2);
    let b = identity(3);
    let mut tracker = FileDistributionTracker::new();
    let t0 = 1_000_000;
    tracker.register_upload(&vault(), "mem://blob/1", "hash", &[a, b], t0);
    assert!(!tracker.can_delete_from_blob_store(&vault(), t0));

    // ── Step 1: one steward downloads within the window ──
    assert!(tracker.confirm_download(&vault(), &a, t0 + 10 * HOUR).unwrap());
    assert!(!tracker.can_delete_from_blob_store(&vault(), t0 + 10 * HOUR));

    // ── Step 2: the other one misses it ──
    let closes = t0 + DISTRIBUTION_WINDOW_MS;
    assert_eq!(tracker.sweep(closes - 1), vec![]);
    assert_eq!(tracker.sweep(closes), vec![(vault(), b)]);
    assert_eq!(tracker.status(&vault(), &b).unwrap().state, FileState::MissedWindow);

    // ── Step 3: everyone resolved ──
    assert!(tracker.can_delete_from_blob_store(&vault(), closes));

    let err = tracker.confirm_download(&vault(), &b, closes + 1).unwrap_err();
    assert!(matches!(
        err,
        KeywardError::Protocol(ProtocolError::WindowClosed { .. })
    ));
}

fn three_steward_manager() -> BackupConfigManager {
    let mut manager = BackupConfigManager::new();
    let stewards = (2..=4).map(|s| Steward::with_identity(identity(s), None)).collect();
    manager.create(new_config(stewards, 2), 1_000).unwrap();
    manager
}

fn is_superseded(err: &KeywardError) -> bool {
    matches!(
        err,
        KeywardError::Protocol(ProtocolError::DistributionSuperseded(_))
    )
}

#[test]
fn threshold_change_drops_partial_distribution() {
    let mut manager = three_steward_manager();
    let mut dist = DistributionCoordinator::new(identity(1));

    // ── Step 1: two of three sends land, one fails ──
    dist.prepare(manager.get(&vault()).unwrap(), b"K", None, 2_000)
        .unwrap();
    for seed in [2, 3] {
        dist.record_send(
            &vault(),
            &identity(seed),
            SendOutcome::Accepted { message_ref: format!("m{seed}") },
            &mut manager,
            2_001,
        )
        .unwrap();
    }
    dist.record_send(
        &vault(),
        &identity(4),
        SendOutcome::Failed { reason: "offline".into() },
        &mut manager,
        2_001,
    )
    .unwrap();

    // ── Step 2: threshold raised before the retry ──
    manager
        .update(&vault(), ConfigUpdate::default().threshold(3), 2_100)
        .unwrap();
    let err = dist.retry_failed(&vault(), &manager).unwrap_err();
    assert!(is_superseded(&err));
    assert!(!dist.has_pending(&vault()));

    let config = manager.get(&vault()).unwrap();
    assert_eq!(config.distribution_version, 0);
    assert_eq!(config.status, BackupStatus::Pending);
    assert!(config.needs_redistribution());

    // ── Step 3: a fresh distribution uses the new threshold ──
    let sends = shard_sends(
        &dist
            .prepare(manager.get(&vault()).unwrap(), b"K", None, 2_200)
            .unwrap(),
    );
    assert!(sends.iter().all(|(_, shard)| shard.threshold == 3));
}

#[test]
fn content_change_between_sends_blocks_completion() {
    let mut manager = three_steward_manager();
    let mut dist = DistributionCoordinator::new(identity(1));
    dist.prepare(manager.get(&vault()).unwrap(), b"old key", None, 2_000)
        .unwrap();
    let accepted = |tag: &str| SendOutcome::Accepted {
        message_ref: tag.to_string(),
    };

    dist.record_send(&vault(), &identity(2), accepted("a"), &mut manager, 2_001)
        .unwrap();
    manager
        .on_content_changed(&vault(), Some("hash-2".into()), 2_050)
        .unwrap();

    let err = dist
        .record_send(&vault(), &identity(3), accepted("b"), &mut manager, 2_060)
        .unwrap_err();
    assert!(is_superseded(&err));
    let err = dist
        .record_send(&vault(), &identity(4), accepted("c"), &mut manager, 2_070)
        .unwrap_err();
    assert!(matches!(
        err,
        KeywardError::Protocol(ProtocolError::NoPendingDistribution(_))
    ));

    let config = manager.get(&vault()).unwrap();
    assert_eq!(config.distribution_version, 0);
    assert_eq!(config.last_redistribution, None);
    assert_ne!(config.status, BackupStatus::Active);
    assert!(config.needs_redistribution());
}

#[test]
fn removed_steward_is_not_resent_its_shard() {
    let mut manager = three_steward_manager();
    let mut dist = DistributionCoordinator::new(identity(1));
    dist.prepare(manager.get(&vault()).unwrap(), b"K", None, 2_000)
        .unwrap();
    dist.record_send(
        &vault(),
        &identity(4),
        SendOutcome::Failed { reason: "offline".into() },
        &mut manager,
        2_001,
    )
    .unwrap();

    let remaining = (2..=3).map(|s| Steward::with_identity(identity(s), None)).collect();
    manager
        .update(&vault(), ConfigUpdate::default().stewards(remaining), 2_100)
        .unwrap();

    let event = dist.discard_if_stale(manager.get(&vault()).unwrap());
    assert!(matches!(
        event,
        Some(DistributionEvent::Superseded { target_version: 1, undelivered: 3, .. })
    ));
    assert!(!dist.has_pending(&vault()));
    assert!(dist.retry_failed(&vault(), &manager).is_err());
}
