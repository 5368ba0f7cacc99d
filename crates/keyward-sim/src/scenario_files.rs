/// File distribution scenario.
///
/// Part one drives the tracker on a simulated clock: one steward downloads
/// after 10 hours, the others miss the 48 hour window. Part two runs the
/// same flow live: the owner uploads a blob, stewards fetch it from their
/// shard, and the owner purges it once everyone is accounted for.
use std::time::Instant;

use keyward_protocol::{
    FileDistributionTracker, FileState, KeyIdentity, RuntimeEvent, VaultId,
    DISTRIBUTION_WINDOW_MS,
};

use crate::scenario_common::{
    poll_until, timed_step, timed_step_async, wait_event, Group, GroupShape, ScenarioResult,
};

const HOUR_MS: u64 = 60 * 60 * 1000;

pub async fn run(shape: GroupShape) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("files");
    let start = Instant::now();

    // ── Simulated clock ─────────────────────────────────────────
    let step = timed_step("window on a simulated clock", || simulated_window(shape.stewards));
    result.add(step);

    // ── Live runtimes ───────────────────────────────────────────
    let mut group = Group::spawn(shape, "vault-files")?;
    let vault = &group.vault_id.clone();
    let owner = &group.owner.handle.clone();
    let blobs = &group.blobs.clone();
    let config = group.new_config(shape.threshold);

    let mut blob_url = String::new();
    let slot = &mut blob_url;
    let step = timed_step_async("upload and distribute", || async move {
        owner
            .create_backup_config(config)
            .await
            .map_err(|e| e.to_string())?;
        let blob = owner
            .upload_file(vault.clone(), "vault.enc".into(), vec![0x5a; 4096])
            .await
            .map_err(|e| e.to_string())?;
        *slot = blob.url.clone();
        let outcome = owner
            .distribute(vault.clone(), b"file scenario key".to_vec())
            .await
            .map_err(|e| e.to_string())?;
        if !outcome.completed {
            return Err("distribution incomplete".into());
        }
        Ok(blob.url)
    })
    .await;
    if !result.check(step) {
        group.shutdown().await;
        result.finalize(start);
        return Ok(result);
    }
    let blob_url = &blob_url;

    let stewards = &mut group.stewards;
    let step = timed_step_async("stewards fetch the blob", || async move {
        for steward in stewards.iter_mut() {
            let size = wait_event(&mut steward.events, |e| match e {
                RuntimeEvent::BlobRetrieved { url, size, .. } if url == blob_url => Some(*size),
                _ => None,
            })
            .await
            .map_err(|e| format!("{}: {e}", steward.name))?;
            if size != 4096 {
                return Err(format!("{} fetched {size} bytes", steward.name));
            }
        }
        Ok(String::new())
    })
    .await;
    result.add(step);

    let step = timed_step_async("purge once resolved", || async move {
        poll_until(|| async move {
            owner
                .can_delete_from_blob_store(vault.clone())
                .await
                .unwrap_or(false)
        })
        .await?;
        let purged = owner
            .purge_blob(vault.clone())
            .await
            .map_err(|e| e.to_string())?;
        match (purged, blobs.contains(blob_url)) {
            (true, false) => Ok(String::new()),
            other => Err(format!("purged/still stored = {other:?}")),
        }
    })
    .await;
    result.add(step);

    group.shutdown().await;
    result.finalize(start);
    Ok(result)
}

fn simulated_window(stewards: usize) -> Result<String, String> {
    let vault = VaultId::from("vault-simulated");
    let ids: Vec<_> = (0..stewards)
        .map(|i| KeyIdentity::from_seed([i as u8 + 2; 32]).identity())
        .collect();
    let Some((first, rest)) = ids.split_first() else {
        return Err("no stewards".into());
    };
    let mut tracker = FileDistributionTracker::new();
    let t0 = 1_700_000_000_000;
    tracker.register_upload(&vault, "mem://simulated", "00", &ids, t0);

    tracker
        .confirm_download(&vault, first, t0 + 10 * HOUR_MS)
        .map_err(|e| e.to_string())?;
    if !rest.is_empty() && tracker.can_delete_from_blob_store(&vault, t0 + 10 * HOUR_MS) {
        return Err("deletable before the window closed".into());
    }

    let missed = tracker.sweep(t0 + DISTRIBUTION_WINDOW_MS);
    if missed.len() != rest.len() {
        return Err(format!("{} missed, expected {}", missed.len(), rest.len()));
    }
    let all_missed = rest.iter().all(|id| {
        tracker
            .status(&vault, id)
            .is_some_and(|s| s.state == FileState::MissedWindow)
    });
    if !all_missed {
        return Err("a late steward is not marked missed".into());
    }
    if !tracker.can_delete_from_blob_store(&vault, t0 + DISTRIBUTION_WINDOW_MS) {
        return Err("not deletable after every steward resolved".into());
    }
    Ok(format!("1 downloaded, {} missed", rest.len()))
}
