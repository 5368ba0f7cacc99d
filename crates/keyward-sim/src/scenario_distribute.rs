/// Distribution scenario: owner splits a vault key across live stewards,
/// waits for acknowledgments, then changes content and redistributes.
///
/// Steps:
/// 1. Create the backup config
/// 2. Distribute version 1 and wait until every steward holds it
/// 3. Mark content changed and check redistribution is needed
/// 4. Distribute version 2 and wait again
use std::time::Instant;

use keyward_protocol::{RuntimeEvent, RuntimeHandle, VaultId};

use crate::scenario_common::{
    poll_until, timed_step_async, wait_event, Device, Group, GroupShape, ScenarioResult,
};

pub async fn run(shape: GroupShape) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("distribute");
    let start = Instant::now();
    let mut group = Group::spawn(shape, "vault-distribute")?;
    let vault = &group.vault_id.clone();
    let owner = &group.owner.handle.clone();

    // ── Configure ───────────────────────────────────────────────
    let config = group.new_config(shape.threshold);
    let step = timed_step_async("create backup config", || async move {
        let config = owner
            .create_backup_config(config)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!(
            "{} of {} stewards, status {}",
            config.threshold, config.total_keys, config.status
        ))
    })
    .await;
    if !result.check(step) {
        group.shutdown().await;
        result.finalize(start);
        return Ok(result);
    }

    for version in 1..=2u32 {
        if version == 2 {
            let step = timed_step_async("content changed", || async move {
                let changed = owner
                    .content_changed(vault.clone(), Some("content-v2".into()))
                    .await
                    .map_err(|e| e.to_string())?;
                let needed = owner
                    .needs_redistribution(vault.clone())
                    .await
                    .map_err(|e| e.to_string())?;
                match (changed, needed) {
                    (true, true) => Ok("redistribution needed".into()),
                    other => Err(format!("changed/needed = {other:?}")),
                }
            })
            .await;
            result.add(step);
        }

        let step = timed_step_async(&format!("distribute version {version}"), || async move {
            let outcome = owner
                .distribute(vault.clone(), format!("vault key v{version}").into_bytes())
                .await
                .map_err(|e| e.to_string())?;
            if !outcome.completed {
                return Err(format!("{} shard(s) not accepted", outcome.failed().count()));
            }
            Ok(format!("recorded version {:?}", outcome.new_version))
        })
        .await;
        if !result.check(step) {
            break;
        }

        let stewards = &mut group.stewards;
        let step = timed_step_async(&format!("stewards store version {version}"), || {
            stewards_store(stewards, version)
        })
        .await;
        result.add(step);

        let step = timed_step_async(&format!("every steward acknowledged {version}"), || {
            settled(owner, vault)
        })
        .await;
        result.add(step);
    }

    group.shutdown().await;
    result.finalize(start);
    Ok(result)
}

pub(crate) async fn stewards_store(stewards: &mut [Device], version: u32) -> Result<String, String> {
    for steward in stewards.iter_mut() {
        let held = wait_event(&mut steward.events, |e| match e {
            RuntimeEvent::ShardReceived { version, .. } => Some(*version),
            _ => None,
        })
        .await
        .map_err(|e| format!("{}: {e}", steward.name))?;
        if held != version {
            return Err(format!("{} stored version {held}", steward.name));
        }
    }
    Ok(format!("{} stewards", stewards.len()))
}

/// Ready, and no steward is behind the current version.
pub(crate) async fn settled(owner: &RuntimeHandle, vault: &VaultId) -> Result<String, String> {
    poll_until(|| async move {
        let ready = owner.is_ready(vault.clone()).await.unwrap_or(false);
        let behind = owner
            .has_version_mismatch(vault.clone())
            .await
            .unwrap_or(true);
        ready && !behind
    })
    .await?;
    Ok(String::new())
}
