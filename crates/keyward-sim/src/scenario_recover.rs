/// Recovery scenario: distribute, then ask every steward for its share.
///
/// The second steward denies; everyone else approves. Recovery must succeed
/// as long as the approvals still reach the threshold.
use std::time::Instant;

use keyward_protocol::{RecoveryStatus, RuntimeEvent};

use crate::scenario_common::{
    poll_until, timed_step_async, wait_event, Group, GroupShape, ScenarioResult,
};
use crate::scenario_distribute::{settled, stewards_store};

const SECRET: &[u8] = b"correct horse battery staple";

pub async fn run(shape: GroupShape) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("recover");
    let start = Instant::now();
    let mut group = Group::spawn(shape, "vault-recover")?;
    let vault = &group.vault_id.clone();
    let owner = &group.owner.handle.clone();

    // ── Distribute ──────────────────────────────────────────────
    let config = group.new_config(shape.threshold);
    let step = timed_step_async("distribute", || async move {
        owner
            .create_backup_config(config)
            .await
            .map_err(|e| e.to_string())?;
        let outcome = owner
            .distribute(vault.clone(), SECRET.to_vec())
            .await
            .map_err(|e| e.to_string())?;
        if outcome.completed {
            Ok(String::new())
        } else {
            Err("distribution incomplete".into())
        }
    })
    .await;
    if !result.check(step) {
        group.shutdown().await;
        result.finalize(start);
        return Ok(result);
    }
    let stewards = &mut group.stewards;
    result.add(timed_step_async("stewards store", || stewards_store(stewards, 1)).await);
    result.add(timed_step_async("owner ready", || settled(owner, vault)).await);

    // ── Request ─────────────────────────────────────────────────
    let mut request_id = String::new();
    let slot = &mut request_id;
    let step = timed_step_async("initiate recovery", || async move {
        *slot = owner
            .initiate_recovery(vault.clone())
            .await
            .map_err(|e| e.to_string())?;
        Ok(slot.clone())
    })
    .await;
    if !result.check(step) {
        group.shutdown().await;
        result.finalize(start);
        return Ok(result);
    }
    let request_id = &request_id;

    // ── Responses ───────────────────────────────────────────────
    let approvals_expected = shape.stewards - usize::from(shape.stewards > 1);
    let stewards = &mut group.stewards;
    let step = timed_step_async("stewards respond", || async move {
        for (i, steward) in stewards.iter_mut().enumerate() {
            let prompt = wait_event(&mut steward.events, |e| match e {
                RuntimeEvent::RecoveryRequested(prompt) => Some(prompt.clone()),
                _ => None,
            })
            .await
            .map_err(|e| format!("{}: {e}", steward.name))?;
            if &prompt.request_id != request_id {
                return Err(format!("{} got request {}", steward.name, prompt.request_id));
            }
            let approve = i != 1;
            steward
                .handle
                .respond_to_recovery(request_id.clone(), approve)
                .await
                .map_err(|e| format!("{}: {e}", steward.name))?;
        }
        Ok(format!("{approvals_expected} approve"))
    })
    .await;
    result.add(step);

    let step = timed_step_async("responses collected", || async move {
        poll_until(|| async move {
            owner
                .recovery_request(request_id.clone())
                .await
                .ok()
                .flatten()
                .is_some_and(|r| r.responded_count() == shape.stewards || r.status.is_terminal())
        })
        .await?;
        let request = owner
            .recovery_request(request_id.clone())
            .await
            .map_err(|e| e.to_string())?
            .ok_or("request vanished")?;
        Ok(format!(
            "{} approved, {} denied, status {}",
            request.approved_count(),
            request.denied_count(),
            request.status
        ))
    })
    .await;
    result.add(step);

    let expect_success = approvals_expected >= shape.threshold;
    let step = timed_step_async("perform recovery", || async move {
        let recovered = owner.perform_recovery(request_id.clone()).await;
        match (recovered, expect_success) {
            (Ok(secret), true) if secret.as_slice() == SECRET => Ok("secret matches".into()),
            (Ok(_), true) => Err("recovered the wrong secret".into()),
            (Ok(_), false) => Err("recovered without enough approvals".into()),
            (Err(e), true) => Err(e.to_string()),
            (Err(e), false) => Ok(format!("refused as expected: {e}")),
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("archive", || async move {
        if !expect_success {
            return Ok("skipped".into());
        }
        owner
            .archive_recovery(request_id.clone())
            .await
            .map_err(|e| e.to_string())?;
        let status = owner
            .recovery_request(request_id.clone())
            .await
            .map_err(|e| e.to_string())?
            .map(|r| r.status);
        match status {
            Some(RecoveryStatus::Archived) => Ok(String::new()),
            other => Err(format!("status {other:?}")),
        }
    })
    .await;
    result.add(step);

    group.shutdown().await;
    result.finalize(start);
    Ok(result)
}
