/// RecoveryCoordinator: runs recovery requests on the initiating device.
///
/// Pure state machine: returns actions (sends, events), the caller does the
/// I/O. Responses are keyed by steward identity and ordered by
/// `responded_at`, never by arrival order.
use std::collections::{BTreeMap, BTreeSet, HashMap};

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{KeywardError, ProtocolError, Result, ValidationError};
use crate::identity::Identity;
use crate::message::CustodyMessage;
use crate::ports::MessageChannel;
use crate::sharing::{self, ShardData};
use crate::types::{VaultId, MAX_SHARES};

use super::types::*;

pub struct RecoveryCoordinator {
    local_id: Identity,
    requests: HashMap<String, RecoveryRequest>,
}

impl RecoveryCoordinator {
    pub fn new(local_id: Identity) -> Self {
        Self {
            local_id,
            requests: HashMap::new(),
        }
    }

    pub fn get(&self, request_id: &str) -> Option<&RecoveryRequest> {
        self.requests.get(request_id)
    }

    pub fn requests(&self) -> impl Iterator<Item = &RecoveryRequest> {
        self.requests.values()
    }

    pub fn requests_for_vault<'a>(
        &'a self,
        vault_id: &'a VaultId,
    ) -> impl Iterator<Item = &'a RecoveryRequest> + 'a {
        self.requests.values().filter(move |r| &r.vault_id == vault_id)
    }

    /// Load a persisted request.
    pub fn restore(&mut self, request: RecoveryRequest) {
        self.requests.insert(request.id.clone(), request);
    }

    // ── Initiation ───────────────────────────────────────────────────────

    /// Create a request and one send action per steward.
    pub fn initiate(
        &mut self,
        params: RecoveryParams,
        now: u64,
    ) -> Result<(String, Vec<RecoveryAction>)> {
        let total = params.stewards.len();
        if params.threshold == 0 || params.threshold > total || total > MAX_SHARES {
            return Err(ValidationError::InvalidThreshold {
                threshold: params.threshold,
                total,
                max: MAX_SHARES,
            }
            .into());
        }
        let mut responses = BTreeMap::new();
        for steward in &params.stewards {
            if responses
                .insert(*steward, RecoveryResponse::pending(*steward))
                .is_some()
            {
                return Err(ValidationError::DuplicateIdentity(*steward).into());
            }
        }

        let request = RecoveryRequest {
            id: uuid::Uuid::new_v4().to_string(),
            vault_id: params.vault_id,
            initiator: self.local_id,
            created_at: now,
            status: RecoveryStatus::Pending,
            expires_at: params.expires_at,
            threshold: params.threshold,
            responses,
            delivered_to: BTreeSet::new(),
            failure: None,
        };
        info!(request = %request.id, vault = %request.vault_id, threshold = request.threshold, stewards = total, "recovery initiated");

        let mut actions = send_actions(&request, &params.stewards);
        actions.push(RecoveryAction::Event(RecoveryEvent::Initiated {
            request_id: request.id.clone(),
            vault_id: request.vault_id.clone(),
        }));
        let id = request.id.clone();
        self.requests.insert(id.clone(), request);
        Ok((id, actions))
    }

    /// Record whether the channel accepted the request for `steward`.
    pub fn record_delivery(
        &mut self,
        request_id: &str,
        steward: &Identity,
        accepted: bool,
    ) -> Result<Vec<RecoveryAction>> {
        let request = self.require_mut(request_id)?;
        if !request.responses.contains_key(steward) || request.status.is_terminal() {
            return Ok(vec![]);
        }
        if !accepted {
            warn!(request = request_id, steward = %steward.short(), "recovery request not delivered");
            return Ok(vec![]);
        }
        request.delivered_to.insert(*steward);
        if request.status == RecoveryStatus::Pending
            && request.delivered_to.len() == request.total_stewards()
        {
            request.status = RecoveryStatus::Sent;
            return Ok(vec![RecoveryAction::Event(RecoveryEvent::Sent {
                request_id: request_id.to_string(),
            })]);
        }
        Ok(vec![])
    }

    /// Resend to stewards whose copy was never accepted.
    pub fn retry_broadcast(&self, request_id: &str) -> Result<Vec<RecoveryAction>> {
        let request = self.require(request_id)?;
        if request.status.is_terminal() {
            return Ok(vec![]);
        }
        Ok(send_actions(request, &request.undelivered()))
    }

    /// Send every `SendRequest` concurrently and feed the results back.
    /// Returns how many sends the channel accepted, and the events raised
    /// by the actions and the deliveries.
    pub async fn broadcast<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &C,
        actions: Vec<RecoveryAction>,
    ) -> Result<(usize, Vec<RecoveryEvent>)> {
        let mut events = Vec::new();
        let sends: Vec<_> = actions
            .into_iter()
            .filter_map(|action| match action {
                RecoveryAction::SendRequest {
                    to,
                    request_id,
                    message,
                } => Some((to, request_id, message)),
                RecoveryAction::Event(event) => {
                    events.push(event);
                    None
                }
            })
            .collect();

        let results = join_all(sends.iter().map(|(to, _, message)| async move {
            let payload = message.seal_for(to)?;
            channel.send(to, &payload).await
        }))
        .await;

        let mut accepted = 0;
        for ((to, request_id, _), result) in sends.iter().zip(results) {
            if let Err(e) = &result {
                warn!(request = %request_id, steward = %to.short(), "recovery send failed: {e}");
            }
            accepted += usize::from(result.is_ok());
            for action in self.record_delivery(request_id, to, result.is_ok())? {
                if let RecoveryAction::Event(event) = action {
                    events.push(event);
                }
            }
        }
        Ok((accepted, events))
    }

    // ── Responses ────────────────────────────────────────────────────────

    pub fn record_response(
        &mut self,
        request_id: &str,
        steward: &Identity,
        approved: bool,
        shard: Option<ShardData>,
        responded_at: u64,
        now: u64,
    ) -> Result<ResponseOutcome> {
        let request = self.require_mut(request_id)?;
        if request.status.is_terminal() {
            debug!(request = request_id, status = %request.status, "response to closed request ignored");
            return Ok(ResponseOutcome::Ignored(IgnoreReason::Closed(request.status)));
        }
        let Some(slot) = request.responses.get(steward) else {
            debug!(request = request_id, steward = %steward.short(), "response from unknown steward ignored");
            return Ok(ResponseOutcome::Ignored(IgnoreReason::UnknownSteward));
        };
        if request.is_expired(now) {
            let expired_at = request.expires_at.unwrap_or(now);
            fail(request, RecoveryFailure::Expired { expired_at });
            return Err(ProtocolError::RecoveryExpired {
                request_id: request_id.to_string(),
            }
            .into());
        }
        if approved {
            let Some(shard) = &shard else {
                return Err(ValidationError::MissingShard { steward: *steward }.into());
            };
            shard.validate()?;
            if shard.vault_id.as_ref().is_some_and(|v| v != &request.vault_id) {
                return Err(ValidationError::InvalidShard("shard belongs to another vault".into()).into());
            }
            if shard.recipient != Some(*steward) {
                warn!(request = request_id, steward = %steward.short(), "approval carries a shard issued to someone else");
                return Err(ValidationError::InvalidShard("shard was not issued to the responder".into()).into());
            }
        }
        if slot.responded_at.is_some_and(|prev| prev > responded_at) {
            debug!(request = request_id, steward = %steward.short(), "older response ignored");
            return Ok(ResponseOutcome::Ignored(IgnoreReason::Stale));
        }

        let could_recover = request.can_recover();
        request.responses.insert(
            *steward,
            RecoveryResponse {
                steward: *steward,
                approved,
                responded_at: Some(responded_at),
                shard: if approved { shard } else { None },
                message_ref: None,
                error: None,
            },
        );
        if matches!(request.status, RecoveryStatus::Pending | RecoveryStatus::Sent) {
            request.status = RecoveryStatus::InProgress;
        }
        info!(request = request_id, steward = %steward.short(), approved, approvals = request.approved_count(), threshold = request.threshold, "recovery response");

        if request.can_recover() {
            return Ok(if could_recover {
                ResponseOutcome::Recorded
            } else {
                ResponseOutcome::ThresholdReached
            });
        }
        if request.has_failed() {
            let failure = RecoveryFailure::InsufficientApprovals {
                approved: request.approved_count(),
                denied: request.denied_count(),
                threshold: request.threshold,
            };
            fail(request, failure.clone());
            return Ok(ResponseOutcome::Failed(failure));
        }
        Ok(ResponseOutcome::Recorded)
    }

    /// Mark a steward's slot as errored, e.g. when its payload could not be used.
    pub fn record_response_error(
        &mut self,
        request_id: &str,
        steward: &Identity,
        error: impl Into<String>,
    ) -> Result<()> {
        let request = self.require_mut(request_id)?;
        if request.status.is_terminal() {
            return Ok(());
        }
        if let Some(slot) = request.responses.get_mut(steward) {
            slot.error = Some(error.into());
            slot.shard = None;
        }
        Ok(())
    }

    // ── Completion ───────────────────────────────────────────────────────

    /// Reconstruct the secret from the approved shards.
    ///
    /// A crypto failure leaves the request as it was.
    pub fn perform_recovery(&mut self, request_id: &str, now: u64) -> Result<Vec<u8>> {
        let request = self.require_mut(request_id)?;
        if request.status.is_terminal() {
            return Err(invalid_transition(request.status, RecoveryStatus::Completed));
        }
        if !request.can_recover() {
            return Err(ProtocolError::InsufficientApprovals {
                approved: request.approved_count(),
                threshold: request.threshold,
            }
            .into());
        }

        let shards = recovery_set(&request.approved_shards());
        if shards.len() < request.threshold {
            return Err(ProtocolError::InsufficientShares {
                have: shards.len(),
                need: request.threshold,
            }
            .into());
        }
        let secret = sharing::reconstruct(&shards)?;
        request.status = RecoveryStatus::Completed;
        info!(request = request_id, vault = %request.vault_id, at = now, "recovery completed");
        Ok(secret)
    }

    /// Stop processing responses. Cancelling twice is a no-op.
    /// Returns whether the status changed.
    pub fn cancel(&mut self, request_id: &str) -> Result<bool> {
        let request = self.require_mut(request_id)?;
        match request.status {
            RecoveryStatus::Cancelled => Ok(false),
            status if status.is_open() => {
                request.status = RecoveryStatus::Cancelled;
                info!(request = request_id, "recovery cancelled");
                Ok(true)
            }
            status => Err(invalid_transition(status, RecoveryStatus::Cancelled)),
        }
    }

    /// Close a finished request and drop the shards it collected.
    pub fn archive(&mut self, request_id: &str) -> Result<()> {
        let request = self.require_mut(request_id)?;
        match request.status {
            RecoveryStatus::Archived => Ok(()),
            RecoveryStatus::Completed | RecoveryStatus::Failed | RecoveryStatus::Cancelled => {
                request.status = RecoveryStatus::Archived;
                for response in request.responses.values_mut() {
                    response.shard = None;
                }
                Ok(())
            }
            status => Err(invalid_transition(status, RecoveryStatus::Archived)),
        }
    }

    /// Fail open requests past their expiry that cannot recover.
    /// Returns the ids of requests that failed.
    pub fn sweep(&mut self, now: u64) -> Vec<String> {
        let mut expired = Vec::new();
        for request in self.requests.values_mut() {
            if request.status.is_open() && request.is_expired(now) && !request.can_recover() {
                let expired_at = request.expires_at.unwrap_or(now);
                fail(request, RecoveryFailure::Expired { expired_at });
                expired.push(request.id.clone());
            }
        }
        expired
    }

    fn require(&self, request_id: &str) -> Result<&RecoveryRequest> {
        self.requests
            .get(request_id)
            .ok_or_else(|| KeywardError::not_found("recovery request", request_id))
    }

    fn require_mut(&mut self, request_id: &str) -> Result<&mut RecoveryRequest> {
        self.requests
            .get_mut(request_id)
            .ok_or_else(|| KeywardError::not_found("recovery request", request_id))
    }
}

fn fail(request: &mut RecoveryRequest, failure: RecoveryFailure) {
    warn!(request = %request.id, %failure, "recovery failed");
    request.status = RecoveryStatus::Failed;
    request.failure = Some(failure);
}

fn invalid_transition(from: RecoveryStatus, to: RecoveryStatus) -> KeywardError {
    ProtocolError::InvalidTransition {
        entity: "recovery request",
        from: from.to_string(),
        to: to.to_string(),
    }
    .into()
}

fn send_actions(request: &RecoveryRequest, stewards: &[Identity]) -> Vec<RecoveryAction> {
    let message = request.request_message();
    stewards
        .iter()
        .map(|to| RecoveryAction::SendRequest {
            to: *to,
            request_id: request.id.clone(),
            message: message.clone(),
        })
        .collect()
}

/// Distinct-index shards of the newest distribution version present.
fn recovery_set(shards: &[&ShardData]) -> Vec<ShardData> {
    let Some(newest) = shards.iter().map(|s| s.distribution_version).max() else {
        return vec![];
    };
    let mut seen = BTreeSet::new();
    shards
        .iter()
        .filter(|s| s.distribution_version == newest)
        .filter(|s| seen.insert(s.shard_index))
        .map(|s| (*s).clone())
        .collect()
}

/// Steward side: answer a recovery request with the shard held for the vault.
pub fn respond(
    prompt: &RecoveryPrompt,
    local: &Identity,
    approved: bool,
    held: Option<&ShardData>,
    now: u64,
) -> Result<CustodyMessage> {
    let shard = if approved {
        let shard = held.ok_or(ValidationError::MissingShard { steward: *local })?;
        if shard.vault_id.as_ref().is_some_and(|v| v != &prompt.vault_id) {
            return Err(ValidationError::InvalidShard("held shard belongs to another vault".into()).into());
        }
        Some(shard.clone())
    } else {
        None
    };
    Ok(CustodyMessage::RecoveryResponse {
        request_id: prompt.request_id.clone(),
        vault_id: prompt.vault_id.clone(),
        approved,
        shard,
        responded_at: now,
    })
}
