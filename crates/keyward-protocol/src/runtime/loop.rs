/// The custody runtime event loop.
///
/// A single async task that owns all device state and multiplexes over
/// inbound channel messages, application commands, and sweep timers.
use tokio::sync::mpsc;

use crate::ports::MessageChannel;
use crate::types::now_ms;

use super::state::RuntimeState;
use super::{RuntimeCommand, RuntimeConfig};

pub(super) async fn runtime_loop<C: MessageChannel>(
    mut state: RuntimeState,
    mut channel: C,
    config: RuntimeConfig,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
) {
    let mut recovery_sweep = tokio::time::interval(config.recovery_sweep_interval);
    let mut file_sweep = tokio::time::interval(config.file_sweep_interval);

    // Skip the immediate first tick on all intervals
    recovery_sweep.tick().await;
    file_sweep.tick().await;

    let mut inbound_open = true;

    loop {
        tokio::select! {
            // ── 1. Inbound custody messages ─────────────────
            inbound = channel.recv(), if inbound_open => {
                match inbound {
                    Some(inbound) => state.handle_inbound(&channel, inbound).await,
                    None => {
                        tracing::warn!("message channel closed, inbound processing stopped");
                        inbound_open = false;
                    }
                }
            }

            // ── 2. Application commands ─────────────────────
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::info!("all runtime handles dropped, shutting down");
                    break;
                };
                if !handle_command(&mut state, &channel, cmd).await {
                    tracing::info!("runtime shutdown requested");
                    break;
                }
            }

            // ── 3. Sweeps ───────────────────────────────────
            _ = recovery_sweep.tick() => {
                state.sweep_recovery(now_ms());
            }
            _ = file_sweep.tick() => {
                state.sweep_files(now_ms());
            }
        }
    }
}

/// Run one command. Returns false on shutdown.
async fn handle_command<C: MessageChannel>(
    state: &mut RuntimeState,
    channel: &C,
    cmd: RuntimeCommand,
) -> bool {
    match cmd {
        // ── Backup configuration ────────────────────
        RuntimeCommand::CreateBackupConfig { config, reply } => {
            let _ = reply.send(state.create_backup_config(config));
        }
        RuntimeCommand::UpdateBackupConfig {
            vault_id,
            update,
            reply,
        } => {
            let _ = reply.send(state.update_backup_config(&vault_id, update));
        }
        RuntimeCommand::InviteSteward {
            vault_id,
            name,
            reply,
        } => {
            let _ = reply.send(state.invite_steward(&vault_id, name));
        }
        RuntimeCommand::AcceptInvitation {
            vault_id,
            invite_code,
            identity,
            reply,
        } => {
            let _ = reply.send(state.accept_invitation(&vault_id, &invite_code, identity));
        }
        RuntimeCommand::RevokeSteward {
            vault_id,
            steward_id,
            reply,
        } => {
            let _ = reply.send(state.revoke_steward(&vault_id, &steward_id));
        }
        RuntimeCommand::ContentChanged {
            vault_id,
            content_hash,
            reply,
        } => {
            let _ = reply.send(state.content_changed(&vault_id, content_hash));
        }
        RuntimeCommand::Deactivate { vault_id, reply } => {
            let _ = reply.send(state.deactivate(&vault_id));
        }

        // ── Distribution ────────────────────────────
        RuntimeCommand::Distribute {
            vault_id,
            secret,
            reply,
        } => {
            let result = state.distribute(channel, &vault_id, &secret).await;
            let _ = reply.send(result);
        }
        RuntimeCommand::RetryDistribution { vault_id, reply } => {
            let result = state.retry_distribution(channel, &vault_id).await;
            let _ = reply.send(result);
        }
        RuntimeCommand::AbandonDistribution { vault_id, reply } => {
            let _ = reply.send(state.abandon_distribution(&vault_id));
        }

        // ── Recovery ────────────────────────────────
        RuntimeCommand::InitiateRecovery {
            vault_id,
            params,
            reply,
        } => {
            let result = state.initiate_recovery(channel, &vault_id, params).await;
            let _ = reply.send(result);
        }
        RuntimeCommand::RetryRecoveryBroadcast { request_id, reply } => {
            let result = state.retry_recovery_broadcast(channel, &request_id).await;
            let _ = reply.send(result);
        }
        RuntimeCommand::RecordResponse {
            request_id,
            steward,
            approved,
            shard,
            responded_at,
            reply,
        } => {
            let result = state.record_response(
                &request_id,
                &steward,
                approved,
                shard.map(|s| *s),
                responded_at,
            );
            let _ = reply.send(result);
        }
        RuntimeCommand::PerformRecovery { request_id, reply } => {
            let _ = reply.send(state.perform_recovery(&request_id));
        }
        RuntimeCommand::CancelRecovery { request_id, reply } => {
            let _ = reply.send(state.cancel_recovery(&request_id));
        }
        RuntimeCommand::ArchiveRecovery { request_id, reply } => {
            let _ = reply.send(state.archive_recovery(&request_id));
        }
        RuntimeCommand::RespondToRecovery {
            request_id,
            approved,
            reply,
        } => {
            let result = state
                .respond_to_recovery(channel, &request_id, approved)
                .await;
            let _ = reply.send(result);
        }

        // ── Files ───────────────────────────────────
        RuntimeCommand::UploadFile {
            vault_id,
            name,
            data,
            reply,
        } => {
            let result = state.upload_file(&vault_id, name, &data).await;
            let _ = reply.send(result);
        }
        RuntimeCommand::ConfirmFileDownload {
            vault_id,
            steward,
            downloaded_at,
            reply,
        } => {
            let _ = reply.send(state.confirm_file_download(&vault_id, &steward, downloaded_at));
        }
        RuntimeCommand::PurgeBlob { vault_id, reply } => {
            let result = state.purge_blob(&vault_id).await;
            let _ = reply.send(result);
        }

        RuntimeCommand::Query { query, reply } => {
            let _ = reply.send(state.query(query));
        }
        RuntimeCommand::Shutdown => return false,
    }
    true
}
