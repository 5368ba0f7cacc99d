/// FileDistributionTracker: who fetched an uploaded vault blob, and when.
///
/// Each steward gets a fixed window after the upload to download the blob.
/// The blob may be deleted from the store once every steward has either
/// downloaded it or run out of time.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{KeywardError, ProtocolError, Result, ValidationError};
use crate::identity::Identity;
use crate::types::VaultId;

/// How long stewards have to download an uploaded blob (48 hours).
pub const DISTRIBUTION_WINDOW_MS: u64 = 48 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    Pending,
    Downloaded,
    MissedWindow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDistributionStatus {
    pub vault_id: VaultId,
    pub steward: Identity,
    pub state: FileState,
    pub uploaded_at: u64,
    pub downloaded_at: Option<u64>,
}

impl FileDistributionStatus {
    pub fn window_closes_at(&self) -> u64 {
        self.uploaded_at.saturating_add(DISTRIBUTION_WINDOW_MS)
    }

    pub fn window_elapsed(&self, now: u64) -> bool {
        now >= self.window_closes_at()
    }

    /// Nothing more will happen to this row.
    pub fn is_resolved(&self, now: u64) -> bool {
        match self.state {
            FileState::Downloaded | FileState::MissedWindow => true,
            FileState::Pending => self.window_elapsed(now),
        }
    }
}

/// The blob currently distributed for a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedBlob {
    pub url: String,
    pub content_hash: String,
    pub uploaded_at: u64,
}

#[derive(Debug, Default)]
pub struct FileDistributionTracker {
    rows: BTreeMap<(VaultId, Identity), FileDistributionStatus>,
    blobs: HashMap<VaultId, UploadedBlob>,
}

impl FileDistributionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a window for every steward. A new upload for the same vault
    /// replaces the previous blob and its rows; the replaced blob is
    /// returned so the caller can remove it from the blob store.
    pub fn register_upload(
        &mut self,
        vault_id: &VaultId,
        blob_url: impl Into<String>,
        content_hash: impl Into<String>,
        stewards: &[Identity],
        uploaded_at: u64,
    ) -> Option<UploadedBlob> {
        self.rows.retain(|(v, _), _| v != vault_id);
        for steward in stewards {
            self.rows.insert(
                (vault_id.clone(), *steward),
                FileDistributionStatus {
                    vault_id: vault_id.clone(),
                    steward: *steward,
                    state: FileState::Pending,
                    uploaded_at,
                    downloaded_at: None,
                },
            );
        }
        let blob = UploadedBlob {
            url: blob_url.into(),
            content_hash: content_hash.into(),
            uploaded_at,
        };
        info!(vault = %vault_id, url = %blob.url, stewards = stewards.len(), "blob upload registered");
        self.blobs.insert(vault_id.clone(), blob)
    }

    /// Record a download. Returns false when it was already recorded.
    pub fn confirm_download(
        &mut self,
        vault_id: &VaultId,
        steward: &Identity,
        downloaded_at: u64,
    ) -> Result<bool> {
        let row = self
            .rows
            .get_mut(&(vault_id.clone(), *steward))
            .ok_or_else(|| KeywardError::not_found("file distribution", format!("{vault_id}/{}", steward.short())))?;

        match row.state {
            FileState::Downloaded => return Ok(false),
            FileState::MissedWindow => return Err(window_closed(vault_id, steward)),
            FileState::Pending => {}
        }
        if downloaded_at < row.uploaded_at {
            return Err(ValidationError::DownloadBeforeUpload {
                uploaded_at: row.uploaded_at,
                downloaded_at,
            }
            .into());
        }
        if row.window_elapsed(downloaded_at) {
            row.state = FileState::MissedWindow;
            return Err(window_closed(vault_id, steward));
        }
        row.state = FileState::Downloaded;
        row.downloaded_at = Some(downloaded_at);
        debug!(vault = %vault_id, steward = %steward.short(), "blob downloaded");
        Ok(true)
    }

    /// Close the window on pending rows that ran out of time.
    pub fn sweep(&mut self, now: u64) -> Vec<(VaultId, Identity)> {
        let mut missed = Vec::new();
        for row in self.rows.values_mut() {
            if row.state == FileState::Pending && row.window_elapsed(now) {
                row.state = FileState::MissedWindow;
                missed.push((row.vault_id.clone(), row.steward));
            }
        }
        if !missed.is_empty() {
            info!(missed = missed.len(), "distribution windows closed");
        }
        missed
    }

    pub fn can_delete_from_blob_store(&self, vault_id: &VaultId, now: u64) -> bool {
        let mut rows = self.statuses(vault_id).peekable();
        rows.peek().is_some() && rows.all(|r| r.is_resolved(now))
    }

    pub fn blob_for(&self, vault_id: &VaultId) -> Option<&UploadedBlob> {
        self.blobs.get(vault_id)
    }

    pub fn statuses<'a>(
        &'a self,
        vault_id: &'a VaultId,
    ) -> impl Iterator<Item = &'a FileDistributionStatus> + 'a {
        self.rows.values().filter(move |r| &r.vault_id == vault_id)
    }

    pub fn status(&self, vault_id: &VaultId, steward: &Identity) -> Option<&FileDistributionStatus> {
        self.rows.get(&(vault_id.clone(), *steward))
    }

    /// Drop every row of a vault once its blob is purged.
    pub fn forget(&mut self, vault_id: &VaultId) -> Option<UploadedBlob> {
        self.rows.retain(|(v, _), _| v != vault_id);
        self.blobs.remove(vault_id)
    }
}

fn window_closed(vault_id: &VaultId, steward: &Identity) -> KeywardError {
    ProtocolError::WindowClosed {
        vault_id: vault_id.clone(),
        steward: *steward,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyIdentity;

    const HOUR: u64 = 60 * 60 * 1000;

    fn identity(seed: u8) -> Identity {
        KeyIdentity::from_seed([seed; 32]).identity()
    }

    fn tracker(uploaded_at: u64) -> (FileDistributionTracker, VaultId) {
        let vault = VaultId::from("files");
        let mut t = FileDistributionTracker::new();
        t.register_upload(&vault, "mem://blob/1", "abcd", &[identity(1), identity(2)], uploaded_at);
        (t, vault)
    }

    #[test]
    fn download_then_missed_window() {
        let t0 = 1_000_000;
        let (mut t, vault) = tracker(t0);
        assert!(t.confirm_download(&vault, &identity(1), t0 + 10 * HOUR).unwrap());
        assert!(!t.can_delete_from_blob_store(&vault, t0 + 10 * HOUR));

        assert!(t.sweep(t0 + 48 * HOUR - 1).is_empty());
        assert_eq!(t.sweep(t0 + 48 * HOUR), vec![(vault.clone(), identity(2))]);
        assert_eq!(
            t.status(&vault, &identity(2)).unwrap().state,
            FileState::MissedWindow
        );
        assert!(t.can_delete_from_blob_store(&vault, t0 + 48 * HOUR));
    }

    #[test]
    fn elapsed_pending_rows_allow_deletion_before_sweep() {
        let (t, vault) = tracker(0);
        assert!(!t.can_delete_from_blob_store(&vault, 48 * HOUR - 1));
        assert!(t.can_delete_from_blob_store(&vault, 48 * HOUR));
    }

    #[test]
    fn download_before_upload_rejected() {
        let (mut t, vault) = tracker(5_000);
        let err = t.confirm_download(&vault, &identity(1), 4_999).unwrap_err();
        assert!(matches!(
            err,
            KeywardError::Validation(ValidationError::DownloadBeforeUpload { .. })
        ));
        assert_eq!(t.status(&vault, &identity(1)).unwrap().state, FileState::Pending);
    }

    #[test]
    fn late_download_closes_window() {
        let (mut t, vault) = tracker(0);
        let err = t.confirm_download(&vault, &identity(1), 48 * HOUR).unwrap_err();
        assert!(matches!(
            err,
            KeywardError::Protocol(ProtocolError::WindowClosed { .. })
        ));
        assert!(t.confirm_download(&vault, &identity(1), HOUR).is_err());
    }

    #[test]
    fn confirm_is_idempotent() {
        let (mut t, vault) = tracker(0);
        assert!(t.confirm_download(&vault, &identity(1), HOUR).unwrap());
        assert!(!t.confirm_download(&vault, &identity(1), 2 * HOUR).unwrap());
        assert_eq!(
            t.status(&vault, &identity(1)).unwrap().downloaded_at,
            Some(HOUR)
        );
    }

    #[test]
    fn unknown_vault_and_forget() {
        let (mut t, vault) = tracker(0);
        assert!(!t.can_delete_from_blob_store(&VaultId::from("other"), 0));
        assert!(t.confirm_download(&vault, &identity(7), 1).is_err());

        let blob = t.forget(&vault).unwrap();
        assert_eq!(blob.url, "mem://blob/1");
        assert_eq!(t.statuses(&vault).count(), 0);
        assert!(t.blob_for(&vault).is_none());
    }

    #[test]
    fn reupload_resets_rows() {
        let (mut t, vault) = tracker(0);
        t.confirm_download(&vault, &identity(1), HOUR).unwrap();
        let replaced = t
            .register_upload(&vault, "mem://blob/2", "ef", &[identity(1)], 2 * HOUR)
            .unwrap();
        assert_eq!(replaced.url, "mem://blob/1");
        assert_eq!(t.statuses(&vault).count(), 1);
        assert_eq!(t.status(&vault, &identity(1)).unwrap().state, FileState::Pending);
        assert_eq!(t.blob_for(&vault).unwrap().url, "mem://blob/2");
    }
}
