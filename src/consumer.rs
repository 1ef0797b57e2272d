use std::path::PathBuf;

use anyhow::Result;

use crate::hash::{self, FileMetadata};
use crate::local_state::{LocalState, SyncActionType, SyncStatus};
use crate::permission::PermissionTree;
use crate::queue::SyncQueueItem;
use crate::rsync;
use crate::sync_client::{SyftClientError, SyncClient};

/// Default ceiling on file size the consumer will push or pull, in megabytes.
/// Oversized items are rejected locally before any network call.
pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalAction {
    Noop,
    CreateLocal,
    ModifyLocal,
    DeleteLocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAction {
    Noop,
    CreateRemote,
    ModifyRemote,
    DeleteRemote,
}

/// Given the triad `(current_local, previous_synced, current_remote)`, decides what
/// to do locally and what to do remotely to bring the two sides back into sync.
pub fn decide(
    current_local: &Option<FileMetadata>,
    previous_synced: &Option<FileMetadata>,
    current_remote: &Option<FileMetadata>,
) -> (LocalAction, RemoteAction) {
    let local_modified = current_local != previous_synced;
    let remote_modified = previous_synced != current_remote;
    let in_sync = current_local == current_remote;

    if in_sync {
        return (LocalAction::Noop, RemoteAction::Noop);
    }

    if local_modified && remote_modified {
        // Conflict: the server's copy was reached first, so it wins; the local copy
        // is overwritten with whatever the server has.
        return (
            local_action_to_reach(current_remote, current_local),
            RemoteAction::Noop,
        );
    }

    if local_modified {
        return (
            LocalAction::Noop,
            remote_action_to_reach(current_local, current_remote),
        );
    }

    if remote_modified {
        return (
            local_action_to_reach(current_remote, current_local),
            RemoteAction::Noop,
        );
    }

    (LocalAction::Noop, RemoteAction::Noop)
}

fn local_action_to_reach(
    target: &Option<FileMetadata>,
    current: &Option<FileMetadata>,
) -> LocalAction {
    match (current, target) {
        (None, Some(_)) => LocalAction::CreateLocal,
        (Some(_), None) => LocalAction::DeleteLocal,
        (Some(_), Some(_)) => LocalAction::ModifyLocal,
        (None, None) => LocalAction::Noop,
    }
}

fn remote_action_to_reach(
    target: &Option<FileMetadata>,
    current: &Option<FileMetadata>,
) -> RemoteAction {
    match (current, target) {
        (None, Some(_)) => RemoteAction::CreateRemote,
        (Some(_), None) => RemoteAction::DeleteRemote,
        (Some(_), Some(_)) => RemoteAction::ModifyRemote,
        (None, None) => RemoteAction::Noop,
    }
}

/// Drains the priority queue, computing and executing the local/remote decision for
/// each item.
pub struct Consumer<'a> {
    client: &'a SyncClient,
    local_state: &'a LocalState,
    datasites_dir: PathBuf,
    own_email: String,
    max_file_size_mb: u64,
}

impl<'a> Consumer<'a> {
    pub fn new(
        client: &'a SyncClient,
        local_state: &'a LocalState,
        datasites_dir: PathBuf,
        own_email: String,
    ) -> Self {
        Self {
            client,
            local_state,
            datasites_dir,
            own_email,
            max_file_size_mb: DEFAULT_MAX_FILE_SIZE_MB,
        }
    }

    pub fn with_max_file_size_mb(mut self, mb: u64) -> Self {
        self.max_file_size_mb = mb;
        self
    }

    pub async fn process_item(&self, item: SyncQueueItem) {
        let path = item.change.path;
        if let Err(err) = self
            .local_state
            .insert_status_info(&path, SyncStatus::InProgress, None, None)
        {
            crate::logging::error(format!("consumer: failed to mark {} in-progress: {}", path, err));
        }

        if let Err(err) = self.process_path(&path).await {
            crate::logging::error(format!("consumer: {} failed: {}", path, err));
            let _ = self.local_state.insert_status_info(
                &path,
                SyncStatus::Error,
                None,
                Some(err.to_string()),
            );
        }
    }

    async fn process_path(&self, path: &str) -> Result<()> {
        if self.reject_if_permission_denied(path)? {
            return Ok(());
        }

        let abs_path = hash::from_posix_rel_path(&self.datasites_dir, path);
        let current_local = read_local_metadata(&abs_path, path)?;
        let previous_synced = self.local_state.get_state(path);
        let current_remote = self.client.get_metadata(path).await?;

        if self.reject_if_oversize(path, &current_local, &current_remote)? {
            return Ok(());
        }

        let (local_action, remote_action) = decide(&current_local, &previous_synced, &current_remote);
        let effective_remote_action = if remote_action == RemoteAction::Noop && local_action == LocalAction::Noop
        {
            remote_action_between(&current_local, &current_remote, &previous_synced)
        } else {
            remote_action
        };

        match local_action {
            LocalAction::Noop => {}
            LocalAction::CreateLocal => self.pull_create(path, &abs_path).await?,
            LocalAction::ModifyLocal => self.pull_modify(path, &abs_path, &current_local).await?,
            LocalAction::DeleteLocal => self.pull_delete(path, &abs_path)?,
        }

        match effective_remote_action {
            RemoteAction::Noop => {}
            RemoteAction::CreateRemote => self.push_create(path, &abs_path).await?,
            RemoteAction::ModifyRemote => self.push_modify(path, &abs_path, &current_remote).await?,
            RemoteAction::DeleteRemote => self.push_delete(path).await?,
        }

        if local_action == LocalAction::Noop && effective_remote_action == RemoteAction::Noop {
            if let Some(meta) = &current_local {
                self.local_state
                    .insert_synced_file(path, meta.clone(), SyncActionType::Noop)?;
            }
        }

        Ok(())
    }

    /// Checks the acting user's effective access against the permission tree as known
    /// locally (the last copy of `_.syftperm` synced down from the server), before
    /// making any network call for this path. A user with neither read nor write
    /// access anywhere on the path's ancestor chain can be rejected outright; finer
    /// distinctions (e.g. read-only access when a push was actually needed) are still
    /// caught by the server's own 403 response in `is_rejectable`.
    fn reject_if_permission_denied(&self, path: &str) -> Result<bool> {
        let (email, rel) = split_datasite_path(path);
        if email == self.own_email {
            return Ok(false);
        }
        let tree = PermissionTree::load(&self.datasites_dir.join(email))?;
        let eff = tree.effective(rel, &self.own_email);
        if eff.read || eff.write {
            return Ok(false);
        }
        self.local_state.insert_status_info(
            path,
            SyncStatus::Rejected,
            None,
            Some(format!("{} has no access to {}", self.own_email, path)),
        )?;
        Ok(true)
    }

    fn reject_if_oversize(
        &self,
        path: &str,
        current_local: &Option<FileMetadata>,
        current_remote: &Option<FileMetadata>,
    ) -> Result<bool> {
        let ceiling = self.max_file_size_mb * 1024 * 1024;
        let oversize = current_local.as_ref().map(|m| m.size > ceiling).unwrap_or(false)
            || current_remote.as_ref().map(|m| m.size > ceiling).unwrap_or(false);
        if oversize {
            self.local_state.insert_status_info(
                path,
                SyncStatus::Rejected,
                None,
                Some(format!(
                    "file exceeds the {} MB size limit",
                    self.max_file_size_mb
                )),
            )?;
        }
        Ok(oversize)
    }

    async fn pull_create(&self, path: &str, abs_path: &std::path::Path) -> Result<()> {
        let bytes = self.client.download(path).await?;
        write_file(abs_path, &bytes)?;
        let meta = hash::hash_file(abs_path, path)?;
        self.local_state
            .insert_synced_file(path, meta, SyncActionType::CreateLocal)?;
        Ok(())
    }

    async fn pull_modify(
        &self,
        path: &str,
        abs_path: &std::path::Path,
        current_local: &Option<FileMetadata>,
    ) -> Result<()> {
        let local_bytes = match current_local {
            Some(_) => std::fs::read(abs_path)?,
            None => Vec::new(),
        };
        let signature = rsync::calculate_signature(&local_bytes);
        let diff_resp = self.client.get_diff(path, &signature).await;
        let diff_resp = match diff_resp {
            Ok(resp) => resp,
            Err(err) => {
                if is_rejectable(&err) {
                    self.local_state.insert_status_info(
                        path,
                        SyncStatus::Rejected,
                        None,
                        Some(err.to_string()),
                    )?;
                    return Ok(());
                }
                return Err(err);
            }
        };
        let applied = rsync::apply_diff(&local_bytes, &diff_resp.diff)?;
        let actual_hash = hex_sha256(&applied);
        if actual_hash != diff_resp.hash {
            anyhow::bail!(
                "hash mismatch after applying diff for {}: expected {} got {}",
                path,
                diff_resp.hash,
                actual_hash
            );
        }
        write_file(abs_path, &applied)?;
        let meta = hash::hash_file(abs_path, path)?;
        self.local_state
            .insert_synced_file(path, meta, SyncActionType::ModifyLocal)?;
        Ok(())
    }

    fn pull_delete(&self, path: &str, abs_path: &std::path::Path) -> Result<()> {
        if abs_path.is_file() {
            std::fs::remove_file(abs_path)?;
            if let Some(parent) = abs_path.parent() {
                crate::fsops::remove_empty_ancestors(parent, &self.datasites_dir);
            }
        }
        self.local_state.remove_path(path)?;
        self.local_state
            .insert_status_info(path, SyncStatus::Synced, Some(SyncActionType::DeleteLocal), None)?;
        Ok(())
    }

    async fn push_create(&self, path: &str, abs_path: &std::path::Path) -> Result<()> {
        let bytes = std::fs::read(abs_path)?;
        match self.client.create(path, &bytes).await {
            Ok(()) => {
                let meta = hash::hash_file(abs_path, path)?;
                self.local_state
                    .insert_synced_file(path, meta, SyncActionType::CreateRemote)?;
                Ok(())
            }
            Err(err) => self.reject_or_propagate(path, err),
        }
    }

    async fn push_modify(
        &self,
        path: &str,
        abs_path: &std::path::Path,
        current_remote: &Option<FileMetadata>,
    ) -> Result<()> {
        let remote_meta = match current_remote {
            Some(m) => m.clone(),
            None => self
                .client
                .get_metadata(path)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no remote metadata for {path} to diff against"))?,
        };
        let local_bytes = std::fs::read(abs_path)?;
        let diff = rsync::compute_diff(&remote_meta.signature, &local_bytes)?;
        let expected_hash = hex_sha256(&local_bytes);
        match self.client.apply_diff(path, &diff, &expected_hash).await {
            Ok(resp) => {
                if resp.current_hash != expected_hash {
                    anyhow::bail!("server hash after apply_diff does not match our own bytes");
                }
                let meta = hash::hash_file(abs_path, path)?;
                self.local_state
                    .insert_synced_file(path, meta, SyncActionType::ModifyRemote)?;
                Ok(())
            }
            Err(err) => self.reject_or_propagate(path, err),
        }
    }

    async fn push_delete(&self, path: &str) -> Result<()> {
        match self.client.delete(path).await {
            Ok(()) => {
                self.local_state.remove_path(path)?;
                self.local_state.insert_status_info(
                    path,
                    SyncStatus::Synced,
                    Some(SyncActionType::DeleteRemote),
                    None,
                )?;
                Ok(())
            }
            Err(err) => {
                if matches!(
                    err.downcast_ref::<SyftClientError>(),
                    Some(SyftClientError::NotFound(_))
                ) {
                    // Already gone server-side; treat as success.
                    self.local_state.remove_path(path)?;
                    Ok(())
                } else {
                    self.reject_or_propagate(path, err)
                }
            }
        }
    }

    fn reject_or_propagate(&self, path: &str, err: anyhow::Error) -> Result<()> {
        if is_rejectable(&err) {
            self.local_state
                .insert_status_info(path, SyncStatus::Rejected, None, Some(err.to_string()))?;
            Ok(())
        } else {
            Err(err)
        }
    }
}

/// The path's permission governs whether a REJECTED (not retried) or ERROR (retried
/// next tick) status applies: permission-denied and conflict responses are
/// authoritative and are not retried blindly.
fn is_rejectable(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<SyftClientError>(),
        Some(SyftClientError::PermissionDenied(_)) | Some(SyftClientError::Conflict(_))
    )
}

fn remote_action_between(
    current_local: &Option<FileMetadata>,
    current_remote: &Option<FileMetadata>,
    previous_synced: &Option<FileMetadata>,
) -> RemoteAction {
    // Used only when both actions resolved NOOP above but the two sides still differ
    // from what was last recorded as synced; guards a freshly-created LocalState entry
    // that hasn't recorded a baseline yet.
    if current_local == current_remote {
        return RemoteAction::Noop;
    }
    if previous_synced == current_local {
        remote_action_to_reach(current_local, current_remote)
    } else {
        RemoteAction::Noop
    }
}

/// Splits `full_path` (e.g. `"alice@x.com/public/f.txt"`) into the owning datasite
/// email and the path relative to that datasite's root.
fn split_datasite_path(full_path: &str) -> (&str, &str) {
    match full_path.split_once('/') {
        Some((email, rest)) if !email.is_empty() => (email, rest),
        _ => (full_path, ""),
    }
}

fn read_local_metadata(abs_path: &std::path::Path, rel_path: &str) -> Result<Option<FileMetadata>> {
    if !abs_path.is_file() {
        return Ok(None);
    }
    let meta = hash::hash_file(abs_path, rel_path)?;
    Ok(Some(meta))
}

fn write_file(abs_path: &std::path::Path, bytes: &[u8]) -> Result<()> {
    crate::fsops::atomic_write(abs_path, bytes)
}

fn hex_sha256(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
