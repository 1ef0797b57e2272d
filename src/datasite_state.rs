use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use crate::hash::{self, FileMetadata, HashOptions};
use crate::ignore::IgnoreRules;
use crate::local_state::LocalState;
use crate::permission::PermissionTree;
use crate::queue::{FileChangeInfo, SyncSide};

/// Recently-deleted files (by mtime-at-last-known-state) are not yet treated as a
/// deletion to push remotely, to avoid racing an editor's unlink-then-recreate atomic
/// save.
const RECENT_DELETE_GRACE: Duration = Duration::from_millis(750);

pub struct OutOfSyncFiles {
    pub permissions: Vec<FileChangeInfo>,
    pub files: Vec<FileChangeInfo>,
    pub ignored: Vec<String>,
}

/// Ephemeral per-datasite-per-tick state: current local metadata, current remote
/// metadata (as already retrieved from the server by the caller), and the previous
/// synced baseline pulled from [`LocalState`].
pub struct DatasiteState<'a> {
    pub email: String,
    pub root: PathBuf,
    local_state: &'a LocalState,
}

impl<'a> DatasiteState<'a> {
    pub fn new(email: impl Into<String>, root: PathBuf, local_state: &'a LocalState) -> Self {
        Self {
            email: email.into(),
            root,
            local_state,
        }
    }

    /// Current local metadata, keyed by path relative to the *datasites* directory
    /// (i.e. prefixed with this datasite's email), matching the key space used by
    /// [`LocalState`], [`crate::queue::SyncQueue`] and every [`crate::sync_client::SyncClient`]
    /// call -- none of which carry a separate "which datasite" field alongside a path.
    pub fn get_current_local_state(&self) -> Result<HashMap<String, FileMetadata>> {
        let by_root = hash::hash_dir(&self.root, HashOptions::default())?;
        Ok(by_root
            .into_iter()
            .map(|(rel, meta)| (self.prefixed(&rel), meta))
            .collect())
    }

    fn prefixed(&self, rel_path: &str) -> String {
        format!("{}/{}", self.email, rel_path)
    }

    /// Computes `{permissions, files, ignored}` relative to the previous-synced state,
    /// given the remote metadata already fetched by the caller.
    pub fn get_out_of_sync_files(
        &self,
        remote_now: &HashMap<String, FileMetadata>,
        ignore_rules: &IgnoreRules,
    ) -> Result<OutOfSyncFiles> {
        let local_now = self.get_current_local_state()?;

        let mut all_paths: Vec<&String> = local_now.keys().chain(remote_now.keys()).collect();
        all_paths.sort();
        all_paths.dedup();

        let mut permissions = Vec::new();
        let mut files = Vec::new();
        let mut ignored = Vec::new();

        for path in all_paths {
            if ignore_rules.is_ignored(path, false) {
                ignored.push(path.clone());
                continue;
            }

            let local = local_now.get(path);
            let remote = remote_now.get(path);

            let change = match (local, remote) {
                (Some(l), Some(r)) => {
                    if l.hash == r.hash {
                        continue;
                    }
                    let newer_is_local = l.last_modified >= r.last_modified;
                    if newer_is_local {
                        FileChangeInfo {
                            path: path.clone(),
                            side_last_modified: SyncSide::Local,
                            date_last_modified: l.last_modified,
                            num_bytes: l.size,
                        }
                    } else {
                        FileChangeInfo {
                            path: path.clone(),
                            side_last_modified: SyncSide::Remote,
                            date_last_modified: r.last_modified,
                            num_bytes: r.size,
                        }
                    }
                }
                (Some(l), None) => {
                    if self.is_recent_local_deletion_race(path, l) {
                        continue;
                    }
                    FileChangeInfo {
                        path: path.clone(),
                        side_last_modified: SyncSide::Local,
                        date_last_modified: l.last_modified,
                        num_bytes: l.size,
                    }
                }
                (None, Some(r)) => FileChangeInfo {
                    path: path.clone(),
                    side_last_modified: SyncSide::Remote,
                    date_last_modified: r.last_modified,
                    num_bytes: r.size,
                },
                (None, None) => continue,
            };

            if PermissionTree::is_permission_path(path) {
                permissions.push(change);
            } else {
                files.push(change);
            }
        }

        Ok(OutOfSyncFiles {
            permissions,
            files,
            ignored,
        })
    }

    /// A path present locally but absent remotely is only "really" a deletion to push
    /// if enough time has passed since it was last known-synced; otherwise it may just
    /// be mid-rewrite by an editor.
    fn is_recent_local_deletion_race(&self, path: &str, _current_local: &FileMetadata) -> bool {
        let previous = match self.local_state.get_state(path) {
            Some(p) => p,
            None => return false,
        };
        let age = Utc::now().signed_duration_since(previous.last_modified);
        age.to_std()
            .map(|age| age < RECENT_DELETE_GRACE)
            .unwrap_or(false)
    }
}

pub fn datasite_root(datasites_dir: &Path, email: &str) -> PathBuf {
    datasites_dir.join(email)
}
