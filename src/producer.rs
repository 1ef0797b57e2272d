use std::collections::HashMap;

use anyhow::Result;

use crate::datasite_state::{datasite_root, DatasiteState};
use crate::ignore::IgnoreRules;
use crate::local_state::LocalState;
use crate::queue::{FileChangeInfo, SyncQueue};
use crate::sync_client::SyncClient;

/// Enumerates datasites and enqueues their out-of-sync changes, permission files
/// before regular files (§4.8).
pub struct Producer<'a> {
    client: &'a SyncClient,
    queue: &'a SyncQueue,
    local_state: &'a LocalState,
    ignore_rules: &'a IgnoreRules,
    datasites_dir: std::path::PathBuf,
    own_email: String,
}

impl<'a> Producer<'a> {
    pub fn new(
        client: &'a SyncClient,
        queue: &'a SyncQueue,
        local_state: &'a LocalState,
        ignore_rules: &'a IgnoreRules,
        datasites_dir: std::path::PathBuf,
        own_email: String,
    ) -> Self {
        Self {
            client,
            queue,
            local_state,
            ignore_rules,
            datasites_dir,
            own_email,
        }
    }

    /// Returns the list of datasite emails to process this tick. Always includes the
    /// caller's own email even if the server's list omits it or the call fails, so a
    /// client never stops syncing its own datasite just because the directory listing
    /// is temporarily unreachable.
    pub async fn get_datasite_emails(&self) -> Vec<String> {
        let mut emails: Vec<String> = match self.client.get_datasite_states().await {
            Ok(map) => map.into_keys().collect(),
            Err(err) => {
                crate::logging::error(format!(
                    "producer: get_datasite_states failed, falling back to own email only: {}",
                    err
                ));
                Vec::new()
            }
        };
        if !emails.iter().any(|e| e == &self.own_email) {
            emails.push(self.own_email.clone());
        }
        emails
    }

    /// Builds a `DatasiteState` for `email`, computes its out-of-sync sets against the
    /// server, enqueues permission changes then file changes, and records ignored
    /// paths to `LocalState` (only if not already ignored, to avoid churn).
    pub async fn enqueue_datasite_changes(&self, email: &str) -> Result<()> {
        let root = datasite_root(&self.datasites_dir, email);
        let state = DatasiteState::new(email.to_string(), root, self.local_state);

        let remote_now = self.fetch_remote_state(email).await?;
        let out_of_sync = state.get_out_of_sync_files(&remote_now, self.ignore_rules)?;

        for change in out_of_sync.permissions {
            self.enqueue(change);
        }
        for change in out_of_sync.files {
            self.enqueue(change);
        }
        for path in out_of_sync.ignored {
            if let Err(err) = self.local_state.mark_ignored_if_changed(&path) {
                crate::logging::error(format!(
                    "producer: failed to record ignored path {}: {}",
                    path, err
                ));
            }
        }
        Ok(())
    }

    fn enqueue(&self, change: FileChangeInfo) {
        self.queue.put(change);
    }

    async fn fetch_remote_state(
        &self,
        email: &str,
    ) -> Result<HashMap<String, crate::hash::FileMetadata>> {
        let list = self.client.get_remote_state(email).await.unwrap_or_default();
        Ok(list.into_iter().map(|m| (m.path.clone(), m)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::HttpStats;
    use std::sync::Arc;

    #[tokio::test]
    async fn always_includes_own_email_even_when_server_list_is_empty() {
        let client = SyncClient::new(
            "http://127.0.0.1:1",
            "me@x.com",
            None,
            None,
            None,
            Arc::new(HttpStats::default()),
        )
        .unwrap();
        let queue = SyncQueue::new();
        let dir = std::env::temp_dir().join(format!("syftbox-rs-producer-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let local_state =
            LocalState::load(dir.join("plugins").join(crate::local_state::LOCAL_STATE_FILENAME))
                .unwrap();
        let ignore_rules = IgnoreRules::from_lines(&dir, &[]).unwrap();
        let producer = Producer::new(
            &client,
            &queue,
            &local_state,
            &ignore_rules,
            dir.join("datasites"),
            "me@x.com".to_string(),
        );
        let emails = producer.get_datasite_emails().await;
        assert_eq!(emails, vec!["me@x.com".to_string()]);
    }
}
