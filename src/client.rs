use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;

use crate::config::Config;
use crate::ignore::IgnoreRules;
use crate::local_state::LocalState;
use crate::manager::SyncManager;
use crate::permission::{PermissionFile, PERMISSION_FILENAME};
use crate::queue::SyncQueue;
use crate::sync_client::SyncClient;
use crate::telemetry::HttpStats;
use crate::workspace::{ensure_workspace_layout, WorkspaceLock};

/// Everything a running daemon needs: the manager to drive ticks, plus the pieces the
/// local control plane reports on.
pub struct PreparedClient {
    pub manager: SyncManager,
    pub local_state: Arc<LocalState>,
    pub queue: Arc<SyncQueue>,
    sync_client: Arc<SyncClient>,
    _lock: WorkspaceLock,
}

/// Assembles the sync engine's pieces -- workspace layout and lock, root permission
/// file, ignore rules, local state, queue and [`SyncManager`] -- from a resolved
/// [`Config`] and a ready [`SyncClient`]. Assembly never touches the network; callers
/// that want to confirm the server is reachable before the first tick should call
/// [`PreparedClient::wait_for_server`] afterwards.
pub struct Client {
    cfg: Config,
    sync_client: Arc<SyncClient>,
}

impl Client {
    pub fn new(cfg: Config, sync_client: SyncClient) -> Self {
        Self {
            cfg,
            sync_client: Arc::new(sync_client),
        }
    }

    pub fn prepare(&self) -> Result<PreparedClient> {
        ensure_workspace_layout(&self.cfg.data_dir, &self.cfg.email)
            .context("ensure workspace layout")?;
        let lock =
            WorkspaceLock::try_lock(&self.cfg.data_dir).context("acquire workspace lock")?;

        let datasites_dir = self.cfg.data_dir.join("datasites");
        let root_acl = datasites_dir.join(&self.cfg.email).join(PERMISSION_FILENAME);
        if !root_acl.exists() {
            if let Some(parent) = root_acl.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            PermissionFile::datasite_default(&self.cfg.email)
                .save(&root_acl)
                .with_context(|| format!("write {}", root_acl.display()))?;
        }

        let ignore_rules = Arc::new(
            IgnoreRules::load_from(
                &self.cfg.data_dir.join(crate::ignore::IGNORE_FILENAME),
                &datasites_dir,
            )
            .context("load ignore rules")?,
        );

        let local_state = Arc::new(
            LocalState::load(LocalState::path_for_data_dir(&self.cfg.data_dir))
                .context("load local state")?,
        );
        let queue = Arc::new(SyncQueue::new());

        let manager = SyncManager::new(
            self.sync_client.clone(),
            queue.clone(),
            local_state.clone(),
            ignore_rules,
            datasites_dir,
            self.cfg.email.clone(),
        )
        .with_tick_interval(std::time::Duration::from_secs(self.cfg.sync_interval_secs))
        .with_max_file_size_mb(self.cfg.max_file_size_mb);

        Ok(PreparedClient {
            manager,
            local_state,
            queue,
            sync_client: self.sync_client.clone(),
            _lock: lock,
        })
    }
}

impl PreparedClient {
    /// Polls `/healthz` until it succeeds, `max_attempts` is exhausted, or `shutdown`
    /// fires. Exhausting attempts without success is logged but not fatal: the sync
    /// loop will keep retrying against the server on every tick regardless.
    pub async fn wait_for_server(&self, shutdown: &Arc<Notify>, max_attempts: Option<usize>) {
        let max_attempts = max_attempts.unwrap_or(60).max(1);
        for attempt in 1..=max_attempts {
            match self.sync_client.healthz().await {
                Ok(()) => return,
                Err(err) => {
                    crate::logging::info_kv(
                        "waiting for sync server",
                        &[
                            ("attempt", &attempt.to_string()),
                            ("error", &err.to_string()),
                        ],
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                        _ = shutdown.notified() => return,
                    }
                }
            }
        }
        crate::logging::error("sync server did not become reachable in time; continuing anyway");
    }
}

/// Builds a [`SyncClient`] from a resolved [`Config`], wiring the shared
/// [`HttpStats`] so `/v1/status` on the control plane can report live traffic counts.
pub fn build_sync_client(cfg: &Config, stats: Arc<HttpStats>) -> Result<SyncClient> {
    SyncClient::new(
        &cfg.server_url,
        &cfg.email,
        cfg.access_token.as_deref(),
        cfg.refresh_token.as_deref(),
        cfg.config_path.as_deref(),
        stats,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_cfg() -> Config {
        let data_dir = std::env::temp_dir().join(format!(
            "syftbox-rs-client-test-{}",
            uuid::Uuid::new_v4()
        ));
        Config::new_for_save(
            &data_dir.join("config.json"),
            &data_dir,
            "alice@example.com",
            "http://127.0.0.1:1",
            None,
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn prepare_creates_workspace_and_manager_state() {
        let cfg = tmp_cfg();
        let data_dir = cfg.data_dir.clone();
        let sync_client = build_sync_client(&cfg, Arc::new(HttpStats::default())).unwrap();
        let client = Client::new(cfg.clone(), sync_client);

        let prepared = client.prepare().unwrap();

        assert!(data_dir.join("datasites").join("alice@example.com").is_dir());
        assert!(data_dir
            .join("datasites")
            .join("alice@example.com")
            .join(PERMISSION_FILENAME)
            .is_file());
        assert_eq!(prepared.queue.len(), 0);
    }

    #[tokio::test]
    async fn wait_for_server_returns_promptly_on_shutdown() {
        let cfg = tmp_cfg();
        let sync_client = build_sync_client(&cfg, Arc::new(HttpStats::default())).unwrap();
        let client = Client::new(cfg, sync_client);
        let prepared = client.prepare().unwrap();

        let shutdown = Arc::new(Notify::new());
        let shutdown_task = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            shutdown_task.notify_waiters();
        });

        let started = std::time::Instant::now();
        prepared.wait_for_server(&shutdown, Some(60)).await;
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }
}
