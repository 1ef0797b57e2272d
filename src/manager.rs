use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;

use crate::consumer::Consumer;
use crate::ignore::IgnoreRules;
use crate::local_state::LocalState;
use crate::producer::Producer;
use crate::queue::SyncQueue;
use crate::sync_client::SyncClient;

/// Default interval between sync ticks when nothing requests an immediate one via
/// [`SyncManager::trigger`].
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// The single-threaded scheduler driving one full produce/consume cycle per tick
/// (§4.10). Ticks never overlap: a tick that is still draining the queue delays the
/// next scheduled wakeup rather than running concurrently with it.
pub struct SyncManager {
    client: Arc<SyncClient>,
    queue: Arc<SyncQueue>,
    local_state: Arc<LocalState>,
    ignore_rules: Arc<IgnoreRules>,
    datasites_dir: std::path::PathBuf,
    own_email: String,
    tick_interval: Duration,
    trigger: Arc<Notify>,
    max_file_size_mb: u64,
}

impl SyncManager {
    pub fn new(
        client: Arc<SyncClient>,
        queue: Arc<SyncQueue>,
        local_state: Arc<LocalState>,
        ignore_rules: Arc<IgnoreRules>,
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
            tick_interval: DEFAULT_TICK_INTERVAL,
            trigger: Arc::new(Notify::new()),
            max_file_size_mb: crate::consumer::DEFAULT_MAX_FILE_SIZE_MB,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_max_file_size_mb(mut self, mb: u64) -> Self {
        self.max_file_size_mb = mb;
        self
    }

    /// A handle callers (e.g. the control plane's `/v1/sync/now` endpoint) can use to
    /// ask for an out-of-schedule tick.
    pub fn trigger_handle(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// Runs ticks forever, on a fixed interval or whenever `trigger_handle()` is
    /// notified, until `shutdown` fires.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval) => {}
                _ = self.trigger.notified() => {}
                _ = shutdown.notified() => {
                    crate::logging::info("sync manager: shutdown requested");
                    return;
                }
            }

            if let Err(err) = self.tick().await {
                crate::logging::error(format!("sync manager: tick failed: {}", err));
            }
        }
    }

    /// One full produce/consume cycle: verify the sync environment is intact, refresh
    /// the list of datasites, enqueue their out-of-sync changes, then drain the queue.
    /// A single datasite's enumeration failing does not abort the others; a single
    /// item's consumption failing does not abort the drain (see [`Consumer::process_item`]).
    pub async fn tick(&self) -> Result<()> {
        self.verify_sync_environment()?;

        let producer = Producer::new(
            &self.client,
            &self.queue,
            &self.local_state,
            &self.ignore_rules,
            self.datasites_dir.clone(),
            self.own_email.clone(),
        );

        let emails = producer.get_datasite_emails().await;
        for email in &emails {
            if let Err(err) = producer.enqueue_datasite_changes(email).await {
                crate::logging::error(format!(
                    "sync manager: failed to enumerate datasite {}: {}",
                    email, err
                ));
            }
        }

        let consumer = Consumer::new(
            &self.client,
            &self.local_state,
            self.datasites_dir.clone(),
            self.own_email.clone(),
        )
        .with_max_file_size_mb(self.max_file_size_mb);

        while let Some(item) = self.queue.try_get() {
            consumer.process_item(item).await;
        }

        self.local_state.save()?;
        Ok(())
    }

    /// Re-checks that the data directory and local-state file are both present before
    /// touching anything; a vanished data directory means the client was torn down
    /// externally and must not be allowed to reinterpret that as "everything deleted".
    fn verify_sync_environment(&self) -> Result<()> {
        let local_state_path = self.local_state.path();
        if let Some(plugins_dir) = local_state_path.parent() {
            if let Some(data_dir) = plugins_dir.parent() {
                if !data_dir.is_dir() {
                    anyhow::bail!(
                        "sync data directory {} is missing; refusing to run a tick",
                        data_dir.display()
                    );
                }
            }
        }
        if !self.datasites_dir.is_dir() {
            std::fs::create_dir_all(&self.datasites_dir)?;
        }
        Ok(())
    }
}
