use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;

use crate::local_state::LocalState;
use crate::queue::SyncQueue;
use crate::telemetry::HttpStats;

/// The local HTTP control plane: a thin, token-authenticated window into the sync
/// engine's state (`/v1/status`, `/v1/sync/*`), used by `syftbox watch-status` and by
/// anything embedding the daemon that wants to poll progress without reading the
/// local-state file directly.
#[derive(Clone)]
pub struct ControlPlane {
    state: Arc<ControlState>,
    bound_addr: SocketAddr,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("bound_addr", &self.bound_addr)
            .finish()
    }
}

/// Result of starting the control plane, including the actual bound address.
#[derive(Clone)]
pub struct ControlPlaneStartResult {
    pub control_plane: ControlPlane,
    pub bound_addr: SocketAddr,
}

struct ControlState {
    token: String,
    http_stats: Arc<HttpStats>,
    local_state: Arc<LocalState>,
    queue: Arc<SyncQueue>,
    sync_trigger: Arc<Notify>,
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    ts: String,
    version: String,
    runtime: RuntimeInfo,
}

#[derive(Serialize)]
struct RuntimeInfo {
    http: HttpInfo,
}

#[derive(Serialize)]
struct HttpInfo {
    bytes_sent_total: i64,
    bytes_recv_total: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    last_error: String,
}

#[derive(Serialize)]
struct SyncStatusResponse {
    files: Vec<crate::local_state::SyncStatusInfo>,
    summary: SyncSummary,
}

#[derive(Serialize)]
struct SyncSummary {
    queued: usize,
    in_progress: usize,
    synced: usize,
    error: usize,
    rejected: usize,
    ignored: usize,
}

#[derive(Serialize)]
struct SyncQueueResponse {
    paths: Vec<String>,
    len: usize,
}

impl ControlPlane {
    /// Starts the control plane HTTP server, retrying the requested address a few
    /// times (ports can linger in TIME_WAIT right after a prior process was killed)
    /// before falling back to an OS-assigned port.
    pub async fn start_async(
        addr: &str,
        token: Option<String>,
        http_stats: Arc<HttpStats>,
        shutdown: Option<Arc<Notify>>,
        local_state: Arc<LocalState>,
        queue: Arc<SyncQueue>,
        sync_trigger: Arc<Notify>,
    ) -> anyhow::Result<ControlPlaneStartResult> {
        let token = token.unwrap_or_else(|| uuid::Uuid::new_v4().as_simple().to_string());

        crate::logging::info_kv(
            "control plane starting",
            &[("requested_addr", addr), ("token", token.as_str())],
        );

        let requested_addr: SocketAddr = match addr.parse() {
            Ok(a) => a,
            Err(e) => {
                crate::logging::error(format!(
                    "control plane failed to parse address '{}': {} - address must be numeric IP (e.g., 127.0.0.1:7938), not hostname",
                    addr, e
                ));
                return Err(anyhow::anyhow!(
                    "invalid address '{}': {} (use numeric IP, not hostname like 'localhost')",
                    addr,
                    e
                ));
            }
        };

        const MAX_BIND_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 200;

        let mut last_error = None;
        for attempt in 1..=MAX_BIND_RETRIES {
            match tokio::net::TcpListener::bind(requested_addr).await {
                Ok(listener) => {
                    let bound = listener.local_addr()?;
                    crate::logging::info_kv(
                        "control plane bound to requested port",
                        &[
                            ("addr", &bound.to_string()),
                            ("attempt", &attempt.to_string()),
                        ],
                    );
                    return Self::finish_start(
                        listener,
                        bound,
                        token,
                        http_stats,
                        shutdown,
                        local_state,
                        queue,
                        sync_trigger,
                    )
                    .await;
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_BIND_RETRIES {
                        crate::logging::info_kv(
                            "control plane bind attempt failed, retrying",
                            &[
                                ("requested_addr", &requested_addr.to_string()),
                                ("attempt", &attempt.to_string()),
                                ("max_attempts", &MAX_BIND_RETRIES.to_string()),
                            ],
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(RETRY_DELAY_MS)).await;
                    }
                }
            }
        }

        let e = last_error.unwrap();
        crate::logging::info_kv(
            "control plane requested port unavailable after retries, trying fallback",
            &[
                ("requested_addr", &requested_addr.to_string()),
                ("error", &e.to_string()),
            ],
        );

        let fallback_addr: SocketAddr = format!("{}:0", requested_addr.ip()).parse()?;
        match tokio::net::TcpListener::bind(fallback_addr).await {
            Ok(listener) => {
                let bound = listener.local_addr()?;
                crate::logging::info_kv(
                    "control plane bound to fallback port",
                    &[
                        ("original_request", &requested_addr.to_string()),
                        ("actual_addr", &bound.to_string()),
                    ],
                );
                Self::finish_start(
                    listener,
                    bound,
                    token,
                    http_stats,
                    shutdown,
                    local_state,
                    queue,
                    sync_trigger,
                )
                .await
            }
            Err(fallback_err) => {
                crate::logging::error(format!(
                    "control plane FAILED to bind - both requested port {} and fallback failed: original={}, fallback={}",
                    requested_addr, e, fallback_err
                ));
                Err(anyhow::anyhow!(
                    "failed to bind control plane: requested {} failed ({}), fallback to port 0 also failed ({})",
                    requested_addr, e, fallback_err
                ))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_start(
        listener: tokio::net::TcpListener,
        bound_addr: SocketAddr,
        token: String,
        http_stats: Arc<HttpStats>,
        shutdown: Option<Arc<Notify>>,
        local_state: Arc<LocalState>,
        queue: Arc<SyncQueue>,
        sync_trigger: Arc<Notify>,
    ) -> anyhow::Result<ControlPlaneStartResult> {
        let state = Arc::new(ControlState {
            token,
            http_stats,
            local_state,
            queue,
            sync_trigger,
        });

        let authenticated_routes = Router::new()
            .route("/v1/sync/status", get(sync_status))
            .route("/v1/sync/status/file", get(sync_status_file))
            .route("/v1/sync/queue", get(sync_queue))
            .route("/v1/sync/now", post(sync_now))
            .with_state(state.clone())
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                auth_middleware,
            ));

        let app = Router::new()
            .route("/v1/status", get(status))
            .with_state(state.clone())
            .merge(authenticated_routes);

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            if let Some(shutdown) = shutdown_clone {
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        shutdown.notified().await;
                    })
                    .await;
                if let Err(e) = result {
                    crate::logging::error(format!("control plane server error: {}", e));
                }
            } else {
                let result = axum::serve(listener, app).await;
                if let Err(e) = result {
                    crate::logging::error(format!("control plane server error: {}", e));
                }
            }
            crate::logging::info("control plane server stopped");
        });

        crate::logging::info_kv(
            "control plane started successfully",
            &[("bound_addr", &bound_addr.to_string())],
        );

        Ok(ControlPlaneStartResult {
            control_plane: ControlPlane { state, bound_addr },
            bound_addr,
        })
    }

    /// Synchronous wrapper for `start_async` that blocks until binding completes.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        addr: &str,
        token: Option<String>,
        http_stats: Arc<HttpStats>,
        shutdown: Option<Arc<Notify>>,
        local_state: Arc<LocalState>,
        queue: Arc<SyncQueue>,
        sync_trigger: Arc<Notify>,
    ) -> anyhow::Result<ControlPlaneStartResult> {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(Self::start_async(
                addr,
                token,
                http_stats,
                shutdown,
                local_state,
                queue,
                sync_trigger,
            ))
        })
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }
}

async fn auth_middleware(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let expected = format!("Bearer {}", state.token);
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if value.to_str().map(|v| v == expected).unwrap_or(false) {
            return next.run(req).await;
        }
    }
    (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
}

async fn status(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let snap = state.http_stats.snapshot();
    Json(StatusResponse {
        status: "ok".to_string(),
        ts: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        runtime: RuntimeInfo {
            http: HttpInfo {
                bytes_sent_total: snap.bytes_sent_total,
                bytes_recv_total: snap.bytes_recv_total,
                last_error: snap.last_error,
            },
        },
    })
}

async fn sync_status(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    use crate::local_state::SyncStatus;

    let mut files = state.local_state.all_status();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    let mut summary = SyncSummary {
        queued: 0,
        in_progress: 0,
        synced: 0,
        error: 0,
        rejected: 0,
        ignored: 0,
    };
    for f in &files {
        match f.status {
            SyncStatus::Queued => summary.queued += 1,
            SyncStatus::InProgress => summary.in_progress += 1,
            SyncStatus::Synced => summary.synced += 1,
            SyncStatus::Error => summary.error += 1,
            SyncStatus::Rejected => summary.rejected += 1,
            SyncStatus::Ignored => summary.ignored += 1,
        }
    }
    Json(SyncStatusResponse { files, summary })
}

#[derive(serde::Deserialize)]
struct SyncStatusFileQuery {
    path: String,
}

async fn sync_status_file(
    State(state): State<Arc<ControlState>>,
    axum::extract::Query(q): axum::extract::Query<SyncStatusFileQuery>,
) -> impl IntoResponse {
    match state.local_state.get_status(&q.path) {
        Some(info) => Json(info).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn sync_queue(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let paths = state.queue.snapshot_paths();
    Json(SyncQueueResponse {
        len: paths.len(),
        paths,
    })
}

async fn sync_now(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    state.sync_trigger.notify_waiters();
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_state::LocalState;

    fn tmp_local_state() -> Arc<LocalState> {
        let dir = std::env::temp_dir().join(format!(
            "syftbox-rs-control-test-{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        Arc::new(LocalState::load(LocalState::path_for_data_dir(&dir)).unwrap())
    }

    #[tokio::test]
    async fn start_binds_and_reports_status_without_auth() {
        let result = ControlPlane::start_async(
            "127.0.0.1:0",
            Some("tok".to_string()),
            Arc::new(HttpStats::default()),
            None,
            tmp_local_state(),
            Arc::new(SyncQueue::new()),
            Arc::new(Notify::new()),
        )
        .await
        .unwrap();

        let url = format!("http://{}/v1/status", result.bound_addr);
        let resp = reqwest::get(url).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn authenticated_routes_reject_missing_token() {
        let result = ControlPlane::start_async(
            "127.0.0.1:0",
            Some("tok".to_string()),
            Arc::new(HttpStats::default()),
            None,
            tmp_local_state(),
            Arc::new(SyncQueue::new()),
            Arc::new(Notify::new()),
        )
        .await
        .unwrap();

        let url = format!("http://{}/v1/sync/status", result.bound_addr);
        let resp = reqwest::get(url).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn authenticated_routes_accept_bearer_token() {
        let result = ControlPlane::start_async(
            "127.0.0.1:0",
            Some("tok".to_string()),
            Arc::new(HttpStats::default()),
            None,
            tmp_local_state(),
            Arc::new(SyncQueue::new()),
            Arc::new(Notify::new()),
        )
        .await
        .unwrap();

        let url = format!("http://{}/v1/sync/status", result.bound_addr);
        let http = reqwest::Client::new();
        let resp = http
            .get(url)
            .header("Authorization", "Bearer tok")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn sync_now_notifies_trigger() {
        let trigger = Arc::new(Notify::new());
        let result = ControlPlane::start_async(
            "127.0.0.1:0",
            Some("tok".to_string()),
            Arc::new(HttpStats::default()),
            None,
            tmp_local_state(),
            Arc::new(SyncQueue::new()),
            trigger.clone(),
        )
        .await
        .unwrap();

        let url = format!("http://{}/v1/sync/now", result.bound_addr);
        let http = reqwest::Client::new();
        let notified = trigger.notified();
        let resp = http
            .post(url)
            .header("Authorization", "Bearer tok")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
        notified.await;
    }
}
