use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client as HttpClient, ClientBuilder, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::auth::{refresh_auth_tokens, validate_token, AuthTokenResponse};
use crate::hash::{decode_base85, encode_base85, FileMetadata};
use crate::telemetry::HttpStats;

/// Typed wrapper over the server's `/sync/*` surface (§4.5, §6.1). Every request
/// carries the authenticated email and a bearer token; non-2xx responses become one
/// of the typed errors below so the consumer can branch on REJECTED vs. ERROR vs.
/// CONFLICT without string-matching.
#[derive(Clone)]
pub struct SyncClient {
    base: String,
    http: HttpClient,
    user: String,
    stats: Arc<HttpStats>,
    auth: Arc<AuthState>,
}

struct AuthState {
    email: String,
    access_token: Mutex<Option<String>>,
    refresh_token: Mutex<Option<String>>,
    config_path: Option<std::path::PathBuf>,
}

impl AuthState {
    async fn ensure_access_token_with<F, Fut>(&self, refresh: F) -> Result<()>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<AuthTokenResponse>>,
    {
        let needs_refresh = {
            let access = self.access_token.lock().await;
            match access.as_deref() {
                None => true,
                Some(t) => validate_token(t, "access", &self.email).is_err(),
            }
        };
        if !needs_refresh {
            return Ok(());
        }

        let refresh_token = { self.refresh_token.lock().await.clone() };
        let Some(refresh_token) = refresh_token else {
            return Ok(());
        };

        let tokens = refresh(refresh_token.clone()).await?;
        validate_token(&tokens.refresh_token, "refresh", &self.email).context("refresh token")?;
        validate_token(&tokens.access_token, "access", &self.email).context("access token")?;

        {
            let mut access = self.access_token.lock().await;
            *access = Some(tokens.access_token);
        }
        if tokens.refresh_token != refresh_token {
            {
                let mut rt = self.refresh_token.lock().await;
                *rt = Some(tokens.refresh_token.clone());
            }
            if let Some(path) = &self.config_path {
                let _ = crate::config::save_refresh_token_file_only(path, &tokens.refresh_token);
            }
        }
        Ok(())
    }
}

/// Errors the consumer distinguishes between (§4.5, §7).
#[derive(Debug)]
pub enum SyftClientError {
    ServerError(String),
    NotFound(String),
    PermissionDenied(String),
    Conflict(String),
}

impl std::fmt::Display for SyftClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyftClientError::ServerError(m) => write!(f, "server error: {m}"),
            SyftClientError::NotFound(m) => write!(f, "not found: {m}"),
            SyftClientError::PermissionDenied(m) => write!(f, "permission denied: {m}"),
            SyftClientError::Conflict(m) => write!(f, "conflict: {m}"),
        }
    }
}

impl std::error::Error for SyftClientError {}

#[derive(Debug, Serialize)]
struct DirStateRequest<'a> {
    dir: &'a str,
}

#[derive(Debug, Serialize)]
struct GetMetadataRequest<'a> {
    path_like: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct GetDiffResponse {
    pub path: String,
    #[serde(with = "base85_bytes")]
    pub diff: Vec<u8>,
    pub hash: String,
}

#[derive(Debug, Serialize)]
struct ApplyDiffRequest {
    path: String,
    #[serde(with = "base85_bytes")]
    diff: Vec<u8>,
    expected_hash: String,
}

#[derive(Debug, Deserialize)]
pub struct ApplyDiffResponse {
    pub path: String,
    pub current_hash: String,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    path: &'a str,
}

#[derive(Debug, Serialize)]
struct DownloadRequest<'a> {
    path: &'a str,
}

#[derive(Debug, Serialize)]
struct DownloadBulkRequest<'a> {
    paths: &'a [String],
}

mod base85_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        super::encode_base85(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        super::decode_base85(&encoded).map_err(serde::de::Error::custom)
    }
}

impl SyncClient {
    pub fn new(
        base: &str,
        user: &str,
        auth_token: Option<&str>,
        refresh_token: Option<&str>,
        config_path: Option<&std::path::Path>,
        stats: Arc<HttpStats>,
    ) -> Result<Self> {
        let http = ClientBuilder::new()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("syftbox-rs/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
            user: user.to_string(),
            stats,
            auth: Arc::new(AuthState {
                email: user.to_string(),
                access_token: Mutex::new(auth_token.map(|s| s.to_string())),
                refresh_token: Mutex::new(refresh_token.map(|s| s.to_string())),
                config_path: config_path.map(|p| p.to_path_buf()),
            }),
        })
    }

    pub async fn healthz(&self) -> Result<()> {
        let url = format!("{}/healthz", self.base);
        let resp = self
            .send_authed(|| self.with_headers(self.http.get(url.clone())))
            .await?;
        map_status(resp, "healthz").await
    }

    /// `POST /sync/datasite_states` → `{ email: [FileMetadata] }`.
    pub async fn get_datasite_states(&self) -> Result<HashMap<String, Vec<FileMetadata>>> {
        let url = format!("{}/sync/datasite_states", self.base);
        let resp = self
            .send_authed(|| self.with_headers(self.http.post(url.clone())))
            .await?;
        map_json(resp, "datasite_states").await
    }

    /// `POST /sync/dir_state {dir}` → `[FileMetadata]`.
    pub async fn get_remote_state(&self, dir: &str) -> Result<Vec<FileMetadata>> {
        let url = format!("{}/sync/dir_state", self.base);
        let body = DirStateRequest { dir };
        let resp = self
            .send_authed(|| self.with_json(self.http.post(url.clone()), &body))
            .await?;
        map_json(resp, "dir_state").await
    }

    /// `POST /sync/get_metadata {path_like}` → `[FileMetadata]`; empty result is `None`.
    pub async fn get_metadata(&self, path: &str) -> Result<Option<FileMetadata>> {
        let url = format!("{}/sync/get_metadata", self.base);
        let body = GetMetadataRequest { path_like: path };
        let resp = self
            .send_authed(|| self.with_json(self.http.post(url.clone()), &body))
            .await?;
        let list: Vec<FileMetadata> = map_json(resp, "get_metadata").await?;
        Ok(list.into_iter().next())
    }

    /// `POST /sync/get_diff {path, signature}` → `{path, diff, hash}`.
    pub async fn get_diff(&self, path: &str, signature: &[u8]) -> Result<GetDiffResponse> {
        let url = format!("{}/sync/get_diff", self.base);
        let body = serde_json::json!({
            "path": path,
            "signature": encode_base85(signature),
        });
        let resp = self
            .send_authed(|| self.with_json(self.http.post(url.clone()), &body))
            .await?;
        map_json(resp, "get_diff").await
    }

    /// `POST /sync/apply_diff {path, diff, expected_hash}` → `{path, current_hash}`.
    /// 409 (hash mismatch) becomes [`SyftClientError::Conflict`].
    pub async fn apply_diff(
        &self,
        path: &str,
        diff: &[u8],
        expected_hash: &str,
    ) -> Result<ApplyDiffResponse> {
        let url = format!("{}/sync/apply_diff", self.base);
        let body = ApplyDiffRequest {
            path: path.to_string(),
            diff: diff.to_vec(),
            expected_hash: expected_hash.to_string(),
        };
        let resp = self
            .send_authed(|| self.with_json(self.http.post(url.clone()), &body))
            .await?;
        map_json(resp, "apply_diff").await
    }

    /// `POST /sync/create` (multipart) `file=<bytes>; path=<p>`.
    pub async fn create(&self, path: &str, data: &[u8]) -> Result<()> {
        self.ensure_access_token().await?;
        let url = format!("{}/sync/create", self.base);
        let mut resp = self.send_create_once(&url, path, data).await?;
        if resp.status() == StatusCode::UNAUTHORIZED && self.has_refresh_token().await {
            self.clear_access_token().await;
            self.ensure_access_token().await?;
            resp = self.send_create_once(&url, path, data).await?;
        }
        self.stats.on_send(data.len() as i64);
        map_status(resp, "create").await
    }

    async fn send_create_once(&self, url: &str, path: &str, data: &[u8]) -> Result<Response> {
        let form = reqwest::multipart::Form::new()
            .text("path", path.to_string())
            .part(
                "file",
                reqwest::multipart::Part::bytes(data.to_vec()).file_name("file"),
            );
        let mut req = self.with_headers(self.http.post(url));
        if let Some(token) = self.current_access_token().await {
            req = req.bearer_auth(token);
        }
        Ok(req.multipart(form).send().await?)
    }

    /// `POST /sync/delete {path}`.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let url = format!("{}/sync/delete", self.base);
        let body = DeleteRequest { path };
        let resp = self
            .send_authed(|| self.with_json(self.http.post(url.clone()), &body))
            .await?;
        map_status(resp, "delete").await
    }

    /// `POST /sync/download {path}` → raw bytes.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let url = format!("{}/sync/download", self.base);
        let body = DownloadRequest { path };
        let resp = self
            .send_authed(|| self.with_json(self.http.post(url.clone()), &body))
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_error(status, resp.text().await.unwrap_or_default(), "download").into());
        }
        let bytes = resp.bytes().await.context("read download body")?;
        self.stats.on_recv(bytes.len() as i64);
        Ok(bytes.to_vec())
    }

    /// `POST /sync/download_bulk {paths}` → tar archive stream.
    pub async fn download_bulk(&self, paths: &[String]) -> Result<Vec<u8>> {
        let url = format!("{}/sync/download_bulk", self.base);
        let body = DownloadBulkRequest { paths };
        let resp = self
            .send_authed(|| self.with_json(self.http.post(url.clone()), &body))
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(
                classify_error(status, resp.text().await.unwrap_or_default(), "download_bulk").into(),
            );
        }
        let bytes = resp.bytes().await.context("read download_bulk body")?;
        self.stats.on_recv(bytes.len() as i64);
        Ok(bytes.to_vec())
    }

    pub fn stats(&self) -> Arc<HttpStats> {
        self.stats.clone()
    }

    fn with_headers(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("email", &self.user)
    }

    fn with_json<B: Serialize>(&self, req: RequestBuilder, body: &B) -> RequestBuilder {
        self.with_headers(req).json(body)
    }

    pub(crate) async fn current_access_token(&self) -> Option<String> {
        self.auth.access_token.lock().await.clone()
    }

    pub(crate) async fn has_refresh_token(&self) -> bool {
        self.auth.refresh_token.lock().await.is_some()
    }

    pub(crate) async fn clear_access_token(&self) {
        *self.auth.access_token.lock().await = None;
    }

    pub(crate) async fn ensure_access_token(&self) -> Result<()> {
        self.auth
            .ensure_access_token_with(|refresh| async move {
                refresh_auth_tokens(&self.http, &self.base, &refresh).await
            })
            .await
    }

    async fn send_authed<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        self.ensure_access_token().await?;
        let resp = self.send_once(build()).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        if !self.has_refresh_token().await {
            return Ok(resp);
        }
        self.clear_access_token().await;
        self.ensure_access_token().await?;
        self.send_once(build()).await
    }

    async fn send_once(&self, mut req: RequestBuilder) -> Result<Response> {
        if let Some(token) = self.current_access_token().await {
            req = req.bearer_auth(token);
        }
        Ok(req.send().await?)
    }
}

async fn map_json<T: for<'de> Deserialize<'de>>(resp: Response, op: &str) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<T>().await.with_context(|| format!("parse {op} response"))?);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(classify_error(status, text, op).into())
}

async fn map_status(resp: Response, op: &str) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let text = resp.text().await.unwrap_or_default();
    Err(classify_error(status, text, op).into())
}

fn classify_error(status: StatusCode, text: String, op: &str) -> SyftClientError {
    match status {
        StatusCode::NOT_FOUND => SyftClientError::NotFound(format!("{op}: {text}")),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
            SyftClientError::PermissionDenied(format!("{op}: {text}"))
        }
        StatusCode::CONFLICT => SyftClientError::Conflict(format!("{op}: {text}")),
        _ => SyftClientError::ServerError(format!("{op}: {status} {text}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use tokio::net::TcpListener;

    async fn fake_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route(
                "/sync/get_metadata",
                post(|| async {
                    Json(serde_json::json!([{
                        "path": "a@x.com/f.txt",
                        "hash": "abc",
                        "signature": "",
                        "size": 3,
                        "last_modified": "2024-01-01T00:00:00Z",
                    }]))
                }),
            )
            .route(
                "/sync/delete",
                post(|| async { axum::http::StatusCode::NOT_FOUND }),
            )
            .route(
                "/sync/apply_diff",
                post(|| async { axum::http::StatusCode::CONFLICT }),
            );
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn get_metadata_returns_first_match_or_none() {
        let (base, _h) = fake_server().await;
        let client = SyncClient::new(
            &base,
            "a@x.com",
            None,
            None,
            None,
            Arc::new(HttpStats::default()),
        )
        .unwrap();
        let meta = client.get_metadata("a@x.com/f.txt").await.unwrap();
        assert_eq!(meta.unwrap().hash, "abc");
    }

    #[tokio::test]
    async fn delete_not_found_maps_to_not_found_error() {
        let (base, _h) = fake_server().await;
        let client = SyncClient::new(
            &base,
            "a@x.com",
            None,
            None,
            None,
            Arc::new(HttpStats::default()),
        )
        .unwrap();
        let err = client.delete("a@x.com/missing.txt").await.unwrap_err();
        assert!(err.downcast_ref::<SyftClientError>().is_some());
        assert!(matches!(
            err.downcast_ref::<SyftClientError>(),
            Some(SyftClientError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn apply_diff_conflict_maps_to_conflict_error() {
        let (base, _h) = fake_server().await;
        let client = SyncClient::new(
            &base,
            "a@x.com",
            None,
            None,
            None,
            Arc::new(HttpStats::default()),
        )
        .unwrap();
        let err = client
            .apply_diff("a@x.com/f.txt", b"diff", "expectedhash")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyftClientError>(),
            Some(SyftClientError::Conflict(_))
        ));
    }
}
