use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::hash::{decode_base85, encode_base85, FileMetadata};
use crate::permission::PermissionTree;

use super::store::{FileStore, HashMismatch};

/// Shared state behind every `/sync/*` handler: the metadata+snapshot store and the
/// datasites root its paths are rooted at (needed separately from the store so
/// permission trees can be loaded per request without the store knowing about
/// permissions at all).
pub struct ServerState {
    pub store: FileStore,
    pub datasites_root: PathBuf,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/sync/datasite_states", post(datasite_states))
        .route("/sync/dir_state", post(dir_state))
        .route("/sync/get_metadata", post(get_metadata))
        .route("/sync/get_diff", post(get_diff))
        .route("/sync/apply_diff", post(apply_diff))
        .route("/sync/create", post(create))
        .route("/sync/delete", post(delete))
        .route("/sync/download", post(download))
        .route("/sync/download_bulk", post(download_bulk))
        .with_state(state)
}

/// `{code, message}` error body per §6.1, mapped from [`ApiError`] to the status codes
/// §4.11/§7 call out: permission denial 401/403, missing path 404, hash mismatch 409.
#[derive(Debug)]
enum ApiError {
    Unauthenticated(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match self {
            ApiError::Unauthenticated(m) => (StatusCode::UNAUTHORIZED, "unauthenticated", m),
            ApiError::Forbidden(m) => (StatusCode::FORBIDDEN, "forbidden", m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "conflict", m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", m),
        };
        (
            status,
            Json(serde_json::json!({ "code": code, "message": message })),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(mismatch) = err.downcast_ref::<HashMismatch>() {
            return ApiError::Conflict(mismatch.to_string());
        }
        let msg = err.to_string();
        if msg.contains("not found") {
            ApiError::NotFound(msg)
        } else if msg.contains("already exists") {
            ApiError::Conflict(msg)
        } else {
            ApiError::Internal(msg)
        }
    }
}

/// Resolves the authenticated caller's email: the bearer token's subject, which must
/// match the `email` header (§6.1: "every request carries ... an email header
/// matching the token").
fn authenticated_email(headers: &HeaderMap) -> Result<String, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthenticated("missing bearer token".to_string()))?;
    let subject = crate::auth::token_subject(token)
        .ok_or_else(|| ApiError::Unauthenticated("invalid bearer token".to_string()))?;
    let header_email = headers
        .get("email")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthenticated("missing email header".to_string()))?;
    if header_email != subject {
        return Err(ApiError::Unauthenticated(
            "email header does not match bearer token".to_string(),
        ));
    }
    Ok(subject)
}

/// Splits `full_path` (e.g. `"alice@x.com/public/f.txt"`) into the owning datasite
/// email and the path relative to that datasite's root.
fn split_datasite_path(full_path: &str) -> Result<(&str, &str), ApiError> {
    match full_path.split_once('/') {
        Some((email, rest)) if !email.is_empty() => Ok((email, rest)),
        _ => Ok((full_path, "")),
    }
}

fn permission_tree(state: &ServerState, email: &str) -> Result<PermissionTree, ApiError> {
    let root = state.datasites_root.join(email);
    PermissionTree::load(&root)
        .map_err(|e| ApiError::Internal(format!("load permissions for {email}: {e}")))
}

fn require_read(state: &ServerState, caller: &str, full_path: &str) -> Result<(), ApiError> {
    let (email, rel) = split_datasite_path(full_path)?;
    if email == caller {
        return Ok(());
    }
    let tree = permission_tree(state, email)?;
    if tree.effective(rel, caller).read {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "{caller} has no read access to {full_path}"
        )))
    }
}

fn require_write(state: &ServerState, caller: &str, full_path: &str) -> Result<(), ApiError> {
    let (email, rel) = split_datasite_path(full_path)?;
    if email == caller {
        return Ok(());
    }
    let tree = permission_tree(state, email)?;
    if tree.effective(rel, caller).write {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "{caller} has no write access to {full_path}"
        )))
    }
}

/// Filters `metas` down to the ones `caller` may read, grouping readable results by
/// their owning datasite so a denied file in one datasite never hides siblings in
/// another.
fn filter_readable(
    state: &ServerState,
    caller: &str,
    metas: Vec<FileMetadata>,
) -> Vec<FileMetadata> {
    let mut trees: std::collections::HashMap<String, PermissionTree> = std::collections::HashMap::new();
    metas
        .into_iter()
        .filter(|m| {
            let Ok((email, rel)) = split_datasite_path(&m.path) else {
                return false;
            };
            if email == caller {
                return true;
            }
            let tree = trees
                .entry(email.to_string())
                .or_insert_with(|| permission_tree(state, email).unwrap_or_default());
            tree.effective(rel, caller).read
        })
        .collect()
}

#[derive(Deserialize)]
struct DirStateRequest {
    dir: String,
}

async fn datasite_states(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticated_email(&headers)?;
    let emails = state
        .store
        .datasite_emails()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let mut out: std::collections::HashMap<String, Vec<FileMetadata>> =
        std::collections::HashMap::new();
    for email in emails {
        let metas = state
            .store
            .list_dir(&email)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let readable = filter_readable(&state, &caller, metas);
        if !readable.is_empty() || email == caller {
            out.insert(email, readable);
        }
    }
    out.entry(caller).or_default();
    Ok(Json(out))
}

async fn dir_state(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<DirStateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticated_email(&headers)?;
    let metas = state
        .store
        .list_dir(&req.dir)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(filter_readable(&state, &caller, metas)))
}

#[derive(Deserialize)]
struct GetMetadataRequest {
    path_like: String,
}

async fn get_metadata(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<GetMetadataRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticated_email(&headers)?;
    let metas = state
        .store
        .get_metadata(&req.path_like)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(filter_readable(&state, &caller, metas)))
}

#[derive(Deserialize)]
struct GetDiffRequest {
    path: String,
    #[serde(with = "base85_bytes")]
    signature: Vec<u8>,
}

#[derive(Serialize)]
struct GetDiffResponse {
    path: String,
    #[serde(with = "base85_bytes")]
    diff: Vec<u8>,
    hash: String,
}

async fn get_diff(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<GetDiffRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticated_email(&headers)?;
    require_read(&state, &caller, &req.path)?;
    let (diff, hash) = state.store.get_diff(&req.path, &req.signature)?;
    Ok(Json(GetDiffResponse {
        path: req.path,
        diff,
        hash,
    }))
}

#[derive(Deserialize)]
struct ApplyDiffRequest {
    path: String,
    #[serde(with = "base85_bytes")]
    diff: Vec<u8>,
    expected_hash: String,
}

#[derive(Serialize)]
struct ApplyDiffResponse {
    path: String,
    current_hash: String,
}

async fn apply_diff(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<ApplyDiffRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticated_email(&headers)?;
    require_write(&state, &caller, &req.path)?;
    let meta = state
        .store
        .apply_diff(&req.path, &req.diff, &req.expected_hash)?;
    Ok(Json(ApplyDiffResponse {
        path: req.path,
        current_hash: meta.hash,
    }))
}

async fn create(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    mut form: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticated_email(&headers)?;
    let mut path: Option<String> = None;
    let mut data: Option<Vec<u8>> = None;
    while let Some(field) = form
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        match field.name() {
            Some("path") => {
                path = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?,
                )
            }
            Some("file") => {
                data = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?
                        .to_vec(),
                )
            }
            _ => {}
        }
    }
    let path = path.ok_or_else(|| ApiError::BadRequest("missing path field".to_string()))?;
    let data = data.ok_or_else(|| ApiError::BadRequest("missing file field".to_string()))?;
    require_write(&state, &caller, &path)?;
    state.store.create(&path, &data)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct DeleteRequest {
    path: String,
}

async fn delete(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<DeleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticated_email(&headers)?;
    require_write(&state, &caller, &req.path)?;
    state.store.delete(&req.path)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct DownloadRequest {
    path: String,
}

async fn download(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<DownloadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticated_email(&headers)?;
    require_read(&state, &caller, &req.path)?;
    let bytes = state
        .store
        .read_bytes(&req.path)?
        .ok_or_else(|| ApiError::NotFound(format!("not found: {}", req.path)))?;
    Ok(bytes)
}

#[derive(Deserialize)]
struct DownloadBulkRequest {
    paths: Vec<String>,
}

/// Streams a tar archive of every requested path the caller may read; paths that are
/// missing or unreadable are silently skipped rather than failing the whole archive,
/// matching `download`'s per-path semantics extended to a batch.
async fn download_bulk(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<DownloadBulkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticated_email(&headers)?;
    let mut archive = tar::Builder::new(Vec::new());
    for path in &req.paths {
        if require_read(&state, &caller, path).is_err() {
            continue;
        }
        let Ok(Some(bytes)) = state.store.read_bytes(path) else {
            continue;
        };
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        archive
            .append_data(&mut header, path, bytes.as_slice())
            .map_err(|e| ApiError::Internal(format!("append {path} to archive: {e}")))?;
    }
    let bytes = archive
        .into_inner()
        .map_err(|e| ApiError::Internal(format!("finish archive: {e}")))?;
    Ok(bytes)
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

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    fn tmp() -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "syftbox-rs-endpoints-test-{}",
            uuid::Uuid::new_v4()
        ));
        (dir.join("store.db"), dir.join("snapshot"))
    }

    fn fake_jwt(email: &str) -> String {
        let header = serde_json::json!({"alg":"none","typ":"JWT"});
        let payload = serde_json::json!({"type":"access","sub":email});
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap()),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap())
        )
    }

    fn auth_headers(email: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {}", fake_jwt(email)).parse().unwrap(),
        );
        headers.insert("email", email.parse().unwrap());
        headers
    }

    fn state() -> Arc<ServerState> {
        let (db_path, snapshot) = tmp();
        Arc::new(ServerState {
            store: FileStore::open(&db_path, &snapshot).unwrap(),
            datasites_root: snapshot,
        })
    }

    #[test]
    fn authenticated_email_rejects_mismatched_header() {
        let mut headers = auth_headers("alice@x.com");
        headers.insert("email", "mallory@x.com".parse().unwrap());
        assert!(authenticated_email(&headers).is_err());
    }

    #[test]
    fn authenticated_email_accepts_matching_header() {
        let headers = auth_headers("alice@x.com");
        assert_eq!(authenticated_email(&headers).unwrap(), "alice@x.com");
    }

    #[tokio::test]
    async fn create_then_download_roundtrips_for_owner() {
        let state = state();
        let headers = auth_headers("alice@x.com");

        let resp = datasite_states(State(state.clone()), headers.clone())
            .await
            .unwrap()
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        state
            .store
            .create("alice@x.com/f.txt", b"hello world")
            .unwrap();

        let resp = download(
            State(state.clone()),
            headers,
            Json(DownloadRequest {
                path: "alice@x.com/f.txt".to_string(),
            }),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn download_denies_non_owner_without_permission() {
        let state = state();
        state
            .store
            .create("alice@x.com/private/f.txt", b"secret")
            .unwrap();
        crate::permission::PermissionFile::datasite_default("alice@x.com")
            .save(&state.datasites_root.join("alice@x.com/_.syftperm"))
            .unwrap();

        let err = download(
            State(state.clone()),
            auth_headers("mallory@x.com"),
            Json(DownloadRequest {
                path: "alice@x.com/private/f.txt".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn apply_diff_conflict_maps_to_409() {
        let state = state();
        state
            .store
            .create("alice@x.com/f.txt", b"original content")
            .unwrap();
        let sig = crate::rsync::calculate_signature(b"original content");
        let diff = crate::rsync::compute_diff(&sig, b"different content").unwrap();

        let err = apply_diff(
            State(state.clone()),
            auth_headers("alice@x.com"),
            Json(ApplyDiffRequest {
                path: "alice@x.com/f.txt".to_string(),
                diff,
                expected_hash: "0000".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_missing_path_maps_to_404() {
        let state = state();
        let err = delete(
            State(state.clone()),
            auth_headers("alice@x.com"),
            Json(DeleteRequest {
                path: "alice@x.com/missing.txt".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
