use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::hash::{self, FileMetadata};

/// Server-side mirror of every datasite plus a metadata table keyed by path, matching
/// §4.11: "server keeps a snapshot directory mirroring all datasites and a metadata
/// table `(path -> hash, signature, size, mtime)`".
///
/// A single [`rusqlite::Connection`] behind a mutex serializes metadata reads/writes;
/// `apply_diff`/`create`/`delete` additionally hold the mutex across their own
/// read-modify-write of the snapshot file, giving the "exclusive write lock held
/// across read-modify-write" guarantee §5 asks for per path (coarsened to the whole
/// store, which is simpler than per-path locking and is never a bottleneck at
/// datasite-sync scale).
pub struct FileStore {
    snapshot_dir: PathBuf,
    conn: Mutex<Connection>,
}

impl FileStore {
    /// Opens (creating if needed) the sqlite metadata db at `db_path`, mirroring files
    /// under `snapshot_dir`.
    pub fn open(db_path: &Path, snapshot_dir: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::create_dir_all(snapshot_dir)
            .with_context(|| format!("create {}", snapshot_dir.display()))?;
        let conn = Connection::open(db_path)
            .with_context(|| format!("open sqlite db {}", db_path.display()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS file_metadata (
                path TEXT PRIMARY KEY,
                hash TEXT NOT NULL,
                signature BLOB NOT NULL,
                size INTEGER NOT NULL,
                last_modified TEXT NOT NULL
            )",
            [],
        )
        .context("create file_metadata table")?;
        Ok(Self {
            snapshot_dir: snapshot_dir.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    fn abs_path(&self, rel_path: &str) -> PathBuf {
        hash::from_posix_rel_path(&self.snapshot_dir, rel_path)
    }

    /// Every email with at least one path recorded. Used by `/sync/datasite_states`.
    pub fn datasite_emails(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT path FROM file_metadata")?;
        let mut emails = std::collections::BTreeSet::new();
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        for path in rows {
            let path = path?;
            if let Some(email) = path.split('/').next() {
                if !email.is_empty() {
                    emails.insert(email.to_string());
                }
            }
        }
        Ok(emails.into_iter().collect())
    }

    /// All metadata rows under `prefix_dir` (POSIX path, may be "" for everything).
    pub fn list_dir(&self, prefix_dir: &str) -> Result<Vec<FileMetadata>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT path, hash, signature, size, last_modified FROM file_metadata")?;
        let rows = stmt.query_map([], Self::row_to_metadata)?;
        let prefix = normalize_dir_prefix(prefix_dir);
        let mut out = Vec::new();
        for row in rows {
            let meta = row?;
            if prefix.is_empty() || meta.path.starts_with(&prefix) {
                out.push(meta);
            }
        }
        Ok(out)
    }

    /// `%`-glob match against path, per §6.1 ("glob `%` allowed on server side").
    pub fn get_metadata(&self, path_like: &str) -> Result<Vec<FileMetadata>> {
        let conn = self.conn.lock().unwrap();
        let pattern = path_like.replace('%', "*");
        let glob = globset::GlobBuilder::new(&pattern)
            .literal_separator(false)
            .build()
            .with_context(|| format!("invalid path pattern {path_like}"))?
            .compile_matcher();
        let mut stmt =
            conn.prepare("SELECT path, hash, signature, size, last_modified FROM file_metadata")?;
        let rows = stmt.query_map([], Self::row_to_metadata)?;
        let mut out = Vec::new();
        for row in rows {
            let meta = row?;
            if meta.path == path_like || glob.is_match(&meta.path) {
                out.push(meta);
            }
        }
        Ok(out)
    }

    pub fn metadata_for_path(&self, path: &str) -> Result<Option<FileMetadata>> {
        let conn = self.conn.lock().unwrap();
        Self::metadata_for_path_locked(&conn, path)
    }

    fn metadata_for_path_locked(conn: &Connection, path: &str) -> Result<Option<FileMetadata>> {
        conn.query_row(
            "SELECT path, hash, signature, size, last_modified FROM file_metadata WHERE path = ?1",
            params![path],
            Self::row_to_metadata,
        )
        .optional()
        .context("query file_metadata")
    }

    /// Reads the current snapshot bytes for `path`, or `None` if the path has no
    /// recorded metadata.
    pub fn read_bytes(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        if Self::metadata_for_path_locked(&conn, path)?.is_none() {
            return Ok(None);
        }
        drop(conn);
        let abs = self.abs_path(path);
        Ok(Some(
            std::fs::read(&abs).with_context(|| format!("read {}", abs.display()))?,
        ))
    }

    /// `POST /sync/create`: writes `data` at `path` and records fresh metadata. Fails
    /// if `path` already has metadata (§6.1: "409 if path exists").
    pub fn create(&self, path: &str, data: &[u8]) -> Result<FileMetadata> {
        let conn = self.conn.lock().unwrap();
        if Self::metadata_for_path_locked(&conn, path)?.is_some() {
            anyhow::bail!("path already exists: {path}");
        }
        let abs = self.abs_path(path);
        crate::fsops::atomic_write(&abs, data)?;
        let meta = self.recompute_metadata(path, &abs)?;
        Self::upsert_locked(&conn, &meta)?;
        Ok(meta)
    }

    /// `POST /sync/delete`: removes the snapshot file and its metadata row. Fails if
    /// the path has no metadata (§6.1: "404 if absent").
    pub fn delete(&self, path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if Self::metadata_for_path_locked(&conn, path)?.is_none() {
            anyhow::bail!("not found: {path}");
        }
        conn.execute("DELETE FROM file_metadata WHERE path = ?1", params![path])
            .context("delete file_metadata row")?;
        let abs = self.abs_path(path);
        if abs.is_file() {
            std::fs::remove_file(&abs).with_context(|| format!("remove {}", abs.display()))?;
        }
        crate::fsops::remove_empty_ancestors(
            abs.parent().unwrap_or(&self.snapshot_dir),
            &self.snapshot_dir,
        );
        Ok(())
    }

    /// `POST /sync/get_diff`: an rsync delta from `signature` (the client's current
    /// bytes) to the server's current bytes for `path`, plus the hash the client
    /// should expect after applying it locally.
    pub fn get_diff(&self, path: &str, signature: &[u8]) -> Result<(Vec<u8>, String)> {
        let conn = self.conn.lock().unwrap();
        let meta = Self::metadata_for_path_locked(&conn, path)?
            .ok_or_else(|| anyhow::anyhow!("not found: {path}"))?;
        drop(conn);
        let abs = self.abs_path(path);
        let current = std::fs::read(&abs).with_context(|| format!("read {}", abs.display()))?;
        let diff = crate::rsync::compute_diff(signature, &current)
            .with_context(|| format!("compute diff for {path}"))?;
        Ok((diff, meta.hash))
    }

    /// `POST /sync/apply_diff`: applies a client delta to the server's current bytes,
    /// verifies the result hash matches `expected_hash`, and only then persists it.
    /// Returns `Err` (the caller maps to 409) on mismatch, leaving the prior write
    /// untouched -- §4.11/§7: "server rolls back its write (no metadata update)".
    pub fn apply_diff(&self, path: &str, diff: &[u8], expected_hash: &str) -> Result<FileMetadata> {
        let conn = self.conn.lock().unwrap();
        if Self::metadata_for_path_locked(&conn, path)?.is_none() {
            anyhow::bail!("not found: {path}");
        }
        let abs = self.abs_path(path);
        let current = std::fs::read(&abs).with_context(|| format!("read {}", abs.display()))?;
        let applied = crate::rsync::apply_diff(&current, diff)
            .with_context(|| format!("apply diff for {path}"))?;
        let actual_hash = hex_sha256(&applied);
        if actual_hash != expected_hash {
            anyhow::bail!(HashMismatch {
                path: path.to_string(),
                expected: expected_hash.to_string(),
                actual: actual_hash,
            });
        }
        crate::fsops::atomic_write(&abs, &applied)?;
        let meta = self.recompute_metadata(path, &abs)?;
        Self::upsert_locked(&conn, &meta)?;
        Ok(meta)
    }

    fn recompute_metadata(&self, path: &str, abs: &Path) -> Result<FileMetadata> {
        let mut meta = hash::hash_file(abs, path)?;
        meta.signature = crate::rsync::calculate_signature(&std::fs::read(abs)?);
        Ok(meta)
    }

    fn upsert_locked(conn: &Connection, meta: &FileMetadata) -> Result<()> {
        conn.execute(
            "INSERT INTO file_metadata (path, hash, signature, size, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET
                hash = excluded.hash,
                signature = excluded.signature,
                size = excluded.size,
                last_modified = excluded.last_modified",
            params![
                meta.path,
                meta.hash,
                meta.signature,
                meta.size as i64,
                meta.last_modified.to_rfc3339(),
            ],
        )
        .context("upsert file_metadata")?;
        Ok(())
    }

    fn row_to_metadata(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileMetadata> {
        let path: String = row.get(0)?;
        let hash: String = row.get(1)?;
        let signature: Vec<u8> = row.get(2)?;
        let size: i64 = row.get(3)?;
        let last_modified: String = row.get(4)?;
        let last_modified = DateTime::parse_from_rfc3339(&last_modified)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).single().unwrap());
        Ok(FileMetadata {
            path,
            hash,
            signature,
            size: size as u64,
            last_modified,
        })
    }
}

/// Raised by [`FileStore::apply_diff`] when the post-apply hash doesn't match what the
/// client expected; the caller (§6.1) maps this to HTTP 409.
#[derive(Debug)]
pub struct HashMismatch {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

impl std::fmt::Display for HashMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "hash mismatch applying diff to {}: expected {}, got {}",
            self.path, self.expected, self.actual
        )
    }
}

impl std::error::Error for HashMismatch {}

fn normalize_dir_prefix(dir: &str) -> String {
    let trimmed = dir.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

fn hex_sha256(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp() -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "syftbox-rs-store-test-{}",
            uuid::Uuid::new_v4()
        ));
        (dir.join("store.db"), dir.join("snapshot"))
    }

    #[test]
    fn create_then_get_metadata_roundtrips() {
        let (db_path, snapshot) = tmp();
        let store = FileStore::open(&db_path, &snapshot).unwrap();
        let meta = store.create("a@x.com/f.txt", b"hello").unwrap();
        assert_eq!(meta.size, 5);

        let found = store.metadata_for_path("a@x.com/f.txt").unwrap().unwrap();
        assert_eq!(found.hash, meta.hash);

        let bytes = store.read_bytes("a@x.com/f.txt").unwrap().unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn create_rejects_duplicate_path() {
        let (db_path, snapshot) = tmp();
        let store = FileStore::open(&db_path, &snapshot).unwrap();
        store.create("a@x.com/f.txt", b"hello").unwrap();
        let err = store.create("a@x.com/f.txt", b"again").unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn delete_removes_file_and_metadata() {
        let (db_path, snapshot) = tmp();
        let store = FileStore::open(&db_path, &snapshot).unwrap();
        store.create("a@x.com/f.txt", b"hello").unwrap();
        store.delete("a@x.com/f.txt").unwrap();
        assert!(store.metadata_for_path("a@x.com/f.txt").unwrap().is_none());
        assert!(store.read_bytes("a@x.com/f.txt").unwrap().is_none());
    }

    #[test]
    fn delete_missing_path_errors() {
        let (db_path, snapshot) = tmp();
        let store = FileStore::open(&db_path, &snapshot).unwrap();
        let err = store.delete("a@x.com/missing.txt").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn get_diff_then_apply_diff_converges_and_updates_hash() {
        let (db_path, snapshot) = tmp();
        let store = FileStore::open(&db_path, &snapshot).unwrap();
        let original = b"the quick brown fox jumps over the lazy dog".repeat(20);
        store.create("a@x.com/f.txt", &original).unwrap();

        let mut updated = original.clone();
        updated.extend_from_slice(b" -- updated");
        store.delete("a@x.com/f.txt").unwrap();
        store.create("a@x.com/f.txt", &updated).unwrap();

        let client_signature = crate::rsync::calculate_signature(&original);
        let (diff, expected_hash) = store.get_diff("a@x.com/f.txt", &client_signature).unwrap();
        let client_applied = crate::rsync::apply_diff(&original, &diff).unwrap();
        assert_eq!(hex_sha256(&client_applied), expected_hash);
        assert_eq!(client_applied, updated);
    }

    #[test]
    fn apply_diff_rejects_hash_mismatch_without_writing() {
        let (db_path, snapshot) = tmp();
        let store = FileStore::open(&db_path, &snapshot).unwrap();
        store.create("a@x.com/f.txt", b"original content").unwrap();
        let before = store.metadata_for_path("a@x.com/f.txt").unwrap().unwrap();

        let sig = crate::rsync::calculate_signature(b"original content");
        let diff = crate::rsync::compute_diff(&sig, b"different content").unwrap();
        let err = store
            .apply_diff("a@x.com/f.txt", &diff, "0000000000000000")
            .unwrap_err();
        assert!(err.downcast_ref::<HashMismatch>().is_some());

        let after = store.metadata_for_path("a@x.com/f.txt").unwrap().unwrap();
        assert_eq!(before.hash, after.hash);
    }

    #[test]
    fn get_metadata_glob_matches_percent_wildcard() {
        let (db_path, snapshot) = tmp();
        let store = FileStore::open(&db_path, &snapshot).unwrap();
        store.create("a@x.com/public/one.txt", b"1").unwrap();
        store.create("a@x.com/public/two.txt", b"2").unwrap();
        store.create("a@x.com/private/three.txt", b"3").unwrap();

        let found = store.get_metadata("a@x.com/public/%").unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn list_dir_filters_by_prefix() {
        let (db_path, snapshot) = tmp();
        let store = FileStore::open(&db_path, &snapshot).unwrap();
        store.create("a@x.com/public/one.txt", b"1").unwrap();
        store.create("b@x.com/public/one.txt", b"1").unwrap();

        let found = store.list_dir("a@x.com").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, "a@x.com/public/one.txt");
    }

    #[test]
    fn datasite_emails_lists_distinct_owners() {
        let (db_path, snapshot) = tmp();
        let store = FileStore::open(&db_path, &snapshot).unwrap();
        store.create("a@x.com/one.txt", b"1").unwrap();
        store.create("a@x.com/two.txt", b"2").unwrap();
        store.create("b@x.com/one.txt", b"1").unwrap();

        let emails = store.datasite_emails().unwrap();
        assert_eq!(emails, vec!["a@x.com".to_string(), "b@x.com".to_string()]);
    }
}
