use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Metadata recorded for a single synced file: hash, rsync signature, size and mtime.
///
/// `signature` is only ever populated server-side; a client-computed `FileMetadata`
/// (from [`hash_file`]/[`hash_dir`]) always carries an empty signature, matching the
/// invariant that clients never trust a local signature as authoritative for a remote diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub hash: String,
    #[serde(default, with = "signature_as_base85")]
    pub signature: Vec<u8>,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

impl FileMetadata {
    pub fn is_empty(&self) -> bool {
        self.hash.is_empty()
    }

    pub fn empty(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            hash: String::new(),
            signature: Vec::new(),
            size: 0,
            last_modified: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// base85-encodes arbitrary bytes for the JSON wire protocol (spec: "bytes in JSON are
/// base85-encoded").
pub fn encode_base85(bytes: &[u8]) -> String {
    base85::encode(bytes)
}

/// Decodes a base85-encoded wire field back into bytes.
pub fn decode_base85(s: &str) -> Result<Vec<u8>> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    base85::decode(s).map_err(|e| anyhow::anyhow!("base85 decode: {:?}", e))
}

mod signature_as_base85 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        base85::encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        if encoded.is_empty() {
            return Ok(Vec::new());
        }
        base85::decode(&encoded).map_err(|e| serde::de::Error::custom(format!("{:?}", e)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HashOptions {
    pub include_hidden: bool,
    pub follow_symlinks: bool,
}

/// Computes the sha256 hash, size and mtime of a single file. Never follows symlinks.
pub fn hash_file(path: &Path, rel_path: &str) -> Result<FileMetadata> {
    let meta = std::fs::symlink_metadata(path)
        .with_context(|| format!("stat {}", path.display()))?;
    if meta.file_type().is_symlink() {
        anyhow::bail!("refusing to hash a symlink: {}", path.display());
    }
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let hash = hex::encode(hasher.finalize());
    let modified = meta
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .into();
    Ok(FileMetadata {
        path: rel_path.to_string(),
        hash,
        signature: Vec::new(),
        size: meta.len(),
        last_modified: modified,
    })
}

/// Walks `root` and hashes every regular file under it, returning a map keyed by
/// POSIX-style relative path. Hidden entries (dotfiles) and symlinks are skipped by
/// default. A file that fails to read is omitted with a logged warning rather than
/// aborting the whole walk ("fails soft per file").
///
/// The returned map depends only on file bytes and metadata, never on traversal order.
pub fn hash_dir(root: &Path, options: HashOptions) -> Result<HashMap<String, FileMetadata>> {
    let mut out = HashMap::new();
    if !root.exists() {
        return Ok(out);
    }
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                crate::logging::error(format!("hash_dir: walk error: {}", err));
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        let path = entry.path();
        let rel = match path.strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if !options.include_hidden && is_hidden(rel) {
            continue;
        }
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            if options.follow_symlinks {
                // Symlinks are never synced regardless of this flag (§4.9 edge policy);
                // callers that want the pointee contents should resolve it themselves.
            }
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let rel_posix = to_posix_rel_path(rel);
        match hash_file(path, &rel_posix) {
            Ok(meta) => {
                out.insert(rel_posix, meta);
            }
            Err(err) => {
                crate::logging::error(format!("hash_dir: skipping {}: {}", path.display(), err));
            }
        }
    }
    Ok(out)
}

fn is_hidden(rel: &Path) -> bool {
    rel.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
    })
}

/// Converts a platform path (always relative) to a POSIX-style relative path string.
/// This is the only place a filesystem `Path` is converted to the wire/string
/// representation used everywhere else in the sync engine.
pub fn to_posix_rel_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Converts a POSIX-style relative path string back to a platform path, rooted at `root`.
/// This is the only place the wire representation is converted back to a filesystem `Path`.
pub fn from_posix_rel_path(root: &Path, rel: &str) -> PathBuf {
    let mut p = root.to_path_buf();
    for segment in rel.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        p.push(segment);
    }
    p
}
