use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Fixed basename for a permission file in any directory of a datasite.
pub const PERMISSION_FILENAME: &str = "_.syftperm";

/// Principal meaning "everyone", usable in any of `read`/`write`/`admin`.
pub const GLOBAL: &str = "GLOBAL";

/// A single permission file: `{admin, read, write}` lists of emails (or `GLOBAL`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionFile {
    #[serde(default)]
    pub admin: Vec<String>,
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
}

impl PermissionFile {
    /// Owner-only: the datasite owner can read, write, and administer.
    pub fn datasite_default(email: &str) -> Self {
        Self {
            admin: vec![email.to_string()],
            read: vec![email.to_string()],
            write: vec![email.to_string()],
        }
    }

    /// Owner read/write/admin, plus public read (e.g. under `public/`).
    pub fn mine_with_public_read(email: &str) -> Self {
        Self {
            admin: vec![email.to_string()],
            read: vec![email.to_string(), GLOBAL.to_string()],
            write: vec![email.to_string()],
        }
    }

    pub fn no_permission() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read permission file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parse permission file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if path.file_name().and_then(|n| n.to_str()) != Some(PERMISSION_FILENAME) {
            anyhow::bail!(
                "permission files must be named {}, got {}",
                PERMISSION_FILENAME,
                path.display()
            );
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(self).context("serialize permission file")?;
        crate::fsops::atomic_write(path, &body)
    }

    fn allows(list: &[String], user: &str, allow_global: bool) -> bool {
        list.iter().any(|p| p == user) || (allow_global && list.iter().any(|p| p == GLOBAL))
    }
}

/// Effective access for one user at one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Effective {
    pub read: bool,
    pub write: bool,
    pub admin: bool,
}

impl Effective {
    pub fn deny() -> Self {
        Self::default()
    }
}

/// The materialized union of all `_.syftperm` files under one datasite.
///
/// Invariant: the effective permission at any path is that of the *deepest* permission
/// file on the path's ancestor chain (including the path itself if it is a directory
/// containing one); if none exists anywhere on the chain, the permission is empty (deny).
#[derive(Debug, Clone, Default)]
pub struct PermissionTree {
    datasite_root: PathBuf,
    /// Keyed by the directory (relative to `datasite_root`, POSIX-style, "" for the root)
    /// the permission file lives in.
    by_dir: HashMap<String, PermissionFile>,
}

impl PermissionTree {
    /// Walks `datasite_root` for every `_.syftperm` file and loads it.
    pub fn load(datasite_root: &Path) -> Result<Self> {
        let mut by_dir = HashMap::new();
        if datasite_root.exists() {
            for entry in walkdir::WalkDir::new(datasite_root).follow_links(false) {
                let entry = entry.with_context(|| {
                    format!("walk permission tree under {}", datasite_root.display())
                })?;
                if entry.file_type().is_file()
                    && entry.file_name().to_str() == Some(PERMISSION_FILENAME)
                {
                    let perm = PermissionFile::load(entry.path())?;
                    let dir = entry.path().parent().unwrap_or(datasite_root);
                    let rel = dir
                        .strip_prefix(datasite_root)
                        .unwrap_or(Path::new(""));
                    by_dir.insert(crate::hash::to_posix_rel_path(rel), perm);
                }
            }
        }
        Ok(Self {
            datasite_root: datasite_root.to_path_buf(),
            by_dir,
        })
    }

    pub fn root_or_default(&self, owner_email: &str) -> PermissionFile {
        self.by_dir
            .get("")
            .cloned()
            .unwrap_or_else(|| PermissionFile::datasite_default(owner_email))
    }

    /// Finds the deepest permission file governing `rel_path`, walking from the root
    /// down. Returns `None` if no ancestor directory has a permission file.
    pub fn permission_for_path(&self, rel_path: &str) -> Option<&PermissionFile> {
        let segments: Vec<&str> = rel_path.split('/').filter(|s| !s.is_empty()).collect();
        // The file's own directory is segments[..len-1]; walk root -> deepest ancestor,
        // keeping the last match (deepest wins).
        let mut current: Option<&PermissionFile> = self.by_dir.get("");
        let mut prefix = String::new();
        // Exclude the last segment (the file/dir name itself is not a containing dir
        // unless rel_path names a directory with its own permission file directly).
        let dir_segments = if segments.is_empty() {
            &segments[..]
        } else {
            &segments[..segments.len() - 1]
        };
        for seg in dir_segments {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(seg);
            if let Some(p) = self.by_dir.get(&prefix) {
                current = Some(p);
            }
        }
        current
    }

    /// Effective read/write/admin for `user` at `rel_path`. `admin` implies all rights
    /// and ignores `GLOBAL` (an admin grant is never public).
    pub fn effective(&self, rel_path: &str, user: &str) -> Effective {
        let perm = match self.permission_for_path(rel_path) {
            Some(p) => p,
            None => return Effective::deny(),
        };
        let is_admin = PermissionFile::allows(&perm.admin, user, false);
        if is_admin {
            return Effective {
                read: true,
                write: true,
                admin: true,
            };
        }
        Effective {
            read: PermissionFile::allows(&perm.read, user, true),
            write: PermissionFile::allows(&perm.write, user, true),
            admin: false,
        }
    }

    pub fn datasite_root(&self) -> &Path {
        &self.datasite_root
    }

    /// True if `rel_path`'s basename is the fixed permission filename.
    pub fn is_permission_path(rel_path: &str) -> bool {
        rel_path
            .rsplit('/')
            .next()
            .map(|name| name == PERMISSION_FILENAME)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("syftbox-rs-perm-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn deepest_ancestor_wins() {
        let root = tmp();
        PermissionFile::datasite_default("owner@x.com")
            .save(&root.join(PERMISSION_FILENAME))
            .unwrap();
        std::fs::create_dir_all(root.join("folder1")).unwrap();
        PermissionFile {
            admin: vec![],
            read: vec![GLOBAL.to_string()],
            write: vec!["owner@x.com".to_string()],
        }
        .save(&root.join("folder1").join(PERMISSION_FILENAME))
        .unwrap();

        let tree = PermissionTree::load(&root).unwrap();

        // At the root, only the owner has access.
        let at_root = tree.effective("top.txt", "anyone@y.com");
        assert!(!at_root.read);

        // Under folder1, the deeper file grants public read.
        let nested = tree.effective("folder1/file.txt", "anyone@y.com");
        assert!(nested.read);
        assert!(!nested.write);

        let owner_nested = tree.effective("folder1/file.txt", "owner@x.com");
        assert!(owner_nested.write);
    }

    #[test]
    fn admin_ignores_global_and_implies_all_rights() {
        let root = tmp();
        PermissionFile {
            admin: vec!["admin@x.com".to_string()],
            read: vec![],
            write: vec![],
        }
        .save(&root.join(PERMISSION_FILENAME))
        .unwrap();
        let tree = PermissionTree::load(&root).unwrap();
        let eff = tree.effective("anything.txt", "admin@x.com");
        assert!(eff.read && eff.write && eff.admin);

        let stranger = tree.effective("anything.txt", "stranger@y.com");
        assert!(!stranger.read && !stranger.write && !stranger.admin);
    }

    #[test]
    fn undefined_path_denies() {
        let root = tmp();
        let tree = PermissionTree::load(&root).unwrap();
        let eff = tree.effective("nowhere/file.txt", "anyone@y.com");
        assert_eq!(eff, Effective::deny());
    }

    #[test]
    fn is_permission_path_matches_fixed_name_only() {
        assert!(PermissionTree::is_permission_path("a@b.com/_.syftperm"));
        assert!(PermissionTree::is_permission_path("_.syftperm"));
        assert!(!PermissionTree::is_permission_path("a@b.com/file.txt"));
    }

    #[test]
    fn save_rejects_wrong_filename() {
        let root = tmp();
        let err = PermissionFile::no_permission()
            .save(&root.join("not-the-right-name.json"))
            .unwrap_err();
        assert!(err.to_string().contains("_.syftperm"));
    }
}
