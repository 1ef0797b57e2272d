use std::path::Path;

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Fixed basename for the (optional) ignore-rules file at a sync root.
pub const IGNORE_FILENAME: &str = "_.syftignore";

/// Gitignore-style rules loaded from the single ignore file at the sync root, applied
/// to every datasite on this client.
pub struct IgnoreRules {
    matcher: Gitignore,
}

impl IgnoreRules {
    /// Loads `_.syftignore` from `sync_root` if present; an absent file means nothing
    /// is ignored.
    pub fn load(sync_root: &Path) -> Result<Self> {
        Self::load_from(&sync_root.join(IGNORE_FILENAME), sync_root)
    }

    /// Loads `_.syftignore` from `ignore_file` (its actual on-disk location, the data
    /// directory root per §6.3) while rooting pattern matching at `match_root` (the
    /// datasites directory), since every rel-path callers test with `is_ignored` is
    /// already prefixed with the owning datasite's email relative to `match_root`.
    pub fn load_from(ignore_file: &Path, match_root: &Path) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(match_root);
        if ignore_file.is_file() {
            if let Some(err) = builder.add(ignore_file) {
                return Err(err).with_context(|| format!("parse {}", ignore_file.display()));
            }
        }
        let matcher = builder
            .build()
            .with_context(|| format!("build ignore matcher for {}", match_root.display()))?;
        Ok(Self { matcher })
    }

    pub fn from_lines(sync_root: &Path, lines: &[&str]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(sync_root);
        for line in lines {
            builder
                .add_line(None, line)
                .with_context(|| format!("parse ignore line {:?}", line))?;
        }
        let matcher = builder.build().context("build ignore matcher")?;
        Ok(Self { matcher })
    }

    /// Tests a POSIX-style relative path (rooted at the sync root) for inclusion.
    /// Honors negation (`!pattern`) and gitignore precedence (last matching rule wins).
    pub fn is_ignored(&self, rel_path: &str, is_dir: bool) -> bool {
        let abs = self.matcher.path().join(rel_path);
        self.matcher.matched(&abs, is_dir).is_ignore()
    }
}
