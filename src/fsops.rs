use std::path::Path;

use anyhow::{Context, Result};

/// Writes `bytes` to `path` atomically: write to a sibling temp file in the same
/// directory, then rename over the destination. Never leaves a partially-written
/// destination visible to a concurrent reader.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;

    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("syftbox"),
        uuid::Uuid::new_v4()
    );
    let tmp_path = parent.join(tmp_name);

    {
        let mut f = std::fs::File::create(&tmp_path)
            .with_context(|| format!("create temp file {}", tmp_path.display()))?;
        use std::io::Write;
        f.write_all(bytes)
            .with_context(|| format!("write temp file {}", tmp_path.display()))?;
        f.sync_all()
            .with_context(|| format!("fsync temp file {}", tmp_path.display()))?;
    }

    std::fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "rename {} -> {}",
            tmp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Removes `dir_of_deleted_file`'s ancestor directories while they are empty, stopping
/// at (and never removing) `stop_at`. Used after a local delete to keep a datasite's
/// directory tree tidy.
pub fn remove_empty_ancestors(mut dir: &Path, stop_at: &Path) {
    loop {
        if dir == stop_at || !dir.starts_with(stop_at) {
            return;
        }
        match std::fs::read_dir(dir) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return;
                }
            }
            Err(_) => return,
        }
        if std::fs::remove_dir(dir).is_err() {
            return;
        }
        match dir.parent() {
            Some(p) => dir = p,
            None => return,
        }
    }
}
