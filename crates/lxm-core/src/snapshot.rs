use crate::error::{EngineError, EngineResult};
use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Write `content` to `path` via a temp file in the same directory and
/// an atomic rename, so a crash mid-write never leaves a partially
/// written file in place.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{:?} has no parent directory", path))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {:?}", parent))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {:?}", parent))?;
    tmp.write_all(content)
        .with_context(|| format!("failed to write temp file for {:?}", path))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync temp file for {:?}", path))?;
    tmp.persist(path)
        .with_context(|| format!("failed to rename temp file into {:?}", path))?;
    Ok(())
}

/// Takes timestamped, append-only backups of OS-owned config files
/// before this engine overwrites them. Snapshots are never pruned here;
/// retention is an operator concern.
pub struct Snapshotter {
    dir: PathBuf,
}

impl Snapshotter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Back up the current content of `path` and return the snapshot
    /// location. A file that does not exist yet snapshots as empty, so
    /// rollback of the first-ever write restores an empty file rather
    /// than failing.
    pub fn snapshot_before(&self, path: &Path) -> Result<PathBuf> {
        let content = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {:?} for snapshot", path));
            }
        };

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{:?} has no usable file name", path))?;
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S%.3f");
        let snapshot_path = self.dir.join(format!("{}_{}", name, stamp));

        atomic_write(&snapshot_path, &content)?;
        tracing::debug!(source = ?path, snapshot = ?snapshot_path, "config snapshot taken");
        Ok(snapshot_path)
    }

    /// Restore `target` from a previously taken snapshot. Failure here
    /// is fatal: the engine no longer knows the true live state.
    pub fn restore(&self, snapshot: &Path, target: &Path) -> EngineResult<()> {
        let content = std::fs::read(snapshot).map_err(|e| {
            EngineError::ConfigCorruption(format!(
                "cannot read snapshot {:?} while restoring {:?}: {}",
                snapshot, target, e
            ))
        })?;
        atomic_write(target, &content).map_err(|e| {
            EngineError::ConfigCorruption(format!(
                "cannot restore {:?} from snapshot {:?}: {}",
                target, snapshot, e
            ))
        })?;
        tracing::warn!(target = ?target, snapshot = ?snapshot, "config restored from snapshot");
        Ok(())
    }
}
