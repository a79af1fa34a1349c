//! Rolling per-target backups of record content, taken before every write.

use crate::error::{Result, RolloutError};
use crate::io;
use crate::paths;
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_RETENTION: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupEntry {
    pub name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub size: u64,
}

/// Backups for one target under `.rollout/backups/<target-id>/`.
///
/// Names are `<UTC timestamp>-<seq>.bak` so lexical order is creation order.
#[derive(Debug, Clone)]
pub struct BackupStore {
    target_id: String,
    dir: PathBuf,
    retention: usize,
}

impl BackupStore {
    pub fn for_target(root: &Path, target_id: &str, retention: usize) -> Self {
        Self {
            target_id: target_id.to_string(),
            dir: paths::target_backup_dir(root, target_id),
            retention: retention.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store `content` as a new backup and return its name.
    pub fn save(&self, content: &[u8]) -> Result<String> {
        io::ensure_dir(&self.dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string();
        let mut seq = 0u32;
        let name = loop {
            let candidate = format!("{stamp}-{seq:03}.bak");
            if !self.dir.join(&candidate).exists() {
                break candidate;
            }
            seq += 1;
        };
        io::atomic_write(&self.dir.join(&name), content)?;
        Ok(name)
    }

    /// Oldest first. A target with no backups yields an empty list.
    pub fn list(&self) -> Result<Vec<BackupEntry>> {
        let read = match std::fs::read_dir(&self.dir) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for entry in read {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".bak") {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            entries.push(BackupEntry {
                name,
                path: entry.path(),
                size,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Delete the oldest backups beyond the retention window. Failures are
    /// logged and otherwise ignored. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let entries = match self.list() {
            Ok(e) => e,
            Err(e) => {
                warn!(target_id = %self.target_id, "could not list backups for pruning: {e}");
                return 0;
            }
        };
        let excess = entries.len().saturating_sub(self.retention);
        let mut removed = 0;
        for entry in entries.into_iter().take(excess) {
            match std::fs::remove_file(&entry.path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(target_id = %self.target_id, backup = %entry.name, "could not prune backup: {e}")
                }
            }
        }
        removed
    }

    pub fn load(&self, name: &str) -> Result<Vec<u8>> {
        if name.contains('/') || name.contains("..") {
            return Err(RolloutError::BackupNotFound(name.to_string()));
        }
        match std::fs::read(self.dir.join(name)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                RolloutError::BackupNotFound(format!("{}/{name}", self.target_id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    pub fn latest(&self) -> Result<Option<BackupEntry>> {
        Ok(self.list()?.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::for_target(dir.path(), "kc-host", 5);
        let name = store.save(b"data: 1\n").unwrap();
        assert!(name.ends_with("-000.bak"));
        assert!(dir.path().join(".rollout/backups/kc-host").join(&name).exists());
        assert_eq!(store.load(&name).unwrap(), b"data: 1\n");
    }

    #[test]
    fn list_is_oldest_first() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::for_target(dir.path(), "t", 10);
        let names: Vec<String> = (0..3).map(|i| store.save(format!("{i}").as_bytes()).unwrap()).collect();
        let listed: Vec<String> = store.list().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(listed, names);
        assert_eq!(store.latest().unwrap().unwrap().name, names[2]);
    }

    #[test]
    fn prune_keeps_newest_within_retention() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::for_target(dir.path(), "t", 5);
        let names: Vec<String> = (0..8).map(|i| store.save(format!("{i}").as_bytes()).unwrap()).collect();
        assert_eq!(store.prune(), 3);
        let listed: Vec<String> = store.list().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(listed, names[3..]);
        assert_eq!(store.prune(), 0);
    }

    #[test]
    fn missing_target_has_no_backups() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::for_target(dir.path(), "never", 5);
        assert!(store.list().unwrap().is_empty());
        assert!(store.latest().unwrap().is_none());
        assert!(matches!(
            store.load("x.bak").unwrap_err(),
            RolloutError::BackupNotFound(_)
        ));
    }
}
