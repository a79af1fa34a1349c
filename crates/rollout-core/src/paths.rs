use crate::error::{Result, RolloutError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const ROLLOUT_DIR: &str = ".rollout";
pub const BACKUPS_DIR: &str = ".rollout/backups";

pub const MANIFEST_FILE: &str = ".rollout/manifest.yaml";
pub const RUNS_LOG: &str = ".rollout/runs.jsonl";
pub const KEYS_DB: &str = ".rollout/keys.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn rollout_dir(root: &Path) -> PathBuf {
    root.join(ROLLOUT_DIR)
}

pub fn manifest_path(root: &Path) -> PathBuf {
    root.join(MANIFEST_FILE)
}

pub fn runs_log_path(root: &Path) -> PathBuf {
    root.join(RUNS_LOG)
}

pub fn keys_db_path(root: &Path) -> PathBuf {
    root.join(KEYS_DB)
}

pub fn backups_dir(root: &Path) -> PathBuf {
    root.join(BACKUPS_DIR)
}

pub fn target_backup_dir(root: &Path, target_id: &str) -> PathBuf {
    backups_dir(root).join(target_id)
}

// ---------------------------------------------------------------------------
// Id validation
// ---------------------------------------------------------------------------

static ID_RE: OnceLock<Regex> = OnceLock::new();

fn id_re() -> &'static Regex {
    ID_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Unit ids, target ids and environment names share one shape: they end up
/// in directory names and store keys.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 63 || !id_re().is_match(id) {
        return Err(RolloutError::InvalidId(id.to_string()));
    }
    Ok(())
}
