//! Durable, versioned storage for key material.
//!
//! # Table design
//!
//! One `KEY_MATERIAL` table keyed by
//! ```text
//! [ environment bytes | 0x00 | version: u64 big-endian ]
//! ```
//! Environment names never contain `0x00`, so a range scan over one prefix
//! returns exactly that environment's versions in ascending order.

use super::KeyMaterialRecord;
use crate::error::{Result, RolloutError};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;

pub trait KeyStore: Send + Sync {
    /// Store a payload as the next version for `environment`.
    fn put(&self, environment: &str, payload: &str, key_count: usize) -> Result<KeyMaterialRecord>;

    /// Fetch one version, or the highest when `version` is `None`.
    fn get(&self, environment: &str, version: Option<u64>) -> Result<KeyMaterialRecord>;

    /// All versions for `environment`, oldest first.
    fn list(&self, environment: &str) -> Result<Vec<KeyMaterialRecord>>;
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

const KEY_MATERIAL: TableDefinition<&[u8], &[u8]> = TableDefinition::new("key_material");

fn record_key(environment: &str, version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(environment.len() + 9);
    key.extend_from_slice(environment.as_bytes());
    key.push(0);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn env_bounds(environment: &str) -> (Vec<u8>, Vec<u8>) {
    (record_key(environment, 0), record_key(environment, u64::MAX))
}

fn unavailable(e: impl std::fmt::Display) -> RolloutError {
    RolloutError::BackupStoreUnavailable(e.to_string())
}

// ---------------------------------------------------------------------------
// RedbKeyStore
// ---------------------------------------------------------------------------

pub struct RedbKeyStore {
    db: Database,
}

impl RedbKeyStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(unavailable)?;
        }
        let db = Database::create(path).map_err(unavailable)?;
        let wt = db.begin_write().map_err(unavailable)?;
        wt.open_table(KEY_MATERIAL).map_err(unavailable)?;
        wt.commit().map_err(unavailable)?;
        Ok(Self { db })
    }
}

impl KeyStore for RedbKeyStore {
    fn put(&self, environment: &str, payload: &str, key_count: usize) -> Result<KeyMaterialRecord> {
        let wt = self.db.begin_write().map_err(unavailable)?;
        let record = {
            let mut table = wt.open_table(KEY_MATERIAL).map_err(unavailable)?;
            let (lo, hi) = env_bounds(environment);
            let latest = match table
                .range(lo.as_slice()..=hi.as_slice())
                .map_err(unavailable)?
                .next_back()
            {
                Some(entry) => {
                    let (_, v) = entry.map_err(unavailable)?;
                    let prev: KeyMaterialRecord = serde_json::from_slice(v.value())?;
                    prev.version
                }
                None => 0,
            };
            let record = KeyMaterialRecord {
                environment: environment.to_string(),
                version: latest + 1,
                payload: payload.to_string(),
                captured_at: Utc::now(),
                key_count,
            };
            let value = serde_json::to_vec(&record)?;
            table
                .insert(record_key(environment, record.version).as_slice(), value.as_slice())
                .map_err(unavailable)?;
            record
        };
        wt.commit().map_err(unavailable)?;
        Ok(record)
    }

    fn get(&self, environment: &str, version: Option<u64>) -> Result<KeyMaterialRecord> {
        let not_found = || RolloutError::RestoreVersionNotFound {
            environment: environment.to_string(),
            version,
        };
        let rt = self.db.begin_read().map_err(unavailable)?;
        let table = rt.open_table(KEY_MATERIAL).map_err(unavailable)?;
        let bytes = match version {
            Some(v) => table
                .get(record_key(environment, v).as_slice())
                .map_err(unavailable)?
                .map(|g| g.value().to_vec()),
            None => {
                let (lo, hi) = env_bounds(environment);
                match table
                    .range(lo.as_slice()..=hi.as_slice())
                    .map_err(unavailable)?
                    .next_back()
                {
                    Some(entry) => Some(entry.map_err(unavailable)?.1.value().to_vec()),
                    None => None,
                }
            }
        };
        let bytes = bytes.ok_or_else(not_found)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn list(&self, environment: &str) -> Result<Vec<KeyMaterialRecord>> {
        let rt = self.db.begin_read().map_err(unavailable)?;
        let table = rt.open_table(KEY_MATERIAL).map_err(unavailable)?;
        let (lo, hi) = env_bounds(environment);
        let mut out = Vec::new();
        for entry in table
            .range(lo.as_slice()..=hi.as_slice())
            .map_err(unavailable)?
        {
            let (_, v) = entry.map_err(unavailable)?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
