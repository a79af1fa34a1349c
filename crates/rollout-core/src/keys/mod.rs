//! Secret key lifecycle: capture the sealing component's active keys after it
//! comes up, and put them back when a cluster is rebuilt.

pub mod envelope;
pub mod store;

use crate::error::{Result, RolloutError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use envelope::Envelope;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use store::KeyStore;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One key as it lives in the cluster. `data` values are base64, exactly as
/// the cluster reports them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_type: Option<String>,
    pub data: BTreeMap<String, String>,
}

/// A stored capture. Exactly one per `(environment, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterialRecord {
    pub environment: String,
    pub version: u64,
    /// base64 of the (optionally enveloped) JSON key list.
    pub payload: String,
    pub captured_at: DateTime<Utc>,
    pub key_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KeyBackupOutcome {
    Stored { version: u64, key_count: usize },
    /// Backup did not happen; the run continues.
    Warning { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreResult {
    pub environment: String,
    pub version: u64,
    pub restored_keys: Vec<String>,
    pub reloaded: bool,
}

/// Where key material lives in the cluster.
pub trait KeySource: Send + Sync {
    fn extract<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, Result<Vec<KeyEntry>>>;
    fn install<'a>(&'a self, namespace: &'a str, keys: &'a [KeyEntry]) -> BoxFuture<'a, Result<()>>;
    /// Make the sealing component pick up installed keys.
    fn reload<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, Result<()>>;
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

pub fn encode_payload(keys: &[KeyEntry], envelope: &dyn Envelope) -> Result<String> {
    let json = serde_json::to_vec(keys)?;
    let sealed = envelope.seal(&json)?;
    Ok(STANDARD.encode(sealed))
}

pub fn decode_payload(payload: &str, envelope: &dyn Envelope) -> Result<Vec<KeyEntry>> {
    let sealed = STANDARD
        .decode(payload.trim())
        .map_err(|e| RolloutError::KeyPayload(e.to_string()))?;
    let json = envelope.open(&sealed)?;
    serde_json::from_slice(&json).map_err(|e| RolloutError::KeyPayload(e.to_string()))
}

// ---------------------------------------------------------------------------
// KeyLifecycle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct KeyLifecycle {
    source: Arc<dyn KeySource>,
    store: Arc<dyn KeyStore>,
    envelope: Arc<dyn Envelope>,
    namespace: String,
}

impl KeyLifecycle {
    pub fn new(
        source: Arc<dyn KeySource>,
        store: Arc<dyn KeyStore>,
        envelope: Arc<dyn Envelope>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            source,
            store,
            envelope,
            namespace: namespace.into(),
        }
    }

    /// Capture the active keys and store them as a new version.
    pub async fn backup(&self, environment: &str) -> Result<KeyMaterialRecord> {
        let keys = self.source.extract(&self.namespace).await?;
        if keys.is_empty() {
            return Err(RolloutError::KeySource(format!(
                "no active sealing keys in namespace '{}'",
                self.namespace
            )));
        }
        let payload = encode_payload(&keys, self.envelope.as_ref())?;
        let store = Arc::clone(&self.store);
        let (env, key_count) = (environment.to_string(), keys.len());
        let record = blocking(move || store.put(&env, &payload, key_count)).await?;
        info!(
            environment,
            version = record.version,
            keys = record.key_count,
            envelope = self.envelope.name(),
            "key material stored"
        );
        Ok(record)
    }

    /// Like [`backup`](Self::backup) but never fails: problems become a
    /// warning outcome.
    pub async fn backup_or_warn(&self, environment: &str) -> KeyBackupOutcome {
        match self.backup(environment).await {
            Ok(r) => KeyBackupOutcome::Stored {
                version: r.version,
                key_count: r.key_count,
            },
            Err(e) => {
                warn!(environment, "key backup skipped: {e}");
                KeyBackupOutcome::Warning {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Write a stored version back into the cluster and trigger a reload.
    /// `None` restores the highest version.
    pub async fn restore(&self, environment: &str, version: Option<u64>) -> Result<RestoreResult> {
        let store = Arc::clone(&self.store);
        let env = environment.to_string();
        let record = blocking(move || store.get(&env, version)).await?;
        let keys = decode_payload(&record.payload, self.envelope.as_ref())?;
        self.source.install(&self.namespace, &keys).await?;
        self.source.reload(&self.namespace).await?;
        info!(environment, version = record.version, keys = keys.len(), "key material restored");
        Ok(RestoreResult {
            environment: environment.to_string(),
            version: record.version,
            restored_keys: keys.into_iter().map(|k| k.name).collect(),
            reloaded: true,
        })
    }

    pub fn list(&self, environment: &str) -> Result<Vec<KeyMaterialRecord>> {
        self.store.list(environment)
    }
}

/// Key store calls touch the database file; keep them off the async workers.
async fn blocking<T, F>(call: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| RolloutError::BackupStoreUnavailable(format!("key store task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
