use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("not initialized: no manifest at {0}")]
    ManifestNotFound(PathBuf),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid id '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidId(String),

    #[error("unit not found: {0}")]
    UnitNotFound(String),

    #[error("unknown environment '{0}': not declared under 'environments'")]
    UnknownEnvironment(String),

    #[error("propagation target not found: {0}")]
    TargetNotFound(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("record store error: {0}")]
    RecordStore(String),

    /// The store refused a write because the record changed after it was read.
    #[error("record '{0}' was modified since it was read")]
    RecordConflict(String),

    #[error("field '{field}' in record '{record}': {reason}")]
    Field {
        record: String,
        field: String,
        reason: String,
    },

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("key backup store unavailable: {0}")]
    BackupStoreUnavailable(String),

    #[error("key material {} not found for environment '{environment}'", version_label(.version))]
    RestoreVersionNotFound {
        environment: String,
        version: Option<u64>,
    },

    #[error("key source error: {0}")]
    KeySource(String),

    #[error("key payload could not be decoded: {0}")]
    KeyPayload(String),

    #[error("age binary not found in PATH")]
    AgeNotInstalled,

    #[error("age encrypt failed: {0}")]
    AgeEncryptFailed(String),

    #[error("age decrypt failed: {0}")]
    AgeDecryptFailed(String),

    #[error("endpoint discovery failed: {0}")]
    Discovery(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn version_label(version: &Option<u64>) -> String {
    match version {
        Some(v) => format!("version {v}"),
        None => "(any version)".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, RolloutError>;
