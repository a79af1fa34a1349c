use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster API: {0}")]
    Kube(#[from] kube::Error),

    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid object address '{0}': expected apiVersion/Kind/namespace/name")]
    ObjectAddress(String),

    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Read a secret-bearing environment variable by name.
pub fn env_var(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| ClusterError::MissingEnv(name.to_string()))
}
