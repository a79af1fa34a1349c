//! Collaborators that talk to real substrates: the Kubernetes API, HTTP
//! endpoints and Postgres.

pub mod discovery;
pub mod error;
pub mod health;
pub mod http;
pub mod objects;
pub mod prober;
pub mod records;
pub mod sealing;
pub mod status;

pub use error::{ClusterError, Result};
pub use kube::Client;

use tracing::debug;

/// Connect using the ambient kubeconfig or in-cluster service account.
pub async fn connect() -> Result<Client> {
    let client = Client::try_default().await?;
    debug!(namespace = client.default_namespace(), "cluster client ready");
    Ok(client)
}
