//! Builds real collaborators from the manifest and an optional cluster
//! connection.

use anyhow::Context;
use rollout_cluster::Client;
use rollout_cluster::discovery::ServiceDiscovery;
use rollout_cluster::health::HttpCheckRunner;
use rollout_cluster::http::HttpProber;
use rollout_cluster::objects::KubeRecordStore;
use rollout_cluster::prober::ClusterProber;
use rollout_cluster::sealing::SealedSecretsKeySource;
use rollout_cluster::status::ObjectStatusProber;
use rollout_core::config::{KeysConfig, Manifest};
use rollout_core::gate::{CancelHandle, CancelSignal};
use rollout_core::keys::envelope::{AgeEnvelope, Envelope, PlainEnvelope};
use rollout_core::keys::store::RedbKeyStore;
use rollout_core::keys::KeyLifecycle;
use rollout_core::orchestrator::Collaborators;
use rollout_core::probe::ProbeTarget;
use rollout_core::propagation::store::{FileRecordStore, RecordStore, RecordStores};
use rollout_core::propagation::target::StoreKind;
use rollout_core::propagation::EndpointDiscovery;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

fn object_probe(target: &ProbeTarget) -> bool {
    matches!(target, ProbeTarget::ObjectStatusField { .. })
}

/// Whether any part of a deploy talks to the cluster API.
pub fn deploy_needs_cluster(manifest: &Manifest) -> bool {
    manifest.propagation.is_some()
        || manifest.keys.is_some()
        || manifest
            .units
            .iter()
            .any(|u| object_probe(&u.readiness_probe.target))
}

pub fn targets_need_cluster(manifest: &Manifest) -> bool {
    manifest.targets().iter().any(|t| t.store == StoreKind::Object)
}

pub fn probe_needs_cluster(target: &ProbeTarget) -> bool {
    object_probe(target)
}

/// Connect, or log why not and carry on without a cluster.
pub async fn try_connect() -> Option<Client> {
    match rollout_cluster::connect().await {
        Ok(client) => Some(client),
        Err(e) => {
            warn!("continuing without a cluster connection: {e}");
            None
        }
    }
}

pub async fn require_connect() -> anyhow::Result<Client> {
    rollout_cluster::connect()
        .await
        .context("this command needs a cluster connection")
}

pub fn record_stores(root: &Path, client: Option<&Client>) -> RecordStores {
    RecordStores {
        file: Arc::new(FileRecordStore::new(root)),
        object: client.map(|c| Arc::new(KubeRecordStore::new(c.clone())) as Arc<dyn RecordStore>),
    }
}

pub fn prober(client: Option<&Client>) -> anyhow::Result<ClusterProber> {
    let http = HttpProber::new().context("failed to build HTTP client")?;
    Ok(ClusterProber::new(
        http,
        client.cloned().map(ObjectStatusProber::new),
    ))
}

pub fn check_runner() -> anyhow::Result<HttpCheckRunner> {
    let http = HttpProber::new().context("failed to build HTTP client")?;
    Ok(HttpCheckRunner::new(http.client().clone()))
}

pub fn envelope(cfg: &KeysConfig, identity: Option<PathBuf>) -> Arc<dyn Envelope> {
    if cfg.recipients.is_empty() {
        Arc::new(PlainEnvelope)
    } else {
        Arc::new(AgeEnvelope::new(cfg.recipients.clone(), identity))
    }
}

pub fn key_lifecycle(
    root: &Path,
    cfg: &KeysConfig,
    client: &Client,
    identity: Option<PathBuf>,
) -> anyhow::Result<KeyLifecycle> {
    let path = cfg.store_path(root);
    let store = RedbKeyStore::open(&path)
        .with_context(|| format!("failed to open key store at {}", path.display()))?;
    let source = SealedSecretsKeySource::new(
        client.clone(),
        cfg.key_selector.clone(),
        cfg.controller_selector.clone(),
    );
    Ok(KeyLifecycle::new(
        Arc::new(source),
        Arc::new(store),
        envelope(cfg, identity),
        cfg.namespace.clone(),
    ))
}

pub fn collaborators(
    root: &Path,
    manifest: &Manifest,
    client: Option<&Client>,
) -> anyhow::Result<Collaborators> {
    let keys = match (&manifest.keys, client) {
        (Some(cfg), Some(c)) => Some(key_lifecycle(root, cfg, c, None)?),
        _ => None,
    };
    let discovery = client.map(|c| {
        Arc::new(ServiceDiscovery::new(c.clone(), c.default_namespace())) as Arc<dyn EndpointDiscovery>
    });
    Ok(Collaborators {
        prober: Arc::new(prober(client)?),
        records: record_stores(root, client),
        discovery,
        keys,
        checks: Arc::new(check_runner()?),
    })
}

/// A cancel signal that fires on Ctrl-C. Must be called inside a runtime.
pub fn interrupt_signal() -> CancelSignal {
    let handle = CancelHandle::new();
    let signal = handle.signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            handle.cancel();
        }
    });
    signal
}
