//! Cluster objects as propagation records.

use crate::error::{ClusterError, Result};
use crate::status::{dynamic_api, parse_gvk};
use futures::future::BoxFuture;
use kube::api::{DynamicObject, PostParams};
use kube::Client;
use rollout_core::propagation::store::{RecordSnapshot, RecordStore};
use rollout_core::RolloutError;
use serde_json::Value;
use tracing::info;

/// `apiVersion/Kind/namespace/name`. The api version may itself contain a
/// slash, so the address is split from the right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAddress {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectAddress {
    pub fn parse(record: &str) -> Result<Self> {
        let mut parts = record.rsplitn(4, '/');
        let (Some(name), Some(namespace), Some(kind), Some(api_version)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ClusterError::ObjectAddress(record.to_string()));
        };
        if [name, namespace, kind, api_version].iter().any(|p| p.is_empty()) {
            return Err(ClusterError::ObjectAddress(record.to_string()));
        }
        Ok(Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

/// Reads and replaces whole objects. The stored `resourceVersion` is part of
/// the snapshot bytes, so any server-side change moves the checksum and a
/// stale replace is rejected by the API server.
#[derive(Clone)]
pub struct KubeRecordStore {
    client: Client,
}

impl KubeRecordStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, addr: &ObjectAddress) -> kube::Api<DynamicObject> {
        let gvk = parse_gvk(&addr.api_version, &addr.kind);
        dynamic_api(&self.client, &gvk, Some(&addr.namespace))
    }
}

fn store_error(record: &str, err: impl std::fmt::Display) -> RolloutError {
    RolloutError::RecordStore(format!("{record}: {err}"))
}

/// A 409 means the `resourceVersion` we sent is stale.
fn replace_error(record: &str, err: kube::Error) -> RolloutError {
    match err {
        kube::Error::Api(resp) if resp.code == 409 => {
            RolloutError::RecordConflict(record.to_string())
        }
        e => store_error(record, e),
    }
}

impl RecordStore for KubeRecordStore {
    fn read<'a>(&'a self, record: &'a str) -> BoxFuture<'a, rollout_core::Result<RecordSnapshot>> {
        Box::pin(async move {
            let addr = ObjectAddress::parse(record).map_err(|e| store_error(record, e))?;
            let obj = self
                .api(&addr)
                .get_opt(&addr.name)
                .await
                .map_err(|e| store_error(record, e))?
                .ok_or_else(|| RolloutError::RecordNotFound(record.to_string()))?;
            let document = serde_json::to_value(&obj)?;
            let raw = serde_json::to_vec(&document)?;
            Ok(RecordSnapshot::new(document, raw))
        })
    }

    fn write<'a>(
        &'a self,
        record: &'a str,
        document: &'a Value,
    ) -> BoxFuture<'a, rollout_core::Result<()>> {
        Box::pin(async move {
            let addr = ObjectAddress::parse(record).map_err(|e| store_error(record, e))?;
            let obj: DynamicObject = serde_json::from_value(document.clone())?;
            self.api(&addr)
                .replace(&addr.name, &PostParams::default(), &obj)
                .await
                .map_err(|e| replace_error(record, e))?;
            info!(record, "object replaced");
            Ok(())
        })
    }
}
