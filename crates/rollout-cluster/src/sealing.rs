//! Sealing-controller key material held as labelled Secrets.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use rollout_core::keys::{KeyEntry, KeySource};
use rollout_core::RolloutError;
use std::collections::BTreeMap;
use tracing::info;

const FIELD_MANAGER: &str = "rollout";

pub struct SealedSecretsKeySource {
    client: Client,
    key_selector: String,
    controller_selector: String,
}

impl SealedSecretsKeySource {
    pub fn new(
        client: Client,
        key_selector: impl Into<String>,
        controller_selector: impl Into<String>,
    ) -> Self {
        Self {
            client,
            key_selector: key_selector.into(),
            controller_selector: controller_selector.into(),
        }
    }
}

fn source_error(err: impl std::fmt::Display) -> RolloutError {
    RolloutError::KeySource(err.to_string())
}

/// Equality terms of a label selector (`a=b,c=d`) as labels.
pub fn selector_labels(selector: &str) -> BTreeMap<String, String> {
    selector
        .split(',')
        .filter_map(|term| term.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

pub fn entry_from_secret(secret: &Secret) -> KeyEntry {
    let data = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), STANDARD.encode(&v.0)))
        .collect();
    KeyEntry {
        name: secret.metadata.name.clone().unwrap_or_default(),
        secret_type: secret.type_.clone(),
        data,
    }
}

pub fn secret_from_entry(
    entry: &KeyEntry,
    namespace: &str,
    labels: &BTreeMap<String, String>,
) -> rollout_core::Result<Secret> {
    let mut data = BTreeMap::new();
    for (k, v) in &entry.data {
        let bytes = STANDARD
            .decode(v)
            .map_err(|e| RolloutError::KeyPayload(format!("{}/{k}: {e}", entry.name)))?;
        data.insert(k.clone(), ByteString(bytes));
    }
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(entry.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        type_: entry.secret_type.clone(),
        data: Some(data),
        ..Secret::default()
    })
}

impl KeySource for SealedSecretsKeySource {
    fn extract<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, rollout_core::Result<Vec<KeyEntry>>> {
        Box::pin(async move {
            let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
            let lp = ListParams::default().labels(&self.key_selector);
            let secrets = api.list(&lp).await.map_err(source_error)?;
            Ok(secrets.items.iter().map(entry_from_secret).collect())
        })
    }

    fn install<'a>(
        &'a self,
        namespace: &'a str,
        keys: &'a [KeyEntry],
    ) -> BoxFuture<'a, rollout_core::Result<()>> {
        Box::pin(async move {
            let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
            let labels = selector_labels(&self.key_selector);
            let params = PatchParams::apply(FIELD_MANAGER).force();
            for entry in keys {
                let secret = secret_from_entry(entry, namespace, &labels)?;
                api.patch(&entry.name, &params, &Patch::Apply(&secret))
                    .await
                    .map_err(source_error)?;
                info!(namespace, secret = %entry.name, "key installed");
            }
            Ok(())
        })
    }

    fn reload<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, rollout_core::Result<()>> {
        Box::pin(async move {
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
            let lp = ListParams::default().labels(&self.controller_selector);
            pods.delete_collection(&DeleteParams::default(), &lp)
                .await
                .map_err(source_error)?;
            info!(namespace, selector = %self.controller_selector, "sealing controller restarted");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_terms_become_labels() {
        let labels = selector_labels("sealedsecrets.bitnami.com/sealed-secrets-key=active");
        assert_eq!(
            labels.get("sealedsecrets.bitnami.com/sealed-secrets-key").map(String::as_str),
            Some("active")
        );
        assert_eq!(selector_labels("a=1, b=2").len(), 2);
        assert!(selector_labels("app").is_empty());
    }

    #[test]
    fn secrets_convert_both_ways() {
        let secret: Secret = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "sealed-secrets-keyx7", "namespace": "kube-system"},
            "type": "kubernetes.io/tls",
            "data": {"tls.crt": "Y2VydA==", "tls.key": "a2V5"}
        }))
        .unwrap();
        let entry = entry_from_secret(&secret);
        assert_eq!(entry.name, "sealed-secrets-keyx7");
        assert_eq!(entry.data["tls.crt"], "Y2VydA==");

        let labels = selector_labels("sealedsecrets.bitnami.com/sealed-secrets-key=active");
        let back = secret_from_entry(&entry, "kube-system", &labels).unwrap();
        assert_eq!(back.data, secret.data);
        assert_eq!(back.metadata.labels, Some(labels));
    }
}
