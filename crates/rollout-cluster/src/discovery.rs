//! Load-balancer address discovery.

use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use kube::Client;
use rollout_core::probe::ProbeFailure;
use rollout_core::propagation::{DiscoverySpec, EndpointDiscovery};
use tracing::debug;

pub struct ServiceDiscovery {
    client: Client,
    default_namespace: String,
}

impl ServiceDiscovery {
    pub fn new(client: Client, default_namespace: impl Into<String>) -> Self {
        Self {
            client,
            default_namespace: default_namespace.into(),
        }
    }
}

/// First ingress entry: hostname if present, else ip.
pub fn ingress_address(service: &Service) -> Option<String> {
    let ingress = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;
    ingress
        .hostname
        .clone()
        .filter(|h| !h.is_empty())
        .or_else(|| ingress.ip.clone().filter(|ip| !ip.is_empty()))
}

impl EndpointDiscovery for ServiceDiscovery {
    fn endpoint<'a>(&'a self, spec: &'a DiscoverySpec) -> BoxFuture<'a, Result<String, ProbeFailure>> {
        Box::pin(async move {
            let ns = spec.namespace.as_deref().unwrap_or(&self.default_namespace);
            let api: Api<Service> = Api::namespaced(self.client.clone(), ns);
            let service = api
                .get_opt(&spec.service)
                .await
                .map_err(|e| ProbeFailure::Transport(e.to_string()))?
                .ok_or_else(|| {
                    ProbeFailure::NotReady(format!("service {ns}/{} not found", spec.service))
                })?;
            debug!(namespace = ns, service = %spec.service, "service read");
            ingress_address(&service).ok_or_else(|| {
                ProbeFailure::NotReady(format!(
                    "service {ns}/{} has no load-balancer address yet",
                    spec.service
                ))
            })
        })
    }
}
