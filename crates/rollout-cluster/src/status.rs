//! Cluster object status probe.

use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::core::GroupVersionKind;
use kube::Client;
use rollout_core::probe::ProbeFailure;
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

const SYNC_GROUP: &str = "argoproj.io";
const SYNC_KIND: &str = "Application";

/// Aggregate state a declarative-sync application reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializationStatus {
    Unknown,
    Progressing,
    Healthy,
    Degraded,
}

impl MaterializationStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "Healthy" => Self::Healthy,
            "Progressing" | "Suspended" => Self::Progressing,
            "Degraded" | "Missing" => Self::Degraded,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for MaterializationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Progressing => "progressing",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// `v1` or `group/version`.
pub fn parse_gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

/// Render a status field for comparison with the manifest's string. Numbers
/// and booleans compare by their JSON text, so `1` matches `"1"`.
pub fn field_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn dynamic_api(client: &Client, gvk: &GroupVersionKind, namespace: Option<&str>) -> Api<DynamicObject> {
    let resource = ApiResource::from_gvk(gvk);
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &resource),
        None => Api::all_with(client.clone(), &resource),
    }
}

pub struct ObjectQuery<'a> {
    pub api_version: &'a str,
    pub kind: &'a str,
    pub namespace: Option<&'a str>,
    pub name: Option<&'a str>,
    pub selector: Option<&'a str>,
    pub field: &'a str,
    pub equals: &'a str,
}

#[derive(Clone)]
pub struct ObjectStatusProber {
    client: Client,
}

impl ObjectStatusProber {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn check(&self, unit: &str, q: &ObjectQuery<'_>) -> Result<(), ProbeFailure> {
        let gvk = parse_gvk(q.api_version, q.kind);
        let api = dynamic_api(&self.client, &gvk, q.namespace);
        let transport = |e: kube::Error| ProbeFailure::Transport(e.to_string());

        let objects = match (q.name, q.selector) {
            (Some(name), _) => match api.get_opt(name).await.map_err(transport)? {
                Some(obj) => vec![obj],
                None => {
                    return Err(ProbeFailure::NotReady(format!("{} {name} not found", q.kind)));
                }
            },
            (None, Some(selector)) => {
                let lp = ListParams::default().labels(selector);
                api.list(&lp).await.map_err(transport)?.items
            }
            (None, None) => Vec::new(),
        };
        if objects.is_empty() {
            return Err(ProbeFailure::NotReady(format!("no {} objects matched", q.kind)));
        }

        let sync_app = gvk.group == SYNC_GROUP && gvk.kind == SYNC_KIND;
        for obj in &objects {
            let doc = serde_json::to_value(obj)
                .map_err(|e| ProbeFailure::Transport(e.to_string()))?;
            let name = obj.metadata.name.as_deref().unwrap_or("?");
            if sync_app {
                log_materialization(unit, name, &doc);
            }
            let found = doc.pointer(q.field).map(field_text);
            match found {
                Some(v) if v == q.equals => {
                    debug!(unit, object = name, field = q.field, "status field matches");
                }
                Some(v) => {
                    return Err(ProbeFailure::NotReady(format!(
                        "{} {name}: {} is '{v}', expected '{}'",
                        q.kind, q.field, q.equals
                    )));
                }
                None => {
                    return Err(ProbeFailure::NotReady(format!(
                        "{} {name}: {} not set",
                        q.kind, q.field
                    )));
                }
            }
        }
        Ok(())
    }
}

fn log_materialization(unit: &str, name: &str, doc: &Value) {
    let health = doc
        .pointer("/status/health/status")
        .and_then(Value::as_str)
        .map(MaterializationStatus::parse)
        .unwrap_or(MaterializationStatus::Unknown);
    let sync = doc
        .pointer("/status/sync/status")
        .and_then(Value::as_str)
        .unwrap_or("Unknown");
    if health == MaterializationStatus::Degraded {
        warn!(unit, application = name, %health, sync, "application degraded");
    } else {
        debug!(unit, application = name, %health, sync, "application status");
    }
}
