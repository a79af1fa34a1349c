use crate::error::{Result, RolloutError};
use crate::health::{self, HealthCheckSpec};
use crate::paths;
use crate::probe::ProbeTarget;
use crate::propagation::backup::DEFAULT_RETENTION;
use crate::propagation::target::TargetSpec;
use crate::propagation::DiscoverySpec;
use crate::scheduler::Schedule;
use crate::unit::DeployableUnit;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Namespace for probes and discovery that do not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PropagationConfig {
    /// Propagation starts once this unit's gate is satisfied.
    pub source_unit: String,
    pub discovery: DiscoverySpec,
    #[serde(default = "default_retention")]
    pub backup_retention: usize,
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
}

fn default_retention() -> usize {
    DEFAULT_RETENTION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeysConfig {
    /// Key backup runs once this unit's gate is satisfied.
    pub sealing_unit: String,
    #[serde(default = "default_keys_namespace")]
    pub namespace: String,
    #[serde(default = "default_key_selector")]
    pub key_selector: String,
    #[serde(default = "default_controller_selector")]
    pub controller_selector: String,
    /// Defaults to `.rollout/keys.redb` under the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    /// age recipients. When empty, payloads are stored without an envelope.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
}

fn default_keys_namespace() -> String {
    "kube-system".to_string()
}

fn default_key_selector() -> String {
    "sealedsecrets.bitnami.com/sealed-secrets-key=active".to_string()
}

fn default_controller_selector() -> String {
    "app.kubernetes.io/name=sealed-secrets".to_string()
}

impl KeysConfig {
    pub fn store_path(&self, root: &Path) -> PathBuf {
        match &self.store_path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => root.join(p),
            None => paths::keys_db_path(root),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default)]
    pub checks: Vec<HealthCheckSpec>,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default = "default_version")]
    pub version: u32,
    pub project: ProjectConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environments: BTreeMap<String, EnvironmentConfig>,
    pub units: Vec<DeployableUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagation: Option<PropagationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<KeysConfig>,
    #[serde(default)]
    pub health: HealthConfig,
}

fn default_version() -> u32 {
    1
}

impl Manifest {
    /// Read and check the manifest. `explicit` overrides the default location.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| paths::manifest_path(root));
        if !path.exists() {
            return Err(RolloutError::ManifestNotFound(path));
        }
        let data = std::fs::read_to_string(&path)?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(data)?;
        manifest.check()?;
        Ok(manifest)
    }

    pub fn schedule(&self) -> Result<Schedule> {
        Schedule::build(&self.units)
    }

    pub fn targets(&self) -> &[TargetSpec] {
        self.propagation
            .as_ref()
            .map(|p| p.targets.as_slice())
            .unwrap_or_default()
    }

    pub fn target(&self, id: &str) -> Result<&TargetSpec> {
        self.targets()
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| RolloutError::TargetNotFound(id.to_string()))
    }

    /// Hard violations. Anything that fails here cannot be deployed.
    fn check(&self) -> Result<()> {
        if self.version != 1 {
            return Err(RolloutError::Configuration(format!(
                "unsupported manifest version {}",
                self.version
            )));
        }
        for env in self.environments.keys() {
            paths::validate_id(env)?;
        }
        for unit in &self.units {
            unit.readiness_probe.validate(&unit.id)?;
        }
        let schedule = self.schedule()?;

        if let Some(p) = &self.propagation {
            schedule.unit(&p.source_unit).map_err(|_| {
                RolloutError::Configuration(format!(
                    "propagation.source_unit '{}' is not a declared unit",
                    p.source_unit
                ))
            })?;
            p.discovery.policy.validate("propagation.discovery")?;
            let mut ids = HashSet::new();
            for t in &p.targets {
                paths::validate_id(&t.id)?;
                if !ids.insert(t.id.as_str()) {
                    return Err(RolloutError::Configuration(format!(
                        "duplicate propagation target id '{}'",
                        t.id
                    )));
                }
                if !t.field.starts_with('/') {
                    return Err(RolloutError::Configuration(format!(
                        "target '{}': field '{}' must be a JSON pointer",
                        t.id, t.field
                    )));
                }
            }
        }

        if let Some(k) = &self.keys {
            schedule.unit(&k.sealing_unit).map_err(|_| {
                RolloutError::Configuration(format!(
                    "keys.sealing_unit '{}' is not a declared unit",
                    k.sealing_unit
                ))
            })?;
        }

        health::validate_checks(&self.health.checks)
    }

    /// A copy of the manifest with the environment's namespace filled into
    /// every probe and discovery spec that does not name one.
    pub fn resolve_environment(&self, environment: &str) -> Result<Manifest> {
        paths::validate_id(environment)?;
        if self.environments.is_empty() {
            return Ok(self.clone());
        }
        let env = self
            .environments
            .get(environment)
            .ok_or_else(|| RolloutError::UnknownEnvironment(environment.to_string()))?;
        let mut resolved = self.clone();
        if let Some(ns) = &env.namespace {
            for unit in &mut resolved.units {
                if let ProbeTarget::ObjectStatusField { namespace, .. } =
                    &mut unit.readiness_probe.target
                {
                    namespace.get_or_insert_with(|| ns.clone());
                }
            }
            if let Some(p) = &mut resolved.propagation {
                p.discovery.namespace.get_or_insert_with(|| ns.clone());
            }
        }
        Ok(resolved)
    }

    /// Suspicious but loadable input.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        let optional: HashSet<&str> = self
            .units
            .iter()
            .filter(|u| u.optional)
            .map(|u| u.id.as_str())
            .collect();
        for unit in &self.units {
            for dep in &unit.depends_on {
                if optional.contains(dep.as_str()) {
                    warnings.push(ConfigWarning::warning(format!(
                        "unit '{}' depends on optional unit '{dep}', which may time out without blocking",
                        unit.id
                    )));
                }
            }
        }

        if self.health.checks.is_empty() {
            warnings.push(ConfigWarning::warning(
                "no health checks: deploy succeeds on readiness alone",
            ));
        }

        if let Some(p) = &self.propagation {
            if p.targets.is_empty() {
                warnings.push(ConfigWarning::warning(
                    "propagation is configured with no targets",
                ));
            }
            if p.backup_retention == 0 {
                warnings.push(ConfigWarning::error(
                    "propagation.backup_retention is 0; at least one backup is always kept",
                ));
            }
            if optional.contains(p.source_unit.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "propagation source unit '{}' is optional; propagation is skipped when it times out",
                    p.source_unit
                )));
            }
        }

        if let Some(k) = &self.keys {
            if k.recipients.is_empty() {
                warnings.push(ConfigWarning::warning(
                    "keys.recipients is empty: key material is stored without an envelope",
                ));
            }
        }

        for (name, env) in &self.environments {
            if env.namespace.is_none() {
                warnings.push(ConfigWarning::warning(format!(
                    "environment '{name}' sets no namespace"
                )));
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"
project:
  name: ledger
environments:
  staging:
    namespace: core-staging
  prod:
    namespace: core
units:
  - id: sealed-secrets
    wave: 0
    readiness_probe:
      target:
        type: object_status_field
        api_version: apps/v1
        kind: Deployment
        namespace: kube-system
        name: sealed-secrets
        field: /status/readyReplicas
        equals: "1"
  - id: identity
    wave: 0
    readiness_probe:
      target:
        type: object_status_field
        api_version: argoproj.io/v1alpha1
        kind: Application
        name: identity
        field: /status/health/status
        equals: Healthy
  - id: core-1
    wave: 1
    depends_on: [identity]
    readiness_probe:
      target:
        type: http_get
        url: http://core-1:8080/actuator/health
propagation:
  source_unit: identity
  discovery:
    service: keycloak
  targets:
    - id: core-1-issuer
      record: apps/core-1.yaml
      field: /spec/env
      key: OIDC_ISSUER
keys:
  sealing_unit: sealed-secrets
health:
  checks:
    - name: core
      check:
        type: endpoint
        url: http://core-1:8080/actuator/health
"#;

    #[test]
    fn parses_with_defaults() {
        let m = Manifest::parse(MANIFEST).unwrap();
        assert_eq!(m.version, 1);
        let keys = m.keys.as_ref().unwrap();
        assert_eq!(keys.namespace, "kube-system");
        assert_eq!(keys.key_selector, "sealedsecrets.bitnami.com/sealed-secrets-key=active");
        assert_eq!(m.propagation.as_ref().unwrap().backup_retention, 5);
        assert_eq!(m.schedule().unwrap().len(), 2);
        assert_eq!(m.targets().len(), 1);
        assert!(m.target("nope").is_err());
    }

    #[test]
    fn unknown_top_level_field_rejected() {
        let bad = format!("{MANIFEST}\nrollback: true\n");
        assert!(Manifest::parse(&bad).is_err());
    }

    #[test]
    fn invalid_policy_rejected_at_load() {
        let bad = MANIFEST.replace(
            "        url: http://core-1:8080/actuator/health\npropagation",
            "        url: http://core-1:8080/actuator/health\n      policy:\n        interval_seconds: 5\n        timeout_seconds: 600\n        max_attempts: 3\npropagation",
        );
        assert_ne!(bad, MANIFEST);
        let err = Manifest::parse(&bad).unwrap_err().to_string();
        assert!(err.contains("must cover timeout"), "{err}");
    }

    #[test]
    fn inconsistent_dependency_rejected_at_load() {
        let bad = MANIFEST.replace("  - id: core-1\n    wave: 1", "  - id: core-1\n    wave: 0");
        assert_ne!(bad, MANIFEST);
        let err = Manifest::parse(&bad).unwrap_err().to_string();
        assert!(err.contains("'core-1' -> 'identity'"), "{err}");
    }

    #[test]
    fn unknown_source_unit_rejected() {
        let bad = MANIFEST.replace("source_unit: identity", "source_unit: ghost");
        let err = Manifest::parse(&bad).unwrap_err().to_string();
        assert!(err.contains("source_unit 'ghost'"), "{err}");
    }

    #[test]
    fn resolve_environment_fills_namespaces() {
        let m = Manifest::parse(MANIFEST).unwrap();
        let prod = m.resolve_environment("prod").unwrap();
        match &prod.units[1].readiness_probe.target {
            ProbeTarget::ObjectStatusField { namespace, .. } => {
                assert_eq!(namespace.as_deref(), Some("core"))
            }
            other => panic!("unexpected probe {other:?}"),
        }
        // Explicit namespaces are kept.
        match &prod.units[0].readiness_probe.target {
            ProbeTarget::ObjectStatusField { namespace, .. } => {
                assert_eq!(namespace.as_deref(), Some("kube-system"))
            }
            other => panic!("unexpected probe {other:?}"),
        }
        assert_eq!(
            prod.propagation.unwrap().discovery.namespace.as_deref(),
            Some("core")
        );
        assert!(matches!(
            m.resolve_environment("qa").unwrap_err(),
            RolloutError::UnknownEnvironment(_)
        ));
    }

    #[test]
    fn validate_reports_warnings() {
        let m = Manifest::parse(MANIFEST).unwrap();
        let warnings = m.validate();
        assert_eq!(warnings.len(), 1, "{warnings:?}");
        assert!(warnings[0].message.contains("keys.recipients"));

        let mut m = m;
        m.units[1].optional = true;
        m.health.checks.clear();
        let messages: Vec<String> = m.validate().into_iter().map(|w| w.message).collect();
        assert!(messages.iter().any(|w| w.contains("depends on optional unit 'identity'")));
        assert!(messages.iter().any(|w| w.contains("no health checks")));
        assert!(messages.iter().any(|w| w.contains("source unit 'identity' is optional")));
    }

    #[test]
    fn load_reports_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let err = Manifest::load(dir.path(), None).unwrap_err();
        assert!(matches!(err, RolloutError::ManifestNotFound(_)));

        std::fs::create_dir_all(dir.path().join(".rollout")).unwrap();
        std::fs::write(dir.path().join(".rollout/manifest.yaml"), MANIFEST).unwrap();
        assert!(Manifest::load(dir.path(), None).is_ok());
    }

    #[test]
    fn keys_store_path_resolves_against_root() {
        let m = Manifest::parse(MANIFEST).unwrap();
        let keys = m.keys.unwrap();
        assert_eq!(keys.store_path(Path::new("/repo")), PathBuf::from("/repo/.rollout/keys.redb"));
    }
}
