//! Configuration propagation: write one runtime-discovered value into every
//! consumer record, guarded by content checksums.

pub mod backup;
pub mod store;
pub mod target;
mod yaml_edit;

use crate::error::{Result, RolloutError};
use crate::gate::{self, CancelSignal, PollEnd};
use crate::probe::{PollPolicy, ProbeFailure};
use backup::BackupStore;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use store::RecordStores;
use target::{PropagationTarget, StoreKind, TargetSpec};
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Endpoint discovery
// ---------------------------------------------------------------------------

/// Where the value to propagate comes from: a Service's load-balancer address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoverySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub service: String,
    #[serde(default)]
    pub policy: PollPolicy,
}

pub trait EndpointDiscovery: Send + Sync {
    /// One lookup. An address that is not assigned yet is `NotReady`.
    fn endpoint<'a>(
        &'a self,
        spec: &'a DiscoverySpec,
    ) -> BoxFuture<'a, std::result::Result<String, ProbeFailure>>;
}

/// Poll until the endpoint is assigned, using its polling policy.
pub async fn discover_endpoint(
    discovery: &dyn EndpointDiscovery,
    spec: &DiscoverySpec,
    cancel: &CancelSignal,
) -> Result<String> {
    let label = format!("discovery/{}", spec.service);
    let polled = gate::poll(&label, &spec.policy, cancel, || discovery.endpoint(spec)).await;
    match polled.end {
        PollEnd::Ready(address) => {
            info!(service = %spec.service, %address, "endpoint discovered");
            Ok(address)
        }
        PollEnd::TimedOut => Err(RolloutError::Discovery(format!(
            "service '{}' has no address after {} attempts: {}",
            spec.service,
            polled.attempts,
            polled.last_error.unwrap_or_default()
        ))),
        PollEnd::Cancelled => Err(RolloutError::Discovery("cancelled".into())),
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagationOptions {
    /// Without `commit` nothing is written; changes are reported as `WouldUpdate`.
    pub commit: bool,
    /// Skip the checksum guard.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetOutcome {
    Updated {
        previous: String,
        backup: String,
    },
    NoOp,
    WouldUpdate {
        previous: String,
    },
    ConcurrentModification {
        expected_checksum: String,
        found_checksum: String,
    },
    Unreadable {
        reason: String,
    },
    BackupFailed {
        reason: String,
    },
    WriteFailed {
        reason: String,
        backup: String,
    },
    VerificationFailed {
        expected: String,
        found: String,
        backup: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Ok,
    /// Isolated to the target; the run degrades to a partial failure.
    Error,
    /// The record may now be in an unexpected state; the run fails.
    Fatal,
}

impl TargetOutcome {
    pub fn severity(&self) -> Severity {
        match self {
            TargetOutcome::Updated { .. } | TargetOutcome::NoOp | TargetOutcome::WouldUpdate { .. } => {
                Severity::Ok
            }
            TargetOutcome::ConcurrentModification { .. }
            | TargetOutcome::Unreadable { .. }
            | TargetOutcome::BackupFailed { .. } => Severity::Error,
            TargetOutcome::WriteFailed { .. } | TargetOutcome::VerificationFailed { .. } => {
                Severity::Fatal
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TargetOutcome::Updated { .. } => "updated",
            TargetOutcome::NoOp => "no-op",
            TargetOutcome::WouldUpdate { .. } => "would update",
            TargetOutcome::ConcurrentModification { .. } => "concurrent modification",
            TargetOutcome::Unreadable { .. } => "unreadable",
            TargetOutcome::BackupFailed { .. } => "backup failed",
            TargetOutcome::WriteFailed { .. } => "write failed",
            TargetOutcome::VerificationFailed { .. } => "verification failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetReport {
    pub target: String,
    pub record: String,
    pub outcome: TargetOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropagationReport {
    pub value: String,
    pub committed: bool,
    pub targets: Vec<TargetReport>,
}

impl PropagationReport {
    pub fn writes(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| matches!(t.outcome, TargetOutcome::Updated { .. }))
            .count()
    }

    pub fn has_fatal(&self) -> bool {
        self.targets
            .iter()
            .any(|t| t.outcome.severity() == Severity::Fatal)
    }

    pub fn has_errors(&self) -> bool {
        self.targets
            .iter()
            .any(|t| t.outcome.severity() != Severity::Ok)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    Ready(PropagationTarget),
    Unreadable { spec: TargetSpec, reason: String },
}

impl Discovery {
    pub fn id(&self) -> &str {
        match self {
            Discovery::Ready(t) => &t.id,
            Discovery::Unreadable { spec, .. } => &spec.id,
        }
    }
}

pub struct PropagationEngine {
    records: RecordStores,
    root: PathBuf,
    retention: usize,
}

impl PropagationEngine {
    pub fn new(records: RecordStores, root: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            records,
            root: root.into(),
            retention,
        }
    }

    pub fn backups(&self, target_id: &str) -> BackupStore {
        BackupStore::for_target(&self.root, target_id, self.retention)
    }

    /// Read every target and remember its record checksum.
    pub async fn discover(&self, specs: &[TargetSpec]) -> Vec<Discovery> {
        let mut out = Vec::with_capacity(specs.len());
        for spec in specs {
            let locator = spec.locator();
            let read = async {
                let store = self.records.get(locator.store)?;
                let snapshot = store.read(&locator.record).await?;
                let value = locator.read_field(&snapshot.document)?;
                Ok::<_, RolloutError>((snapshot.checksum, value))
            };
            match read.await {
                Ok((checksum, current_value)) => out.push(Discovery::Ready(PropagationTarget {
                    id: spec.id.clone(),
                    locator,
                    current_value,
                    last_write_checksum: checksum,
                })),
                Err(e) => {
                    warn!(target_id = %spec.id, "target unreadable: {e}");
                    out.push(Discovery::Unreadable {
                        spec: spec.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        out
    }

    /// Bring every discovered target to `value`, in declaration order.
    ///
    /// Each target is isolated: its failure is recorded and the next target
    /// is still attempted.
    pub async fn propagate(
        &self,
        value: &str,
        discovered: &[Discovery],
        opts: PropagationOptions,
    ) -> PropagationReport {
        // Several targets may share a record. After this run writes a record
        // the new checksum becomes the expected one for later targets.
        let mut expected: HashMap<(StoreKind, String), String> = HashMap::new();
        let mut targets = Vec::with_capacity(discovered.len());

        for d in discovered {
            let (record, outcome) = match d {
                Discovery::Unreadable { spec, reason } => (
                    spec.record.clone(),
                    TargetOutcome::Unreadable {
                        reason: reason.clone(),
                    },
                ),
                Discovery::Ready(t) => {
                    let outcome = self.apply(value, t, &mut expected, opts).await;
                    (t.locator.record.clone(), outcome)
                }
            };
            match outcome.severity() {
                Severity::Ok => info!(target_id = %d.id(), outcome = outcome.label(), "propagation target"),
                Severity::Error => warn!(target_id = %d.id(), outcome = outcome.label(), "propagation target"),
                Severity::Fatal => error!(target_id = %d.id(), outcome = outcome.label(), "propagation target"),
            }
            targets.push(TargetReport {
                target: d.id().to_string(),
                record,
                outcome,
            });
        }

        PropagationReport {
            value: value.to_string(),
            committed: opts.commit,
            targets,
        }
    }

    async fn apply(
        &self,
        value: &str,
        target: &PropagationTarget,
        expected: &mut HashMap<(StoreKind, String), String>,
        opts: PropagationOptions,
    ) -> TargetOutcome {
        let loc = &target.locator;
        let key = (loc.store, loc.record.clone());
        let unreadable = |e: RolloutError| TargetOutcome::Unreadable {
            reason: e.to_string(),
        };

        let store = match self.records.get(loc.store) {
            Ok(s) => s,
            Err(e) => return unreadable(e),
        };
        let snapshot = match store.read(&loc.record).await {
            Ok(s) => s,
            Err(e) => return unreadable(e),
        };

        let guard = expected
            .get(&key)
            .cloned()
            .unwrap_or_else(|| target.last_write_checksum.clone());
        if snapshot.checksum != guard && !opts.force {
            return TargetOutcome::ConcurrentModification {
                expected_checksum: guard,
                found_checksum: snapshot.checksum,
            };
        }

        let current = match loc.read_field(&snapshot.document) {
            Ok(v) => v,
            Err(e) => return unreadable(e),
        };
        if current == value {
            return TargetOutcome::NoOp;
        }
        if !opts.commit {
            return TargetOutcome::WouldUpdate { previous: current };
        }

        let backups = self.backups(&target.id);
        let backup = match backups.save(&snapshot.raw) {
            Ok(name) => name,
            Err(e) => {
                return TargetOutcome::BackupFailed {
                    reason: e.to_string(),
                }
            }
        };
        backups.prune();

        let mut document = snapshot.document.clone();
        if let Err(e) = loc.write_field(&mut document, value) {
            return TargetOutcome::WriteFailed {
                reason: e.to_string(),
                backup,
            };
        }
        match store.write(&loc.record, &document).await {
            Ok(()) => {}
            // The store caught an edit that landed after our read. Nothing
            // was written, so this is isolated to the target.
            Err(RolloutError::RecordConflict(_)) => {
                let found_checksum = match store.read(&loc.record).await {
                    Ok(s) => s.checksum,
                    Err(e) => format!("<unreadable: {e}>"),
                };
                return TargetOutcome::ConcurrentModification {
                    expected_checksum: snapshot.checksum,
                    found_checksum,
                };
            }
            Err(e) => {
                return TargetOutcome::WriteFailed {
                    reason: e.to_string(),
                    backup,
                }
            }
        }

        let verified = match store.read(&loc.record).await {
            Ok(s) => s,
            Err(e) => {
                return TargetOutcome::VerificationFailed {
                    expected: value.to_string(),
                    found: format!("<unreadable: {e}>"),
                    backup,
                }
            }
        };
        let found = loc
            .read_field(&verified.document)
            .unwrap_or_else(|e| format!("<unreadable: {e}>"));
        if found != value {
            return TargetOutcome::VerificationFailed {
                expected: value.to_string(),
                found,
                backup,
            };
        }
        expected.insert(key, verified.checksum);
        TargetOutcome::Updated {
            previous: current,
            backup,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryRecordStore, StaticDiscovery};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    const LB: &str = "a1b2.elb.example.com";

    fn object_spec(id: &str, record: &str, field: &str, key: Option<&str>) -> TargetSpec {
        TargetSpec {
            id: id.into(),
            store: StoreKind::Object,
            record: record.into(),
            field: field.into(),
            key: key.map(str::to_string),
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryRecordStore>,
        engine: PropagationEngine,
        specs: Vec<TargetSpec>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryRecordStore::new());
        store.insert(
            "v1/ConfigMap/identity/kc",
            json!({"data": {"KC_HOSTNAME": "old.example"}}),
        );
        store.insert(
            "apps/Deployment/core/proxy",
            json!({"spec": {"env": ["LOG=info", "ISSUER=http://old.example/realms/core", "Z=1"]}}),
        );
        let records = RecordStores {
            file: store.clone(),
            object: Some(store.clone()),
        };
        let engine = PropagationEngine::new(records, dir.path(), 5);
        let specs = vec![
            object_spec("kc-host", "v1/ConfigMap/identity/kc", "/data/KC_HOSTNAME", None),
            object_spec("proxy-issuer", "apps/Deployment/core/proxy", "/spec/env", Some("ISSUER")),
        ];
        Fixture {
            _dir: dir,
            store,
            engine,
            specs,
        }
    }

    fn commit() -> PropagationOptions {
        PropagationOptions {
            commit: true,
            force: false,
        }
    }

    #[tokio::test]
    async fn discover_records_checksum_and_value() {
        let f = fixture();
        let found = f.engine.discover(&f.specs).await;
        let Discovery::Ready(t) = &found[1] else {
            panic!("expected ready target");
        };
        assert_eq!(t.current_value, "http://old.example/realms/core");
        assert_eq!(t.last_write_checksum.len(), 64);
    }

    #[tokio::test]
    async fn updates_backs_up_and_verifies() {
        let f = fixture();
        let found = f.engine.discover(&f.specs).await;
        let report = f.engine.propagate(LB, &found, commit()).await;
        assert_eq!(report.writes(), 2);
        assert!(!report.has_errors());
        assert_eq!(f.store.document("v1/ConfigMap/identity/kc")["data"]["KC_HOSTNAME"], LB);
        assert_eq!(
            f.store.document("apps/Deployment/core/proxy")["spec"]["env"],
            json!(["LOG=info", format!("ISSUER={LB}"), "Z=1"])
        );
        for target in ["kc-host", "proxy-issuer"] {
            let backups = f.engine.backups(target).list().unwrap();
            assert_eq!(backups.len(), 1, "{target}");
            let saved = f.engine.backups(target).load(&backups[0].name).unwrap();
            assert!(String::from_utf8(saved).unwrap().contains("old.example"), "{target}");
        }
    }

    #[tokio::test]
    async fn pending_placeholders_are_replaced_with_backups() {
        let f = fixture();
        f.store.insert(
            "v1/ConfigMap/identity/kc",
            json!({"data": {"KC_HOSTNAME": "PENDING_UPDATE"}}),
        );
        f.store.insert(
            "apps/Deployment/core/proxy",
            json!({"spec": {"env": ["apps-hostname=PENDING_UPDATE", "other=1"]}}),
        );
        let specs = vec![
            object_spec("kc-host", "v1/ConfigMap/identity/kc", "/data/KC_HOSTNAME", None),
            object_spec("proxy-env", "apps/Deployment/core/proxy", "/spec/env", Some("apps-hostname")),
        ];
        let found = f.engine.discover(&specs).await;
        let report = f.engine.propagate("lb.example.com", &found, commit()).await;
        assert_eq!(report.writes(), 2, "{report:?}");

        assert_eq!(
            f.store.document("v1/ConfigMap/identity/kc")["data"]["KC_HOSTNAME"],
            "lb.example.com"
        );
        assert_eq!(
            f.store.document("apps/Deployment/core/proxy")["spec"]["env"],
            json!(["apps-hostname=lb.example.com", "other=1"])
        );
        for (target, marker) in [
            ("kc-host", "\"KC_HOSTNAME\":\"PENDING_UPDATE\""),
            ("proxy-env", "\"apps-hostname=PENDING_UPDATE\""),
        ] {
            let backups = f.engine.backups(target).list().unwrap();
            assert_eq!(backups.len(), 1, "{target}");
            let saved = f.engine.backups(target).load(&backups[0].name).unwrap();
            assert!(String::from_utf8(saved).unwrap().contains(marker), "{target}");
        }
    }

    #[tokio::test]
    async fn second_run_is_all_no_op() {
        let f = fixture();
        let found = f.engine.discover(&f.specs).await;
        f.engine.propagate(LB, &found, commit()).await;
        let writes_after_first = f.store.writes();

        let found = f.engine.discover(&f.specs).await;
        let report = f.engine.propagate(LB, &found, commit()).await;
        assert!(report.targets.iter().all(|t| t.outcome == TargetOutcome::NoOp));
        assert_eq!(f.store.writes(), writes_after_first);
        assert_eq!(f.engine.backups("kc-host").list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_edit_is_detected_and_left_alone() {
        let f = fixture();
        let found = f.engine.discover(&f.specs).await;
        let edited = json!({"data": {"KC_HOSTNAME": "hand-edited.example"}});
        f.store.insert("v1/ConfigMap/identity/kc", edited.clone());

        let report = f.engine.propagate(LB, &found, commit()).await;
        assert!(matches!(
            report.targets[0].outcome,
            TargetOutcome::ConcurrentModification { .. }
        ));
        assert_eq!(f.store.document("v1/ConfigMap/identity/kc"), edited);
        // The other target is isolated from the conflict.
        assert!(matches!(report.targets[1].outcome, TargetOutcome::Updated { .. }));
        assert!(report.has_errors());
        assert!(!report.has_fatal());
    }

    #[tokio::test]
    async fn force_bypasses_checksum_guard() {
        let f = fixture();
        let found = f.engine.discover(&f.specs).await;
        f.store.insert(
            "v1/ConfigMap/identity/kc",
            json!({"data": {"KC_HOSTNAME": "hand-edited.example"}}),
        );
        let opts = PropagationOptions {
            commit: true,
            force: true,
        };
        let report = f.engine.propagate(LB, &found, opts).await;
        assert_eq!(
            report.targets[0].outcome,
            TargetOutcome::Updated {
                previous: "hand-edited.example".into(),
                backup: f.engine.backups("kc-host").latest().unwrap().unwrap().name,
            }
        );
    }

    #[tokio::test]
    async fn targets_sharing_a_record_do_not_conflict() {
        let f = fixture();
        f.store.insert(
            "v1/ConfigMap/identity/kc",
            json!({"data": {"KC_HOSTNAME": "old", "KC_HOSTNAME_ADMIN": "old"}}),
        );
        let specs = vec![
            object_spec("kc-host", "v1/ConfigMap/identity/kc", "/data/KC_HOSTNAME", None),
            object_spec("kc-admin", "v1/ConfigMap/identity/kc", "/data/KC_HOSTNAME_ADMIN", None),
        ];
        let found = f.engine.discover(&specs).await;
        let report = f.engine.propagate(LB, &found, commit()).await;
        assert_eq!(report.writes(), 2, "{report:?}");
    }

    #[tokio::test]
    async fn verification_failure_keeps_backup() {
        let f = fixture();
        let found = f.engine.discover(&f.specs[..1]).await;
        f.store.corrupt_writes();
        let report = f.engine.propagate(LB, &found, commit()).await;
        let TargetOutcome::VerificationFailed { expected, backup, .. } = &report.targets[0].outcome else {
            panic!("expected verification failure, got {:?}", report.targets[0].outcome);
        };
        assert_eq!(expected, LB);
        assert!(f.engine.backups("kc-host").load(backup).is_ok());
        assert!(report.has_fatal());
    }

    #[tokio::test]
    async fn write_failure_is_fatal() {
        let f = fixture();
        let found = f.engine.discover(&f.specs[..1]).await;
        f.store.fail_writes();
        let report = f.engine.propagate(LB, &found, commit()).await;
        assert!(matches!(report.targets[0].outcome, TargetOutcome::WriteFailed { .. }));
        assert!(report.has_fatal());
    }

    #[tokio::test]
    async fn conflict_at_write_time_is_a_concurrent_modification() {
        let f = fixture();
        let found = f.engine.discover(&f.specs).await;
        f.store.conflict_on_write("v1/ConfigMap/identity/kc");
        let report = f.engine.propagate(LB, &found, commit()).await;
        assert!(matches!(
            report.targets[0].outcome,
            TargetOutcome::ConcurrentModification { .. }
        ));
        assert_eq!(
            f.store.document("v1/ConfigMap/identity/kc")["data"]["KC_HOSTNAME"],
            "old.example"
        );
        assert!(matches!(report.targets[1].outcome, TargetOutcome::Updated { .. }));
        assert!(report.has_errors());
        assert!(!report.has_fatal());
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let f = fixture();
        let found = f.engine.discover(&f.specs).await;
        let report = f.engine.propagate(LB, &found, PropagationOptions::default()).await;
        assert!(!report.committed);
        assert_eq!(
            report.targets[0].outcome,
            TargetOutcome::WouldUpdate {
                previous: "old.example".into()
            }
        );
        assert_eq!(f.store.writes(), 0);
        assert!(f.engine.backups("kc-host").list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_target_is_isolated() {
        let f = fixture();
        let mut specs = f.specs.clone();
        specs.insert(0, object_spec("ghost", "v1/ConfigMap/x/missing", "/data/A", None));
        let found = f.engine.discover(&specs).await;
        assert!(matches!(found[0], Discovery::Unreadable { .. }));
        let report = f.engine.propagate(LB, &found, commit()).await;
        assert!(matches!(report.targets[0].outcome, TargetOutcome::Unreadable { .. }));
        assert_eq!(report.writes(), 2);
    }

    #[tokio::test]
    async fn retention_bounds_backups() {
        let f = fixture();
        for i in 0..7 {
            let found = f.engine.discover(&f.specs[..1]).await;
            f.engine
                .propagate(&format!("lb-{i}.example"), &found, commit())
                .await;
        }
        assert_eq!(f.engine.backups("kc-host").list().unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn endpoint_discovery_polls_until_assigned() {
        let discovery = StaticDiscovery::new(Some(LB), 3);
        let spec = DiscoverySpec {
            namespace: Some("identity".into()),
            service: "keycloak".into(),
            policy: PollPolicy::new(5, 60, 12),
        };
        let addr = discover_endpoint(&discovery, &spec, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(addr, LB);
    }

    #[tokio::test(start_paused = true)]
    async fn endpoint_discovery_times_out() {
        let discovery = StaticDiscovery::new(None, 0);
        let spec = DiscoverySpec {
            namespace: None,
            service: "keycloak".into(),
            policy: PollPolicy::new(5, 10, 2),
        };
        let err = discover_endpoint(&discovery, &spec, &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no address after 2 attempts"), "{err}");
    }
}
