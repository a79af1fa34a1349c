//! In-crate fakes for the collaborator traits.

use crate::error::{Result, RolloutError};
use crate::gate::Prober;
use crate::health::{CheckContext, CheckKind, CheckRunner, CheckSuccess, HealthCheckSpec};
use crate::keys::{KeyEntry, KeySource};
use crate::probe::{PollPolicy, ProbeFailure, ProbeTarget, ReadinessProbe, StatusRange};
use crate::propagation::store::{RecordSnapshot, RecordStore};
use crate::propagation::{DiscoverySpec, EndpointDiscovery};
use crate::unit::{DeployableUnit, HookPhase};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

pub fn http_unit(id: &str, wave: i32, interval: u64, timeout: u64, max_attempts: u32) -> DeployableUnit {
    let target = ProbeTarget::HttpGet {
        url: format!("http://{id}.test/ready"),
        expect_status: StatusRange::default(),
        expect_json: None,
    };
    DeployableUnit::new(
        id,
        wave,
        HookPhase::Sync,
        ReadinessProbe::new(target, PollPolicy::new(interval, timeout, max_attempts)),
    )
}

pub fn unit(id: &str, wave: i32, phase: HookPhase) -> DeployableUnit {
    let mut u = http_unit(id, wave, 5, 30, 6);
    u.hook_phase = phase;
    u
}

// ---------------------------------------------------------------------------
// ScriptedProber
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum Script {
    Always,
    Never,
    /// Fail this many attempts, then succeed.
    SucceedAfter(u32),
    Hang,
    Transport,
}

#[derive(Default)]
pub struct ScriptedProber {
    scripts: HashMap<String, Script>,
    attempts: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, unit: &str, script: Script) -> Self {
        self.scripts.insert(unit.to_string(), script);
        self
    }

    pub fn attempts(&self, unit: &str) -> u32 {
        self.attempts.lock().unwrap().get(unit).copied().unwrap_or(0)
    }

    /// Units in the order of their first attempt.
    pub fn first_calls(&self) -> Vec<String> {
        let calls = self.calls.lock().unwrap();
        let mut seen = Vec::new();
        for c in calls.iter() {
            if !seen.contains(c) {
                seen.push(c.clone());
            }
        }
        seen
    }
}

impl Prober for ScriptedProber {
    fn probe<'a>(
        &'a self,
        unit: &'a str,
        _target: &'a ProbeTarget,
    ) -> BoxFuture<'a, std::result::Result<(), ProbeFailure>> {
        Box::pin(async move {
            let n = {
                let mut attempts = self.attempts.lock().unwrap();
                let n = attempts.entry(unit.to_string()).or_insert(0);
                *n += 1;
                *n
            };
            self.calls.lock().unwrap().push(unit.to_string());
            match self.scripts.get(unit).copied().unwrap_or(Script::Always) {
                Script::Always => Ok(()),
                Script::Never => Err(ProbeFailure::NotReady("status Progressing".into())),
                Script::SucceedAfter(k) if n > k => Ok(()),
                Script::SucceedAfter(_) => Err(ProbeFailure::NotReady("status Progressing".into())),
                Script::Hang => std::future::pending().await,
                Script::Transport => Err(ProbeFailure::Transport("connection refused".into())),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryRecordStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, serde_json::Value>>,
    writes: AtomicUsize,
    corrupt_writes: AtomicBool,
    fail_writes: AtomicBool,
    conflicts: Mutex<Vec<String>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: &str, document: serde_json::Value) {
        self.records
            .lock()
            .unwrap()
            .insert(record.to_string(), document);
    }

    pub fn document(&self, record: &str) -> serde_json::Value {
        self.records.lock().unwrap()[record].clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Subsequent writes store something other than what was asked.
    pub fn corrupt_writes(&self) {
        self.corrupt_writes.store(true, Ordering::SeqCst);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Writes to `record` are refused as if it changed after being read.
    pub fn conflict_on_write(&self, record: &str) {
        self.conflicts.lock().unwrap().push(record.to_string());
    }
}

impl RecordStore for MemoryRecordStore {
    fn read<'a>(&'a self, record: &'a str) -> BoxFuture<'a, Result<RecordSnapshot>> {
        Box::pin(async move {
            let doc = self
                .records
                .lock()
                .unwrap()
                .get(record)
                .cloned()
                .ok_or_else(|| RolloutError::RecordNotFound(record.to_string()))?;
            let raw = serde_json::to_vec(&doc)?;
            Ok(RecordSnapshot::new(doc, raw))
        })
    }

    fn write<'a>(
        &'a self,
        record: &'a str,
        document: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(RolloutError::RecordStore("write rejected".into()));
            }
            if self.conflicts.lock().unwrap().iter().any(|r| r == record) {
                return Err(RolloutError::RecordConflict(record.to_string()));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            let stored = if self.corrupt_writes.load(Ordering::SeqCst) {
                serde_json::json!({ "corrupted": true })
            } else {
                document.clone()
            };
            self.insert(record, stored);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// StaticDiscovery
// ---------------------------------------------------------------------------

/// Returns "not assigned" for the first `pending` calls, then `address`.
pub struct StaticDiscovery {
    address: Option<String>,
    pending: u32,
    calls: AtomicUsize,
}

impl StaticDiscovery {
    pub fn new(address: Option<&str>, pending: u32) -> Self {
        Self {
            address: address.map(str::to_string),
            pending,
            calls: AtomicUsize::new(0),
        }
    }
}

impl EndpointDiscovery for StaticDiscovery {
    fn endpoint<'a>(
        &'a self,
        spec: &'a DiscoverySpec,
    ) -> BoxFuture<'a, std::result::Result<String, ProbeFailure>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
            match &self.address {
                Some(a) if n >= self.pending => Ok(a.clone()),
                _ => Err(ProbeFailure::NotReady(format!(
                    "service {} has no ingress yet",
                    spec.service
                ))),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryKeySource
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryKeySource {
    pub entries: Mutex<Vec<KeyEntry>>,
    pub installed: Mutex<Vec<KeyEntry>>,
    pub reloads: AtomicUsize,
    pub unavailable: AtomicBool,
}

impl MemoryKeySource {
    pub fn with_keys(names: &[&str]) -> Self {
        let entries = names
            .iter()
            .map(|n| KeyEntry {
                name: n.to_string(),
                secret_type: Some("kubernetes.io/tls".into()),
                data: BTreeMap::from([
                    ("tls.crt".to_string(), "Y2VydA==".to_string()),
                    ("tls.key".to_string(), "a2V5".to_string()),
                ]),
            })
            .collect();
        Self {
            entries: Mutex::new(entries),
            ..Self::default()
        }
    }
}

impl KeySource for MemoryKeySource {
    fn extract<'a>(&'a self, _namespace: &'a str) -> BoxFuture<'a, Result<Vec<KeyEntry>>> {
        Box::pin(async move {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(RolloutError::KeySource("cluster unreachable".into()));
            }
            Ok(self.entries.lock().unwrap().clone())
        })
    }

    fn install<'a>(&'a self, _namespace: &'a str, keys: &'a [KeyEntry]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.installed.lock().unwrap().extend_from_slice(keys);
            Ok(())
        })
    }

    fn reload<'a>(&'a self, _namespace: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedChecks
// ---------------------------------------------------------------------------

/// Passes every check except those named in `failing`. Auth checks hand out
/// a token named after the check.
#[derive(Default)]
pub struct ScriptedChecks {
    failing: Vec<String>,
    pub runs: Mutex<Vec<String>>,
}

impl ScriptedChecks {
    pub fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|s| s.to_string()).collect(),
            runs: Mutex::new(Vec::new()),
        }
    }
}

impl CheckRunner for ScriptedChecks {
    fn run<'a>(
        &'a self,
        spec: &'a HealthCheckSpec,
        ctx: &'a CheckContext,
    ) -> BoxFuture<'a, std::result::Result<CheckSuccess, String>> {
        Box::pin(async move {
            self.runs.lock().unwrap().push(spec.name.clone());
            if self.failing.contains(&spec.name) {
                return Err(format!("{} returned 503", spec.name));
            }
            match &spec.check {
                CheckKind::AuthRoundTrip { .. } => Ok(CheckSuccess {
                    detail: "token issued".into(),
                    token: Some(format!("token-{}", spec.name)),
                }),
                CheckKind::DataQuery {
                    bearer_from: Some(from),
                    ..
                } => match ctx.token(from) {
                    Some(t) => Ok(CheckSuccess {
                        detail: format!("authorized with {t}"),
                        token: None,
                    }),
                    None => Err(format!("no token from check '{from}'")),
                },
                _ => Ok(CheckSuccess {
                    detail: "200 OK".into(),
                    token: None,
                }),
            }
        })
    }
}
