//! Readiness gate: polls one unit's probe until it is satisfied, its budget
//! runs out, or the run is cancelled.

use crate::probe::{PollPolicy, ProbeFailure, ProbeTarget, ReadinessProbe, MAX_POLL_SECONDS};
use crate::unit::DeployableUnit;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Prober
// ---------------------------------------------------------------------------

/// Performs a single probe attempt against a target.
///
/// Implementations must not retry internally; the gate owns the retry budget.
pub trait Prober: Send + Sync {
    fn probe<'a>(
        &'a self,
        unit: &'a str,
        target: &'a ProbeTarget,
    ) -> BoxFuture<'a, std::result::Result<(), ProbeFailure>>;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Owner side of the run cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Observer side. Cheap to clone; every gate task holds one.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested. Never resolves if the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Satisfied,
    TimedOut,
    Cancelled,
    /// Released without polling (`--skip-wait`).
    Skipped,
}

impl std::fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateOutcome::Satisfied => write!(f, "satisfied"),
            GateOutcome::TimedOut => write!(f, "timed out"),
            GateOutcome::Cancelled => write!(f, "cancelled"),
            GateOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub unit: String,
    pub outcome: GateOutcome,
    pub attempts: u32,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl GateReport {
    pub fn skipped(unit: &str) -> Self {
        Self::bare(unit, GateOutcome::Skipped, None)
    }

    /// Report for a unit whose gate never started because the run stopped.
    pub fn cancelled(unit: &str, reason: impl Into<String>) -> Self {
        Self::bare(unit, GateOutcome::Cancelled, Some(reason.into()))
    }

    /// Report for a gate task that died before producing an outcome.
    pub fn aborted(unit: &str, reason: impl Into<String>) -> Self {
        Self::bare(unit, GateOutcome::TimedOut, Some(reason.into()))
    }

    fn bare(unit: &str, outcome: GateOutcome, last_error: Option<String>) -> Self {
        Self {
            unit: unit.to_string(),
            outcome,
            attempts: 0,
            elapsed_ms: 0,
            last_error,
        }
    }
}

// ---------------------------------------------------------------------------
// Polling loop
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum PollEnd<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct Polled<T> {
    pub end: PollEnd<T>,
    pub attempts: u32,
    pub elapsed: Duration,
    pub last_error: Option<String>,
}

/// Run `attempt` on a fixed schedule until it succeeds or the policy budget
/// is spent.
///
/// Attempts start every `interval` measured from the previous attempt's
/// start. Each attempt is bounded by the policy's attempt timeout (clipped to
/// the remaining wall-clock budget). Cancellation is observed before each
/// attempt, while an attempt is in flight, and while sleeping.
pub async fn poll<T, F, Fut>(
    label: &str,
    policy: &PollPolicy,
    cancel: &CancelSignal,
    mut attempt: F,
) -> Polled<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ProbeFailure>>,
{
    let started = Instant::now();
    let deadline = started
        .checked_add(policy.timeout())
        .or_else(|| started.checked_add(Duration::from_secs(MAX_POLL_SECONDS)))
        .unwrap_or(started);
    let interval = policy.interval();
    let mut attempts = 0u32;
    let mut last_error: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return finish(PollEnd::Cancelled, attempts, started, last_error);
        }
        let attempt_start = Instant::now();
        if attempt_start >= deadline {
            return finish(PollEnd::TimedOut, attempts, started, last_error);
        }
        let budget = policy.attempt_timeout().min(deadline - attempt_start);
        attempts += 1;
        debug!(unit = %label, attempt = attempts, "probe attempt");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return finish(PollEnd::Cancelled, attempts, started, last_error);
            }
            r = tokio::time::timeout(budget, attempt()) => r,
        };

        match result {
            Ok(Ok(value)) => {
                info!(unit = %label, attempts, "ready");
                return finish(PollEnd::Ready(value), attempts, started, None);
            }
            Ok(Err(failure)) => {
                warn!(unit = %label, attempt = attempts, kind = failure.kind(), "{failure}");
                last_error = Some(failure.to_string());
            }
            Err(_) => {
                warn!(
                    unit = %label,
                    attempt = attempts,
                    kind = "attempt_timeout",
                    "attempt exceeded {}ms",
                    budget.as_millis()
                );
                last_error = Some(format!("attempt exceeded {}ms", budget.as_millis()));
            }
        }

        if attempts >= policy.max_attempts {
            return finish(PollEnd::TimedOut, attempts, started, last_error);
        }

        let wake = attempt_start
            .checked_add(interval)
            .map_or(deadline, |next| next.min(deadline));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return finish(PollEnd::Cancelled, attempts, started, last_error);
            }
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}

fn finish<T>(
    end: PollEnd<T>,
    attempts: u32,
    started: Instant,
    last_error: Option<String>,
) -> Polled<T> {
    Polled {
        end,
        attempts,
        elapsed: started.elapsed(),
        last_error,
    }
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

/// Await one unit's readiness probe.
pub async fn await_probe(
    unit: &str,
    probe: &ReadinessProbe,
    prober: &dyn Prober,
    cancel: &CancelSignal,
) -> GateReport {
    let polled = poll(unit, &probe.policy, cancel, || {
        prober.probe(unit, &probe.target)
    })
    .await;

    let outcome = match polled.end {
        PollEnd::Ready(()) => GateOutcome::Satisfied,
        PollEnd::TimedOut => {
            warn!(unit = %unit, attempts = polled.attempts, "readiness gate timed out");
            GateOutcome::TimedOut
        }
        PollEnd::Cancelled => GateOutcome::Cancelled,
    };
    GateReport {
        unit: unit.to_string(),
        outcome,
        attempts: polled.attempts,
        elapsed_ms: u64::try_from(polled.elapsed.as_millis()).unwrap_or(u64::MAX),
        last_error: polled.last_error,
    }
}

/// Await every unit of one release group concurrently.
///
/// Returns once every gate has reached a terminal outcome. Reports are in
/// the order of `units`. A timed-out peer does not cancel the others.
pub async fn await_group(
    units: &[DeployableUnit],
    prober: Arc<dyn Prober>,
    cancel: &CancelSignal,
) -> Vec<GateReport> {
    let mut set = JoinSet::new();
    for (idx, unit) in units.iter().enumerate() {
        let unit = unit.clone();
        let prober = Arc::clone(&prober);
        let cancel = cancel.clone();
        set.spawn(async move {
            let report =
                await_probe(&unit.id, &unit.readiness_probe, prober.as_ref(), &cancel).await;
            (idx, report)
        });
    }

    let mut slots: Vec<Option<GateReport>> = vec![None; units.len()];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, report)) => slots[idx] = Some(report),
            Err(e) => error!("gate task failed: {e}"),
        }
    }

    slots
        .into_iter()
        .zip(units)
        .map(|(slot, unit)| slot.unwrap_or_else(|| GateReport::aborted(&unit.id, "gate task failed")))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
