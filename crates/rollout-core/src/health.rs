//! Health verifier: the synthetic checks that decide whether a deployment
//! actually works end to end.

use crate::error::{Result, RolloutError};
use crate::gate::CancelSignal;
use crate::probe::StatusRange;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Check definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum CheckKind {
    Endpoint {
        url: String,
        #[serde(default)]
        expect_status: StatusRange,
    },
    /// OAuth2 client-credentials grant. Passes when the token endpoint
    /// returns an `access_token`.
    AuthRoundTrip {
        token_url: String,
        client_id: String,
        /// Environment variable holding the client secret.
        client_secret_env: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audience: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
    },
    DataQuery {
        url: String,
        /// Name of an earlier `auth_round_trip` check whose token is sent as
        /// a bearer credential.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_from: Option<String>,
        #[serde(default)]
        expect_status: StatusRange,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckSpec {
    pub name: String,
    pub check: CheckKind,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_check_timeout")]
    pub timeout_seconds: u64,
}

fn default_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

fn default_check_timeout() -> u64 {
    10
}

/// Names must be unique, budgets finite, and `bearer_from` must name an
/// earlier auth check.
pub fn validate_checks(checks: &[HealthCheckSpec]) -> Result<()> {
    let mut auth: Vec<&str> = Vec::new();
    let mut seen: Vec<&str> = Vec::new();
    for c in checks {
        let bad = |reason: String| {
            Err(RolloutError::Configuration(format!(
                "health check '{}': {reason}",
                c.name
            )))
        };
        if seen.contains(&c.name.as_str()) {
            return bad("duplicate name".into());
        }
        if c.attempts == 0 || c.timeout_seconds == 0 {
            return bad("attempts and timeout_seconds must be at least 1".into());
        }
        match &c.check {
            CheckKind::AuthRoundTrip { .. } => auth.push(&c.name),
            CheckKind::DataQuery {
                bearer_from: Some(from),
                ..
            } if !auth.contains(&from.as_str()) => {
                return bad(format!(
                    "bearer_from '{from}' must name an earlier auth_round_trip check"
                ));
            }
            _ => {}
        }
        seen.push(&c.name);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Runner seam
// ---------------------------------------------------------------------------

/// Tokens obtained by earlier checks in the same verification.
#[derive(Default)]
pub struct CheckContext {
    tokens: HashMap<String, String>,
}

impl CheckContext {
    pub fn token(&self, check: &str) -> Option<&str> {
        self.tokens.get(check).map(String::as_str)
    }
}

pub struct CheckSuccess {
    pub detail: String,
    /// Credential to hand to later checks. Never serialized.
    pub token: Option<String>,
}

/// Runs one attempt of one check.
pub trait CheckRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        spec: &'a HealthCheckSpec,
        ctx: &'a CheckContext,
    ) -> BoxFuture<'a, std::result::Result<CheckSuccess, String>>;
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub attempts: u32,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub passed: bool,
    pub checks: Vec<CheckResult>,
}

impl HealthReport {
    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// Run every check in declaration order and produce one verdict.
///
/// Every check runs even after an earlier one fails, so the report carries
/// full detail. An empty battery passes.
pub async fn verify(
    checks: &[HealthCheckSpec],
    runner: &dyn CheckRunner,
    cancel: &CancelSignal,
) -> HealthReport {
    let mut ctx = CheckContext::default();
    let mut results = Vec::with_capacity(checks.len());

    for spec in checks {
        let result = run_check(spec, runner, &mut ctx, cancel).await;
        if result.passed {
            info!(check = %spec.name, attempts = result.attempts, "health check passed");
        } else {
            warn!(check = %spec.name, attempts = result.attempts, "health check failed: {}", result.detail);
        }
        results.push(result);
    }

    HealthReport {
        passed: results.iter().all(|r| r.passed),
        checks: results,
    }
}

async fn run_check(
    spec: &HealthCheckSpec,
    runner: &dyn CheckRunner,
    ctx: &mut CheckContext,
    cancel: &CancelSignal,
) -> CheckResult {
    let timeout = Duration::from_secs(spec.timeout_seconds);
    let delay = Duration::from_secs(spec.retry_delay_seconds);
    let mut detail = String::new();
    let mut attempts = 0;

    while attempts < spec.attempts.max(1) {
        if cancel.is_cancelled() {
            detail = "cancelled".into();
            break;
        }
        attempts += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                detail = "cancelled".into();
                break;
            }
            r = tokio::time::timeout(timeout, runner.run(spec, ctx)) => r,
        };
        match outcome {
            Ok(Ok(success)) => {
                if let Some(token) = success.token {
                    ctx.tokens.insert(spec.name.clone(), token);
                }
                return CheckResult {
                    name: spec.name.clone(),
                    passed: true,
                    attempts,
                    detail: success.detail,
                };
            }
            Ok(Err(reason)) => detail = reason,
            Err(_) => detail = format!("no response within {}s", spec.timeout_seconds),
        }
        if attempts < spec.attempts {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    detail = "cancelled".into();
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    CheckResult {
        name: spec.name.clone(),
        passed: false,
        attempts,
        detail,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
