//! Readiness probe definitions.
//!
//! A probe pairs a kind-specific target (what to look at, and what counts as
//! ready) with a polling policy. Probes are read from the manifest once and
//! never mutated; the gate evaluates them until a terminal outcome.

use crate::error::{Result, RolloutError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// StatusRange / JsonExpectation
// ---------------------------------------------------------------------------

/// Inclusive HTTP status range accepted as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusRange {
    pub min: u16,
    pub max: u16,
}

impl StatusRange {
    pub fn contains(&self, code: u16) -> bool {
        (self.min..=self.max).contains(&code)
    }
}

impl Default for StatusRange {
    fn default() -> Self {
        Self { min: 200, max: 299 }
    }
}

impl fmt::Display for StatusRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.min, self.max)
    }
}

/// A check against the JSON body of a discovery document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonExpectation {
    /// RFC 6901 pointer into the response body, e.g. `/realm`.
    pub pointer: String,
    pub equals: serde_json::Value,
}

// ---------------------------------------------------------------------------
// ProbeKind / ProbeTarget
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    HttpGet,
    RecordExists,
    ObjectStatusField,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::HttpGet => write!(f, "http_get"),
            ProbeKind::RecordExists => write!(f, "record_exists"),
            ProbeKind::ObjectStatusField => write!(f, "object_status_field"),
        }
    }
}

/// Locator plus success predicate for one probe kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ProbeTarget {
    /// Satisfied when the GET returns a status in `expect_status` and, if set,
    /// the body matches `expect_json`.
    HttpGet {
        url: String,
        #[serde(default)]
        expect_status: StatusRange,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect_json: Option<JsonExpectation>,
    },
    /// Satisfied when `table` contains a row whose `column` equals `value`.
    /// The connection string is read from the environment variable `dsn_env`.
    RecordExists {
        dsn_env: String,
        table: String,
        column: String,
        value: String,
    },
    /// Satisfied when the field at pointer `field` equals `equals` on every
    /// matched object (and at least one object matched).
    ObjectStatusField {
        api_version: String,
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        field: String,
        equals: String,
    },
}

impl ProbeTarget {
    pub fn kind(&self) -> ProbeKind {
        match self {
            ProbeTarget::HttpGet { .. } => ProbeKind::HttpGet,
            ProbeTarget::RecordExists { .. } => ProbeKind::RecordExists,
            ProbeTarget::ObjectStatusField { .. } => ProbeKind::ObjectStatusField,
        }
    }

    /// Short human description used in plans and logs.
    pub fn describe(&self) -> String {
        match self {
            ProbeTarget::HttpGet { url, .. } => format!("GET {url}"),
            ProbeTarget::RecordExists {
                table,
                column,
                value,
                ..
            } => format!("{table}.{column} = {value}"),
            ProbeTarget::ObjectStatusField {
                kind,
                namespace,
                name,
                selector,
                field,
                equals,
                ..
            } => {
                let ns = namespace.as_deref().unwrap_or("*");
                let obj = name
                    .clone()
                    .or_else(|| selector.as_ref().map(|s| format!("[{s}]")))
                    .unwrap_or_default();
                format!("{kind} {ns}/{obj} {field} == {equals}")
            }
        }
    }

    fn validate(&self, unit: &str) -> Result<()> {
        match self {
            ProbeTarget::HttpGet {
                url, expect_status, ..
            } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(invalid(unit, format!("url '{url}' must be http(s)")));
                }
                if expect_status.min > expect_status.max {
                    return Err(invalid(unit, format!("empty status range {expect_status}")));
                }
            }
            ProbeTarget::RecordExists {
                dsn_env,
                table,
                column,
                ..
            } => {
                if dsn_env.trim().is_empty() {
                    return Err(invalid(unit, "dsn_env must name an environment variable"));
                }
                for ident in [table, column] {
                    if !is_sql_identifier(ident) {
                        return Err(invalid(
                            unit,
                            format!("'{ident}' is not a plain SQL identifier"),
                        ));
                    }
                }
            }
            ProbeTarget::ObjectStatusField {
                name,
                selector,
                field,
                ..
            } => {
                if name.is_some() == selector.is_some() {
                    return Err(invalid(unit, "exactly one of 'name' or 'selector' is required"));
                }
                if !field.starts_with('/') {
                    return Err(invalid(
                        unit,
                        format!("field '{field}' must be a JSON pointer such as /status/phase"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Letters, digits, `_`, with an optional single schema qualifier.
pub fn is_sql_identifier(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|p| {
            !p.is_empty()
                && !p.starts_with(|c: char| c.is_ascii_digit())
                && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

fn invalid(unit: &str, reason: impl Into<String>) -> RolloutError {
    RolloutError::Configuration(format!(
        "unit '{unit}' readiness probe: {}",
        reason.into()
    ))
}

// ---------------------------------------------------------------------------
// PollPolicy
// ---------------------------------------------------------------------------

/// Polling budget shared by readiness probes and endpoint discovery.
///
/// Invariants (checked by [`PollPolicy::validate`]):
/// `max_attempts × interval ≥ timeout` and `attempt_timeout < interval`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollPolicy {
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-attempt budget in milliseconds. Defaults to half the interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_timeout_ms: Option<u64>,
}

/// Upper bound for `interval_seconds` and `timeout_seconds`: one week.
pub const MAX_POLL_SECONDS: u64 = 7 * 24 * 60 * 60;

fn default_interval() -> u64 {
    5
}

fn default_timeout() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    60
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            timeout_seconds: default_timeout(),
            max_attempts: default_max_attempts(),
            attempt_timeout_ms: None,
        }
    }
}

impl PollPolicy {
    pub fn new(interval_seconds: u64, timeout_seconds: u64, max_attempts: u32) -> Self {
        Self {
            interval_seconds,
            timeout_seconds,
            max_attempts,
            attempt_timeout_ms: None,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn attempt_timeout(&self) -> Duration {
        match self.attempt_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.interval() / 2,
        }
    }

    pub fn validate(&self, owner: &str) -> Result<()> {
        let fail = |reason: String| {
            Err(RolloutError::Configuration(format!(
                "{owner} polling policy: {reason}"
            )))
        };
        if self.interval_seconds == 0 {
            return fail("interval_seconds must be at least 1".into());
        }
        if self.timeout_seconds == 0 {
            return fail("timeout_seconds must be at least 1".into());
        }
        if self.max_attempts == 0 {
            return fail("max_attempts must be at least 1".into());
        }
        if self.interval_seconds > MAX_POLL_SECONDS || self.timeout_seconds > MAX_POLL_SECONDS {
            return fail(format!(
                "interval_seconds and timeout_seconds must not exceed {MAX_POLL_SECONDS}"
            ));
        }
        if u64::from(self.max_attempts).saturating_mul(self.interval_seconds) < self.timeout_seconds {
            return fail(format!(
                "max_attempts ({}) x interval ({}s) must cover timeout ({}s)",
                self.max_attempts, self.interval_seconds, self.timeout_seconds
            ));
        }
        if self.attempt_timeout() >= self.interval() || self.attempt_timeout().is_zero() {
            return fail(format!(
                "attempt timeout ({}ms) must be positive and shorter than the interval ({}s)",
                self.attempt_timeout().as_millis(),
                self.interval_seconds
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ReadinessProbe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadinessProbe {
    pub target: ProbeTarget,
    #[serde(default)]
    pub policy: PollPolicy,
}

impl ReadinessProbe {
    pub fn new(target: ProbeTarget, policy: PollPolicy) -> Self {
        Self { target, policy }
    }

    pub fn kind(&self) -> ProbeKind {
        self.target.kind()
    }

    pub fn validate(&self, unit: &str) -> Result<()> {
        self.target.validate(unit)?;
        self.policy.validate(&format!("unit '{unit}'"))
    }
}

// ---------------------------------------------------------------------------
// ProbeFailure
// ---------------------------------------------------------------------------

/// Why one probe attempt did not succeed. Both variants count as a failed
/// attempt; the distinction only feeds diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    /// The target answered but the predicate does not hold yet.
    NotReady(String),
    /// The target could not be reached at all.
    Transport(String),
}

impl ProbeFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeFailure::NotReady(_) => "not_ready",
            ProbeFailure::Transport(_) => "transport",
        }
    }
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::NotReady(m) => write!(f, "not ready: {m}"),
            ProbeFailure::Transport(m) => write!(f, "unreachable: {m}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
