use crate::probe::ReadinessProbe;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ---------------------------------------------------------------------------
// HookPhase
// ---------------------------------------------------------------------------

/// Sub-ordering inside a wave. Declaration order is the release order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum HookPhase {
    PreSync,
    #[default]
    Sync,
    PostSync,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HookPhase::PreSync => "PreSync",
            HookPhase::Sync => "Sync",
            HookPhase::PostSync => "PostSync",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// DeployableUnit
// ---------------------------------------------------------------------------

/// One independently releasable component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployableUnit {
    pub id: String,
    #[serde(default)]
    pub wave: i32,
    #[serde(default)]
    pub hook_phase: HookPhase,
    pub readiness_probe: ReadinessProbe,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    /// A timed-out optional unit is recorded but does not block later groups.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DeployableUnit {
    pub fn new(id: impl Into<String>, wave: i32, hook_phase: HookPhase, probe: ReadinessProbe) -> Self {
        Self {
            id: id.into(),
            wave,
            hook_phase,
            readiness_probe: probe,
            depends_on: BTreeSet::new(),
            optional: false,
            description: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Sort key that places the unit into its release group.
    pub fn release_key(&self) -> (i32, HookPhase) {
        (self.wave, self.hook_phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_phase_orders_pre_sync_first() {
        assert!(HookPhase::PreSync < HookPhase::Sync);
        assert!(HookPhase::Sync < HookPhase::PostSync);
        assert_eq!(HookPhase::default(), HookPhase::Sync);
    }

    #[test]
    fn unit_yaml_round_trip_keeps_defaults() {
        let yaml = r#"
id: db-migrate
wave: -1
hook_phase: PreSync
readiness_probe:
  target:
    type: object_status_field
    api_version: batch/v1
    kind: Job
    namespace: core
    name: db-migrate
    field: /status/succeeded
    equals: "1"
"#;
        let unit: DeployableUnit = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(unit.release_key(), (-1, HookPhase::PreSync));
        assert!(unit.depends_on.is_empty());
        assert!(!unit.optional);

        let out = serde_yaml::to_string(&unit).unwrap();
        assert!(!out.contains("optional"));
        assert!(!out.contains("depends_on"));
    }

    #[test]
    fn unknown_unit_field_rejected() {
        let yaml = "id: x\nwaves: 1\nreadiness_probe:\n  target:\n    type: http_get\n    url: http://x\n";
        assert!(serde_yaml::from_str::<DeployableUnit>(yaml).is_err());
    }
}
