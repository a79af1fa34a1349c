//! Wave scheduler: orders units into release groups and decides whether a
//! finished group permits the next one to start.
//!
//! The scheduler holds no run state. `advance` is a pure function of the
//! group index and that group's gate reports.

use crate::error::{Result, RolloutError};
use crate::gate::{GateOutcome, GateReport};
use crate::paths;
use crate::unit::{DeployableUnit, HookPhase};
use serde::Serialize;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Units sharing one `(wave, hook_phase)` key. Released together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseGroup {
    pub index: usize,
    pub wave: i32,
    pub hook_phase: HookPhase,
    pub units: Vec<DeployableUnit>,
}

impl ReleaseGroup {
    pub fn unit_ids(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.id.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Next(usize),
    Done,
    /// The named unit failed its gate and is not optional.
    Blocked { unit: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schedule {
    groups: Vec<ReleaseGroup>,
    #[serde(skip)]
    position: HashMap<String, usize>,
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

impl Schedule {
    /// Sort units by `(wave, hook_phase)` keeping declaration order among
    /// equals, group them, and check every dependency edge.
    pub fn build(units: &[DeployableUnit]) -> Result<Self> {
        let mut position: HashMap<String, usize> = HashMap::with_capacity(units.len());
        for unit in units {
            paths::validate_id(&unit.id)?;
            if position.insert(unit.id.clone(), 0).is_some() {
                return Err(RolloutError::Configuration(format!(
                    "duplicate unit id '{}'",
                    unit.id
                )));
            }
        }

        let mut sorted: Vec<&DeployableUnit> = units.iter().collect();
        sorted.sort_by_key(|u| u.release_key());

        let mut groups: Vec<ReleaseGroup> = Vec::new();
        for unit in sorted {
            let key = unit.release_key();
            match groups.last_mut() {
                Some(g) if (g.wave, g.hook_phase) == key => g.units.push(unit.clone()),
                _ => groups.push(ReleaseGroup {
                    index: groups.len(),
                    wave: key.0,
                    hook_phase: key.1,
                    units: vec![unit.clone()],
                }),
            }
            position.insert(unit.id.clone(), groups.len() - 1);
        }

        for unit in units {
            let own = position[&unit.id];
            for dep in &unit.depends_on {
                if dep == &unit.id {
                    return Err(RolloutError::Configuration(format!(
                        "unit '{}' depends on itself",
                        unit.id
                    )));
                }
                let Some(&dep_group) = position.get(dep) else {
                    return Err(RolloutError::Configuration(format!(
                        "unit '{}' depends on unknown unit '{dep}'",
                        unit.id
                    )));
                };
                if dep_group >= own {
                    let d = &groups[dep_group];
                    let g = &groups[own];
                    return Err(RolloutError::Configuration(format!(
                        "dependency '{}' -> '{dep}' is not released earlier: \
                         '{dep}' is in wave {} {} but '{}' is in wave {} {}",
                        unit.id, d.wave, d.hook_phase, unit.id, g.wave, g.hook_phase
                    )));
                }
            }
        }

        Ok(Self { groups, position })
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

impl Schedule {
    pub fn groups(&self) -> &[ReleaseGroup] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Group index of a unit.
    pub fn position(&self, unit_id: &str) -> Option<usize> {
        self.position.get(unit_id).copied()
    }

    pub fn unit(&self, unit_id: &str) -> Result<&DeployableUnit> {
        let idx = self
            .position(unit_id)
            .ok_or_else(|| RolloutError::UnitNotFound(unit_id.to_string()))?;
        self.groups[idx]
            .units
            .iter()
            .find(|u| u.id == unit_id)
            .ok_or_else(|| RolloutError::UnitNotFound(unit_id.to_string()))
    }

    /// Every unit released after `group_index`, in release order.
    pub fn units_after(&self, group_index: usize) -> impl Iterator<Item = &DeployableUnit> {
        self.groups
            .iter()
            .skip(group_index + 1)
            .flat_map(|g| g.units.iter())
    }

    /// Decide what follows group `current` given its gate reports.
    pub fn advance(&self, current: usize, reports: &[GateReport]) -> Advance {
        let Some(group) = self.groups.get(current) else {
            return Advance::Done;
        };
        for unit in &group.units {
            let outcome = reports
                .iter()
                .find(|r| r.unit == unit.id)
                .map(|r| r.outcome)
                .unwrap_or(GateOutcome::Cancelled);
            if !permits_advance(outcome, unit.optional) {
                return Advance::Blocked {
                    unit: unit.id.clone(),
                };
            }
        }
        if current + 1 < self.groups.len() {
            Advance::Next(current + 1)
        } else {
            Advance::Done
        }
    }
}

pub fn permits_advance(outcome: GateOutcome, optional: bool) -> bool {
    match outcome {
        GateOutcome::Satisfied | GateOutcome::Skipped => true,
        GateOutcome::TimedOut => optional,
        GateOutcome::Cancelled => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
