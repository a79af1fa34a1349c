//! Drives one deployment: release groups in order, run the side stages
//! their units unlock, then verify health.

use crate::config::Manifest;
use crate::error::Result;
use crate::gate::{self, CancelSignal, GateOutcome, GateReport, Prober};
use crate::health::{self, CheckRunner};
use crate::keys::{KeyBackupOutcome, KeyLifecycle};
use crate::propagation::store::RecordStores;
use crate::propagation::{self, EndpointDiscovery, PropagationEngine, PropagationOptions};
use crate::run::{OrchestrationRun, PropagationStage, RunOutcome};
use crate::scheduler::{Advance, ReleaseGroup, Schedule};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Everything the orchestrator talks to outside the process.
#[derive(Clone)]
pub struct Collaborators {
    pub prober: Arc<dyn Prober>,
    pub records: RecordStores,
    pub discovery: Option<Arc<dyn EndpointDiscovery>>,
    pub keys: Option<KeyLifecycle>,
    pub checks: Arc<dyn CheckRunner>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeployOptions {
    /// Release every group without polling gates.
    pub skip_wait: bool,
    pub commit: bool,
    pub force: bool,
}

pub struct Orchestrator {
    root: PathBuf,
    environment: String,
    manifest: Manifest,
    schedule: Schedule,
    collab: Collaborators,
    opts: DeployOptions,
}

/// Why the run stopped releasing groups.
struct Stop {
    group: usize,
    reason: String,
}

impl Orchestrator {
    pub fn new(
        root: impl Into<PathBuf>,
        manifest: &Manifest,
        environment: &str,
        collab: Collaborators,
        opts: DeployOptions,
    ) -> Result<Self> {
        let manifest = manifest.resolve_environment(environment)?;
        let schedule = manifest.schedule()?;
        Ok(Self {
            root: root.into(),
            environment: environment.to_string(),
            manifest,
            schedule,
            collab,
            opts,
        })
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub async fn run(&self, cancel: &CancelSignal) -> OrchestrationRun {
        let mut run = OrchestrationRun::start(&self.environment);
        info!(
            run = %run.id,
            environment = %self.environment,
            groups = self.schedule.len(),
            "deploy started"
        );

        let stop = self.release_groups(&mut run, cancel).await;

        match stop {
            Some(stop) => {
                for unit in self.schedule.units_after(stop.group) {
                    run.units.push(GateReport::cancelled(&unit.id, stop.reason.clone()));
                }
                if self.manifest.propagation.is_some() && run.propagation.is_none() {
                    run.propagation = Some(PropagationStage::Skipped {
                        reason: stop.reason.clone(),
                    });
                }
                error!(environment = %self.environment, "deploy stopped: {}", stop.reason);
            }
            None => self.verify_health(&mut run, cancel).await,
        }

        run.finish();
        info!(run = %run.id, outcome = %run.outcome, "deploy finished");
        run
    }

    async fn release_groups(&self, run: &mut OrchestrationRun, cancel: &CancelSignal) -> Option<Stop> {
        let mut current = if self.schedule.is_empty() { None } else { Some(0) };

        while let Some(idx) = current {
            let group = &self.schedule.groups()[idx];
            info!(
                group = idx,
                wave = group.wave,
                phase = %group.hook_phase,
                units = ?group.unit_ids(),
                "releasing group"
            );

            let reports = if self.opts.skip_wait {
                group.units.iter().map(|u| GateReport::skipped(&u.id)).collect()
            } else {
                gate::await_group(&group.units, Arc::clone(&self.collab.prober), cancel).await
            };
            for (unit, report) in group.units.iter().zip(&reports) {
                if unit.optional && report.outcome == GateOutcome::TimedOut {
                    warn!(unit = %unit.id, "optional unit timed out; continuing");
                    run.notes.push(format!("optional unit '{}' timed out", unit.id));
                }
            }
            run.units.extend(reports.iter().cloned());

            if cancel.is_cancelled() {
                run.degrade(RunOutcome::Cancelled, "cancelled by operator");
                return Some(Stop {
                    group: idx,
                    reason: "run cancelled".into(),
                });
            }

            let advance = self.schedule.advance(idx, &reports);
            self.maybe_backup_keys(&reports, run).await;

            if let Advance::Blocked { unit } = &advance {
                run.degrade(
                    RunOutcome::Failure,
                    format!("unit '{unit}' did not become ready"),
                );
                return Some(Stop {
                    group: idx,
                    reason: format!("blocked by unit '{unit}'"),
                });
            }

            if let Err(reason) = self.maybe_propagate(group, &reports, run, cancel).await {
                if cancel.is_cancelled() {
                    run.degrade(RunOutcome::Cancelled, "cancelled by operator");
                    return Some(Stop {
                        group: idx,
                        reason: "run cancelled".into(),
                    });
                }
                run.degrade(RunOutcome::Failure, reason.clone());
                return Some(Stop { group: idx, reason });
            }

            current = match advance {
                Advance::Next(n) => Some(n),
                Advance::Done | Advance::Blocked { .. } => None,
            };
        }
        None
    }

    async fn maybe_backup_keys(&self, reports: &[GateReport], run: &mut OrchestrationRun) {
        let Some(cfg) = &self.manifest.keys else {
            return;
        };
        let Some(report) = reports.iter().find(|r| r.unit == cfg.sealing_unit) else {
            return;
        };
        let outcome = if !matches!(report.outcome, GateOutcome::Satisfied | GateOutcome::Skipped) {
            KeyBackupOutcome::Warning {
                reason: format!("sealing unit '{}' is {}", cfg.sealing_unit, report.outcome),
            }
        } else {
            match &self.collab.keys {
                Some(keys) => keys.backup_or_warn(&self.environment).await,
                None => KeyBackupOutcome::Warning {
                    reason: "no key source available".into(),
                },
            }
        };
        if let KeyBackupOutcome::Warning { reason } = &outcome {
            run.degrade(
                RunOutcome::PartialFailure,
                format!("key backup skipped: {reason}"),
            );
        }
        run.key_backup = Some(outcome);
    }

    /// `Err` carries the reason the run must stop.
    async fn maybe_propagate(
        &self,
        group: &ReleaseGroup,
        reports: &[GateReport],
        run: &mut OrchestrationRun,
        cancel: &CancelSignal,
    ) -> std::result::Result<(), String> {
        let Some(cfg) = &self.manifest.propagation else {
            return Ok(());
        };
        let Some(source) = group.units.iter().find(|u| u.id == cfg.source_unit) else {
            return Ok(());
        };
        let ready = reports
            .iter()
            .find(|r| r.unit == source.id)
            .is_some_and(|r| matches!(r.outcome, GateOutcome::Satisfied | GateOutcome::Skipped));
        if !ready {
            // The source was optional and timed out; `advance` let the run go on.
            let reason = format!("source unit '{}' is not ready", source.id);
            run.degrade(RunOutcome::PartialFailure, format!("propagation skipped: {reason}"));
            run.propagation = Some(PropagationStage::Skipped { reason });
            return Ok(());
        }

        let Some(discovery) = &self.collab.discovery else {
            let reason = "no endpoint discovery available".to_string();
            run.propagation = Some(PropagationStage::DiscoveryFailed {
                reason: reason.clone(),
            });
            return Err(format!("propagation failed: {reason}"));
        };
        let value =
            match propagation::discover_endpoint(discovery.as_ref(), &cfg.discovery, cancel).await {
                Ok(v) => v,
                Err(e) => {
                    run.propagation = Some(PropagationStage::DiscoveryFailed {
                        reason: e.to_string(),
                    });
                    return Err(format!("propagation failed: {e}"));
                }
            };

        let engine = PropagationEngine::new(
            self.collab.records.clone(),
            self.root.clone(),
            cfg.backup_retention,
        );
        let discovered = engine.discover(&cfg.targets).await;
        let opts = PropagationOptions {
            commit: self.opts.commit,
            force: self.opts.force,
        };
        let report = engine.propagate(&value, &discovered, opts).await;
        info!(
            value = %value,
            writes = report.writes(),
            committed = report.committed,
            "propagation finished"
        );

        let fatal = report.has_fatal();
        let errors = report.has_errors();
        run.propagation = Some(PropagationStage::Completed(report));
        if fatal {
            return Err("propagation failed: a target write could not be verified".into());
        }
        if errors {
            run.degrade(
                RunOutcome::PartialFailure,
                "propagation left some targets unchanged",
            );
        }
        Ok(())
    }

    async fn verify_health(&self, run: &mut OrchestrationRun, cancel: &CancelSignal) {
        let report = health::verify(
            &self.manifest.health.checks,
            self.collab.checks.as_ref(),
            cancel,
        )
        .await;
        if cancel.is_cancelled() {
            run.degrade(RunOutcome::Cancelled, "cancelled by operator");
        } else if !report.passed {
            let failed: Vec<&str> = report.failed_checks().map(|c| c.name.as_str()).collect();
            run.degrade(
                RunOutcome::Failure,
                format!("health check failed: {}", failed.join(", ")),
            );
        }
        run.health = Some(report);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
