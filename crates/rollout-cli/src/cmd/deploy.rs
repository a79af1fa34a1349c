use crate::cluster;
use crate::cmd::{exit_with, runtime, Workspace};
use crate::output::{format_elapsed, print_json, print_table};
use anyhow::Context;
use rollout_core::health::HealthReport;
use rollout_core::keys::KeyBackupOutcome;
use rollout_core::orchestrator::{DeployOptions, Orchestrator};
use rollout_core::propagation::{PropagationReport, TargetOutcome};
use rollout_core::run::{OrchestrationRun, PropagationStage};

pub fn run(ws: &Workspace, environment: &str, opts: DeployOptions, json: bool) -> anyhow::Result<()> {
    let manifest = ws.load()?;
    let rt = runtime()?;
    let run = rt.block_on(async {
        let client = if cluster::deploy_needs_cluster(&manifest) {
            cluster::try_connect().await
        } else {
            None
        };
        let collab = cluster::collaborators(&ws.root, &manifest, client.as_ref())?;
        let orchestrator = Orchestrator::new(&ws.root, &manifest, environment, collab, opts)?;
        let cancel = cluster::interrupt_signal();
        anyhow::Ok(orchestrator.run(&cancel).await)
    })?;

    run.append_to_log(&ws.root)
        .context("failed to append to the run log")?;

    if json {
        print_json(&run)?;
    } else {
        print_run(&run);
    }
    exit_with(run.outcome.exit_code())
}

fn print_run(run: &OrchestrationRun) {
    let rows = run
        .units
        .iter()
        .map(|r| {
            vec![
                r.unit.clone(),
                r.outcome.to_string(),
                r.attempts.to_string(),
                format_elapsed(r.elapsed_ms),
                r.last_error.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["UNIT", "OUTCOME", "ATTEMPTS", "ELAPSED", "LAST ERROR"], rows);

    if let Some(key) = &run.key_backup {
        match key {
            KeyBackupOutcome::Stored { version, key_count } => {
                println!("\nKey backup: stored version {version} ({key_count} keys)");
            }
            KeyBackupOutcome::Warning { reason } => println!("\nKey backup: skipped ({reason})"),
        }
    }

    match &run.propagation {
        Some(PropagationStage::Completed(report)) => print_propagation(report),
        Some(PropagationStage::DiscoveryFailed { reason }) => {
            println!("\nPropagation: discovery failed ({reason})");
        }
        Some(PropagationStage::Skipped { reason }) => println!("\nPropagation: skipped ({reason})"),
        None => {}
    }

    if let Some(health) = &run.health {
        print_health(health);
    }

    for note in &run.notes {
        println!("note: {note}");
    }
    println!("\nRun {}: {}", run.id, run.outcome);
}

pub fn print_propagation(report: &PropagationReport) {
    let mode = if report.committed { "committed" } else { "dry run" };
    println!("\nPropagation of '{}' ({mode}):", report.value);
    let rows = report
        .targets
        .iter()
        .map(|t| {
            vec![
                t.target.clone(),
                t.record.clone(),
                t.outcome.label().to_string(),
                outcome_detail(&t.outcome),
            ]
        })
        .collect();
    print_table(&["TARGET", "RECORD", "OUTCOME", "DETAIL"], rows);
}

fn outcome_detail(outcome: &TargetOutcome) -> String {
    match outcome {
        TargetOutcome::Updated { previous, backup } => format!("was '{previous}', backup {backup}"),
        TargetOutcome::NoOp => String::new(),
        TargetOutcome::WouldUpdate { previous } => format!("currently '{previous}'"),
        TargetOutcome::ConcurrentModification { .. } => "record changed since discovery".into(),
        TargetOutcome::Unreadable { reason } | TargetOutcome::BackupFailed { reason } => reason.clone(),
        TargetOutcome::WriteFailed { reason, backup } => format!("{reason} (backup {backup})"),
        TargetOutcome::VerificationFailed {
            expected,
            found,
            backup,
        } => format!("expected '{expected}', found '{found}' (backup {backup})"),
    }
}

pub fn print_health(report: &HealthReport) {
    let verdict = if report.passed { "passed" } else { "failed" };
    println!("\nHealth: {verdict}");
    let rows = report
        .checks
        .iter()
        .map(|c| {
            vec![
                c.name.clone(),
                if c.passed { "pass".into() } else { "FAIL".into() },
                c.attempts.to_string(),
                c.detail.clone(),
            ]
        })
        .collect();
    print_table(&["CHECK", "RESULT", "ATTEMPTS", "DETAIL"], rows);
}
