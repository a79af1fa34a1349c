use crate::cluster;
use crate::cmd::{exit_with, runtime, Workspace};
use crate::output::{format_elapsed, print_json};
use rollout_core::gate::{self, GateOutcome};

/// Await one unit's readiness probe. Usable as an entrypoint guard.
pub fn run(ws: &Workspace, unit_id: &str, environment: Option<&str>, json: bool) -> anyhow::Result<()> {
    let mut manifest = ws.load()?;
    if let Some(env) = environment {
        manifest = manifest.resolve_environment(env)?;
    }
    let schedule = manifest.schedule()?;
    let unit = schedule.unit(unit_id)?;

    let rt = runtime()?;
    let report = rt.block_on(async {
        let client = if cluster::probe_needs_cluster(&unit.readiness_probe.target) {
            cluster::try_connect().await
        } else {
            None
        };
        let prober = cluster::prober(client.as_ref())?;
        let cancel = cluster::interrupt_signal();
        anyhow::Ok(gate::await_probe(&unit.id, &unit.readiness_probe, &prober, &cancel).await)
    })?;

    if json {
        print_json(&report)?;
    } else {
        let detail = report
            .last_error
            .as_deref()
            .map(|e| format!(": {e}"))
            .unwrap_or_default();
        println!(
            "{} {} after {} attempts in {}{detail}",
            report.unit,
            report.outcome,
            report.attempts,
            format_elapsed(report.elapsed_ms)
        );
    }

    exit_with(match report.outcome {
        GateOutcome::Satisfied | GateOutcome::Skipped => 0,
        GateOutcome::TimedOut => 1,
        GateOutcome::Cancelled => 130,
    })
}
