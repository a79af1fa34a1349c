use crate::cluster;
use crate::cmd::deploy::print_health;
use crate::cmd::{runtime, Workspace};
use crate::output::print_json;
use rollout_core::health;

pub fn run(ws: &Workspace, json: bool) -> anyhow::Result<()> {
    let manifest = ws.load()?;
    let runner = cluster::check_runner()?;
    let rt = runtime()?;
    let report = rt.block_on(async {
        let cancel = cluster::interrupt_signal();
        health::verify(&manifest.health.checks, &runner, &cancel).await
    });

    if json {
        print_json(&report)?;
    } else {
        print_health(&report);
    }
    if !report.passed {
        let failed: Vec<&str> = report.failed_checks().map(|c| c.name.as_str()).collect();
        anyhow::bail!("health verification failed: {}", failed.join(", "));
    }
    Ok(())
}
