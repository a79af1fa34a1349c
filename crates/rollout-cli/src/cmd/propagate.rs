use crate::cluster;
use crate::cmd::deploy::print_propagation;
use crate::cmd::{exit_with, runtime, Workspace};
use crate::output::print_json;
use anyhow::Context;
use rollout_core::propagation::{PropagationEngine, PropagationOptions};

/// Write `value` into every manifest target, outside a deploy.
pub fn run(ws: &Workspace, value: &str, opts: PropagationOptions, json: bool) -> anyhow::Result<()> {
    let manifest = ws.load()?;
    let cfg = manifest
        .propagation
        .as_ref()
        .context("manifest has no 'propagation' section")?;

    let rt = runtime()?;
    let report = rt.block_on(async {
        let client = if cluster::targets_need_cluster(&manifest) {
            cluster::try_connect().await
        } else {
            None
        };
        let engine = PropagationEngine::new(
            cluster::record_stores(&ws.root, client.as_ref()),
            ws.root.clone(),
            cfg.backup_retention,
        );
        let discovered = engine.discover(&cfg.targets).await;
        engine.propagate(value, &discovered, opts).await
    });

    if json {
        print_json(&report)?;
    } else {
        print_propagation(&report);
    }

    exit_with(if report.has_fatal() {
        1
    } else if report.has_errors() {
        2
    } else {
        0
    })
}
