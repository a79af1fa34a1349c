use crate::cmd::Workspace;
use crate::output::{print_json, print_table};
use anyhow::Context;
use serde_json::json;

/// Print the release order without touching anything.
pub fn run(ws: &Workspace, environment: Option<&str>, json: bool) -> anyhow::Result<()> {
    let mut manifest = ws.load()?;
    if let Some(env) = environment {
        manifest = manifest.resolve_environment(env)?;
    }
    let schedule = manifest.schedule().context("failed to build release schedule")?;

    if json {
        let groups: Vec<_> = schedule
            .groups()
            .iter()
            .map(|g| {
                json!({
                    "index": g.index,
                    "wave": g.wave,
                    "hook_phase": g.hook_phase,
                    "units": g.units.iter().map(|u| json!({
                        "id": u.id,
                        "probe": u.readiness_probe.target.kind(),
                        "depends_on": u.depends_on,
                        "optional": u.optional,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        return print_json(&json!({ "groups": groups }));
    }

    if schedule.is_empty() {
        println!("No units declared.");
        return Ok(());
    }

    let mut rows = Vec::new();
    for group in schedule.groups() {
        for unit in &group.units {
            let deps: Vec<&str> = unit.depends_on.iter().map(String::as_str).collect();
            rows.push(vec![
                group.index.to_string(),
                group.wave.to_string(),
                group.hook_phase.to_string(),
                unit.id.clone(),
                unit.readiness_probe.target.describe(),
                if deps.is_empty() { "-".into() } else { deps.join(",") },
                if unit.optional { "yes".into() } else { String::new() },
            ]);
        }
    }
    print_table(
        &["GROUP", "WAVE", "PHASE", "UNIT", "PROBE", "DEPENDS ON", "OPTIONAL"],
        rows,
    );
    Ok(())
}
