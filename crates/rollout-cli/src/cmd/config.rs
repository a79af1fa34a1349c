use crate::cmd::Workspace;
use crate::output::print_json;
use clap::Subcommand;
use rollout_core::config::WarnLevel;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Validate the manifest for common mistakes
    Validate,
}

pub fn run(ws: &Workspace, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Validate => validate(ws, json),
    }
}

fn validate(ws: &Workspace, json: bool) -> anyhow::Result<()> {
    let manifest = ws.load()?;
    let warnings = manifest.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Manifest is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("manifest validation found errors");
    }
    Ok(())
}
