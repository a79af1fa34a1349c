mod cluster;
mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    backups::BackupsSubcommand, config::ConfigSubcommand, keys::KeysSubcommand, DeployExit,
    Workspace,
};
use rollout_core::orchestrator::DeployOptions;
use rollout_core::propagation::PropagationOptions;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "rollout",
    about = "Dependency-gated deployment orchestrator: release waves, gate on readiness, propagate discovered config",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .rollout/ or .git/)
    #[arg(long, global = true, env = "ROLLOUT_ROOT")]
    root: Option<PathBuf>,

    /// Manifest path (default: <root>/.rollout/manifest.yaml)
    #[arg(long, global = true, env = "ROLLOUT_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy an environment: release groups in order, propagate, verify
    Deploy {
        environment: String,
        /// Release every group without waiting on readiness gates
        #[arg(long)]
        skip_wait: bool,
        /// Write propagation targets (default is a dry run)
        #[arg(long)]
        commit: bool,
        /// Write targets even if they changed since discovery
        #[arg(long)]
        force: bool,
    },

    /// Show the release order
    Plan {
        /// Resolve per-environment namespaces
        #[arg(long = "env")]
        environment: Option<String>,
    },

    /// Block until one unit's readiness probe passes
    Wait {
        unit: String,
        #[arg(long = "env")]
        environment: Option<String>,
    },

    /// Propagate a value into every manifest target
    Propagate {
        value: String,
        #[arg(long)]
        commit: bool,
        #[arg(long)]
        force: bool,
    },

    /// Run the health check battery
    Verify,

    /// Back up, restore and list sealing key material
    Keys {
        #[command(subcommand)]
        subcommand: KeysSubcommand,
    },

    /// Inspect and restore propagation target backups
    Backups {
        #[command(subcommand)]
        subcommand: BackupsSubcommand,
    },

    /// Validate the manifest
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Deploy { .. } | Commands::Wait { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let ws = Workspace {
        root: root::resolve_root(cli.root.as_deref()),
        manifest: cli.manifest,
    };

    let result = match cli.command {
        Commands::Deploy {
            environment,
            skip_wait,
            commit,
            force,
        } => cmd::deploy::run(
            &ws,
            &environment,
            DeployOptions {
                skip_wait,
                commit,
                force,
            },
            cli.json,
        ),
        Commands::Plan { environment } => cmd::plan::run(&ws, environment.as_deref(), cli.json),
        Commands::Wait { unit, environment } => {
            cmd::wait::run(&ws, &unit, environment.as_deref(), cli.json)
        }
        Commands::Propagate {
            value,
            commit,
            force,
        } => cmd::propagate::run(&ws, &value, PropagationOptions { commit, force }, cli.json),
        Commands::Verify => cmd::verify::run(&ws, cli.json),
        Commands::Keys { subcommand } => cmd::keys::run(&ws, subcommand, cli.json),
        Commands::Backups { subcommand } => cmd::backups::run(&ws, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&ws, subcommand, cli.json),
    };

    if let Err(e) = result {
        if let Some(exit) = e.downcast_ref::<DeployExit>() {
            std::process::exit(exit.code);
        }
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
