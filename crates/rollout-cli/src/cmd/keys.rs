use crate::cluster;
use crate::cmd::{runtime, Workspace};
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use rollout_core::config::{KeysConfig, Manifest};
use rollout_core::keys::store::{KeyStore, RedbKeyStore};
use serde_json::json;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum KeysSubcommand {
    /// Capture the sealing controller's active keys as a new version
    Backup {
        /// Environment name
        environment: String,
    },
    /// Install a stored version into the cluster and restart the controller
    Restore {
        /// Environment name
        environment: String,
        /// Version to restore (default: latest)
        #[arg(long)]
        version: Option<u64>,
        /// age identity for decrypting an enveloped payload
        #[arg(long, env = "ROLLOUT_AGE_IDENTITY")]
        identity: Option<PathBuf>,
    },
    /// List stored versions (reads only the local store)
    List {
        /// Environment name
        environment: String,
    },
}

pub fn run(ws: &Workspace, subcmd: KeysSubcommand, json: bool) -> anyhow::Result<()> {
    let manifest = ws.load()?;
    match subcmd {
        KeysSubcommand::Backup { environment } => backup(ws, &manifest, &environment, json),
        KeysSubcommand::Restore {
            environment,
            version,
            identity,
        } => restore(ws, &manifest, &environment, version, identity, json),
        KeysSubcommand::List { environment } => list(ws, &manifest, &environment, json),
    }
}

fn keys_config<'a>(manifest: &'a Manifest, environment: &str) -> anyhow::Result<&'a KeysConfig> {
    manifest.resolve_environment(environment)?;
    manifest
        .keys
        .as_ref()
        .context("manifest has no 'keys' section")
}

fn backup(ws: &Workspace, manifest: &Manifest, environment: &str, json: bool) -> anyhow::Result<()> {
    let cfg = keys_config(manifest, environment)?;
    let rt = runtime()?;
    let record = rt.block_on(async {
        let client = cluster::require_connect().await?;
        let keys = cluster::key_lifecycle(&ws.root, cfg, &client, None)?;
        keys.backup(environment).await.context("key backup failed")
    })?;

    if json {
        print_json(&json!({
            "environment": record.environment,
            "version": record.version,
            "key_count": record.key_count,
            "captured_at": record.captured_at,
        }))?;
    } else {
        println!(
            "Stored version {} for '{environment}' ({} keys).",
            record.version, record.key_count
        );
    }
    Ok(())
}

fn restore(
    ws: &Workspace,
    manifest: &Manifest,
    environment: &str,
    version: Option<u64>,
    identity: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let cfg = keys_config(manifest, environment)?;
    let rt = runtime()?;
    let result = rt.block_on(async {
        let client = cluster::require_connect().await?;
        let keys = cluster::key_lifecycle(&ws.root, cfg, &client, identity)?;
        keys.restore(environment, version)
            .await
            .context("key restore failed")
    })?;

    if json {
        print_json(&result)?;
    } else {
        println!(
            "Restored version {} for '{environment}': {}",
            result.version,
            result.restored_keys.join(", ")
        );
        if result.reloaded {
            println!("Sealing controller restarted.");
        }
    }
    Ok(())
}

fn list(ws: &Workspace, manifest: &Manifest, environment: &str, json: bool) -> anyhow::Result<()> {
    let cfg = keys_config(manifest, environment)?;
    let path = cfg.store_path(&ws.root);
    let store = RedbKeyStore::open(&path)
        .with_context(|| format!("failed to open key store at {}", path.display()))?;
    let records = store.list(environment)?;

    if json {
        let versions: Vec<_> = records
            .iter()
            .map(|r| {
                json!({
                    "version": r.version,
                    "captured_at": r.captured_at,
                    "key_count": r.key_count,
                })
            })
            .collect();
        return print_json(&json!({ "environment": environment, "versions": versions }));
    }
    if records.is_empty() {
        println!("No key material stored for '{environment}'.");
        return Ok(());
    }
    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.version.to_string(),
                r.captured_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                r.key_count.to_string(),
            ]
        })
        .collect();
    print_table(&["VERSION", "CAPTURED", "KEYS"], rows);
    Ok(())
}
