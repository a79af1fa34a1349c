use crate::cmd::Workspace;
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use rollout_core::io;
use rollout_core::propagation::backup::{BackupStore, DEFAULT_RETENTION};
use rollout_core::propagation::store::FileRecordStore;
use rollout_core::propagation::target::StoreKind;
use serde_json::json;

#[derive(Subcommand)]
pub enum BackupsSubcommand {
    /// List backups for a propagation target, oldest first
    List {
        /// Target id from the manifest
        target: String,
    },
    /// Put a backup back into a file target's record
    Restore {
        /// Target id from the manifest
        target: String,
        /// Backup name (default: the most recent)
        #[arg(long)]
        backup: Option<String>,
    },
}

pub fn run(ws: &Workspace, subcmd: BackupsSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        BackupsSubcommand::List { target } => list(ws, &target, json),
        BackupsSubcommand::Restore { target, backup } => restore(ws, &target, backup, json),
    }
}

fn store_for(ws: &Workspace, target: &str) -> anyhow::Result<(rollout_core::config::Manifest, BackupStore)> {
    let manifest = ws.load()?;
    manifest.target(target)?;
    let retention = manifest
        .propagation
        .as_ref()
        .map(|p| p.backup_retention)
        .unwrap_or(DEFAULT_RETENTION);
    let store = BackupStore::for_target(&ws.root, target, retention);
    Ok((manifest, store))
}

fn list(ws: &Workspace, target: &str, json: bool) -> anyhow::Result<()> {
    let (_, store) = store_for(ws, target)?;
    let entries = store.list()?;

    if json {
        return print_json(&json!({ "target": target, "backups": entries }));
    }
    if entries.is_empty() {
        println!("No backups for '{target}'.");
        return Ok(());
    }
    let rows = entries
        .iter()
        .map(|e| vec![e.name.clone(), e.size.to_string()])
        .collect();
    print_table(&["BACKUP", "BYTES"], rows);
    Ok(())
}

fn restore(ws: &Workspace, target: &str, backup: Option<String>, json: bool) -> anyhow::Result<()> {
    let (manifest, store) = store_for(ws, target)?;
    let spec = manifest.target(target)?;
    if spec.store != StoreKind::File {
        anyhow::bail!("target '{target}' is a cluster object; restore it through the cluster");
    }

    let name = match backup {
        Some(name) => name,
        None => {
            store
                .latest()?
                .with_context(|| format!("no backups for '{target}'"))?
                .name
        }
    };
    let content = store.load(&name)?;

    let path = FileRecordStore::new(&ws.root).path_of(&spec.record)?;
    let saved = match std::fs::read(&path) {
        Ok(current) => Some(
            store
                .save(&current)
                .context("failed to back up the record before restoring")?,
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    io::atomic_write(&path, &content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    store.prune();

    if json {
        print_json(&json!({
            "target": target,
            "record": spec.record,
            "restored": name,
            "previous_saved_as": saved,
        }))?;
    } else {
        println!("Restored '{target}' ({}) from {name}.", spec.record);
        if let Some(saved) = saved {
            println!("Previous content saved as {saved}.");
        }
    }
    Ok(())
}
