pub mod backups;
pub mod config;
pub mod deploy;
pub mod keys;
pub mod plan;
pub mod propagate;
pub mod verify;
pub mod wait;

use anyhow::Context;
use rollout_core::config::Manifest;
use std::fmt;
use std::path::PathBuf;

/// Project root plus the manifest override, shared by every command.
pub struct Workspace {
    pub root: PathBuf,
    pub manifest: Option<PathBuf>,
}

impl Workspace {
    pub fn load(&self) -> anyhow::Result<Manifest> {
        Manifest::load(&self.root, self.manifest.as_deref()).context("failed to load manifest")
    }
}

/// A command finished and reported, but must exit non-zero with `code`.
#[derive(Debug)]
pub struct DeployExit {
    pub code: i32,
}

impl fmt::Display for DeployExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit status {}", self.code)
    }
}

impl std::error::Error for DeployExit {}

pub fn exit_with(code: i32) -> anyhow::Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(DeployExit { code }.into())
    }
}

pub fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to start async runtime")
}
