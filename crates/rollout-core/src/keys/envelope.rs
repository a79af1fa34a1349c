//! Optional store-side envelope for key payloads, delegated to the `age`
//! binary. Nothing here implements cryptography.

use crate::error::{Result, RolloutError};
use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};

pub trait Envelope: Send + Sync {
    fn name(&self) -> &'static str;
    fn seal(&self, plain: &[u8]) -> Result<Vec<u8>>;
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// No envelope: payloads are stored as encoded.
pub struct PlainEnvelope;

impl Envelope for PlainEnvelope {
    fn name(&self) -> &'static str {
        "none"
    }

    fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        Ok(plain.to_vec())
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        Ok(sealed.to_vec())
    }
}

// ---------------------------------------------------------------------------
// AgeEnvelope
// ---------------------------------------------------------------------------

pub struct AgeEnvelope {
    recipients: Vec<String>,
    identity: Option<PathBuf>,
}

impl AgeEnvelope {
    pub fn new(recipients: Vec<String>, identity: Option<PathBuf>) -> Self {
        Self {
            recipients,
            identity,
        }
    }

    fn identity(&self) -> Result<PathBuf> {
        self.identity
            .clone()
            .or_else(default_identity)
            .ok_or_else(|| {
                RolloutError::AgeDecryptFailed(
                    "no identity: use --identity <path> or set ROLLOUT_AGE_IDENTITY".to_string(),
                )
            })
    }
}

fn age_bin() -> Result<PathBuf> {
    which::which("age").map_err(|_| RolloutError::AgeNotInstalled)
}

/// `~/.ssh/id_ed25519`, then `~/.ssh/id_rsa`.
pub fn default_identity() -> Option<PathBuf> {
    let home = home::home_dir()?;
    [
        home.join(".ssh").join("id_ed25519"),
        home.join(".ssh").join("id_rsa"),
    ]
    .into_iter()
    .find(|p| p.exists())
}

/// Run `age` with `input` on stdin and return stdout.
fn run_age(args: &[String], input: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let bin = age_bin().map_err(|e| e.to_string())?;
    let mut child = Command::new(bin)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| e.to_string())?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).map_err(|e| e.to_string())?;
    }
    let output = child.wait_with_output().map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(output.stdout)
}

impl Envelope for AgeEnvelope {
    fn name(&self) -> &'static str {
        "age"
    }

    fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        if self.recipients.is_empty() {
            return Err(RolloutError::AgeEncryptFailed(
                "no recipients configured under keys.recipients".to_string(),
            ));
        }
        age_bin()?;
        let mut args = vec!["--encrypt".to_string()];
        for r in &self.recipients {
            args.push("--recipient".to_string());
            args.push(r.clone());
        }
        run_age(&args, plain).map_err(RolloutError::AgeEncryptFailed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        age_bin()?;
        let identity = self.identity()?;
        let args = vec![
            "--decrypt".to_string(),
            "--identity".to_string(),
            identity.to_string_lossy().into_owned(),
        ];
        run_age(&args, sealed).map_err(RolloutError::AgeDecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_envelope_is_identity() {
        let env = PlainEnvelope;
        let sealed = env.seal(b"payload").unwrap();
        assert_eq!(env.open(&sealed).unwrap(), b"payload");
    }

    #[test]
    fn age_without_recipients_fails_before_spawning() {
        let env = AgeEnvelope::new(Vec::new(), None);
        assert!(matches!(
            env.seal(b"x").unwrap_err(),
            RolloutError::AgeEncryptFailed(_)
        ));
    }
}
