//! Checkpoint Engine collaborator — CRIU.
//!
//! Grounded on `checkpoint.c`: binary located by probing a fixed
//! search list, `dump`/`restore` argv construction, version parsed
//! out of `criu check`'s "Version: X.Y.Z" line, and image validation
//! by required-file prefixes.

use crate::error::CheckpointError;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CRIU_SEARCH_PATHS: &[&str] = &["/usr/sbin/criu", "/usr/bin/criu", "/sbin/criu", "/bin/criu"];
const CHECKPOINT_DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const MINIMUM_SUPPORTED_VERSION: (u32, u32, u32) = (3, 0, 0);
const REQUIRED_IMAGE_PREFIXES: &[&str] = &["core", "mm", "pstree"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EngineVersion {
    pub fn meets_minimum(&self) -> bool {
        (self.major, self.minor, self.patch) >= MINIMUM_SUPPORTED_VERSION
    }
}

impl std::fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Thin wrapper over the external CRIU binary. The core never
/// implements checkpoint/restore itself — this only shells out.
pub struct CheckpointEngine {
    binary: Option<PathBuf>,
}

impl CheckpointEngine {
    pub fn discover() -> Self {
        let binary = CRIU_SEARCH_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.is_file());
        Self { binary }
    }

    /// An engine with no binary located — `is_supported()` is always
    /// false. Used by the Upgrade Coordinator's Tier 1 when checkpoint
    /// is declared but the platform has no CRIU, and by tests that
    /// need a deterministically-unsupported engine.
    pub fn unavailable() -> Self {
        Self { binary: None }
    }

    pub fn is_supported(&self) -> bool {
        let Some(binary) = &self.binary else { return false };
        std::process::Command::new(binary)
            .arg("check")
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub async fn version(&self) -> Result<EngineVersion, CheckpointError> {
        let binary = self
            .binary
            .as_ref()
            .ok_or_else(|| CheckpointError::EngineNotSupported("criu binary not found".to_string()))?;

        let output = tokio::process::Command::new(binary)
            .arg("check")
            .arg("-V")
            .output()
            .await?;
        let text = String::from_utf8_lossy(&output.stdout);
        let combined = format!("{text}{}", String::from_utf8_lossy(&output.stderr));

        let line = combined
            .lines()
            .find(|l| l.contains("Version:"))
            .ok_or_else(|| CheckpointError::EngineNotSupported("could not determine criu version".to_string()))?;

        let digits = line
            .split("Version:")
            .nth(1)
            .unwrap_or("")
            .trim()
            .split(|c: char| !c.is_ascii_digit() && c != '.')
            .next()
            .unwrap_or("");
        let mut parts = digits.split('.');
        let major: u32 = parts.next().unwrap_or("0").parse().unwrap_or(0);
        let minor: u32 = parts.next().unwrap_or("0").parse().unwrap_or(0);
        let patch: u32 = parts.next().unwrap_or("0").parse().unwrap_or(0);

        Ok(EngineVersion { major, minor, patch })
    }

    /// Checkpoints `pid` into `dir`. Leaves the process running if
    /// `leave_running` is set (used for Tier-1 live upgrade; cleared
    /// for kernel-transition checkpoint-all since those components are
    /// about to go away anyway).
    pub async fn checkpoint(&self, pid: i32, dir: &Path, leave_running: bool) -> Result<(), CheckpointError> {
        let binary = self
            .binary
            .as_ref()
            .ok_or_else(|| CheckpointError::EngineNotSupported("criu binary not found".to_string()))?;

        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
            return Err(CheckpointError::ProcessNotFound(pid));
        }

        std::fs::create_dir_all(dir)?;

        let mut cmd = tokio::process::Command::new(binary);
        cmd.arg("dump")
            .arg("-t")
            .arg(pid.to_string())
            .arg("-D")
            .arg(dir)
            .arg("--shell-job")
            .arg("-v4");
        if leave_running {
            cmd.arg("--leave-running");
        }

        run_bounded(cmd, CHECKPOINT_DEFAULT_TIMEOUT).await?;
        Ok(())
    }

    /// Restores from `dir`, returning the restored pid. Validates the
    /// image first.
    pub async fn restore(&self, dir: &Path) -> Result<i32, CheckpointError> {
        validate(dir)?;

        let binary = self
            .binary
            .as_ref()
            .ok_or_else(|| CheckpointError::EngineNotSupported("criu binary not found".to_string()))?;

        let mut cmd = tokio::process::Command::new(binary);
        cmd.arg("restore").arg("-D").arg(dir).arg("--shell-job").arg("-v4");

        let output = run_bounded(cmd, CHECKPOINT_DEFAULT_TIMEOUT).await?;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        combined
            .lines()
            .find_map(|line| {
                line.split_once("PID").and_then(|(_, rest)| rest.trim().parse().ok())
            })
            .ok_or_else(|| CheckpointError::RestoreFailed("could not parse restored pid from criu output".to_string()))
    }

    pub fn validate(&self, dir: &Path) -> Result<(), CheckpointError> {
        validate(dir)
    }
}

async fn run_bounded(
    mut cmd: tokio::process::Command,
    timeout: Duration,
) -> Result<std::process::Output, CheckpointError> {
    let child = cmd.output();
    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) if output.status.success() => Ok(output),
        Ok(Ok(output)) => Err(CheckpointError::RestoreFailed(format!(
            "criu exited with status {:?}",
            output.status.code()
        ))),
        Ok(Err(err)) => Err(CheckpointError::Io(err)),
        Err(_) => Err(CheckpointError::Timeout(timeout)),
    }
}

/// Checks the directory exists and that every required prefix (core
/// image, memory map, process tree) has at least one matching file.
fn validate(dir: &Path) -> Result<(), CheckpointError> {
    if !dir.is_dir() {
        return Err(CheckpointError::ImageCorrupt(dir.to_path_buf()));
    }

    let entries: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();

    for prefix in REQUIRED_IMAGE_PREFIXES {
        if !entries.iter().any(|name| name.starts_with(prefix)) {
            return Err(CheckpointError::ImageCorrupt(dir.to_path_buf()));
        }
    }

    Ok(())
}
