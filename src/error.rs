//! Enumerated error kinds for subsystems that need one.
//!
//! Resolver, supervisor, and readiness/health code paths recover
//! locally and keep using `anyhow::Result`; checkpoint and kernel
//! transition surface distinct, matchable error kinds since operators
//! need to tell "CRIU missing" apart from "image corrupt" apart from
//! "process gone."

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint engine not available: {0}")]
    EngineNotSupported(String),

    #[error("kernel does not support checkpoint/restore: {0}")]
    KernelUnsupported(String),

    #[error("process {0} not found")]
    ProcessNotFound(i32),

    #[error("permission denied checkpointing process {0}")]
    PermissionDenied(i32),

    #[error("checkpoint operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("checkpoint image at {0:?} is corrupt or incomplete")]
    ImageCorrupt(PathBuf),

    #[error("restore failed: {0}")]
    RestoreFailed(String),

    #[error("checkpoint storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum KexecError {
    #[error("kernel image at {0:?} is invalid: {1}")]
    InvalidKernel(PathBuf, String),

    #[error("initrd image at {0:?} is invalid: {1}")]
    InvalidInitrd(PathBuf, String),

    #[error("insufficient free space: need at least {needed} bytes, have {available}")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("kexec command line too long")]
    CmdlineTooLong,

    #[error("kexec load failed: {0}")]
    LoadFailed(String),

    #[error("kexec execute failed: {0}")]
    ExecFailed(String),

    #[error("refusing kernel transition: not running as PID 1 / insufficient privilege")]
    PermissionDenied,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Per spec.md §7: every upgrade tier's failure falls through
/// silently (logged as a warning); only a Tier-3 failure is surfaced
/// to an operator as a tagged, operator-visible failure.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("component {0:?} not found")]
    UnknownComponent(String),

    #[error("component {0:?} is not ACTIVE (upgrade requires a running instance)")]
    NotActive(String),

    #[error("restart (tier 3) failed for {0:?}: {1}")]
    RestartFailed(String, String),
}

#[derive(Debug, Error)]
pub enum DeclarationError {
    #[error("declaration {0:?} is missing a name")]
    MissingName(PathBuf),

    #[error("declaration {0:?} is missing a binary path")]
    MissingBinary(PathBuf),

    #[error("duplicate component name {0:?} (first seen in {1:?}, again in {2:?})")]
    DuplicateName(String, PathBuf, PathBuf),

    #[error("declaration {0:?} has unknown section {1:?}")]
    UnknownSection(PathBuf, String),

    #[error("failed to parse {0:?}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
