//! Error types for sandbox slot management.

use std::path::PathBuf;
use thiserror::Error;

use crate::provision::ProvisioningError;

/// Top-level error type for sandbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Every slot in the range is claimed or has a port conflict.
    #[error("no slots available ({first}-{last} all claimed or have port conflicts)")]
    SlotsExhausted { first: u32, last: u32 },

    /// A base port plus slot offset does not fit in a TCP port.
    #[error("port {var} (base {base}) overflows at slot {slot_id}")]
    PortOutOfRange { var: String, base: u16, slot_id: u32 },

    /// The registry could not be persisted or locked.
    #[error("registry error at {path}: {reason}")]
    Registry { path: PathBuf, reason: String },

    /// Project configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The container tool failed to bring the stack up.
    #[error("sandbox failed to start: {0}")]
    SandboxStart(String),

    /// The container tool failed to bring the stack down.
    #[error("sandbox failed to stop: {0}")]
    SandboxStop(String),

    /// The container tool could not report container state.
    #[error("container status query failed: {0}")]
    Status(String),

    /// An external tool is not installed or not on PATH.
    #[error("{0} is not installed or not on PATH")]
    ToolUnavailable(String),

    /// No slot is registered for the given worktree.
    #[error("no sandbox allocated for worktree {0}")]
    NotAllocated(PathBuf),

    /// The worktree already holds a slot.
    #[error("worktree {worktree} already has sandbox slot {slot_id}")]
    AlreadyAllocated { slot_id: u32, worktree: PathBuf },

    /// The worktree has uncommitted changes.
    #[error("worktree {0} has uncommitted changes (use --force to override)")]
    DirtyWorktree(PathBuf),

    /// Secret or file provisioning failed; every failure is listed.
    #[error("provisioning failed with {} error(s)", .0.len())]
    Provisioning(Vec<ProvisioningError>),

    /// A generated env-file entry would break the line format.
    #[error("{kind} for '{key}' contains invalid characters (newline or null byte)")]
    InvalidEnvEntry { kind: &'static str, key: String },

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// IO error during sandbox operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization failed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;
