//! Container lifecycle through `docker compose`.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::config::InfraConfig;
use crate::error::{Error, Result};
use crate::provision::SECRETS_FILE;
use crate::registry::SlotInfo;

use super::override_file::OVERRIDE_FILE;
use super::slot_dir::ENV_FILE;

/// What a compose invocation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeAction {
    /// `up -d`
    Up,
    /// `down`
    Down,
    /// `ps --format json`
    Ps,
}

impl ComposeAction {
    fn args(self) -> &'static [&'static str] {
        match self {
            ComposeAction::Up => &["up", "-d"],
            ComposeAction::Down => &["down"],
            ComposeAction::Ps => &["ps", "--format", "json"],
        }
    }
}

/// A fully resolved compose command line, minus the executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeInvocation {
    pub project_name: String,
    /// Compose files in `-f` order.
    pub files: Vec<PathBuf>,
    /// Env files in `--env-file` order.
    pub env_files: Vec<PathBuf>,
    pub action: ComposeAction,
}

impl ComposeInvocation {
    /// Invocation for bringing a slot up from the live worktree compose file.
    pub fn start(config: &InfraConfig, slot: &SlotInfo) -> Self {
        let mut env_files = vec![slot.slot_dir.join(ENV_FILE)];
        let secrets = slot.slot_dir.join(SECRETS_FILE);
        if secrets.is_file() {
            env_files.push(secrets);
        }

        Self {
            project_name: slot.compose_project_name(),
            files: vec![
                slot.worktree_path.join(&config.compose_file),
                slot.slot_dir.join(OVERRIDE_FILE),
            ],
            env_files,
            action: ComposeAction::Up,
        }
    }

    /// Invocation against the frozen compose copy, for `down` and `ps`.
    ///
    /// The override and env files are included only if they still exist.
    pub fn frozen(slot: &SlotInfo, action: ComposeAction) -> Self {
        let mut files = vec![slot.compose_file_copy.clone()];
        let overlay = slot.slot_dir.join(OVERRIDE_FILE);
        if overlay.is_file() {
            files.push(overlay);
        }

        let env_files = [ENV_FILE, SECRETS_FILE]
            .iter()
            .map(|name| slot.slot_dir.join(name))
            .filter(|p| p.is_file())
            .collect();

        Self {
            project_name: slot.compose_project_name(),
            files,
            env_files,
            action,
        }
    }

    /// Same files, different action.
    pub fn with_action(&self, action: ComposeAction) -> Self {
        Self {
            action,
            ..self.clone()
        }
    }

    /// Arguments following `docker compose`.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.project_name.clone()];
        for file in &self.files {
            args.push("-f".to_string());
            args.push(file.display().to_string());
        }
        for env_file in &self.env_files {
            args.push("--env-file".to_string());
            args.push(env_file.display().to_string());
        }
        args.extend(self.action.args().iter().map(|a| a.to_string()));
        args
    }
}

/// Captured result of an external tool run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Stderr if it has content, otherwise stdout, otherwise the exit code.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.code {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

impl From<std::process::Output> for ToolOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// The container tool the sandbox lifecycle drives.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the name of this runtime.
    fn name(&self) -> &str;

    /// Returns true if the tool is installed.
    fn is_available(&self) -> bool;

    /// Runs one compose invocation to completion.
    async fn compose(&self, invocation: &ComposeInvocation) -> Result<ToolOutput>;

    /// Returns true if a network with this name exists.
    async fn network_exists(&self, name: &str) -> bool;
}

/// [`ContainerRuntime`] backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCompose {
    cli_path: String,
}

impl Default for DockerCompose {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCompose {
    pub fn new() -> Self {
        Self {
            cli_path: "docker".to_string(),
        }
    }

    /// Sets a custom path to the docker CLI.
    pub fn with_cli_path(mut self, path: impl Into<String>) -> Self {
        self.cli_path = path.into();
        self
    }
}

#[async_trait]
impl ContainerRuntime for DockerCompose {
    fn name(&self) -> &str {
        "docker"
    }

    fn is_available(&self) -> bool {
        which::which(&self.cli_path).is_ok()
    }

    async fn compose(&self, invocation: &ComposeInvocation) -> Result<ToolOutput> {
        let args = invocation.args();
        tracing::debug!(cli = %self.cli_path, args = ?args, "running docker compose");

        let output = Command::new(&self.cli_path)
            .arg("compose")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::ToolUnavailable(self.cli_path.clone()),
                _ => Error::Io(e),
            })?;

        Ok(output.into())
    }

    async fn network_exists(&self, name: &str) -> bool {
        Command::new(&self.cli_path)
            .args(["network", "inspect", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// Brings the slot's containers up.
///
/// A failed `up` is followed by exactly one `down` over the same files, so
/// partially created containers do not linger. The `up` diagnostic is
/// returned either way.
pub async fn start_sandbox<R>(runtime: &R, config: &InfraConfig, slot: &SlotInfo) -> Result<()>
where
    R: ContainerRuntime + ?Sized,
{
    if !runtime.is_available() {
        return Err(Error::ToolUnavailable(runtime.name().to_string()));
    }

    let up = ComposeInvocation::start(config, slot);
    tracing::info!(slot = slot.slot_id, project = %up.project_name, "starting containers");

    let failure = match runtime.compose(&up).await {
        Ok(output) if output.success => return Ok(()),
        Ok(output) => output.diagnostic(),
        Err(e) => e.to_string(),
    };

    tracing::warn!(slot = slot.slot_id, error = %failure, "compose up failed, rolling back");
    match runtime.compose(&up.with_action(ComposeAction::Down)).await {
        Ok(output) if !output.success => {
            tracing::warn!(slot = slot.slot_id, error = %output.diagnostic(), "rollback down failed");
        }
        Err(e) => tracing::warn!(slot = slot.slot_id, error = %e, "rollback down failed"),
        Ok(_) => {}
    }

    Err(Error::SandboxStart(failure))
}

/// Brings the slot's containers down using the compose copy frozen at claim
/// time, so edits to the worktree cannot orphan containers.
pub async fn stop_sandbox<R>(runtime: &R, slot: &SlotInfo) -> Result<()>
where
    R: ContainerRuntime + ?Sized,
{
    if !slot.compose_file_copy.is_file() {
        return Err(Error::SandboxStop(format!(
            "compose snapshot missing at {}",
            slot.compose_file_copy.display()
        )));
    }

    let down = ComposeInvocation::frozen(slot, ComposeAction::Down);
    tracing::info!(slot = slot.slot_id, project = %down.project_name, "stopping containers");

    let output = runtime
        .compose(&down)
        .await
        .map_err(|e| Error::SandboxStop(e.to_string()))?;
    if output.success {
        Ok(())
    } else {
        Err(Error::SandboxStop(output.diagnostic()))
    }
}

/// Container state as reported by `compose ps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Running => f.write_str("running"),
            ServiceState::Stopped => f.write_str("stopped"),
        }
    }
}

/// One container of a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub service: String,
    pub state: ServiceState,
    /// Human-readable status, e.g. `Up 5 minutes`.
    pub detail: String,
}

#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "Service", default)]
    service: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
}

impl From<PsEntry> for ServiceStatus {
    fn from(entry: PsEntry) -> Self {
        let state = if entry.state.eq_ignore_ascii_case("running") {
            ServiceState::Running
        } else {
            ServiceState::Stopped
        };
        Self {
            service: if entry.service.is_empty() {
                entry.name
            } else {
                entry.service
            },
            state,
            detail: entry.status,
        }
    }
}

/// Parses `compose ps --format json`, which is a JSON array on older
/// releases and one object per line on newer ones.
pub fn parse_ps_output(stdout: &str) -> Result<Vec<ServiceStatus>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<PsEntry> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?
    };

    Ok(entries.into_iter().map(ServiceStatus::from).collect())
}

/// Reports the slot's containers.
pub async fn sandbox_status<R>(runtime: &R, slot: &SlotInfo) -> Result<Vec<ServiceStatus>>
where
    R: ContainerRuntime + ?Sized,
{
    if !slot.compose_file_copy.is_file() {
        return Ok(Vec::new());
    }
    let output = runtime
        .compose(&ComposeInvocation::frozen(slot, ComposeAction::Ps))
        .await?;
    if !output.success {
        return Err(Error::Status(output.diagnostic()));
    }
    parse_ps_output(&output.stdout)
}
