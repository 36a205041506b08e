//! Project configuration loaded from `.devops-ai/infra.toml`.
//!
//! The loader turns the loosely-shaped TOML document into an immutable
//! [`InfraConfig`]. Validation is separate so callers can surface warnings
//! without refusing to run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::ports::SLOT_RANGE;

/// Directory that marks a project root.
pub const CONFIG_DIR: &str = ".devops-ai";

/// Config file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "infra.toml";

/// How far [`find_project_root`] walks up before giving up.
const MAX_ROOT_SEARCH_DEPTH: usize = 10;

/// A parsed Docker-style mount specification (`host:container[:ro]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Host path, relative to the worktree or main repository.
    pub host: String,
    /// Path inside the container.
    pub container: String,
    /// Whether the mount is read-only.
    pub readonly: bool,
}

impl MountEntry {
    /// Creates a read-write mount.
    pub fn new(host: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            readonly: false,
        }
    }

    /// Marks the mount read-only.
    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }
}

/// A declared port: env var name and the base port used without sandboxing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    pub env_var: String,
    pub base_port: u16,
}

impl ServicePort {
    pub fn new(env_var: impl Into<String>, base_port: u16) -> Self {
        Self {
            env_var: env_var.into(),
            base_port,
        }
    }
}

/// Typed representation of `infra.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfraConfig {
    pub project_name: String,
    pub prefix: String,
    pub has_sandbox: bool,
    /// Compose file, relative to the worktree root.
    pub compose_file: String,
    pub ports: Vec<ServicePort>,
    pub health_endpoint: Option<String>,
    pub health_port_var: Option<String>,
    /// Health gate timeout in seconds.
    pub health_timeout: u64,
    pub code_mounts: Vec<MountEntry>,
    pub code_mount_targets: Vec<String>,
    pub shared_mounts: Vec<MountEntry>,
    pub shared_mount_targets: Vec<String>,
    pub otel_endpoint_var: String,
    pub otel_namespace_var: String,
    /// Extra variables written into the slot env file.
    pub env: BTreeMap<String, String>,
    /// Secret references keyed by the variable they populate.
    pub secrets: BTreeMap<String, String>,
    /// Files to copy: worktree-relative destination -> repo-relative source.
    pub files: BTreeMap<String, String>,
}

impl InfraConfig {
    /// Creates a config with a sandbox section and every optional field defaulted.
    pub fn new(project_name: impl Into<String>) -> Self {
        let project_name = project_name.into();
        Self {
            prefix: project_name.clone(),
            project_name,
            has_sandbox: true,
            compose_file: default_compose_file(),
            ports: Vec::new(),
            health_endpoint: None,
            health_port_var: None,
            health_timeout: default_health_timeout(),
            code_mounts: Vec::new(),
            code_mount_targets: Vec::new(),
            shared_mounts: Vec::new(),
            shared_mount_targets: Vec::new(),
            otel_endpoint_var: default_otel_endpoint_var(),
            otel_namespace_var: default_otel_namespace_var(),
            env: BTreeMap::new(),
            secrets: BTreeMap::new(),
            files: BTreeMap::new(),
        }
    }

    /// Sets the declared ports.
    pub fn with_ports(mut self, ports: Vec<ServicePort>) -> Self {
        self.ports = ports;
        self
    }

    /// Sets the health endpoint, the port variable it is served on, and the timeout.
    pub fn with_health(
        mut self,
        endpoint: impl Into<String>,
        port_var: impl Into<String>,
        timeout_secs: u64,
    ) -> Self {
        self.health_endpoint = Some(endpoint.into());
        self.health_port_var = Some(port_var.into());
        self.health_timeout = timeout_secs;
        self
    }

    /// Services receiving either mount category, in declaration order without duplicates.
    pub fn mount_targets(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.code_mount_targets
            .iter()
            .chain(&self.shared_mount_targets)
            .filter(|t| seen.insert(t.to_string()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    project: RawProject,
    sandbox: Option<RawSandbox>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProject {
    name: Option<String>,
    prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSandbox {
    #[serde(default = "default_compose_file")]
    compose_file: String,
    #[serde(default)]
    ports: BTreeMap<String, u16>,
    #[serde(default)]
    health: RawHealth,
    #[serde(default)]
    mounts: RawMounts,
    #[serde(default)]
    otel: RawOtel,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    secrets: BTreeMap<String, String>,
    #[serde(default)]
    files: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawHealth {
    endpoint: Option<String>,
    port_var: Option<String>,
    #[serde(default = "default_health_timeout")]
    timeout: u64,
}

impl Default for RawHealth {
    fn default() -> Self {
        Self {
            endpoint: None,
            port_var: None,
            timeout: default_health_timeout(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawMounts {
    #[serde(default)]
    code: Vec<String>,
    #[serde(default)]
    code_targets: Vec<String>,
    #[serde(default)]
    shared: Vec<String>,
    #[serde(default)]
    shared_targets: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawOtel {
    #[serde(default = "default_otel_endpoint_var")]
    endpoint_var: String,
    #[serde(default = "default_otel_namespace_var")]
    namespace_var: String,
}

impl Default for RawOtel {
    fn default() -> Self {
        Self {
            endpoint_var: default_otel_endpoint_var(),
            namespace_var: default_otel_namespace_var(),
        }
    }
}

fn default_compose_file() -> String {
    "docker-compose.yml".to_string()
}

fn default_health_timeout() -> u64 {
    60
}

fn default_otel_endpoint_var() -> String {
    "OTEL_EXPORTER_OTLP_ENDPOINT".to_string()
}

fn default_otel_namespace_var() -> String {
    "OTEL_RESOURCE_ATTRIBUTES".to_string()
}

/// Parses a Docker-style mount string: `host:container[:ro]`.
pub fn parse_mount(spec: &str) -> Result<MountEntry> {
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.as_slice() {
        [host, container] => Ok(MountEntry::new(*host, *container)),
        [host, container, "ro"] => Ok(MountEntry::new(*host, *container).read_only()),
        _ => Err(Error::Config(format!(
            "invalid mount syntax: {:?} (expected host:container[:ro])",
            spec
        ))),
    }
}

/// Parses `infra.toml` content.
pub fn parse_config(text: &str) -> Result<InfraConfig> {
    let raw: RawConfig =
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid infra.toml: {}", e)))?;

    let name = raw
        .project
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| Error::Config("missing required field: [project].name".to_string()))?;
    let prefix = raw.project.prefix.unwrap_or_else(|| name.clone());

    let Some(sandbox) = raw.sandbox else {
        return Ok(InfraConfig {
            prefix,
            has_sandbox: false,
            ..InfraConfig::new(name)
        });
    };

    let parse_all = |specs: &[String]| -> Result<Vec<MountEntry>> {
        specs.iter().map(|s| parse_mount(s)).collect()
    };

    Ok(InfraConfig {
        project_name: name,
        prefix,
        has_sandbox: true,
        compose_file: sandbox.compose_file,
        ports: sandbox
            .ports
            .into_iter()
            .map(|(var, port)| ServicePort::new(var, port))
            .collect(),
        health_endpoint: sandbox.health.endpoint,
        health_port_var: sandbox.health.port_var,
        health_timeout: sandbox.health.timeout,
        code_mounts: parse_all(&sandbox.mounts.code)?,
        code_mount_targets: sandbox.mounts.code_targets,
        shared_mounts: parse_all(&sandbox.mounts.shared)?,
        shared_mount_targets: sandbox.mounts.shared_targets,
        otel_endpoint_var: sandbox.otel.endpoint_var,
        otel_namespace_var: sandbox.otel.namespace_var,
        env: sandbox.env,
        secrets: sandbox.secrets,
        files: sandbox.files,
    })
}

/// Loads `.devops-ai/infra.toml` under `project_root`.
///
/// Returns `Ok(None)` when the file does not exist.
pub fn load_config(project_root: &Path) -> Result<Option<InfraConfig>> {
    let path = project_root.join(CONFIG_DIR).join(CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    parse_config(&text).map(Some)
}

/// Walks up from `start` looking for a directory containing `.devops-ai/`.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.canonicalize().ok()?;
    for _ in 0..MAX_ROOT_SEARCH_DEPTH {
        if current.join(CONFIG_DIR).is_dir() {
            return Some(current);
        }
        if !current.pop() {
            break;
        }
    }
    None
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Fatal problems.
    pub errors: Vec<String>,
    /// Non-fatal problems.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for InfraConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.project_name.trim().is_empty() {
            result.add_error("project name cannot be empty");
        }

        if !self.has_sandbox {
            return result;
        }

        let max_offset = *SLOT_RANGE.end();
        for port in &self.ports {
            if u32::from(port.base_port) + max_offset > u32::from(u16::MAX) {
                result.add_error(format!(
                    "base port {} for {} overflows at slot {}",
                    port.base_port, port.env_var, max_offset
                ));
            }
        }

        if let Some(var) = &self.health_port_var {
            if !self.ports.iter().any(|p| &p.env_var == var) {
                result.add_error(format!(
                    "health port_var '{}' is not declared in [sandbox.ports]",
                    var
                ));
            }
        } else if self.health_endpoint.is_some() {
            result.add_warning("health endpoint configured without port_var - gate will fail");
        }

        for (mounts, targets, kind) in [
            (&self.code_mounts, &self.code_mount_targets, "code"),
            (&self.shared_mounts, &self.shared_mount_targets, "shared"),
        ] {
            if !mounts.is_empty() && targets.is_empty() {
                result.add_warning(format!("{} mounts declared but no {}_targets", kind, kind));
            }
            if mounts.is_empty() && !targets.is_empty() {
                result.add_warning(format!("{}_targets declared but no {} mounts", kind, kind));
            }
        }

        result
    }
}
