//! Sandbox workflows: `up`, `start`, `stop`, `down` and `status`.
//!
//! The manager sequences the allocator, registry, provisioning pipeline and
//! container lifecycle. Registry decisions (stale cleanup, allocation,
//! claim) run inside one locked transaction.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::config::{InfraConfig, Validate, CONFIG_FILE};
use crate::error::{Error, Result};
use crate::ports::check_base_port_safety;
use crate::provision::{generate_secrets_file, provision_files, SecretResolver, SECRETS_FILE};
use crate::registry::{allocate_slot, RegistryStore, SlotInfo, SlotStatus};
use crate::sandbox::{
    copy_compose_to_slot, create_slot_dir, generate_env_file, generate_override, remove_slot_dir,
    sandbox_status, start_sandbox, stop_sandbox, ContainerRuntime, HealthGate, ServiceStatus,
    OBSERVABILITY_NETWORK,
};
use crate::worktree;

/// Outcome of a successful `up` or `start`.
#[derive(Debug, Clone)]
pub struct SandboxReport {
    pub slot: SlotInfo,
    /// `(destination, source)` pairs copied into the worktree.
    pub files: Vec<(String, String)>,
    /// Names of resolved secrets. Values are never kept here.
    pub secrets: Vec<String>,
    pub healthy: bool,
    pub health_timeout: u64,
    pub warnings: Vec<String>,
}

impl fmt::Display for SandboxReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Sandbox slot {} running for {}",
            self.slot.slot_id, self.slot.project
        )?;
        writeln!(f, "  Worktree: {}", self.slot.worktree_path.display())?;
        writeln!(f, "  Slot dir: {}", self.slot.slot_dir.display())?;

        if !self.slot.ports.is_empty() {
            writeln!(f, "  Ports:")?;
            for (var, port) in &self.slot.ports {
                writeln!(f, "    {}={}", var, port)?;
            }
        }
        if !self.files.is_empty() {
            writeln!(f, "  Files:")?;
            for (dest, source) in &self.files {
                writeln!(f, "    {} \u{2190} {} \u{2713}", dest, source)?;
            }
        }
        if !self.secrets.is_empty() {
            writeln!(f, "  Secrets: {}", self.secrets.join(", "))?;
        }
        if !self.healthy {
            writeln!(f, "  Health check timed out after {}s", self.health_timeout)?;
        }
        for warning in &self.warnings {
            writeln!(f, "  Warning: {}", warning)?;
        }
        Ok(())
    }
}

/// A claimed slot and its live containers.
#[derive(Debug, Clone)]
pub struct SlotOverview {
    pub slot: SlotInfo,
    pub services: Vec<ServiceStatus>,
}

/// Drives sandbox slots for worktrees.
pub struct SandboxManager<R: ContainerRuntime> {
    store: RegistryStore,
    runtime: R,
    slots_dir: PathBuf,
    resolver: SecretResolver,
    health: HealthGate,
}

impl<R: ContainerRuntime> SandboxManager<R> {
    /// Creates a manager persisting to `store` and placing slot
    /// directories under `slots_dir`.
    pub fn new(store: RegistryStore, runtime: R, slots_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            runtime,
            slots_dir: slots_dir.into(),
            resolver: SecretResolver::default(),
            health: HealthGate::default(),
        }
    }

    /// Sets the secret resolver.
    pub fn with_resolver(mut self, resolver: SecretResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Sets the health gate.
    pub fn with_health_gate(mut self, health: HealthGate) -> Self {
        self.health = health;
        self
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    fn lookup(&self, worktree: &Path) -> Result<SlotInfo> {
        self.store
            .load()
            .get_by_worktree(worktree)
            .cloned()
            .ok_or_else(|| Error::NotAllocated(worktree.to_path_buf()))
    }

    fn set_status(&self, slot_id: u32, status: SlotStatus) -> Result<()> {
        self.store.transaction(|registry| {
            registry.set_status(slot_id, status);
            Ok(())
        })
    }

    /// Claims a slot for `worktree`, provisions it and starts its containers.
    ///
    /// Provisioning failures leave the slot claimed so the user can fix the
    /// inputs and run [`start`](Self::start). A failed container start
    /// releases the slot and deletes its directory; the worktree is kept.
    pub async fn up(
        &self,
        config: &InfraConfig,
        worktree: &Path,
        source_root: &Path,
    ) -> Result<SandboxReport> {
        if !config.has_sandbox {
            return Err(Error::Config(format!(
                "{} has no [sandbox] section",
                CONFIG_FILE
            )));
        }
        let mut warnings = config.validate().into_result()?;
        if !self.runtime.is_available() {
            return Err(Error::ToolUnavailable(self.runtime.name().to_string()));
        }

        let compose_path = worktree.join(&config.compose_file);
        if !compose_path.is_file() {
            return Err(Error::Config(format!(
                "compose file not found at {}",
                compose_path.display()
            )));
        }

        let mut created_dir = None;
        let claimed = self.store.transaction(|registry| {
            let stale = registry.clean_stale();
            if !stale.is_empty() {
                tracing::info!(slots = ?stale, "cleaned stale registry entries");
            }
            if let Some(existing) = registry.get_by_worktree(worktree) {
                return Err(Error::AlreadyAllocated {
                    slot_id: existing.slot_id,
                    worktree: worktree.to_path_buf(),
                });
            }

            warnings.extend(check_base_port_safety(
                &config.project_name,
                &config.ports,
                &registry.project_ports(),
            ));

            let (slot_id, ports) = allocate_slot(registry, &config.ports)?;
            let slot_dir = create_slot_dir(&self.slots_dir, &config.project_name, slot_id)?;
            created_dir = Some(slot_dir.clone());
            let compose_file_copy = copy_compose_to_slot(&compose_path, &slot_dir)?;

            let slot = SlotInfo {
                slot_id,
                project: config.project_name.clone(),
                worktree_path: worktree.to_path_buf(),
                slot_dir,
                compose_file_copy,
                ports,
                claimed_at: Utc::now(),
                status: SlotStatus::Provisioning,
            };
            tracing::info!(slot = slot_id, project = %slot.project, worktree = ?worktree, "claimed slot");
            registry.insert(slot.clone());
            Ok(slot)
        });

        // Without a saved claim nothing owns the directory.
        let slot = match claimed {
            Ok(slot) => slot,
            Err(e) => {
                if let Some(dir) = created_dir {
                    if let Err(cleanup) = remove_slot_dir(&dir) {
                        tracing::warn!(path = ?dir, error = %cleanup, "failed to remove unclaimed slot dir");
                    }
                }
                return Err(e);
            }
        };

        for warning in &warnings {
            tracing::warn!(project = %config.project_name, "{}", warning);
        }

        self.launch(config, slot, source_root, true, warnings).await
    }

    /// Restarts an already claimed slot, regenerating its files.
    ///
    /// Unlike [`up`](Self::up), a failed container start keeps the claim.
    pub async fn start(
        &self,
        config: &InfraConfig,
        worktree: &Path,
        source_root: &Path,
    ) -> Result<SandboxReport> {
        let warnings = config.validate().into_result()?;
        if !self.runtime.is_available() {
            return Err(Error::ToolUnavailable(self.runtime.name().to_string()));
        }

        let slot = self.lookup(worktree)?;
        std::fs::create_dir_all(&slot.slot_dir)?;
        self.launch(config, slot, source_root, false, warnings).await
    }

    async fn launch(
        &self,
        config: &InfraConfig,
        mut slot: SlotInfo,
        source_root: &Path,
        release_on_failure: bool,
        warnings: Vec<String>,
    ) -> Result<SandboxReport> {
        generate_env_file(config, &slot, &slot.slot_dir)?;
        let observability = self.runtime.network_exists(OBSERVABILITY_NETWORK).await;
        generate_override(
            config,
            &slot,
            &slot.worktree_path,
            source_root,
            &slot.slot_dir,
            observability,
        )?;

        let (copied, mut errors) = provision_files(&config.files, source_root, &slot.worktree_path);
        let (resolved, secret_errors) = self.resolver.resolve_all(&config.secrets).await;
        errors.extend(secret_errors);
        if !errors.is_empty() {
            for e in &errors {
                tracing::error!(slot = slot.slot_id, "{}", e);
            }
            return Err(Error::Provisioning(errors));
        }

        if resolved.is_empty() {
            let stale = slot.slot_dir.join(SECRETS_FILE);
            if stale.exists() {
                std::fs::remove_file(stale)?;
            }
        } else {
            generate_secrets_file(&resolved, &slot.slot_dir)?;
        }

        if let Err(e) = start_sandbox(&self.runtime, config, &slot).await {
            if release_on_failure {
                self.rollback_claim(&slot);
            }
            return Err(e);
        }

        self.set_status(slot.slot_id, SlotStatus::Running)?;
        slot.status = SlotStatus::Running;

        let healthy = self.health.wait(config, &slot).await;

        let files = copied
            .into_iter()
            .filter_map(|dest| config.files.get(&dest).map(|source| (dest, source.clone())))
            .collect();
        Ok(SandboxReport {
            slot,
            files,
            secrets: resolved.into_keys().collect(),
            healthy,
            health_timeout: config.health_timeout,
            warnings,
        })
    }

    fn rollback_claim(&self, slot: &SlotInfo) {
        tracing::warn!(slot = slot.slot_id, "releasing slot after failed start");
        if let Err(e) = self.store.transaction(|registry| {
            registry.remove(slot.slot_id);
            Ok(())
        }) {
            tracing::error!(slot = slot.slot_id, error = %e, "failed to release slot");
        }
        if let Err(e) = remove_slot_dir(&slot.slot_dir) {
            tracing::error!(slot = slot.slot_id, error = %e, "failed to remove slot dir");
        }
    }

    /// Brings the worktree's containers down and marks the slot stopped.
    pub async fn stop(&self, worktree: &Path) -> Result<SlotInfo> {
        let mut slot = self.lookup(worktree)?;
        stop_sandbox(&self.runtime, &slot).await?;
        self.set_status(slot.slot_id, SlotStatus::Stopped)?;
        slot.status = SlotStatus::Stopped;
        Ok(slot)
    }

    /// Stops the containers, deletes the slot directory and releases the slot.
    ///
    /// Refuses a worktree with uncommitted changes unless `force` is set. A
    /// failed `down` is logged and does not block the release.
    pub async fn down(&self, worktree: &Path, force: bool) -> Result<SlotInfo> {
        let slot = self.lookup(worktree)?;

        if !force && worktree.exists() {
            match worktree::is_dirty(worktree) {
                Ok(true) => return Err(Error::DirtyWorktree(worktree.to_path_buf())),
                Ok(false) => {}
                Err(e) => tracing::warn!(worktree = ?worktree, error = %e, "dirty check skipped"),
            }
        }

        if let Err(e) = stop_sandbox(&self.runtime, &slot).await {
            tracing::warn!(slot = slot.slot_id, error = %e, "containers may still be running");
        }
        remove_slot_dir(&slot.slot_dir)?;
        self.store.transaction(|registry| {
            registry.remove(slot.slot_id);
            Ok(())
        })?;
        tracing::info!(slot = slot.slot_id, project = %slot.project, "released slot");
        Ok(slot)
    }

    /// Lists every claimed slot with its containers.
    pub async fn status(&self) -> Vec<SlotOverview> {
        let registry = self.store.load();
        let mut overview = Vec::with_capacity(registry.slots.len());
        for slot in registry.slots.into_values() {
            let services = match sandbox_status(&self.runtime, &slot).await {
                Ok(services) => services,
                Err(e) => {
                    tracing::warn!(slot = slot.slot_id, error = %e, "status query failed");
                    Vec::new()
                }
            };
            overview.push(SlotOverview { slot, services });
        }
        overview
    }
}
