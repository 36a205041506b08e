//! Slot records and the in-memory registry ledger.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ServicePort;
use crate::error::{Error, Result};
use crate::ports::{check_ports_available, compute_ports, PortMap, ProjectPorts, SLOT_RANGE};

/// Current on-disk registry format.
pub const REGISTRY_VERSION: u32 = 1;

/// Lifecycle state of a claimed slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    /// Claimed, files generated, containers not yet confirmed up.
    Provisioning,
    /// Containers started successfully.
    #[default]
    Running,
    /// Containers brought down; the slot is still claimed.
    Stopped,
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SlotStatus::Provisioning => "provisioning",
            SlotStatus::Running => "running",
            SlotStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Information about a claimed slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    /// Allocation key and port offset.
    pub slot_id: u32,
    /// Owning project.
    pub project: String,
    /// Worktree served by this slot.
    pub worktree_path: PathBuf,
    /// Private directory holding generated files.
    pub slot_dir: PathBuf,
    /// Frozen copy of the compose file taken at claim time.
    #[serde(default)]
    pub compose_file_copy: PathBuf,
    /// Concrete ports assigned to this slot.
    #[serde(default)]
    pub ports: PortMap,
    pub claimed_at: DateTime<Utc>,
    #[serde(default)]
    pub status: SlotStatus,
}

impl SlotInfo {
    /// Compose project name isolating this slot's containers.
    pub fn compose_project_name(&self) -> String {
        format!("{}-slot-{}", self.project, self.slot_id)
    }
}

/// The full slot ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Claimed slots keyed by slot id (serialized as string keys).
    #[serde(default)]
    pub slots: BTreeMap<u32, SlotInfo>,
}

fn default_version() -> u32 {
    REGISTRY_VERSION
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            slots: BTreeMap::new(),
        }
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites a slot entry.
    pub fn insert(&mut self, slot: SlotInfo) {
        self.slots.insert(slot.slot_id, slot);
    }

    /// Removes a slot entry, returning it if present.
    pub fn remove(&mut self, slot_id: u32) -> Option<SlotInfo> {
        self.slots.remove(&slot_id)
    }

    /// Returns the slot with the given id.
    pub fn get(&self, slot_id: u32) -> Option<&SlotInfo> {
        self.slots.get(&slot_id)
    }

    /// Returns true if the slot id is claimed.
    pub fn is_claimed(&self, slot_id: u32) -> bool {
        self.slots.contains_key(&slot_id)
    }

    /// Looks up a slot by exact worktree path.
    pub fn get_by_worktree(&self, worktree_path: &Path) -> Option<&SlotInfo> {
        self.slots
            .values()
            .find(|slot| slot.worktree_path == worktree_path)
    }

    /// Updates a slot's status. Returns false if the slot is not claimed.
    pub fn set_status(&mut self, slot_id: u32, status: SlotStatus) -> bool {
        match self.slots.get_mut(&slot_id) {
            Some(slot) => {
                slot.status = status;
                true
            }
            None => false,
        }
    }

    /// Removes entries whose worktree or slot directory no longer exists.
    ///
    /// Returns the removed slot ids.
    pub fn clean_stale(&mut self) -> Vec<u32> {
        let mut stale = Vec::new();

        for (slot_id, info) in &self.slots {
            let worktree_exists = info.worktree_path.exists();
            let slot_dir_exists = info.slot_dir.exists();
            if worktree_exists && slot_dir_exists {
                continue;
            }

            let mut reasons = Vec::new();
            if !worktree_exists {
                reasons.push("worktree missing");
            }
            if !slot_dir_exists {
                reasons.push("slot dir missing");
            }
            tracing::warn!(
                slot = slot_id,
                project = %info.project,
                reason = %reasons.join(", "),
                "removing stale slot"
            );
            stale.push(*slot_id);
        }

        for slot_id in &stale {
            self.slots.remove(slot_id);
        }
        stale
    }

    /// Claimed ports per slot, for cross-project proximity checks.
    pub fn project_ports(&self) -> Vec<ProjectPorts<'_>> {
        self.slots
            .values()
            .map(|slot| ProjectPorts {
                project: &slot.project,
                slot_id: slot.slot_id,
                ports: &slot.ports,
            })
            .collect()
    }
}

/// Finds the lowest unclaimed slot whose ports all pass the bind probe.
///
/// Claimed ids and ids with any port conflict are skipped.
pub fn allocate_slot(registry: &Registry, base_ports: &[ServicePort]) -> Result<(u32, PortMap)> {
    for slot_id in SLOT_RANGE {
        if registry.is_claimed(slot_id) {
            continue;
        }

        let ports = compute_ports(base_ports, slot_id)?;
        let conflicts = check_ports_available(&ports);
        if conflicts.is_empty() {
            return Ok((slot_id, ports));
        }

        for conflict in &conflicts {
            tracing::info!(
                slot = slot_id,
                port = conflict.port,
                var = %conflict.env_var,
                "slot skipped: port in use"
            );
        }
    }

    Err(Error::SlotsExhausted {
        first: *SLOT_RANGE.start(),
        last: *SLOT_RANGE.end(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use tempfile::TempDir;

    fn slot(slot_id: u32, worktree: &Path, slot_dir: &Path) -> SlotInfo {
        SlotInfo {
            slot_id,
            project: "myproj".to_string(),
            worktree_path: worktree.to_path_buf(),
            slot_dir: slot_dir.to_path_buf(),
            compose_file_copy: slot_dir.join("docker-compose.yml"),
            ports: PortMap::from([("API_PORT".to_string(), 8080 + slot_id as u16)]),
            claimed_at: Utc::now(),
            status: SlotStatus::Running,
        }
    }

    /// Returns a port that was free a moment ago.
    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn status_serializes_to_lowercase() {
        assert_eq!(
            serde_json::to_string(&SlotStatus::Provisioning).unwrap(),
            "\"provisioning\""
        );
        assert_eq!(serde_json::to_string(&SlotStatus::Stopped).unwrap(), "\"stopped\"");
    }

    #[test]
    fn slots_serialize_with_string_keys() {
        let mut registry = Registry::new();
        registry.insert(slot(4, Path::new("/wt"), Path::new("/slot")));

        let json = serde_json::to_value(&registry).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["slots"]["4"]["slot_id"], 4);
        assert_eq!(json["slots"]["4"]["status"], "running");
    }

    #[test]
    fn legacy_entry_defaults_missing_fields() {
        let json = r#"{
            "version": 1,
            "slots": {
                "2": {
                    "slot_id": 2,
                    "project": "old",
                    "worktree_path": "/wt",
                    "slot_dir": "/slot",
                    "claimed_at": "2025-01-01T00:00:00Z"
                }
            }
        }"#;

        let registry: Registry = serde_json::from_str(json).unwrap();
        let entry = registry.get(2).unwrap();
        assert_eq!(entry.status, SlotStatus::Running);
        assert!(entry.ports.is_empty());
        assert_eq!(entry.compose_file_copy, PathBuf::new());
    }

    #[test]
    fn get_by_worktree_matches_exact_path() {
        let mut registry = Registry::new();
        registry.insert(slot(1, Path::new("/wt/a"), Path::new("/slot/1")));
        registry.insert(slot(2, Path::new("/wt/b"), Path::new("/slot/2")));

        assert_eq!(registry.get_by_worktree(Path::new("/wt/b")).unwrap().slot_id, 2);
        assert!(registry.get_by_worktree(Path::new("/wt")).is_none());
    }

    #[test]
    fn set_status_updates_claimed_slot_only() {
        let mut registry = Registry::new();
        registry.insert(slot(1, Path::new("/wt"), Path::new("/slot")));

        assert!(registry.set_status(1, SlotStatus::Stopped));
        assert_eq!(registry.get(1).unwrap().status, SlotStatus::Stopped);
        assert!(!registry.set_status(9, SlotStatus::Running));
    }

    #[test]
    fn clean_stale_removes_missing_worktree() {
        let dir = TempDir::new().unwrap();
        let slot_dir = dir.path().join("slot");
        std::fs::create_dir(&slot_dir).unwrap();

        let mut registry = Registry::new();
        registry.insert(slot(1, &dir.path().join("gone"), &slot_dir));

        assert_eq!(registry.clean_stale(), vec![1]);
        assert!(!registry.is_claimed(1));
    }

    #[test]
    fn clean_stale_removes_missing_slot_dir() {
        let dir = TempDir::new().unwrap();
        let worktree = dir.path().join("wt");
        std::fs::create_dir(&worktree).unwrap();

        let mut registry = Registry::new();
        registry.insert(slot(1, &worktree, &dir.path().join("gone")));

        assert_eq!(registry.clean_stale(), vec![1]);
    }

    #[test]
    fn clean_stale_preserves_live_entries() {
        let dir = TempDir::new().unwrap();
        let worktree = dir.path().join("wt");
        let slot_dir = dir.path().join("slot");
        std::fs::create_dir(&worktree).unwrap();
        std::fs::create_dir(&slot_dir).unwrap();

        let mut registry = Registry::new();
        registry.insert(slot(1, &worktree, &slot_dir));
        registry.insert(slot(2, &dir.path().join("gone"), &slot_dir));

        assert_eq!(registry.clean_stale(), vec![2]);
        assert!(registry.is_claimed(1));
    }

    #[test]
    fn allocate_skips_claimed_slot() {
        let port = free_port();
        let base = vec![ServicePort::new("API_PORT", port - 2)];
        let mut registry = Registry::new();
        registry.insert(slot(1, Path::new("/wt"), Path::new("/slot")));

        let (slot_id, ports) = allocate_slot(&registry, &base).unwrap();

        assert_eq!(slot_id, 2);
        assert_eq!(ports["API_PORT"], port);
    }

    #[test]
    fn allocate_skips_port_conflict() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = listener.local_addr().unwrap().port();
        let base = vec![ServicePort::new("API_PORT", busy - 1)];

        let (slot_id, ports) = allocate_slot(&Registry::new(), &base).unwrap();

        assert_eq!(slot_id, 2);
        assert_eq!(ports["API_PORT"], busy + 1);
    }

    #[test]
    fn allocate_fails_when_all_claimed() {
        let mut registry = Registry::new();
        for id in SLOT_RANGE {
            registry.insert(slot(id, Path::new("/wt"), Path::new("/slot")));
        }

        let err = allocate_slot(&registry, &[ServicePort::new("API_PORT", 8080)]).unwrap_err();
        assert!(matches!(err, Error::SlotsExhausted { first: 1, last: 100 }));
        assert!(err.to_string().contains("no slots available"));
    }
}
