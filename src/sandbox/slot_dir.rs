//! Slot directory layout and the generated env file.

use std::path::{Path, PathBuf};

use crate::config::InfraConfig;
use crate::error::Result;
use crate::registry::SlotInfo;

/// Env file passed to the container tool.
pub const ENV_FILE: &str = ".env.sandbox";

/// Frozen copy of the compose file, used for teardown.
pub const COMPOSE_SNAPSHOT: &str = "docker-compose.yml";

const COMPOSE_PROJECT_VAR: &str = "COMPOSE_PROJECT_NAME";

/// Returns `~/.devops-ai/slots`.
pub fn default_slots_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".devops-ai")
        .join("slots")
}

/// Creates `<base>/<project>-<slot_id>` if absent and returns it.
pub fn create_slot_dir(base: &Path, project: &str, slot_id: u32) -> Result<PathBuf> {
    let dir = base.join(format!("{}-{}", project, slot_id));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Deletes a slot directory and everything in it. A missing directory is fine.
pub fn remove_slot_dir(slot_dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(slot_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Snapshots the compose file into the slot directory.
pub fn copy_compose_to_slot(compose_path: &Path, slot_dir: &Path) -> Result<PathBuf> {
    let dest = slot_dir.join(COMPOSE_SNAPSHOT);
    std::fs::copy(compose_path, &dest)?;
    Ok(dest)
}

/// Writes `.env.sandbox`: the compose project name, every slot port, then
/// the extra `[sandbox.env]` entries.
pub fn generate_env_file(config: &InfraConfig, slot: &SlotInfo, slot_dir: &Path) -> Result<PathBuf> {
    let mut entries: Vec<(String, String)> =
        vec![(COMPOSE_PROJECT_VAR.to_string(), slot.compose_project_name())];
    entries.extend(slot.ports.iter().map(|(var, port)| (var.clone(), port.to_string())));

    for (key, value) in &config.env {
        if key == COMPOSE_PROJECT_VAR || slot.ports.contains_key(key) {
            tracing::warn!(var = %key, "ignoring [sandbox.env] entry that shadows a generated variable");
            continue;
        }
        entries.push((key.clone(), value.clone()));
    }

    let path = slot_dir.join(ENV_FILE);
    crate::dotenv::write(
        &path,
        entries.iter().map(|(k, v)| (k.as_str(), v.as_str())),
    )?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortMap;
    use crate::registry::SlotStatus;
    use chrono::Utc;
    use tempfile::TempDir;

    fn slot(slot_id: u32, ports: &[(&str, u16)]) -> SlotInfo {
        SlotInfo {
            slot_id,
            project: "myproj".to_string(),
            worktree_path: PathBuf::from("/tmp/wt"),
            slot_dir: PathBuf::from("/tmp/slot"),
            compose_file_copy: PathBuf::from("/tmp/slot/docker-compose.yml"),
            ports: ports
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<PortMap>(),
            claimed_at: Utc::now(),
            status: SlotStatus::Provisioning,
        }
    }

    #[test]
    fn creates_slot_dir_at_expected_path() {
        let base = TempDir::new().unwrap();
        let dir = create_slot_dir(base.path(), "myproj", 3).unwrap();
        assert_eq!(dir, base.path().join("myproj-3"));
        assert!(dir.is_dir());
    }

    #[test]
    fn remove_slot_dir_deletes_contents_and_tolerates_absence() {
        let base = TempDir::new().unwrap();
        let dir = create_slot_dir(base.path(), "myproj", 1).unwrap();
        std::fs::write(dir.join("somefile"), "data").unwrap();

        remove_slot_dir(&dir).unwrap();
        assert!(!dir.exists());
        remove_slot_dir(&dir).unwrap();
    }

    #[test]
    fn compose_snapshot_matches_source() {
        let dir = TempDir::new().unwrap();
        let compose = dir.path().join("compose.yaml");
        std::fs::write(&compose, "services:\n  app:\n    image: python\n").unwrap();
        let slot_dir = create_slot_dir(dir.path(), "p", 1).unwrap();

        let copy = copy_compose_to_slot(&compose, &slot_dir).unwrap();

        assert_eq!(copy, slot_dir.join(COMPOSE_SNAPSHOT));
        assert_eq!(
            std::fs::read_to_string(copy).unwrap(),
            std::fs::read_to_string(compose).unwrap()
        );
    }

    #[test]
    fn env_file_has_project_name_and_ports() {
        let dir = TempDir::new().unwrap();
        let slot = slot(2, &[("API_PORT", 8082), ("DB_PORT", 5434)]);

        let path = generate_env_file(&InfraConfig::new("myproj"), &slot, dir.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "COMPOSE_PROJECT_NAME=myproj-slot-2\nAPI_PORT=8082\nDB_PORT=5434\n"
        );
    }

    #[test]
    fn env_file_appends_extra_env_without_shadowing() {
        let dir = TempDir::new().unwrap();
        let mut config = InfraConfig::new("myproj");
        config.env.insert("LOG_LEVEL".to_string(), "debug".to_string());
        config.env.insert("API_PORT".to_string(), "1".to_string());

        let path = generate_env_file(&config, &slot(5, &[("API_PORT", 8085)]), dir.path()).unwrap();
        let content = std::fs::read_to_string(path).unwrap();

        assert!(content.contains("API_PORT=8085\n"));
        assert!(!content.contains("API_PORT=1\n"));
        assert!(content.ends_with("LOG_LEVEL=debug\n"));
    }

    #[test]
    fn env_file_rejects_injected_lines() {
        let dir = TempDir::new().unwrap();
        let mut config = InfraConfig::new("myproj");
        config.env.insert("X".to_string(), "1\nEVIL=2".to_string());

        assert!(generate_env_file(&config, &slot(1, &[]), dir.path()).is_err());
        assert!(!dir.path().join(ENV_FILE).exists());
    }
}
