//! Generates the per-slot compose override: bind mounts for code and shared
//! paths, plus observability wiring when the shared network exists.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{InfraConfig, MountEntry};
use crate::error::Result;
use crate::registry::SlotInfo;

/// Override file name inside the slot directory.
pub const OVERRIDE_FILE: &str = "docker-compose.override.yml";

/// Shared network the observability stack runs on.
pub const OBSERVABILITY_NETWORK: &str = "devops-ai-observability";

/// OTLP collector endpoint as seen from inside the observability network.
pub const OTLP_ENDPOINT: &str = "http://devops-ai-jaeger:4317";

#[derive(Debug, Default, Serialize)]
struct ComposeOverride {
    services: BTreeMap<String, ServiceOverride>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    networks: BTreeMap<String, ExternalNetwork>,
}

#[derive(Debug, Default, Serialize)]
struct ServiceOverride {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    networks: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ExternalNetwork {
    external: bool,
}

fn volume(base: &Path, mount: &MountEntry) -> String {
    let mut spec = format!("{}:{}", base.join(&mount.host).display(), mount.container);
    if mount.readonly {
        spec.push_str(":ro");
    }
    spec
}

fn add_mounts(
    services: &mut BTreeMap<String, ServiceOverride>,
    targets: &[String],
    mounts: &[MountEntry],
    base: &Path,
) {
    if mounts.is_empty() {
        return;
    }
    for target in targets {
        let service = services.entry(target.clone()).or_default();
        service
            .volumes
            .extend(mounts.iter().map(|m| volume(base, m)));
    }
}

/// Renders the override document.
///
/// Code mounts resolve against `worktree`, shared mounts against
/// `source_root`. With `observability` set, every mount target also joins
/// [`OBSERVABILITY_NETWORK`] and receives the OTLP endpoint and a
/// `service.namespace` resource attribute.
pub fn render_override(
    config: &InfraConfig,
    slot: &SlotInfo,
    worktree: &Path,
    source_root: &Path,
    observability: bool,
) -> Result<String> {
    let mut doc = ComposeOverride::default();

    add_mounts(&mut doc.services, &config.code_mount_targets, &config.code_mounts, worktree);
    add_mounts(
        &mut doc.services,
        &config.shared_mount_targets,
        &config.shared_mounts,
        source_root,
    );

    if observability {
        let namespace = format!("service.namespace={}", slot.compose_project_name());
        for target in config.mount_targets() {
            let service = doc.services.entry(target).or_default();
            service
                .environment
                .insert(config.otel_endpoint_var.clone(), OTLP_ENDPOINT.to_string());
            service
                .environment
                .insert(config.otel_namespace_var.clone(), namespace.clone());
            service.networks = vec!["default".to_string(), OBSERVABILITY_NETWORK.to_string()];
        }
        doc.networks.insert(
            OBSERVABILITY_NETWORK.to_string(),
            ExternalNetwork { external: true },
        );
    }

    let body = serde_yaml::to_string(&doc)?;
    Ok(format!(
        "# Generated by kinfra for worktree {}\n# Rewritten on every start; do not edit.\n{}",
        worktree.display(),
        body
    ))
}

/// Writes `docker-compose.override.yml` into `slot_dir` and returns its path.
pub fn generate_override(
    config: &InfraConfig,
    slot: &SlotInfo,
    worktree: &Path,
    source_root: &Path,
    slot_dir: &Path,
    observability: bool,
) -> Result<PathBuf> {
    let content = render_override(config, slot, worktree, source_root, observability)?;
    let path = slot_dir.join(OVERRIDE_FILE);
    std::fs::write(&path, content)?;
    tracing::debug!(path = ?path, observability, "wrote compose override");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SlotStatus;
    use chrono::Utc;
    use serde_yaml::Value;

    fn slot() -> SlotInfo {
        SlotInfo {
            slot_id: 2,
            project: "myproj".to_string(),
            worktree_path: PathBuf::from("/wt"),
            slot_dir: PathBuf::from("/slots/myproj-2"),
            compose_file_copy: PathBuf::from("/slots/myproj-2/docker-compose.yml"),
            ports: Default::default(),
            claimed_at: Utc::now(),
            status: SlotStatus::Provisioning,
        }
    }

    fn config() -> InfraConfig {
        let mut config = InfraConfig::new("myproj");
        config.code_mounts = vec![
            MountEntry::new("src/", "/app/src"),
            MountEntry::new("tests/", "/app/tests").read_only(),
        ];
        config.code_mount_targets = vec!["app".to_string(), "worker".to_string()];
        config.shared_mounts = vec![MountEntry::new("data/", "/app/data")];
        config.shared_mount_targets = vec!["app".to_string()];
        config
    }

    fn parse(content: &str) -> Value {
        serde_yaml::from_str(content).unwrap()
    }

    fn volumes(doc: &Value, service: &str) -> Vec<String> {
        doc["services"][service]["volumes"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn starts_with_generated_header() {
        let content =
            render_override(&config(), &slot(), Path::new("/wt"), Path::new("/repo"), false).unwrap();
        assert!(content.starts_with("# Generated by kinfra for worktree /wt\n"));
    }

    #[test]
    fn code_mounts_resolve_against_worktree() {
        let content =
            render_override(&config(), &slot(), Path::new("/wt"), Path::new("/repo"), false).unwrap();
        let doc = parse(&content);

        assert_eq!(
            volumes(&doc, "worker"),
            vec!["/wt/src/:/app/src", "/wt/tests/:/app/tests:ro"]
        );
    }

    #[test]
    fn shared_mounts_resolve_against_source_root() {
        let content =
            render_override(&config(), &slot(), Path::new("/wt"), Path::new("/repo"), false).unwrap();
        let doc = parse(&content);

        let app = volumes(&doc, "app");
        assert_eq!(app.len(), 3);
        assert_eq!(app[2], "/repo/data/:/app/data");
    }

    #[test]
    fn no_observability_without_network() {
        let content =
            render_override(&config(), &slot(), Path::new("/wt"), Path::new("/repo"), false).unwrap();
        let doc = parse(&content);

        assert!(doc.get("networks").is_none());
        assert!(doc["services"]["app"].get("environment").is_none());
        assert!(!content.contains(OBSERVABILITY_NETWORK));
    }

    #[test]
    fn observability_injected_when_network_exists() {
        let content =
            render_override(&config(), &slot(), Path::new("/wt"), Path::new("/repo"), true).unwrap();
        let doc = parse(&content);

        let env = &doc["services"]["worker"]["environment"];
        assert_eq!(env["OTEL_EXPORTER_OTLP_ENDPOINT"], OTLP_ENDPOINT);
        assert_eq!(
            env["OTEL_RESOURCE_ATTRIBUTES"],
            "service.namespace=myproj-slot-2"
        );
        assert_eq!(
            doc["services"]["app"]["networks"],
            parse("[default, devops-ai-observability]")
        );
        assert_eq!(doc["networks"][OBSERVABILITY_NETWORK]["external"], true);
    }

    #[test]
    fn no_mounts_yields_empty_services() {
        let content = render_override(
            &InfraConfig::new("bare"),
            &slot(),
            Path::new("/wt"),
            Path::new("/repo"),
            false,
        )
        .unwrap();
        let doc = parse(&content);
        assert!(doc["services"].as_mapping().unwrap().is_empty());
    }

    #[test]
    fn generate_writes_into_slot_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = generate_override(
            &config(),
            &slot(),
            Path::new("/wt"),
            Path::new("/repo"),
            dir.path(),
            false,
        )
        .unwrap();

        assert_eq!(path, dir.path().join(OVERRIDE_FILE));
        assert!(std::fs::read_to_string(path).unwrap().contains("/wt/src/:/app/src"));
    }
}
