//! Sandbox orchestration: per-slot files and the container lifecycle.
//!
//! A slot moves `provisioning -> running -> stopped` and is finally removed
//! from the registry. The container tool sits behind [`ContainerRuntime`] so
//! the lifecycle can be driven without Docker.

mod compose;
mod health;
mod override_file;
mod slot_dir;

pub use compose::{
    parse_ps_output, sandbox_status, start_sandbox, stop_sandbox, ComposeAction,
    ComposeInvocation, ContainerRuntime, DockerCompose, ServiceState, ServiceStatus, ToolOutput,
};
pub use health::{health_url, run_health_gate, HealthGate};
pub use override_file::{
    generate_override, OBSERVABILITY_NETWORK, OTLP_ENDPOINT, OVERRIDE_FILE,
};
pub use slot_dir::{
    copy_compose_to_slot, create_slot_dir, default_slots_dir, generate_env_file,
    remove_slot_dir, COMPOSE_SNAPSHOT, ENV_FILE,
};
