//! kinfra - port-offset sandbox slots for git worktrees
//!
//! Each worktree of a project gets a numbered slot. The slot id offsets every
//! declared base port, isolates the compose project name, and owns a private
//! directory of generated files. Slots are recorded in a shared registry so
//! concurrent sandboxes, across projects, never collide.

pub mod config;
pub mod dotenv;
pub mod error;
pub mod manager;
pub mod ports;
pub mod provision;
pub mod registry;
pub mod sandbox;
pub mod worktree;

pub use config::{
    find_project_root, load_config, parse_config, InfraConfig, MountEntry, ServicePort, Validate,
    ValidationResult,
};
pub use error::{Error, Result};
pub use manager::{SandboxManager, SandboxReport, SlotOverview};
pub use ports::{check_base_port_safety, check_ports_available, compute_ports, PortConflict, PortMap};
pub use provision::{ProvisioningError, SecretResolver, VaultCli};
pub use registry::{allocate_slot, Registry, RegistryStore, SlotInfo, SlotStatus};
pub use sandbox::{ContainerRuntime, DockerCompose, HealthGate, ServiceState, ServiceStatus};
