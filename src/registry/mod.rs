//! Global slot registry shared by every project on the host.
//!
//! [`Registry`] is the in-memory ledger; [`RegistryStore`] persists it to a
//! single JSON document and serializes cross-process access with an advisory
//! lock.

mod slot;
mod store;

pub use slot::{allocate_slot, Registry, SlotInfo, SlotStatus, REGISTRY_VERSION};
pub use store::{default_registry_path, RegistryLock, RegistryStore};
