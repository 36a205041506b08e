//! Port allocation: slot offsets and live TCP availability probing.
//!
//! A slot's ports are the project's base ports shifted by the slot id. The
//! availability probe is advisory; another process can still take a port
//! between the probe and container start.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;

use tokio::net::TcpSocket;

use crate::config::ServicePort;
use crate::error::{Error, Result};

/// Slot ids that may be allocated. The id doubles as the port offset.
pub const SLOT_RANGE: RangeInclusive<u32> = 1..=100;

/// Base ports closer than this may collide once offset by a slot id.
const PROXIMITY_WINDOW: u32 = 100;

/// Concrete ports keyed by env var name.
pub type PortMap = BTreeMap<String, u16>;

/// A port that failed the TCP bind availability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConflict {
    /// Env var the port is assigned to.
    pub env_var: String,
    /// The port that could not be bound.
    pub port: u16,
    /// OS error text from the failed bind.
    pub message: String,
}

/// Computes the ports for a slot: `base_port + slot_id` for each declared port.
pub fn compute_ports(base_ports: &[ServicePort], slot_id: u32) -> Result<PortMap> {
    base_ports
        .iter()
        .map(|sp| {
            let port = u32::from(sp.base_port) + slot_id;
            let port = u16::try_from(port).map_err(|_| Error::PortOutOfRange {
                var: sp.env_var.clone(),
                base: sp.base_port,
                slot_id,
            })?;
            Ok((sp.env_var.clone(), port))
        })
        .collect()
}

/// Attempts a loopback bind on each port and returns every conflict.
///
/// Sockets are dropped immediately after binding, so a free port is left
/// untouched.
pub fn check_ports_available(ports: &PortMap) -> Vec<PortConflict> {
    ports
        .iter()
        .filter_map(|(env_var, &port)| {
            probe_port(port).err().map(|e| PortConflict {
                env_var: env_var.clone(),
                port,
                message: e.to_string(),
            })
        })
        .collect()
}

fn probe_port(port: u16) -> std::io::Result<()> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
}

/// Another project's claimed ports, as recorded in the registry.
#[derive(Debug, Clone)]
pub struct ProjectPorts<'a> {
    pub project: &'a str,
    pub slot_id: u32,
    pub ports: &'a PortMap,
}

/// Warns when this project's base ports sit within 100 of another project's.
///
/// The other project's base port is recovered from its slot assignment as
/// `port - slot_id`. The result is advisory only.
pub fn check_base_port_safety(
    project: &str,
    base_ports: &[ServicePort],
    others: &[ProjectPorts<'_>],
) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut seen = BTreeSet::new();

    for other in others {
        if other.project == project {
            continue;
        }
        for (other_var, &other_port) in other.ports {
            let Some(other_base) = u32::from(other_port).checked_sub(other.slot_id) else {
                continue;
            };
            for mine in base_ports {
                let distance = u32::from(mine.base_port).abs_diff(other_base);
                // Every slot of a project shares the same bases.
                let key = (other.project, other_var.as_str(), other_base, mine.env_var.as_str());
                if distance < PROXIMITY_WINDOW && seen.insert(key) {
                    warnings.push(format!(
                        "port proximity warning: {}:{} (base {}) is within {} of {}:{} (base {})",
                        project,
                        mine.env_var,
                        mine.base_port,
                        distance,
                        other.project,
                        other_var,
                        other_base
                    ));
                }
            }
        }
    }

    warnings
}
