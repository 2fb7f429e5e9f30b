//! veth pair creation, namespace attachment, and bridge membership.
//!
//! Grounded on `netns-testbench/src/veth.rs` (`PairManager`,
//! `is_valid_interface_name`) for structure and naming validation, and on
//! `network-sim/src/namespace.rs` (`create_shaped_veth_pair`) for the
//! concrete `ip link add ... type veth peer name ...` / `ip link set ...
//! netns ...` sequencing.

use netsim_proto::ErrorKind;
use rand::Rng;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum VethError {
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("invalid interface name: {0}")]
    InvalidName(String),

    #[error("permission denied (requires CAP_NET_ADMIN)")]
    Permission,

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VethError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VethError::InterfaceNotFound(_) => ErrorKind::NotFound,
            VethError::InvalidName(_) => ErrorKind::InvalidArgument,
            VethError::Permission => ErrorKind::Privilege,
            VethError::CommandFailed(_) | VethError::Io(_) => ErrorKind::KernelError,
        }
    }
}

/// Interface names must fit `IFNAMSIZ` (15 usable chars), be alphanumeric
/// plus `-_.`, and not start with `-` (which `ip` would parse as a flag).
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 15
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Host-visible veth peer names are randomized to avoid collisions across
/// the root namespace, as opposed to the per-device interface names
/// (`eth0`, `eth1`, ...) which are only unique within their own namespace.
pub fn random_veth_name() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect();
    format!("veth-{suffix}")
}

async fn run_ip(args: &[&str]) -> Result<std::process::Output, VethError> {
    debug!(?args, "ip");
    Ok(Command::new("ip").args(args).output().await?)
}

fn classify(out: &std::process::Output, iface: &str) -> VethError {
    let stderr = String::from_utf8_lossy(&out.stderr).to_string();
    if stderr.contains("Operation not permitted") {
        VethError::Permission
    } else if stderr.contains("Cannot find device") {
        VethError::InterfaceNotFound(iface.to_string())
    } else {
        VethError::CommandFailed(stderr)
    }
}

pub struct VethManager;

impl Default for VethManager {
    fn default() -> Self {
        Self::new()
    }
}

impl VethManager {
    pub fn new() -> Self {
        Self
    }

    /// Creates a veth pair `host_a <-> host_b` in the root namespace.
    pub async fn create_pair(&self, host_a: &str, host_b: &str) -> Result<(), VethError> {
        for n in [host_a, host_b] {
            if !is_valid_interface_name(n) {
                return Err(VethError::InvalidName(n.to_string()));
            }
        }
        // Best-effort pre-cleanup of stale interfaces from a previous run.
        let _ = run_ip(&["link", "del", "dev", host_a]).await;

        let out = run_ip(&[
            "link", "add", host_a, "type", "veth", "peer", "name", host_b,
        ])
        .await?;
        if !out.status.success() {
            return Err(classify(&out, host_a));
        }
        Ok(())
    }

    /// Moves `iface` (currently in the root namespace) into `ns`, renaming
    /// it to `target_name` once inside.
    pub async fn move_to_namespace(
        &self,
        iface: &str,
        ns: &str,
        target_name: &str,
    ) -> Result<(), VethError> {
        if !is_valid_interface_name(target_name) {
            return Err(VethError::InvalidName(target_name.to_string()));
        }
        let out = run_ip(&["link", "set", "dev", iface, "netns", ns]).await?;
        if !out.status.success() {
            return Err(classify(&out, iface));
        }
        if target_name != iface {
            let out = run_ip(&[
                "netns", "exec", ns, "ip", "link", "set", "dev", iface, "name", target_name,
            ])
            .await?;
            if !out.status.success() {
                return Err(classify(&out, iface));
            }
        }
        Ok(())
    }

    /// Attaches `iface` (already living in `bridge_ns`) to the bridge
    /// `bridge_name` owned by that namespace.
    pub async fn attach_to_bridge(
        &self,
        bridge_ns: &str,
        bridge_name: &str,
        iface: &str,
    ) -> Result<(), VethError> {
        let out = run_ip(&[
            "netns", "exec", bridge_ns, "ip", "link", "set", "dev", iface, "master", bridge_name,
        ])
        .await?;
        if !out.status.success() {
            return Err(classify(&out, iface));
        }
        let out = run_ip(&["netns", "exec", bridge_ns, "ip", "link", "set", "dev", iface, "up"]).await?;
        if !out.status.success() {
            return Err(classify(&out, iface));
        }
        Ok(())
    }

    pub async fn set_up(&self, ns: &str, iface: &str) -> Result<(), VethError> {
        let out = run_ip(&["netns", "exec", ns, "ip", "link", "set", "dev", iface, "up"]).await?;
        if !out.status.success() {
            return Err(classify(&out, iface));
        }
        Ok(())
    }

    /// Deletes the veth pair by deleting either end; the kernel removes the
    /// peer atomically. Best-effort: tolerates the interface already being
    /// gone (e.g. because its namespace was already destroyed). Only valid
    /// while `host_iface` still lives in the root namespace — once a veth
    /// end has been moved into a device namespace, use
    /// `delete_pair_in_ns` instead.
    pub async fn delete_pair(&self, host_iface: &str) {
        let _ = run_ip(&["link", "del", "dev", host_iface]).await;
    }

    /// Deletes the veth pair from inside the namespace that now owns one
    /// end, for when `move_to_namespace` has already run and the interface
    /// is no longer reachable by an unqualified `ip link del` in the root
    /// namespace. Best-effort, same tolerance as `delete_pair`.
    pub async fn delete_pair_in_ns(&self, ns: &str, iface: &str) {
        let _ = run_ip(&["netns", "exec", ns, "ip", "link", "del", "dev", iface]).await;
    }

    pub async fn create_bridge(&self, ns: &str, name: &str) -> Result<(), VethError> {
        if !is_valid_interface_name(name) {
            return Err(VethError::InvalidName(name.to_string()));
        }
        let out = run_ip(&["netns", "exec", ns, "ip", "link", "add", "name", name, "type", "bridge"]).await?;
        if !out.status.success() {
            return Err(classify(&out, name));
        }
        let out = run_ip(&["netns", "exec", ns, "ip", "link", "set", "dev", name, "up"]).await?;
        if !out.status.success() {
            return Err(classify(&out, name));
        }
        Ok(())
    }

    pub async fn destroy_bridge(&self, ns: &str, name: &str) {
        let _ = run_ip(&["netns", "exec", ns, "ip", "link", "del", "dev", name]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(is_valid_interface_name("eth0"));
        assert!(is_valid_interface_name("veth-abcd1234"));
        assert!(is_valid_interface_name("br0"));
    }

    #[test]
    fn invalid_names() {
        assert!(!is_valid_interface_name(""));
        assert!(!is_valid_interface_name("-bad"));
        assert!(!is_valid_interface_name("way-too-long-for-ifnamsiz"));
        assert!(!is_valid_interface_name("has space"));
    }

    #[test]
    fn random_veth_name_is_well_formed() {
        let name = random_veth_name();
        assert!(name.starts_with("veth-"));
        assert!(is_valid_interface_name(&name));
    }
}
