//! Namespace Manager: owns namespace lifecycles and intra-namespace
//! address/route/forwarding state.
//!
//! Grounded on `netns-testbench/src/netns.rs` (`Manager`, `NamespaceGuard`
//! RAII enter/exit, per-module `thiserror` enum) for structure, and on
//! `network-sim/src/nsapi.rs` (`Namespace::ensure`/`exec` via `ip netns`,
//! `setns`-based `enter`) for the simpler `ip`-driven lifecycle operations,
//! which this module follows since it does not need the bind-mount
//! bookkeeping `netns-testbench` uses to track namespaces it created itself.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::OwnedFd;
use std::process::Output;

use netsim_proto::{ArpEntry, Device, DeviceKind, ErrorKind, Interface, LinkState, RouteEntry};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::registry::AddressRegistry;

#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("namespace already exists: {0}")]
    AlreadyExists(String),

    #[error("namespace not found: {0}")]
    NotFound(String),

    #[error("interface not found: {0} on {1}")]
    InterfaceNotFound(String, String),

    #[error("permission denied (requires CAP_NET_ADMIN/CAP_SYS_ADMIN)")]
    Permission,

    #[error("address conflict: {0} already assigned to {1}:{2}")]
    AddressConflict(Ipv4Addr, String, String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("kernel command failed: {0}")]
    KernelCommand(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl NamespaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NamespaceError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            NamespaceError::NotFound(_) | NamespaceError::InterfaceNotFound(..) => {
                ErrorKind::NotFound
            }
            NamespaceError::Permission => ErrorKind::Privilege,
            NamespaceError::AddressConflict(..) => ErrorKind::AddressConflict,
            NamespaceError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            NamespaceError::KernelCommand(_) | NamespaceError::Io(_) => ErrorKind::KernelError,
        }
    }
}

#[derive(Debug, Clone)]
struct InterfaceState {
    name: String,
    address: Option<(Ipv4Addr, u8)>,
    state: LinkState,
}

#[derive(Debug, Clone)]
struct DeviceNsState {
    kind: DeviceKind,
    forwarding: bool,
    interfaces: Vec<InterfaceState>,
    default_gateway: Option<Ipv4Addr>,
}

/// Owns the kernel-visible namespace table. Holds no model of the network
/// beyond what's needed to drive inspection and cleanup.
pub struct Manager {
    namespaces: HashMap<String, DeviceNsState>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            namespaces: HashMap::new(),
        }
    }

    async fn run_ip(args: &[&str]) -> Result<Output, NamespaceError> {
        debug!("ip {:?}", args);
        Ok(Command::new("ip").args(args).output().await?)
    }

    async fn run_ip_ns(ns: &str, rest: &[&str]) -> Result<Output, NamespaceError> {
        let mut args = vec!["netns", "exec", ns];
        args.extend_from_slice(rest);
        Self::run_ip(&args).await
    }

    fn classify_failure(out: &Output) -> NamespaceError {
        let stderr = String::from_utf8_lossy(&out.stderr).to_string();
        if stderr.contains("Operation not permitted") {
            NamespaceError::Permission
        } else {
            NamespaceError::KernelCommand(stderr)
        }
    }

    /// Creates a namespace and brings up its loopback; enables IPv4
    /// forwarding for routers.
    pub async fn create(&mut self, name: &str, kind: DeviceKind) -> Result<(), NamespaceError> {
        if self.namespaces.contains_key(name) {
            return Err(NamespaceError::AlreadyExists(name.to_string()));
        }
        if name.is_empty() || name.len() > 64 {
            return Err(NamespaceError::InvalidArgument(format!(
                "invalid device name: {name}"
            )));
        }

        let out = Self::run_ip(&["netns", "add", name]).await?;
        if !out.status.success() {
            return Err(Self::classify_failure(&out));
        }

        let out = Self::run_ip_ns(name, &["link", "set", "dev", "lo", "up"]).await?;
        if !out.status.success() {
            let _ = Self::run_ip(&["netns", "del", name]).await;
            return Err(Self::classify_failure(&out));
        }

        let forwarding = kind.default_forwarding();
        if forwarding {
            self.enable_forwarding_inner(name, true).await?;
        }

        self.namespaces.insert(
            name.to_string(),
            DeviceNsState {
                kind,
                forwarding,
                interfaces: Vec::new(),
                default_gateway: None,
            },
        );

        info!(device = %name, ?kind, "namespace created");
        Ok(())
    }

    /// Idempotent: deleting a namespace that doesn't exist is a no-op.
    pub async fn destroy(&mut self, name: &str, registry: &mut AddressRegistry) -> Result<(), NamespaceError> {
        if !self.namespaces.contains_key(name) {
            return Ok(());
        }
        let out = Self::run_ip(&["netns", "del", name]).await?;
        if !out.status.success() {
            warn!(device = %name, "namespace delete returned non-zero, proceeding anyway");
        }
        self.namespaces.remove(name);
        registry.release_device(name);
        info!(device = %name, "namespace destroyed");
        Ok(())
    }

    fn device_mut(&mut self, name: &str) -> Result<&mut DeviceNsState, NamespaceError> {
        self.namespaces
            .get_mut(name)
            .ok_or_else(|| NamespaceError::NotFound(name.to_string()))
    }

    fn device(&self, name: &str) -> Result<&DeviceNsState, NamespaceError> {
        self.namespaces
            .get(name)
            .ok_or_else(|| NamespaceError::NotFound(name.to_string()))
    }

    pub fn register_interface(&mut self, name: &str, iface: &str) -> Result<(), NamespaceError> {
        let dev = self.device_mut(name)?;
        if dev.interfaces.iter().any(|i| i.name == iface) {
            return Ok(());
        }
        dev.interfaces.push(InterfaceState {
            name: iface.to_string(),
            address: None,
            state: LinkState::Down,
        });
        Ok(())
    }

    /// Drops an interface from the device's tracked state, e.g. when its
    /// owning link is torn down. Best-effort: a missing device or interface
    /// is a no-op, since teardown ordering may already have removed either.
    pub fn deregister_interface(&mut self, name: &str, iface: &str) {
        if let Ok(dev) = self.device_mut(name) {
            dev.interfaces.retain(|i| i.name != iface);
        }
    }

    /// Idempotent if the same assignment already exists; `AddressConflict`
    /// if the global registry already holds the address elsewhere.
    pub async fn assign_address(
        &mut self,
        name: &str,
        iface: &str,
        addr: Ipv4Addr,
        prefix: u8,
        registry: &mut AddressRegistry,
    ) -> Result<(), NamespaceError> {
        {
            let dev = self.device(name)?;
            if !dev.interfaces.iter().any(|i| i.name == iface) {
                return Err(NamespaceError::InterfaceNotFound(
                    iface.to_string(),
                    name.to_string(),
                ));
            }
        }

        registry
            .reserve(addr, name, iface)
            .map_err(|(d, i)| NamespaceError::AddressConflict(addr, d, i))?;

        let cidr = format!("{addr}/{prefix}");
        let out = Self::run_ip_ns(name, &["addr", "add", &cidr, "dev", iface]).await?;
        if !out.status.success() {
            registry.release(addr);
            return Err(Self::classify_failure(&out));
        }

        let dev = self.device_mut(name)?;
        if let Some(i) = dev.interfaces.iter_mut().find(|i| i.name == iface) {
            i.address = Some((addr, prefix));
        }
        Ok(())
    }

    pub async fn set_link_state(
        &mut self,
        name: &str,
        iface: &str,
        up: bool,
    ) -> Result<(), NamespaceError> {
        {
            let dev = self.device(name)?;
            if !dev.interfaces.iter().any(|i| i.name == iface) {
                return Err(NamespaceError::InterfaceNotFound(
                    iface.to_string(),
                    name.to_string(),
                ));
            }
        }
        let verb = if up { "up" } else { "down" };
        let out = Self::run_ip_ns(name, &["link", "set", "dev", iface, verb]).await?;
        if !out.status.success() {
            return Err(Self::classify_failure(&out));
        }
        let dev = self.device_mut(name)?;
        if let Some(i) = dev.interfaces.iter_mut().find(|i| i.name == iface) {
            i.state = if up { LinkState::Up } else { LinkState::Down };
        }
        Ok(())
    }

    /// Fails if `gw` is not reachable on any of the device's interface
    /// subnets; the caller (Topology Manager) is responsible for that check
    /// since it alone knows subnet membership, and reports it as
    /// `NoRouteForGateway`. Here we only install the route once validated.
    pub async fn set_default_gateway(
        &mut self,
        name: &str,
        gw: Ipv4Addr,
    ) -> Result<(), NamespaceError> {
        let _ = self.device(name)?;
        let out = Self::run_ip_ns(name, &["route", "replace", "default", "via", &gw.to_string()])
            .await?;
        if !out.status.success() {
            return Err(Self::classify_failure(&out));
        }
        self.device_mut(name)?.default_gateway = Some(gw);
        Ok(())
    }

    async fn enable_forwarding_inner(&self, name: &str, on: bool) -> Result<(), NamespaceError> {
        let value = if on { "1" } else { "0" };
        let out = Self::run_ip_ns(
            name,
            &["sysctl", "-w", &format!("net.ipv4.ip_forward={value}")],
        )
        .await?;
        if !out.status.success() {
            let sysctl_arg = format!("net.ipv4.ip_forward={value}");
            let out = Command::new("ip")
                .args(["netns", "exec", name, "sysctl", "-w", &sysctl_arg])
                .output()
                .await?;
            if !out.status.success() {
                return Err(Self::classify_failure(&out));
            }
        }
        Ok(())
    }

    pub async fn enable_forwarding(&mut self, name: &str, on: bool) -> Result<(), NamespaceError> {
        self.enable_forwarding_inner(name, on).await?;
        self.device_mut(name)?.forwarding = on;
        Ok(())
    }

    /// Read-through inspection: interfaces with addresses/state, forwarding
    /// flag, merged into a proto `Device` shell by the caller.
    pub fn inspect(&self, name: &str) -> Result<Vec<Interface>, NamespaceError> {
        let dev = self.device(name)?;
        Ok(dev
            .interfaces
            .iter()
            .map(|i| Interface {
                name: i.name.clone(),
                address: i
                    .address
                    .map(|(a, p)| ipnetwork::Ipv4Network::new(a, p).expect("valid prefix")),
                state: i.state,
            })
            .collect())
    }

    pub fn forwarding(&self, name: &str) -> Result<bool, NamespaceError> {
        Ok(self.device(name)?.forwarding)
    }

    /// Collects the namespace's IPv4 routing table via `ip route show`.
    pub async fn routes(&self, name: &str) -> Result<Vec<RouteEntry>, NamespaceError> {
        let _ = self.device(name)?;
        let out = Self::run_ip_ns(name, &["route", "show"]).await?;
        if !out.status.success() {
            return Err(Self::classify_failure(&out));
        }
        Ok(parse_routes(&String::from_utf8_lossy(&out.stdout)))
    }

    /// Collects the namespace's ARP/neighbor cache via `ip neigh show`.
    pub async fn arp(&self, name: &str) -> Result<Vec<ArpEntry>, NamespaceError> {
        let _ = self.device(name)?;
        let out = Self::run_ip_ns(name, &["neigh", "show"]).await?;
        if !out.status.success() {
            return Err(Self::classify_failure(&out));
        }
        Ok(parse_arp(&String::from_utf8_lossy(&out.stdout)))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.namespaces.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.namespaces.keys().cloned().collect()
    }
}

/// Opens the underlying `/run/netns/<name>` file; used by the PTY manager to
/// `setns` a freshly forked child into a device's namespace before exec.
pub fn open_netns_file(name: &str) -> io::Result<File> {
    let candidates = [
        format!("/run/netns/{name}"),
        format!("/var/run/netns/{name}"),
    ];
    let mut last_err: Option<io::Error> = None;
    for path in candidates {
        match File::open(&path) {
            Ok(f) => return Ok(f),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "netns path not found")))
}

/// RAII guard restoring the calling thread's namespace on drop. Used for the
/// rare case a control operation must briefly execute inside a namespace
/// rather than shelling `ip netns exec` (e.g. reading `/proc` state).
pub struct NamespaceGuard {
    original_ns: OwnedFd,
}

impl NamespaceGuard {
    pub fn enter(name: &str) -> io::Result<Self> {
        let original = File::open("/proc/self/ns/net")?;
        let target = open_netns_file(name)?;
        nix::sched::setns(target, nix::sched::CloneFlags::CLONE_NEWNET)
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(Self {
            original_ns: original.into(),
        })
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        let _ = nix::sched::setns(&self.original_ns, nix::sched::CloneFlags::CLONE_NEWNET);
    }
}

/// Parses `ip route show` output lines such as
/// `10.0.1.0/24 dev eth0 proto kernel scope link src 10.0.1.2` or
/// `default via 10.0.1.1 dev eth0`.
fn parse_routes(output: &str) -> Vec<RouteEntry> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let destination = tokens.first().copied().unwrap_or_default().to_string();
            let gateway = tokens
                .iter()
                .position(|t| *t == "via")
                .and_then(|i| tokens.get(i + 1))
                .and_then(|s| s.parse().ok());
            let dev = tokens
                .iter()
                .position(|t| *t == "dev")
                .and_then(|i| tokens.get(i + 1))
                .map(|s| s.to_string());
            RouteEntry {
                destination,
                gateway,
                dev,
            }
        })
        .collect()
}

/// Parses `ip neigh show` output lines such as
/// `10.0.1.1 dev eth0 lladdr 02:42:ac:11:00:02 STALE`.
fn parse_arp(output: &str) -> Vec<ArpEntry> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let address = tokens.first()?.parse().ok()?;
            let dev = tokens
                .iter()
                .position(|t| *t == "dev")
                .and_then(|i| tokens.get(i + 1))
                .map(|s| s.to_string())?;
            let mac = tokens
                .iter()
                .position(|t| *t == "lladdr")
                .and_then(|i| tokens.get(i + 1))
                .map(|s| s.to_string());
            let state = tokens.last().copied().unwrap_or_default().to_string();
            Some(ArpEntry {
                address,
                mac,
                dev,
                state,
            })
        })
        .collect()
}

/// Builds a client-facing `Device` by merging kind/name with the manager's
/// interface/forwarding state. Gateway and failures are filled in by the
/// Topology Manager, which alone knows both.
pub fn build_device_shell(name: &str, kind: DeviceKind) -> Device {
    Device::new(name, kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_device_shell_has_default_forwarding() {
        let d = build_device_shell("r1", DeviceKind::Router);
        assert!(d.forwarding);
        let d = build_device_shell("h1", DeviceKind::Host);
        assert!(!d.forwarding);
    }

    #[tokio::test]
    async fn create_rejects_empty_name() {
        let mut mgr = Manager::new();
        let err = mgr.create("", DeviceKind::Host).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn parses_default_and_connected_routes() {
        let out = "default via 10.0.1.1 dev eth0 \n10.0.1.0/24 dev eth0 proto kernel scope link src 10.0.1.2\n";
        let routes = parse_routes(out);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].destination, "default");
        assert_eq!(routes[0].gateway, Some(Ipv4Addr::new(10, 0, 1, 1)));
        assert_eq!(routes[0].dev.as_deref(), Some("eth0"));
        assert_eq!(routes[1].destination, "10.0.1.0/24");
        assert_eq!(routes[1].gateway, None);
    }

    #[test]
    fn parses_neighbor_cache() {
        let out = "10.0.1.1 dev eth0 lladdr 02:42:ac:11:00:02 STALE\n";
        let arp = parse_arp(out);
        assert_eq!(arp.len(), 1);
        assert_eq!(arp[0].address, Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(arp[0].dev, "eth0");
        assert_eq!(arp[0].mac.as_deref(), Some("02:42:ac:11:00:02"));
        assert_eq!(arp[0].state, "STALE");
    }

    #[tokio::test]
    #[cfg(feature = "net-admin-tests")]
    async fn create_destroy_roundtrip_requires_net_admin() {
        let mut mgr = Manager::new();
        let mut reg = AddressRegistry::new();
        if mgr.create("nstest0", DeviceKind::Host).await.is_ok() {
            assert!(mgr.exists("nstest0"));
            mgr.destroy("nstest0", &mut reg).await.unwrap();
            assert!(!mgr.exists("nstest0"));
        }
    }
}
