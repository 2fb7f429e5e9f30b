use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

/// Kind of a device. Immutable once the device is created.
///
/// Behaviour that differs by kind (forwarding, bridge ownership, gateway
/// rules) is expressed as a dispatch function over this tag rather than a
/// class hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Host,
    Router,
    Switch,
    DnsServer,
}

impl DeviceKind {
    /// Routers run with IPv4 forwarding on; every other kind has it off.
    pub fn default_forwarding(self) -> bool {
        matches!(self, DeviceKind::Router)
    }

    /// Only switches own an in-namespace bridge.
    pub fn owns_bridge(self) -> bool {
        matches!(self, DeviceKind::Switch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Up,
    Down,
}

/// One kernel-assigned interface inside a device's namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub address: Option<Ipv4Network>,
    pub state: LinkState,
}

/// Opaque, UI-owned position hint. Stored, never interpreted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PositionHint {
    pub x: f64,
    pub y: f64,
}

/// One IPv4 routing table entry inside a device's namespace, as reported by
/// `ip route show`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub destination: String,
    pub gateway: Option<std::net::Ipv4Addr>,
    pub dev: Option<String>,
}

/// One ARP/neighbor cache entry inside a device's namespace, as reported by
/// `ip neigh show`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArpEntry {
    pub address: std::net::Ipv4Addr,
    pub mac: Option<String>,
    pub dev: String,
    pub state: String,
}

/// A device as seen by clients: kind, interfaces, routes, ARP cache,
/// gateway, active failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub kind: DeviceKind,
    pub interfaces: Vec<Interface>,
    pub routes: Vec<RouteEntry>,
    pub arp: Vec<ArpEntry>,
    pub forwarding: bool,
    pub default_gateway: Option<std::net::Ipv4Addr>,
    pub failures: Vec<super::failure::Failure>,
    pub position: PositionHint,
}

impl Device {
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            interfaces: Vec::new(),
            routes: Vec::new(),
            arp: Vec::new(),
            forwarding: kind.default_forwarding(),
            default_gateway: None,
            failures: Vec::new(),
            position: PositionHint::default(),
        }
    }
}
