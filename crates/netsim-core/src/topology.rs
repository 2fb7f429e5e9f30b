//! Topology Manager: the device/link graph, lock discipline, teardown
//! ordering, and failure-injection dispatch. The single entry point the
//! Control Server drives.
//!
//! Grounded on `netns-testbench/src/bench.rs`'s `NetworkOrchestrator`
//! (`LinkResources`-tracked-for-teardown, explicit reverse-dependency-order
//! `shutdown(self)`, `impl Drop` as a log-only last resort) for the overall
//! shape. Unlike that orchestrator, sub-managers are not exposed to each
//! other directly — PTY sessions and Packet Observers are driven purely by
//! calls originating here, per SPEC_FULL §9's event-channel composition note.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use netsim_proto::{
    CommandExecResponse, Device, DeviceKind, Failure, FailureKind, Link, LinkEndpoint, LinkId,
    PacketEvent, ShapingParams, SnapshotResponse,
};
use tokio::process::Command;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::error::EmulatorError;
use crate::link::LinkManager;
use crate::namespace::Manager as NamespaceManager;
use crate::observer::Observer;
use crate::pty::Manager as PtyManager;
use crate::registry::AddressRegistry;
use crate::subnet::SubnetAllocator;

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);
const PRIMARY_TERMINAL_CHANNEL: &str = "primary";
/// SPEC_FULL §5: how long a disconnected terminal session is kept alive for
/// a reconnect to reattach before it is actually closed.
const PTY_GRACE_PERIOD: Duration = Duration::from_secs(30);
const DEFAULT_TERMINAL_ROWS: u16 = 24;
const DEFAULT_TERMINAL_COLS: u16 = 80;

struct LinkEntry {
    endpoint_a: LinkEndpoint,
    endpoint_b: LinkEndpoint,
    shaping_a: ShapingParams,
    shaping_b: ShapingParams,
    addr_a: Ipv4Addr,
    addr_b: Ipv4Addr,
    subnet: Ipv4Network,
}

struct DeviceEntry {
    kind: DeviceKind,
    position: netsim_proto::PositionHint,
    default_gateway: Option<Ipv4Addr>,
    failures: Vec<FailureKind>,
    next_iface_idx: u32,
    /// Indices freed by `remove_link_inner`, reused by `next_iface_name`
    /// before `next_iface_idx` is advanced again.
    freed_iface_idx: BTreeSet<u32>,
    bridge_name: Option<String>,
}

/// Owns every sub-manager and the device/link graph above them. Individual
/// devices are locked independently so that unrelated devices can be
/// mutated concurrently; any operation spanning two devices (links) takes
/// both locks in sorted-name order to avoid deadlock.
pub struct Topology {
    namespaces: Mutex<NamespaceManager>,
    links: Mutex<LinkManager>,
    registry: Mutex<AddressRegistry>,
    subnets: Mutex<SubnetAllocator>,
    /// `RwLock`, not `Mutex`: `write`/`resize`/`recv_output` only need `&self`
    /// on the manager and must run concurrently with each other (in
    /// particular, a `recv_output` can sit on a read lock indefinitely
    /// pumping terminal output without starving writes to other sessions).
    /// Only `open`/`close*` need the write lock, and both are brief.
    pty: RwLock<PtyManager>,
    /// Pending grace-period close tasks, keyed by session. A reconnect
    /// cancels the matching `Notify` before the grace period elapses;
    /// otherwise the spawned task closes the session itself.
    pty_close_timers: Mutex<HashMap<crate::pty::SessionId, Arc<Notify>>>,
    observer: Mutex<Observer>,
    devices: RwLock<HashMap<String, DeviceEntry>>,
    link_entries: RwLock<HashMap<LinkId, LinkEntry>>,
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    pub fn new() -> Self {
        Self {
            namespaces: Mutex::new(NamespaceManager::new()),
            links: Mutex::new(LinkManager::new()),
            registry: Mutex::new(AddressRegistry::new()),
            subnets: Mutex::new(SubnetAllocator::new()),
            pty: RwLock::new(PtyManager::new()),
            pty_close_timers: Mutex::new(HashMap::new()),
            observer: Mutex::new(Observer::new()),
            devices: RwLock::new(HashMap::new()),
            link_entries: RwLock::new(HashMap::new()),
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn subscribe_packets(&self) -> broadcast::Receiver<PacketEvent> {
        self.observer.lock().await.subscribe()
    }

    async fn device_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.device_locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Creates the namespace, pre-spawns its primary PTY session, and
    /// records the device. If `addr` is given, the device's first interface
    /// is created and addressed immediately via the same `assign_address`
    /// path `add_link` uses; otherwise addressing is deferred until the
    /// device is first linked. Any other interface and its Observer are
    /// still attached lazily by `add_link`.
    pub async fn add_device(
        &self,
        name: &str,
        kind: DeviceKind,
        position: Option<netsim_proto::PositionHint>,
        addr: Option<Ipv4Addr>,
        prefix: Option<u8>,
    ) -> Result<(), EmulatorError> {
        {
            let devices = self.devices.read().await;
            if devices.contains_key(name) {
                return Err(EmulatorError::AlreadyExists(name.to_string()));
            }
        }
        let guard = self.device_lock(name).await;
        let _permit = guard.lock().await;

        self.namespaces.lock().await.create(name, kind).await?;

        let bridge_name = if kind.owns_bridge() {
            let bridge = format!("br-{name}");
            if let Err(e) = self.links.lock().await.create_bridge(name, &bridge).await {
                let mut reg = self.registry.lock().await;
                let _ = self.namespaces.lock().await.destroy(name, &mut reg).await;
                return Err(e.into());
            }
            Some(bridge)
        } else {
            None
        };

        self.pty
            .write()
            .await
            .open(name, PRIMARY_TERMINAL_CHANNEL, 24, 80)
            .await?;

        self.devices.write().await.insert(
            name.to_string(),
            DeviceEntry {
                kind,
                position: position.unwrap_or_default(),
                default_gateway: None,
                failures: Vec::new(),
                next_iface_idx: 0,
                freed_iface_idx: BTreeSet::new(),
                bridge_name,
            },
        );

        if let Some(addr) = addr {
            let iface = {
                let mut devices = self.devices.write().await;
                Self::next_iface_name(devices.get_mut(name).unwrap())
            };
            if let Err(e) = self.provision_initial_address(name, &iface, addr, prefix.unwrap_or(24)).await {
                self.devices.write().await.remove(name);
                self.device_locks.lock().await.remove(name);
                let mut reg = self.registry.lock().await;
                let _ = self.namespaces.lock().await.destroy(name, &mut reg).await;
                return Err(e);
            }
        }

        info!(device = name, ?kind, "device added");
        Ok(())
    }

    async fn provision_initial_address(
        &self,
        device: &str,
        iface: &str,
        addr: Ipv4Addr,
        prefix: u8,
    ) -> Result<(), EmulatorError> {
        self.namespaces.lock().await.register_interface(device, iface)?;
        let mut registry = self.registry.lock().await;
        self.namespaces
            .lock()
            .await
            .assign_address(device, iface, addr, prefix, &mut registry)
            .await?;
        Ok(())
    }

    /// Teardown ordering: links touching the device, then its PTY sessions,
    /// then its Packet Observers, then the namespace itself. Idempotent.
    pub async fn remove_device(&self, name: &str) -> Result<(), EmulatorError> {
        let guard = self.device_lock(name).await;
        let _permit = guard.lock().await;

        if !self.devices.read().await.contains_key(name) {
            return Ok(());
        }

        let link_ids: Vec<LinkId> = {
            let entries = self.link_entries.read().await;
            entries
                .iter()
                .filter(|(_, e)| e.endpoint_a.device == name || e.endpoint_b.device == name)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in link_ids {
            self.remove_link_inner(id).await;
        }

        self.pty.write().await.close_all_for_device(name).await;
        self.observer.lock().await.stop_all_for_device(name).await;

        let mut reg = self.registry.lock().await;
        self.namespaces.lock().await.destroy(name, &mut reg).await?;
        self.devices.write().await.remove(name);
        self.device_locks.lock().await.remove(name);
        info!(device = name, "device removed");
        Ok(())
    }

    fn next_iface_name(entry: &mut DeviceEntry) -> String {
        if let Some(&idx) = entry.freed_iface_idx.iter().next() {
            entry.freed_iface_idx.remove(&idx);
            return format!("eth{idx}");
        }
        let idx = entry.next_iface_idx;
        entry.next_iface_idx += 1;
        format!("eth{idx}")
    }

    /// Returns an `ethN` interface index to the free list for `next_iface_name`
    /// to reuse. Non-`ethN` names (e.g. a switch's own bridge) are ignored.
    fn release_iface_idx(entry: &mut DeviceEntry, iface: &str) {
        if let Some(idx) = iface.strip_prefix("eth").and_then(|s| s.parse::<u32>().ok()) {
            entry.freed_iface_idx.insert(idx);
        }
    }

    /// Materializes a link between two devices. When either endpoint is a
    /// switch, the veth lands on that switch's bridge instead of becoming a
    /// second plain peer (per-device-namespace-owns-bridge model).
    pub async fn add_link(
        &self,
        device_a: &str,
        device_b: &str,
        shaping: ShapingParams,
    ) -> Result<LinkId, EmulatorError> {
        if device_a == device_b {
            return Err(EmulatorError::InvalidArgument(
                "a link cannot join a device to itself".to_string(),
            ));
        }
        let (first, second) = if device_a < device_b {
            (device_a, device_b)
        } else {
            (device_b, device_a)
        };
        let lock_a = self.device_lock(first).await;
        let lock_b = self.device_lock(second).await;
        let _permit_a = lock_a.lock().await;
        let _permit_b = lock_b.lock().await;

        let switch_side = {
            let devices = self.devices.read().await;
            let a = devices
                .get(device_a)
                .ok_or_else(|| EmulatorError::NotFound(device_a.to_string()))?;
            let b = devices
                .get(device_b)
                .ok_or_else(|| EmulatorError::NotFound(device_b.to_string()))?;
            match (a.kind.owns_bridge(), b.kind.owns_bridge()) {
                (true, true) => {
                    return Err(EmulatorError::InvalidArgument(
                        "cannot link two switches directly".to_string(),
                    ))
                }
                (true, false) => Some(device_a.to_string()),
                (false, true) => Some(device_b.to_string()),
                (false, false) => None,
            }
        };

        let (iface_a, iface_b) = {
            let mut devices = self.devices.write().await;
            let iface_a = Self::next_iface_name(devices.get_mut(device_a).unwrap());
            let iface_b = Self::next_iface_name(devices.get_mut(device_b).unwrap());
            (iface_a, iface_b)
        };

        let (network, addr_a, addr_b) = self.subnets.lock().await.allocate()?;

        self.namespaces
            .lock()
            .await
            .register_interface(device_a, &iface_a)?;
        self.namespaces
            .lock()
            .await
            .register_interface(device_b, &iface_b)?;

        let op = async {
            let id = match &switch_side {
                Some(switch_dev) if switch_dev == device_a => {
                    let bridge = self.bridge_name(device_a).await?;
                    self.links
                        .lock()
                        .await
                        .create_switched(device_a, &bridge, device_b, &iface_b, shaping)
                        .await?
                }
                Some(switch_dev) if switch_dev == device_b => {
                    let bridge = self.bridge_name(device_b).await?;
                    self.links
                        .lock()
                        .await
                        .create_switched(device_b, &bridge, device_a, &iface_a, shaping)
                        .await?
                }
                _ => {
                    self.links
                        .lock()
                        .await
                        .create_p2p(device_a, &iface_a, device_b, &iface_b, shaping, shaping)
                        .await?
                }
            };
            Ok::<LinkId, EmulatorError>(id)
        };
        let id = match timeout(DEFAULT_OP_TIMEOUT, op).await {
            Ok(result) => result?,
            Err(_) => return Err(EmulatorError::Timeout(DEFAULT_OP_TIMEOUT)),
        };

        let mut registry = self.registry.lock().await;
        self.namespaces
            .lock()
            .await
            .assign_address(device_a, &iface_a, addr_a, 24, &mut registry)
            .await?;
        self.namespaces
            .lock()
            .await
            .assign_address(device_b, &iface_b, addr_b, 24, &mut registry)
            .await?;
        drop(registry);

        self.namespaces
            .lock()
            .await
            .set_link_state(device_a, &iface_a, true)
            .await?;
        self.namespaces
            .lock()
            .await
            .set_link_state(device_b, &iface_b, true)
            .await?;

        if let Err(e) = self.observer.lock().await.start(device_a, &iface_a) {
            warn!(device = device_a, iface = %iface_a, %e, "failed to start observer");
        }
        if let Err(e) = self.observer.lock().await.start(device_b, &iface_b) {
            warn!(device = device_b, iface = %iface_b, %e, "failed to start observer");
        }

        self.link_entries.write().await.insert(
            id,
            LinkEntry {
                endpoint_a: LinkEndpoint {
                    device: device_a.to_string(),
                    interface: iface_a,
                },
                endpoint_b: LinkEndpoint {
                    device: device_b.to_string(),
                    interface: iface_b,
                },
                shaping_a: shaping,
                shaping_b: shaping,
                addr_a,
                addr_b,
                subnet: network,
            },
        );
        info!(link = %id, a = device_a, b = device_b, "link added");
        Ok(id)
    }

    async fn bridge_name(&self, device: &str) -> Result<String, EmulatorError> {
        self.devices
            .read()
            .await
            .get(device)
            .and_then(|d| d.bridge_name.clone())
            .ok_or_else(|| EmulatorError::Internal {
                correlation_id: "bridge-lookup".to_string(),
                message: format!("{device} has no bridge"),
            })
    }

    pub async fn remove_link(&self, id: LinkId) -> Result<(), EmulatorError> {
        if !self.link_entries.read().await.contains_key(&id) {
            return Err(EmulatorError::NotFound(id.to_string()));
        }
        self.remove_link_inner(id).await;
        Ok(())
    }

    /// Tears the link down and, per SPEC_FULL §8's round-trip law, undoes
    /// every side effect `add_link` accrued: the interfaces are dropped from
    /// `NamespaceManager`, their address reserved in the registry is
    /// released, their subnet is returned to the allocator's free list, and
    /// each device's interface-index counter is rewound so the next
    /// `add_link` reuses the same `ethN` name.
    async fn remove_link_inner(&self, id: LinkId) {
        let entry = self.link_entries.write().await.remove(&id);
        let Some(entry) = entry else { return };
        self.observer
            .lock()
            .await
            .stop(&entry.endpoint_a.device, &entry.endpoint_a.interface);
        self.observer
            .lock()
            .await
            .stop(&entry.endpoint_b.device, &entry.endpoint_b.interface);
        self.links.lock().await.destroy(id).await;

        {
            let mut namespaces = self.namespaces.lock().await;
            namespaces.deregister_interface(&entry.endpoint_a.device, &entry.endpoint_a.interface);
            namespaces.deregister_interface(&entry.endpoint_b.device, &entry.endpoint_b.interface);
        }

        let mut registry = self.registry.lock().await;
        registry.release(entry.addr_a);
        registry.release(entry.addr_b);
        drop(registry);

        self.subnets.lock().await.release(entry.subnet);

        {
            let mut devices = self.devices.write().await;
            if let Some(d) = devices.get_mut(&entry.endpoint_a.device) {
                Self::release_iface_idx(d, &entry.endpoint_a.interface);
            }
            if let Some(d) = devices.get_mut(&entry.endpoint_b.device) {
                Self::release_iface_idx(d, &entry.endpoint_b.interface);
            }
        }

        info!(link = %id, "link removed");
    }

    /// Fails with `InvalidArgument` if `gw` doesn't fall inside any of the
    /// device's assigned interface subnets.
    pub async fn set_gateway(&self, device: &str, gw: Ipv4Addr) -> Result<(), EmulatorError> {
        let interfaces = self.namespaces.lock().await.inspect(device)?;
        let reachable = interfaces.iter().any(|i| {
            i.address
                .map(|net| net.contains(gw))
                .unwrap_or(false)
        });
        if !reachable {
            return Err(EmulatorError::InvalidArgument(format!(
                "gateway {gw} is not reachable from any interface on {device}"
            )));
        }
        self.namespaces.lock().await.set_default_gateway(device, gw).await?;
        if let Some(entry) = self.devices.write().await.get_mut(device) {
            entry.default_gateway = Some(gw);
        }
        Ok(())
    }

    /// Applies one of the six kernel-realized failure verbs. Idempotent per
    /// `FailureKind::discriminant_key`: re-injecting replaces parameters.
    pub async fn inject_failure(
        &self,
        device: &str,
        failure: FailureKind,
    ) -> Result<(), EmulatorError> {
        if !self.devices.read().await.contains_key(device) {
            return Err(EmulatorError::NotFound(device.to_string()));
        }
        match &failure {
            FailureKind::InterfaceDown { iface } => {
                self.namespaces
                    .lock()
                    .await
                    .set_link_state(device, &iface.0, false)
                    .await?;
            }
            FailureKind::BlockIcmp => {
                apply_icmp_drop_rule(device, "icmp", None).await?;
            }
            FailureKind::SilentRouter => {
                apply_icmp_drop_rule(device, "icmp", Some("time-exceeded")).await?;
                apply_icmp_drop_rule(device, "icmp", Some("host-prohibited")).await?;
            }
            FailureKind::PacketLoss { iface, pct } => {
                self.apply_shaping_failure(
                    device,
                    &iface.0,
                    ShapingParams {
                        loss_pct: Some(*pct),
                        ..Default::default()
                    },
                )
                .await?;
            }
            FailureKind::Latency { iface, ms } => {
                self.apply_shaping_failure(
                    device,
                    &iface.0,
                    ShapingParams {
                        latency_ms: Some(*ms),
                        ..Default::default()
                    },
                )
                .await?;
            }
            FailureKind::BandwidthLimit { iface, mbps } => {
                self.apply_shaping_failure(
                    device,
                    &iface.0,
                    ShapingParams {
                        bandwidth_mbps: Some(*mbps),
                        ..Default::default()
                    },
                )
                .await?;
            }
        }

        let mut devices = self.devices.write().await;
        if let Some(entry) = devices.get_mut(device) {
            entry
                .failures
                .retain(|f| f.discriminant_key() != failure.discriminant_key());
            entry.failures.push(failure);
        }
        Ok(())
    }

    pub async fn clear_failure(
        &self,
        device: &str,
        key: (&'static str, Option<&str>),
    ) -> Result<(), EmulatorError> {
        let removed = {
            let mut devices = self.devices.write().await;
            let entry = devices
                .get_mut(device)
                .ok_or_else(|| EmulatorError::NotFound(device.to_string()))?;
            let before = entry.failures.len();
            entry.failures.retain(|f| f.discriminant_key() != key);
            before != entry.failures.len()
        };
        if !removed {
            return Ok(());
        }
        match key {
            ("interface_down", Some(iface)) => {
                self.namespaces
                    .lock()
                    .await
                    .set_link_state(device, iface, true)
                    .await?;
            }
            ("block_icmp", None) | ("silent_router", None) => {
                clear_icmp_drop_rules(device).await?;
            }
            ("packet_loss", Some(iface))
            | ("latency", Some(iface))
            | ("bandwidth_limit", Some(iface)) => {
                self.apply_shaping_failure(device, iface, ShapingParams::default())
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn apply_shaping_failure(
        &self,
        device: &str,
        iface: &str,
        params: ShapingParams,
    ) -> Result<(), EmulatorError> {
        let id = {
            let entries = self.link_entries.read().await;
            entries
                .iter()
                .find(|(_, e)| {
                    (e.endpoint_a.device == device && e.endpoint_a.interface == iface)
                        || (e.endpoint_b.device == device && e.endpoint_b.interface == iface)
                })
                .map(|(id, e)| {
                    let side_a = e.endpoint_a.device == device && e.endpoint_a.interface == iface;
                    (*id, side_a)
                })
        };
        let Some((id, side_a)) = id else {
            return Err(EmulatorError::NotFound(format!("{device}:{iface}")));
        };
        self.links.lock().await.update_shaping(id, side_a, params).await?;
        Ok(())
    }

    pub async fn inspect(&self, device: &str) -> Result<Device, EmulatorError> {
        let interfaces = self.namespaces.lock().await.inspect(device)?;
        let routes = self.namespaces.lock().await.routes(device).await?;
        let arp = self.namespaces.lock().await.arp(device).await?;
        let devices = self.devices.read().await;
        let entry = devices
            .get(device)
            .ok_or_else(|| EmulatorError::NotFound(device.to_string()))?;
        Ok(Device {
            name: device.to_string(),
            kind: entry.kind,
            interfaces,
            routes,
            arp,
            forwarding: self.namespaces.lock().await.forwarding(device)?,
            default_gateway: entry.default_gateway,
            failures: entry.failures.iter().cloned().map(|kind| Failure { kind }).collect(),
            position: entry.position,
        })
    }

    pub async fn snapshot(&self) -> Result<SnapshotResponse, EmulatorError> {
        let names: Vec<String> = self.devices.read().await.keys().cloned().collect();
        let mut devices = Vec::with_capacity(names.len());
        for name in &names {
            devices.push(self.inspect(name).await?);
        }
        let links = self
            .link_entries
            .read()
            .await
            .iter()
            .map(|(id, e)| Link {
                id: *id,
                a: e.endpoint_a.clone(),
                b: e.endpoint_b.clone(),
                shaping_a: e.shaping_a,
                shaping_b: e.shaping_b,
            })
            .collect();
        Ok(SnapshotResponse { devices, links })
    }

    /// Spawns a transient, non-interactive command inside the device's
    /// namespace and captures its output; distinct from the PTY surface,
    /// which is interactive and long-lived.
    pub async fn exec_command(
        &self,
        device: &str,
        argv: &[String],
    ) -> Result<CommandExecResponse, EmulatorError> {
        if argv.is_empty() {
            return Err(EmulatorError::InvalidArgument("argv must not be empty".to_string()));
        }
        if !self.devices.read().await.contains_key(device) {
            return Err(EmulatorError::NotFound(device.to_string()));
        }
        let mut cmd = Command::new("ip");
        cmd.args(["netns", "exec", device])
            .args(argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = cmd
            .output()
            .await
            .map_err(|e| EmulatorError::internal(e.to_string()))?;
        Ok(CommandExecResponse {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    pub async fn pty_write(&self, device: &str, channel: &str, bytes: &[u8]) -> Result<(), EmulatorError> {
        let id = crate::pty::SessionId {
            device: device.to_string(),
            channel_id: channel.to_string(),
        };
        self.pty.read().await.write(&id, bytes).await?;
        Ok(())
    }

    pub async fn pty_resize(&self, device: &str, channel: &str, rows: u16, cols: u16) -> Result<(), EmulatorError> {
        let id = crate::pty::SessionId {
            device: device.to_string(),
            channel_id: channel.to_string(),
        };
        self.pty.read().await.resize(&id, rows, cols).await?;
        Ok(())
    }

    /// Blocks until the next output chunk from the child, or `None` once the
    /// session has closed. Takes only a read lock on the PTY manager, so it
    /// never starves writes/resizes to other sessions while it waits.
    pub async fn pty_recv_output(
        &self,
        device: &str,
        channel: &str,
    ) -> Result<Option<Vec<u8>>, EmulatorError> {
        let id = crate::pty::SessionId {
            device: device.to_string(),
            channel_id: channel.to_string(),
        };
        Ok(self.pty.read().await.recv_output(&id).await?)
    }

    pub fn primary_terminal_channel(&self) -> &'static str {
        PRIMARY_TERMINAL_CHANNEL
    }

    /// Opens `device`'s `channel` terminal session if it isn't already
    /// running, so a reconnect within the grace period attaches to the
    /// existing session instead of spawning a second shell.
    pub async fn pty_ensure_open(&self, device: &str, channel: &str) -> Result<(), EmulatorError> {
        let id = crate::pty::SessionId {
            device: device.to_string(),
            channel_id: channel.to_string(),
        };
        let mut pty = self.pty.write().await;
        if !pty.exists(&id) {
            pty.open(device, channel, DEFAULT_TERMINAL_ROWS, DEFAULT_TERMINAL_COLS)
                .await?;
        }
        Ok(())
    }

    /// Cancels any pending grace-period close for `device`/`channel`, for a
    /// client reattaching before the timer fires.
    pub async fn pty_cancel_grace_close(&self, device: &str, channel: &str) {
        let id = crate::pty::SessionId {
            device: device.to_string(),
            channel_id: channel.to_string(),
        };
        if let Some(notify) = self.pty_close_timers.lock().await.remove(&id) {
            notify.notify_one();
        }
    }

    /// Schedules `device`/`channel` to be closed after `PTY_GRACE_PERIOD`
    /// unless `pty_cancel_grace_close` fires first. An associated function
    /// rather than a `&self` method: the spawned task must own an
    /// `Arc<Topology>` to outlive the websocket handler that triggered it.
    pub fn pty_schedule_grace_close(topo: Arc<Topology>, device: String, channel: String) {
        let id = crate::pty::SessionId {
            device: device.clone(),
            channel_id: channel.clone(),
        };
        let notify = Arc::new(Notify::new());
        tokio::spawn(async move {
            topo.pty_close_timers
                .lock()
                .await
                .insert(id.clone(), notify.clone());

            tokio::select! {
                _ = notify.notified() => {
                    debug!(device = %device, channel = %channel, "pty grace-close cancelled by reconnect");
                }
                _ = sleep(PTY_GRACE_PERIOD) => {
                    let mut timers = topo.pty_close_timers.lock().await;
                    let still_current = matches!(timers.get(&id), Some(current) if Arc::ptr_eq(current, &notify));
                    if still_current {
                        timers.remove(&id);
                        drop(timers);
                        if let Err(e) = topo.pty.write().await.close(&id).await {
                            warn!(device = %device, channel = %channel, %e, "error closing pty session after grace period");
                        } else {
                            info!(device = %device, channel = %channel, "pty session closed after grace period");
                        }
                    }
                }
            }
        });
    }

    /// Tears down every device in arbitrary order (each call already
    /// enforces links -> PTY -> observers -> namespace internally). Driven
    /// by an explicit control-plane call or by process shutdown signal
    /// handling in the binary entry point.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.devices.read().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.remove_device(&name).await {
                warn!(device = name, %e, "error during shutdown teardown");
            }
        }
        info!("topology shutdown complete");
    }
}

async fn run_iptables_ns(ns: &str, args: &[&str]) -> Result<std::process::Output, EmulatorError> {
    let mut full = vec!["netns", "exec", ns, "iptables"];
    full.extend_from_slice(args);
    Command::new("ip")
        .args(full)
        .output()
        .await
        .map_err(|e| EmulatorError::internal(e.to_string()))
}

const FAILURE_CHAIN: &str = "NETSIM_FAIL";

async fn ensure_failure_chain(ns: &str) -> Result<(), EmulatorError> {
    let _ = run_iptables_ns(ns, &["-N", FAILURE_CHAIN]).await;
    let check = run_iptables_ns(ns, &["-C", "OUTPUT", "-j", FAILURE_CHAIN]).await?;
    if !check.status.success() {
        let _ = run_iptables_ns(ns, &["-I", "OUTPUT", "-j", FAILURE_CHAIN]).await;
    }
    Ok(())
}

/// Appends (never replaces in place — callers clear first when needed) a
/// drop rule for ICMP, optionally scoped to an ICMP type name.
async fn apply_icmp_drop_rule(
    ns: &str,
    proto: &str,
    icmp_type: Option<&str>,
) -> Result<(), EmulatorError> {
    ensure_failure_chain(ns).await?;
    let mut args = vec!["-A", FAILURE_CHAIN, "-p", proto];
    if let Some(t) = icmp_type {
        args.extend_from_slice(&["--icmp-type", t]);
    }
    args.extend_from_slice(&["-j", "DROP"]);
    let out = run_iptables_ns(ns, &args).await?;
    if !out.status.success() {
        return Err(EmulatorError::internal(format!(
            "iptables rule install failed: {}",
            String::from_utf8_lossy(&out.stderr)
        )));
    }
    Ok(())
}

async fn clear_icmp_drop_rules(ns: &str) -> Result<(), EmulatorError> {
    let _ = run_iptables_ns(ns, &["-F", FAILURE_CHAIN]).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_link_rejects_self_loop() {
        let topo = Topology::new();
        let err = topo
            .add_link("h1", "h1", ShapingParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), netsim_proto::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn remove_device_unknown_is_noop() {
        let topo = Topology::new();
        topo.remove_device("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn inspect_unknown_device_not_found() {
        let topo = Topology::new();
        let err = topo.inspect("ghost").await.unwrap_err();
        assert_eq!(err.kind(), netsim_proto::ErrorKind::NotFound);
    }

    /// SPEC_FULL §8 round-trip law: add_device; remove_device returns the
    /// system to its prior state. Best-effort like the namespace/qdisc
    /// modules' own net-admin-tests: skips the assertion body (not the
    /// test) when the environment lacks CAP_NET_ADMIN.
    #[tokio::test]
    #[cfg(feature = "net-admin-tests")]
    async fn add_device_remove_device_round_trip() {
        let topo = Topology::new();
        if topo.add_device("nstopo0", DeviceKind::Host, None, None, None).await.is_ok() {
            assert!(topo.inspect("nstopo0").await.is_ok());
            topo.remove_device("nstopo0").await.unwrap();
            assert_eq!(
                topo.inspect("nstopo0").await.unwrap_err().kind(),
                netsim_proto::ErrorKind::NotFound
            );
        }
    }

    /// SPEC_FULL §8 round-trip law: add_link; remove_link returns the
    /// system to its prior state — the interface is actually deregistered
    /// (not just stale-but-unread), and a second add_link lands back on the
    /// same subnet and `ethN` name as the first.
    #[tokio::test]
    #[cfg(feature = "net-admin-tests")]
    async fn add_link_remove_link_rewinds_address_pool() {
        let topo = Topology::new();
        let setup = async {
            topo.add_device("nsa0", DeviceKind::Host, None, None, None).await?;
            topo.add_device("nsb0", DeviceKind::Host, None, None, None).await?;
            Ok::<(), EmulatorError>(())
        };
        if setup.await.is_err() {
            return;
        }
        let first = topo
            .add_link("nsa0", "nsb0", ShapingParams::default())
            .await
            .unwrap();
        let addr_before = topo.inspect("nsa0").await.unwrap().interfaces[0].address;
        topo.remove_link(first).await.unwrap();
        assert!(topo.inspect("nsa0").await.unwrap().interfaces.is_empty());
        let second = topo
            .add_link("nsa0", "nsb0", ShapingParams::default())
            .await
            .unwrap();
        let after = topo.inspect("nsa0").await.unwrap();
        assert_eq!(after.interfaces.len(), 1);
        assert_eq!(after.interfaces[0].name, "eth0");
        assert_eq!(addr_before, after.interfaces[0].address);
        topo.remove_link(second).await.unwrap();
        topo.remove_device("nsa0").await.unwrap();
        topo.remove_device("nsb0").await.unwrap();
    }

    /// SPEC_FULL §8 boundary: linking two switches directly is rejected
    /// regardless of kernel access, since the rejection happens before any
    /// kernel call is made.
    #[tokio::test]
    #[cfg(feature = "net-admin-tests")]
    async fn add_link_rejects_two_switches() {
        let topo = Topology::new();
        let setup = async {
            topo.add_device("sw-a", DeviceKind::Switch, None, None, None).await?;
            topo.add_device("sw-b", DeviceKind::Switch, None, None, None).await?;
            Ok::<(), EmulatorError>(())
        };
        if setup.await.is_err() {
            // Switches need a bridge created via `ip link add type bridge`;
            // without CAP_NET_ADMIN even add_device fails here, so the
            // rejection path this test targets can't be reached either.
            return;
        }
        let err = topo
            .add_link("sw-a", "sw-b", ShapingParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), netsim_proto::ErrorKind::InvalidArgument);
        topo.remove_device("sw-a").await.unwrap();
        topo.remove_device("sw-b").await.unwrap();
    }
}
