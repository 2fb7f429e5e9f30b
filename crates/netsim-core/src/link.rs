//! Link Manager: veth-pair creation, bridge attachment, and traffic shaping.
//!
//! Grounded on `netns-testbench/src/bench.rs`'s `LinkResources` (endpoints
//! tracked explicitly for robust reverse-order teardown) for the record
//! shape, composed from the `veth` and `qdisc` submodules.

use std::collections::HashMap;

use netsim_proto::{ErrorKind, LinkId, ShapingParams};
use thiserror::Error;
use tracing::info;

use crate::qdisc::{QdiscError, QdiscManager};
use crate::veth::{self, VethError, VethManager};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Veth(#[from] VethError),

    #[error(transparent)]
    Qdisc(#[from] QdiscError),

    #[error("link not found: {0}")]
    NotFound(LinkId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::Veth(e) => e.kind(),
            LinkError::Qdisc(e) => e.kind(),
            LinkError::NotFound(_) => ErrorKind::NotFound,
            LinkError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub device: String,
    pub iface: String,
}

/// Everything needed to tear a link down without re-deriving it, mirroring
/// `LinkResources` in the source tree.
struct LinkRecord {
    host_veth_name: String,
    a: Endpoint,
    b: Endpoint,
    shaping_a: ShapingParams,
    shaping_b: ShapingParams,
    /// `Some(bridge_ns)` when endpoint `a` is actually a switch bridge
    /// attachment rather than a plain p2p peer.
    switched: bool,
}

pub struct LinkManager {
    veth: VethManager,
    qdisc: QdiscManager,
    links: HashMap<LinkId, LinkRecord>,
    next_id: u64,
}

impl Default for LinkManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkManager {
    pub fn new() -> Self {
        Self {
            veth: VethManager::new(),
            qdisc: QdiscManager::new(),
            links: HashMap::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> LinkId {
        let id = LinkId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Materializes a veth pair between two plain namespace endpoints.
    /// Rolls back everything completed so far on any step failure.
    pub async fn create_p2p(
        &mut self,
        dev_a: &str,
        iface_a: &str,
        dev_b: &str,
        iface_b: &str,
        shaping_a: ShapingParams,
        shaping_b: ShapingParams,
    ) -> Result<LinkId, LinkError> {
        let host_name = veth::random_veth_name();
        let peer_name = veth::random_veth_name();

        self.veth.create_pair(&host_name, &peer_name).await?;

        if let Err(e) = self
            .veth
            .move_to_namespace(&host_name, dev_a, iface_a)
            .await
        {
            self.veth.delete_pair(&host_name).await;
            return Err(e.into());
        }
        if let Err(e) = self
            .veth
            .move_to_namespace(&peer_name, dev_b, iface_b)
            .await
        {
            self.veth.delete_pair(&peer_name).await;
            return Err(e.into());
        }
        if let Err(e) = self.veth.set_up(dev_a, iface_a).await {
            self.rollback_p2p(dev_a, iface_a, dev_b, iface_b).await;
            return Err(e.into());
        }
        if let Err(e) = self.veth.set_up(dev_b, iface_b).await {
            self.rollback_p2p(dev_a, iface_a, dev_b, iface_b).await;
            return Err(e.into());
        }

        if !shaping_a.is_noop() {
            if let Err(e) = self.qdisc.apply(dev_a, iface_a, &shaping_a).await {
                self.rollback_p2p(dev_a, iface_a, dev_b, iface_b).await;
                return Err(e.into());
            }
        }
        if !shaping_b.is_noop() {
            if let Err(e) = self.qdisc.apply(dev_b, iface_b, &shaping_b).await {
                self.rollback_p2p(dev_a, iface_a, dev_b, iface_b).await;
                return Err(e.into());
            }
        }

        let id = self.allocate_id();
        self.links.insert(
            id,
            LinkRecord {
                host_veth_name: host_name,
                a: Endpoint {
                    device: dev_a.to_string(),
                    iface: iface_a.to_string(),
                },
                b: Endpoint {
                    device: dev_b.to_string(),
                    iface: iface_b.to_string(),
                },
                shaping_a,
                shaping_b,
                switched: false,
            },
        );
        info!(link = %id, a = %dev_a, b = %dev_b, "link created");
        Ok(id)
    }

    /// Called once both veth ends have already been moved into `dev_a`'s
    /// and `dev_b`'s namespaces, so the pair is no longer reachable by an
    /// unqualified root-namespace `ip link del` — it has to be deleted by
    /// re-entering whichever namespace still owns an end.
    async fn rollback_p2p(&self, dev_a: &str, iface_a: &str, dev_b: &str, iface_b: &str) {
        let _ = self.qdisc.clear(dev_a, iface_a).await;
        let _ = self.qdisc.clear(dev_b, iface_b).await;
        self.veth.delete_pair_in_ns(dev_a, iface_a).await;
    }

    /// Creates one veth pair whose `bridge` end is attached to
    /// `bridge_dev`'s own bridge (per-device-namespace-owns-bridge model),
    /// and whose other end lands in `endpoint_dev`'s namespace.
    pub async fn create_switched(
        &mut self,
        bridge_dev: &str,
        bridge_name: &str,
        endpoint_dev: &str,
        endpoint_iface: &str,
        shaping: ShapingParams,
    ) -> Result<LinkId, LinkError> {
        let host_name = veth::random_veth_name();
        let peer_name = veth::random_veth_name();

        self.veth.create_pair(&host_name, &peer_name).await?;

        if let Err(e) = self
            .veth
            .move_to_namespace(&host_name, bridge_dev, &host_name)
            .await
        {
            self.veth.delete_pair(&host_name).await;
            return Err(e.into());
        }
        if let Err(e) = self
            .veth
            .attach_to_bridge(bridge_dev, bridge_name, &host_name)
            .await
        {
            self.veth.delete_pair(&host_name).await;
            return Err(e.into());
        }
        if let Err(e) = self
            .veth
            .move_to_namespace(&peer_name, endpoint_dev, endpoint_iface)
            .await
        {
            self.veth.delete_pair(&peer_name).await;
            return Err(e.into());
        }
        if let Err(e) = self.veth.set_up(endpoint_dev, endpoint_iface).await {
            self.veth.delete_pair(&host_name).await;
            return Err(e.into());
        }
        if !shaping.is_noop() {
            if let Err(e) = self.qdisc.apply(endpoint_dev, endpoint_iface, &shaping).await {
                self.veth.delete_pair(&host_name).await;
                return Err(e.into());
            }
        }

        let id = self.allocate_id();
        self.links.insert(
            id,
            LinkRecord {
                host_veth_name: host_name,
                a: Endpoint {
                    device: bridge_dev.to_string(),
                    iface: bridge_name.to_string(),
                },
                b: Endpoint {
                    device: endpoint_dev.to_string(),
                    iface: endpoint_iface.to_string(),
                },
                shaping_a: ShapingParams::default(),
                shaping_b: shaping,
                switched: true,
            },
        );
        info!(link = %id, bridge = %bridge_dev, endpoint = %endpoint_dev, "switched link created");
        Ok(id)
    }

    /// Replaces the qdisc on the given side (`true` = side A/bridge, `false`
    /// = side B/endpoint) rather than stacking.
    pub async fn update_shaping(
        &mut self,
        id: LinkId,
        side_a: bool,
        params: ShapingParams,
    ) -> Result<(), LinkError> {
        let record = self.links.get(&id).ok_or(LinkError::NotFound(id))?;
        let ep = if side_a { &record.a } else { &record.b };
        self.qdisc.apply(&ep.device, &ep.iface, &params).await?;
        let record = self.links.get_mut(&id).ok_or(LinkError::NotFound(id))?;
        if side_a {
            record.shaping_a = params;
        } else {
            record.shaping_b = params;
        }
        Ok(())
    }

    /// Idempotent: removing an already-removed link is a no-op.
    pub async fn destroy(&mut self, id: LinkId) {
        let Some(record) = self.links.remove(&id) else {
            return;
        };
        let _ = self.qdisc.clear(&record.a.device, &record.a.iface).await;
        let _ = self.qdisc.clear(&record.b.device, &record.b.iface).await;
        self.veth.delete_pair(&record.host_veth_name).await;
        info!(link = %id, "link destroyed");
    }

    pub async fn create_bridge(&self, ns: &str, name: &str) -> Result<(), LinkError> {
        Ok(self.veth.create_bridge(ns, name).await?)
    }

    pub async fn destroy_bridge(&self, ns: &str, name: &str) {
        self.veth.destroy_bridge(ns, name).await;
    }

    pub fn endpoints(&self, id: LinkId) -> Option<(Endpoint, Endpoint)> {
        self.links
            .get(&id)
            .map(|r| (r.a.clone(), r.b.clone()))
    }

    pub fn is_switched(&self, id: LinkId) -> bool {
        self.links.get(&id).map(|r| r.switched).unwrap_or(false)
    }

    pub fn ids(&self) -> Vec<LinkId> {
        self.links.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_id_increments() {
        let mut mgr = LinkManager::new();
        let a = mgr.allocate_id();
        let b = mgr.allocate_id();
        assert_ne!(a, b);
        assert_eq!(a.0 + 1, b.0);
    }

    #[tokio::test]
    async fn destroy_unknown_link_is_noop() {
        let mut mgr = LinkManager::new();
        mgr.destroy(LinkId(999)).await;
    }
}
