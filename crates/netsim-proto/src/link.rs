use serde::{Deserialize, Serialize};

/// Opaque stable link identifier, allocated at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub u64);

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Traffic-shaping parameters for one end of a link.
///
/// Maps directly onto `netem`/`tbf` semantics: latency -> `netem delay`,
/// loss -> `netem loss`, bandwidth -> `tbf rate`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapingParams {
    pub latency_ms: Option<u32>,
    pub loss_pct: Option<f32>,
    pub bandwidth_mbps: Option<u32>,
}

impl ShapingParams {
    pub fn is_noop(&self) -> bool {
        self.latency_ms.unwrap_or(0) == 0
            && self.loss_pct.unwrap_or(0.0) <= 0.0
            && self.bandwidth_mbps.is_none()
    }
}

/// Unordered pair identifying one endpoint of a link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkEndpoint {
    pub device: String,
    pub interface: String,
}

/// A realized link: exactly one veth pair, two endpoint namespaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    pub a: LinkEndpoint,
    pub b: LinkEndpoint,
    pub shaping_a: ShapingParams,
    pub shaping_b: ShapingParams,
}
