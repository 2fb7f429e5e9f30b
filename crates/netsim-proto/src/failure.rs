use serde::{Deserialize, Serialize};

/// One of the six kernel-realized failure verbs.
///
/// At most one of each parametrized kind may be active per interface;
/// re-applying a kind replaces its parameters rather than stacking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    InterfaceDown { iface: InterfaceRef },
    BlockIcmp,
    SilentRouter,
    PacketLoss { iface: InterfaceRef, pct: f32 },
    Latency { iface: InterfaceRef, ms: u32 },
    BandwidthLimit { iface: InterfaceRef, mbps: u32 },
}

/// Newtype so interface names round-trip through JSON distinctly from
/// free-form strings elsewhere in the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterfaceRef(pub String);

impl FailureKind {
    /// Identity used for "at most one per parametrized kind per interface".
    pub fn discriminant_key(&self) -> (&'static str, Option<&str>) {
        match self {
            FailureKind::InterfaceDown { iface } => ("interface_down", Some(iface.0.as_str())),
            FailureKind::BlockIcmp => ("block_icmp", None),
            FailureKind::SilentRouter => ("silent_router", None),
            FailureKind::PacketLoss { iface, .. } => ("packet_loss", Some(iface.0.as_str())),
            FailureKind::Latency { iface, .. } => ("latency", Some(iface.0.as_str())),
            FailureKind::BandwidthLimit { iface, .. } => {
                ("bandwidth_limit", Some(iface.0.as_str()))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminant_key_distinguishes_per_interface() {
        let a = FailureKind::PacketLoss {
            iface: InterfaceRef("eth0".into()),
            pct: 50.0,
        };
        let b = FailureKind::PacketLoss {
            iface: InterfaceRef("eth1".into()),
            pct: 50.0,
        };
        assert_ne!(a.discriminant_key(), b.discriminant_key());
    }

    #[test]
    fn discriminant_key_ignores_parameters() {
        let a = FailureKind::Latency {
            iface: InterfaceRef("eth0".into()),
            ms: 10,
        };
        let b = FailureKind::Latency {
            iface: InterfaceRef("eth0".into()),
            ms: 50,
        };
        assert_eq!(a.discriminant_key(), b.discriminant_key());
    }
}
