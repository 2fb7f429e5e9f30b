//! Traffic-control qdisc application: netem (delay/loss) and tbf (rate).
//!
//! Grounded on `network-sim/src/qdisc.rs`'s `QdiscManager`, chosen over
//! `netns-testbench/src/qdisc.rs`'s rtnetlink-based `add_netem`/`add_tbf`
//! because those are admitted stubs ("TODO: Complete implementation with
//! proper netlink message encoding"), while `network-sim`'s
//! `configure_interface`/`configure_interface_in_ns` are complete,
//! `tc`-shelling, and exercised by its own test suite.

use netsim_proto::{ErrorKind, ShapingParams};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum QdiscError {
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("permission denied (requires CAP_NET_ADMIN)")]
    Permission,

    #[error("tc command failed: {0}")]
    CommandFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl QdiscError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QdiscError::InterfaceNotFound(_) => ErrorKind::NotFound,
            QdiscError::Permission => ErrorKind::Privilege,
            QdiscError::CommandFailed(_) | QdiscError::Io(_) => ErrorKind::KernelError,
        }
    }
}

/// Per-SPEC_FULL §4.2: latency -> `netem delay`, loss -> `netem loss`,
/// bandwidth -> `tbf rate Bmbit burst 32kbit latency 400ms` chained under
/// the netem root.
fn build_tc_args(iface: &str, params: &ShapingParams) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "qdisc".into(),
        "replace".into(),
        "dev".into(),
        iface.into(),
        "root".into(),
        "handle".into(),
        "10:".into(),
        "netem".into(),
    ];

    let delay_ms = params.latency_ms.unwrap_or(0);
    if delay_ms > 0 {
        args.push("delay".into());
        args.push(format!("{delay_ms}ms"));
    }

    let loss_pct = params.loss_pct.unwrap_or(0.0);
    if loss_pct > 0.0 {
        args.push("loss".into());
        args.push(format!("{loss_pct}%"));
    }

    args
}

pub struct QdiscManager;

impl Default for QdiscManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QdiscManager {
    pub fn new() -> Self {
        Self
    }

    async fn run_tc_in_ns(ns: &str, args: &[String]) -> Result<std::process::Output, QdiscError> {
        let mut full = vec!["netns".to_string(), "exec".to_string(), ns.to_string(), "tc".to_string()];
        full.extend(args.iter().cloned());
        debug!(?full, "ip");
        Ok(Command::new("ip").args(full).output().await?)
    }

    fn classify(out: &std::process::Output, iface: &str) -> QdiscError {
        let stderr = String::from_utf8_lossy(&out.stderr).to_string();
        if stderr.contains("Operation not permitted") {
            QdiscError::Permission
        } else if stderr.contains("Cannot find device") {
            QdiscError::InterfaceNotFound(iface.to_string())
        } else {
            QdiscError::CommandFailed(stderr)
        }
    }

    /// Installs (or replaces) the netem root qdisc and, if a bandwidth limit
    /// is requested, a chained tbf qdisc, on `iface` inside namespace `ns`.
    /// `replace` makes this idempotent — re-applying swaps parameters rather
    /// than stacking, satisfying the failure-injection idempotence law.
    pub async fn apply(
        &self,
        ns: &str,
        iface: &str,
        params: &ShapingParams,
    ) -> Result<(), QdiscError> {
        if params.is_noop() && params.bandwidth_mbps.is_none() {
            return self.clear(ns, iface).await;
        }

        info!(ns, iface, ?params, "applying shaping");
        let netem_args = build_tc_args(iface, params);
        let out = Self::run_tc_in_ns(ns, &netem_args).await?;
        if !out.status.success() {
            return Err(Self::classify(&out, iface));
        }

        if let Some(mbps) = params.bandwidth_mbps {
            let tbf_args: Vec<String> = vec![
                "qdisc".into(),
                "replace".into(),
                "dev".into(),
                iface.into(),
                "parent".into(),
                "10:1".into(),
                "handle".into(),
                "20:".into(),
                "tbf".into(),
                "rate".into(),
                format!("{mbps}mbit"),
                "burst".into(),
                "32kbit".into(),
                "latency".into(),
                "400ms".into(),
            ];
            let out = Self::run_tc_in_ns(ns, &tbf_args).await?;
            if !out.status.success() {
                return Err(Self::classify(&out, iface));
            }
        }

        Ok(())
    }

    /// Removes any qdisc configuration from the interface (best-effort).
    pub async fn clear(&self, ns: &str, iface: &str) -> Result<(), QdiscError> {
        let args = vec![
            "qdisc".to_string(),
            "del".to_string(),
            "dev".to_string(),
            iface.to_string(),
            "root".to_string(),
        ];
        let out = Self::run_tc_in_ns(ns, &args).await?;
        if !out.status.success() {
            debug!(ns, iface, "no qdisc to clear, or insufficient permission");
        }
        Ok(())
    }

    /// Heuristic capability probe, mirroring `has_net_admin()` in the source
    /// tree: used to skip kernel-touching tests instead of failing them.
    pub async fn has_net_admin(&self) -> bool {
        match Command::new("tc").args(["qdisc", "show"]).output().await {
            Ok(out) => out.status.success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_tc_args_includes_delay_and_loss() {
        let params = ShapingParams {
            latency_ms: Some(10),
            loss_pct: Some(5.0),
            bandwidth_mbps: None,
        };
        let args = build_tc_args("eth0", &params);
        assert!(args.contains(&"delay".to_string()));
        assert!(args.contains(&"10ms".to_string()));
        assert!(args.contains(&"loss".to_string()));
        assert!(args.contains(&"5%".to_string()));
    }

    #[test]
    fn build_tc_args_omits_zero_fields() {
        let params = ShapingParams::default();
        let args = build_tc_args("eth0", &params);
        assert!(!args.contains(&"delay".to_string()));
        assert!(!args.contains(&"loss".to_string()));
    }

    #[tokio::test]
    async fn noop_params_clear_instead_of_apply() {
        let qdisc = QdiscManager::new();
        if !qdisc.has_net_admin().await {
            eprintln!("skipping: requires CAP_NET_ADMIN");
            return;
        }
        let _ = qdisc.apply("nonexistent-ns", "eth0", &ShapingParams::default()).await;
    }
}
