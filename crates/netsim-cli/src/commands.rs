//! CLI command implementations, split out from `main.rs` for unit testing.

use std::sync::Arc;

use anyhow::{Context, Result};
use netsim_core::Topology;
use tracing::info;

/// Implementation of the 'serve' command — runs the control server until a
/// shutdown signal arrives, tearing down every device in the topology first.
pub async fn cmd_serve(bind: &str) -> Result<()> {
    let addr = bind
        .parse()
        .with_context(|| format!("invalid bind address: {bind}"))?;
    let topology = Arc::new(Topology::new());
    info!(%bind, "starting network emulator control server");
    netsim_server::serve(addr, topology).await?;
    Ok(())
}

/// Implementation of the 'snapshot' command — fetches and pretty-prints the
/// topology snapshot from a running control server.
pub async fn cmd_snapshot(server: &str) -> Result<()> {
    let url = format!("{}/snapshot", server.trim_end_matches('/'));
    let resp = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach control server at {url}"))?
        .error_for_status()
        .context("control server returned an error status")?;
    let body: serde_json::Value = resp.json().await.context("malformed snapshot response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_reports_connection_failure() {
        // Nothing is listening on this port; the command should surface a
        // readable error rather than panicking.
        let result = cmd_snapshot("http://127.0.0.1:1").await;
        assert!(result.is_err());
    }
}
