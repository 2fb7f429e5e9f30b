//! Control Server: JSON-over-HTTP request/response routes plus two
//! persistent WebSocket streaming routes.
//!
//! Grounded on `observability/src/server.rs`'s `MetricsServer`/
//! `ObservabilityConfig` — the source tree already depends on `axum` and
//! `tower-http` here, but `start()` is a stub ("TODO: Implement actual HTTP
//! server"); this crate finishes that wiring for the real control/streaming
//! surfaces instead of a metrics dashboard.

mod error;
mod http;
mod state;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use netsim_core::{EmulatorError, Topology};
use tower_http::cors::CorsLayer;
use tracing::info;

pub use state::AppState;

/// Builds the full router: request/response routes under no prefix, plus
/// the two streaming WebSocket routes.
pub fn router(topology: Arc<Topology>) -> Router {
    let state = AppState::new(topology);
    Router::new()
        .route("/devices", get(http::list_devices).post(http::add_device))
        .route("/devices/:name", get(http::get_device).delete(http::remove_device))
        .route("/devices/:name/gateway", post(http::set_gateway))
        .route("/devices/:name/exec", post(http::exec_command))
        .route("/devices/:name/failures", post(http::inject_failure))
        .route("/devices/:name/failures/:kind", axum::routing::delete(http::clear_failure))
        .route("/links", get(http::list_links).post(http::add_link))
        .route("/links/:id", axum::routing::delete(http::remove_link))
        .route("/snapshot", get(http::snapshot))
        .route("/ws/terminal/:device", get(ws::terminal_ws))
        .route("/ws/packets", get(ws::packets_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds and serves until the process receives a shutdown signal, then
/// drains the topology in teardown order before returning. Returns
/// `EmulatorError`, not `anyhow::Error`: `anyhow` is reserved for the CLI
/// boundary, and `netsim-cli`'s `cmd_serve` is where this gets converted.
pub async fn serve(addr: SocketAddr, topology: Arc<Topology>) -> Result<(), EmulatorError> {
    let app = router(topology.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| EmulatorError::internal(e.to_string()))?;
    info!(%addr, "control server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| EmulatorError::internal(e.to_string()))?;

    topology.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sig.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
