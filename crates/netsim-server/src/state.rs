use std::sync::Arc;

use netsim_core::Topology;

/// Shared application state handed to every axum handler. Cloning is cheap —
/// it only clones the `Arc`, never the topology itself.
#[derive(Clone)]
pub struct AppState {
    pub topology: Arc<Topology>,
}

impl AppState {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self { topology }
    }
}
