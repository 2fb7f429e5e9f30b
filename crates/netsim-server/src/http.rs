//! JSON-over-HTTP request/response handlers: create/list/delete device and
//! link, gateway, failure injection, one-shot exec, and topology snapshot.

use std::net::Ipv4Addr;

use axum::extract::{Path, Query, State};
use axum::Json;
use netsim_proto::{
    AddDeviceRequest, AddLinkRequest, CommandExecResponse, Device, FailureKind, Link, LinkId,
    ShapingParams, SnapshotResponse,
};
use serde::{Deserialize, Serialize};

use crate::error::HttpResult;
use crate::state::AppState;

pub async fn list_devices(State(state): State<AppState>) -> HttpResult<Json<Vec<Device>>> {
    let snapshot = state.topology.snapshot().await?;
    Ok(Json(snapshot.devices))
}

pub async fn add_device(
    State(state): State<AppState>,
    Json(req): Json<AddDeviceRequest>,
) -> HttpResult<Json<Device>> {
    state
        .topology
        .add_device(&req.name, req.kind, req.position, req.addr, req.prefix)
        .await?;
    let device = state.topology.inspect(&req.name).await?;
    Ok(Json(device))
}

pub async fn get_device(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> HttpResult<Json<Device>> {
    let device = state.topology.inspect(&name).await?;
    Ok(Json(device))
}

pub async fn remove_device(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> HttpResult<()> {
    state.topology.remove_device(&name).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct SetGatewayRequest {
    pub gateway: Ipv4Addr,
}

pub async fn set_gateway(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SetGatewayRequest>,
) -> HttpResult<()> {
    state.topology.set_gateway(&name, req.gateway).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub argv: Vec<String>,
}

pub async fn exec_command(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<ExecRequest>,
) -> HttpResult<Json<CommandExecResponse>> {
    let resp = state.topology.exec_command(&name, &req.argv).await?;
    Ok(Json(resp))
}

pub async fn inject_failure(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(failure): Json<FailureKind>,
) -> HttpResult<()> {
    state.topology.inject_failure(&name, failure).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct ClearFailureQuery {
    #[serde(default)]
    pub iface: Option<String>,
}

/// `kind` is one of the `FailureKind::discriminant_key` tags
/// (`interface_down`, `block_icmp`, `silent_router`, `packet_loss`,
/// `latency`, `bandwidth_limit`); the interface-scoped kinds also require
/// `?iface=` on the query string.
pub async fn clear_failure(
    State(state): State<AppState>,
    Path((name, kind)): Path<(String, String)>,
    Query(q): Query<ClearFailureQuery>,
) -> HttpResult<()> {
    let key: (&'static str, Option<&str>) = match kind.as_str() {
        "interface_down" => ("interface_down", q.iface.as_deref()),
        "block_icmp" => ("block_icmp", None),
        "silent_router" => ("silent_router", None),
        "packet_loss" => ("packet_loss", q.iface.as_deref()),
        "latency" => ("latency", q.iface.as_deref()),
        "bandwidth_limit" => ("bandwidth_limit", q.iface.as_deref()),
        other => {
            return Err(netsim_core::EmulatorError::InvalidArgument(format!(
                "unknown failure kind: {other}"
            ))
            .into())
        }
    };
    state.topology.clear_failure(&name, key).await?;
    Ok(())
}

pub async fn list_links(State(state): State<AppState>) -> HttpResult<Json<Vec<Link>>> {
    let snapshot = state.topology.snapshot().await?;
    Ok(Json(snapshot.links))
}

pub async fn add_link(
    State(state): State<AppState>,
    Json(req): Json<AddLinkRequest>,
) -> HttpResult<Json<LinkIdResponse>> {
    let shaping = ShapingParams {
        latency_ms: req.latency_ms,
        loss_pct: req.loss_pct,
        bandwidth_mbps: req.bandwidth_mbps,
    };
    let id = state
        .topology
        .add_link(&req.device_a, &req.device_b, shaping)
        .await?;
    Ok(Json(LinkIdResponse { id }))
}

#[derive(Debug, Serialize)]
pub struct LinkIdResponse {
    pub id: LinkId,
}

pub async fn remove_link(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> HttpResult<()> {
    state.topology.remove_link(LinkId(id)).await?;
    Ok(())
}

pub async fn snapshot(State(state): State<AppState>) -> HttpResult<Json<SnapshotResponse>> {
    let snap = state.topology.snapshot().await?;
    Ok(Json(snap))
}
