use serde::{Deserialize, Serialize};

use crate::device::{Device, DeviceKind, PositionHint};
use crate::failure::FailureKind;
use crate::link::Link;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddDeviceRequest {
    pub name: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub position: Option<PositionHint>,
    /// Immediate address for the device's first interface. If omitted,
    /// addressing is deferred to whenever the device is first linked.
    #[serde(default)]
    pub addr: Option<std::net::Ipv4Addr>,
    /// Prefix length accompanying `addr`; ignored if `addr` is absent.
    #[serde(default)]
    pub prefix: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddLinkRequest {
    pub device_a: String,
    pub device_b: String,
    #[serde(default)]
    pub latency_ms: Option<u32>,
    #[serde(default)]
    pub bandwidth_mbps: Option<u32>,
    #[serde(default)]
    pub loss_pct: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectFailureRequest {
    pub device: String,
    pub failure: FailureKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandExecRequest {
    pub device: String,
    /// argv, taken verbatim — the server performs no shell parsing.
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandExecResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub devices: Vec<Device>,
    pub links: Vec<Link>,
}

/// Client -> server frames on the terminal WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalClientFrame {
    Input { data: String },
    Resize { rows: u16, cols: u16 },
}

/// Server -> client frames on the terminal WebSocket. Raw bytes are sent as
/// binary websocket frames out of band of this enum; `Closed` is the one
/// typed out-of-band control frame the server sends as JSON text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalServerFrame {
    Closed { reason: String },
}
