//! The two persistent streaming surfaces: a terminal channel keyed by
//! device (one channel per PTY session) and a packet channel subscribing to
//! the global fan-out.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use netsim_proto::{TerminalClientFrame, TerminalServerFrame};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    channel: Option<String>,
}

pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    Path(device): Path<String>,
    Query(query): Query<TerminalQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let channel = query
        .channel
        .unwrap_or_else(|| state.topology.primary_terminal_channel().to_string());
    ws.on_upgrade(move |socket| handle_terminal(socket, state, device, channel))
}

/// Pumps bytes in both directions until either side closes. Client frames
/// are `{type: "input"|"resize", ...}` JSON text; server frames are raw
/// terminal bytes as binary, except the one out-of-band `closed` JSON text
/// frame sent just before the socket is dropped.
///
/// Connect cancels any pending grace-period close for this `device`/
/// `channel` and attaches to the existing session if one is still alive;
/// disconnect does not close the session immediately but schedules a
/// grace-period close, so a client that reconnects within the window
/// resumes the same shell instead of losing it.
async fn handle_terminal(socket: WebSocket, state: AppState, device: String, channel: String) {
    state.topology.pty_cancel_grace_close(&device, &channel).await;
    if let Err(e) = state.topology.pty_ensure_open(&device, &channel).await {
        warn!(device, channel, %e, "failed to open terminal session");
        return;
    }

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            client_msg = stream.next() => {
                match client_msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<TerminalClientFrame>(&text) {
                            Ok(TerminalClientFrame::Input { data }) => {
                                if let Err(e) = state.topology.pty_write(&device, &channel, data.as_bytes()).await {
                                    warn!(device, %e, "terminal write failed");
                                    break;
                                }
                            }
                            Ok(TerminalClientFrame::Resize { rows, cols }) => {
                                if let Err(e) = state.topology.pty_resize(&device, &channel, rows, cols).await {
                                    warn!(device, %e, "terminal resize failed");
                                }
                            }
                            Err(e) => debug!(device, %e, "ignoring malformed terminal client frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(device, %e, "terminal websocket error");
                        break;
                    }
                }
            }
            output = state.topology.pty_recv_output(&device, &channel) => {
                match output {
                    Ok(Some(bytes)) => {
                        if sink.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(device, %e, "terminal read failed");
                        break;
                    }
                }
            }
        }
    }

    let closed = TerminalServerFrame::Closed {
        reason: "session ended".to_string(),
    };
    if let Ok(text) = serde_json::to_string(&closed) {
        let _ = sink.send(Message::Text(text)).await;
    }

    netsim_core::Topology::pty_schedule_grace_close(state.topology.clone(), device, channel);
}

pub async fn packets_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_packets(socket, state))
}

/// One-way: the server pushes `PacketEvent` JSON objects as they arrive on
/// the global fan-out; any client traffic (e.g. a heartbeat) is drained and
/// ignored. Disconnect drops the subscriber immediately — there is no grace
/// period here, unlike the terminal channel.
async fn handle_packets(socket: WebSocket, state: AppState) {
    let mut rx = state.topology.subscribe_packets().await;
    let (mut sink, mut stream) = socket.split();
    // Assigned here, not read off the broadcast event: the Observer's
    // fan-out is shared by every subscriber, so its events carry no seq of
    // their own. Each connection counts its own delivered events from 0.
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            client_msg = stream.next() => {
                match client_msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(mut event) => {
                        event.seq = Some(seq);
                        seq += 1;
                        let sent = match serde_json::to_string(&event) {
                            Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
                            Err(e) => {
                                warn!(%e, "failed to serialize packet event");
                                true
                            }
                        };
                        if !sent {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "packet subscriber lagged, dropping to catch up");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
