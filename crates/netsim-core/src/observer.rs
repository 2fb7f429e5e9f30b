//! Packet Observer: per-interface capture process, classified into
//! `PacketEvent`s and broadcast to every packet-channel subscriber.
//!
//! Grounded on the process-spawn-and-pump shape used throughout
//! `network-sim/src/qdisc.rs` and `network-sim/src/namespace.rs`
//! (`tokio::process::Command` output/piped-stdout), generalized here from a
//! one-shot command to a long-lived, restart-on-exit child driven by a
//! dedicated reader task, matching the "one driver activity per long-lived
//! subcomponent" shape the source tree uses for its qdisc scheduler.

use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;

use netsim_proto::{ErrorKind, L3Protocol, PacketEvent, PacketSubtag};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

const RESTART_BACKOFFS_MS: [u64; 3] = [100, 500, 2000];

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("interface not found: {0} on {1}")]
    InterfaceNotFound(String, String),

    #[error("already observing {0} on {1}")]
    AlreadyExists(String, String),

    #[error("capture process failed to start: {0}")]
    SpawnFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ObserverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ObserverError::InterfaceNotFound(..) => ErrorKind::NotFound,
            ObserverError::AlreadyExists(..) => ErrorKind::AlreadyExists,
            ObserverError::SpawnFailed(_) | ObserverError::Io(_) => ErrorKind::KernelError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    Running,
    Restarting,
    Failed,
}

struct ObserverHandle {
    state: ObserverState,
    malformed_count: u64,
    cancel: Arc<tokio::sync::Notify>,
}

/// Owns every `(device, interface)` capture and the single global fan-out
/// every packet subscriber attaches to. The fan-out holds no queue of its
/// own — lagging subscribers simply miss events, counted by the caller via
/// `broadcast::Receiver`'s `RecvError::Lagged`. `PacketEvent::seq` is left
/// unset here: it is meaningless without a subscriber to count relative to,
/// and is assigned per-connection by the Control Server as it frames events
/// onto each WebSocket.
pub struct Observer {
    tx: broadcast::Sender<PacketEvent>,
    handles: std::collections::HashMap<(String, String), ObserverHandle>,
}

impl Default for Observer {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            tx,
            handles: std::collections::HashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PacketEvent> {
        self.tx.subscribe()
    }

    /// Starts capture on `(device, iface)`. Idempotent only in the sense that
    /// calling twice for the same key is rejected, not silently merged —
    /// the Topology Manager is responsible for not double-attaching.
    pub fn start(&mut self, device: &str, iface: &str) -> Result<(), ObserverError> {
        let key = (device.to_string(), iface.to_string());
        if self.handles.contains_key(&key) {
            return Err(ObserverError::AlreadyExists(
                device.to_string(),
                iface.to_string(),
            ));
        }
        let cancel = Arc::new(tokio::sync::Notify::new());
        let tx = self.tx.clone();
        let task_cancel = cancel.clone();
        let device_owned = device.to_string();
        let iface_owned = iface.to_string();
        tokio::spawn(async move {
            run_with_restart(device_owned, iface_owned, tx, task_cancel).await;
        });
        self.handles.insert(
            key,
            ObserverHandle {
                state: ObserverState::Running,
                malformed_count: 0,
                cancel,
            },
        );
        Ok(())
    }

    /// Stops capture on `(device, iface)`; a no-op if none is running.
    pub fn stop(&mut self, device: &str, iface: &str) {
        let key = (device.to_string(), iface.to_string());
        if let Some(handle) = self.handles.remove(&key) {
            handle.cancel.notify_waiters();
        }
    }

    pub async fn stop_all_for_device(&mut self, device: &str) {
        let keys: Vec<_> = self
            .handles
            .keys()
            .filter(|(d, _)| d == device)
            .cloned()
            .collect();
        for (d, i) in keys {
            self.stop(&d, &i);
        }
    }

    pub fn state(&self, device: &str, iface: &str) -> Option<ObserverState> {
        self.handles
            .get(&(device.to_string(), iface.to_string()))
            .map(|h| h.state)
    }
}

/// Spawns the capture process, restarts it on unexpected exit up to three
/// times with the mandated backoff, then leaves the observer `failed`.
async fn run_with_restart(
    device: String,
    iface: String,
    tx: broadcast::Sender<PacketEvent>,
    cancel: Arc<tokio::sync::Notify>,
) {
    let mut attempt = 0usize;
    loop {
        let run = capture_once(&device, &iface, &tx, &cancel);
        tokio::select! {
            _ = cancel.notified() => {
                debug!(device, iface, "observer cancelled");
                return;
            }
            result = run => {
                match result {
                    Ok(()) => {
                        debug!(device, iface, "observer cancelled");
                        return;
                    }
                    Err(e) => {
                        warn!(device, iface, %e, "capture process exited unexpectedly");
                    }
                }
            }
        }
        if attempt >= RESTART_BACKOFFS_MS.len() {
            warn!(device, iface, "observer failed after 3 restart attempts, giving up");
            return;
        }
        sleep(Duration::from_millis(RESTART_BACKOFFS_MS[attempt])).await;
        attempt += 1;
    }
}

/// Runs one capture child to completion (or until cancelled), pumping its
/// stdout line-by-line into classified `PacketEvent`s. Returns `Ok(())` only
/// on an explicit, graceful exit — anything else is an error to the caller
/// so it can decide whether to restart.
async fn capture_once(
    device: &str,
    iface: &str,
    tx: &broadcast::Sender<PacketEvent>,
    cancel: &Arc<tokio::sync::Notify>,
) -> Result<(), ObserverError> {
    let mut child = spawn_capture(device, iface)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ObserverError::SpawnFailed("no stdout pipe".to_string()))?;
    let mut lines = BufReader::new(stdout).lines();
    let mut malformed = 0u64;

    loop {
        tokio::select! {
            _ = cancel.notified() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Ok(());
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        match parse_line(&raw, device, iface) {
                            Some(event) => {
                                let _ = tx.send(event);
                            }
                            None => {
                                malformed += 1;
                                debug!(device, iface, malformed, "unparseable capture line");
                            }
                        }
                    }
                    Ok(None) => {
                        let status = child.wait().await?;
                        if status.success() {
                            return Ok(());
                        }
                        return Err(ObserverError::SpawnFailed(format!(
                            "capture process exited with {status}"
                        )));
                    }
                    Err(e) => return Err(ObserverError::Io(e)),
                }
            }
        }
    }
}

fn spawn_capture(device: &str, iface: &str) -> Result<Child, ObserverError> {
    Command::new("ip")
        .args([
            "netns", "exec", device, "tcpdump", "-l", "-n", "-tt", "-e", "-i", iface, "-Q", "in",
            "not", "port", "22",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ObserverError::SpawnFailed(e.to_string()))
}

/// Parses one `tcpdump -tt -n -e` line into a classified event. Best-effort:
/// any line that doesn't match a recognized shape yields `None` rather than
/// panicking.
fn parse_line(line: &str, device: &str, iface: &str) -> Option<PacketEvent> {
    let mut fields = line.split_whitespace();
    let ts_raw = fields.next()?;
    let timestamp_us = parse_timestamp_us(ts_raw)?;
    let rest = &line[ts_raw.len()..];

    if rest.contains("ARP") {
        return parse_arp(rest, timestamp_us, device, iface);
    }
    if rest.contains("ICMP") {
        return parse_icmp(rest, timestamp_us, device, iface);
    }
    if let Some(event) = parse_tcp(rest, timestamp_us, device, iface) {
        return Some(event);
    }
    parse_udp(rest, timestamp_us, device, iface)
}

fn parse_timestamp_us(raw: &str) -> Option<u64> {
    let mut parts = raw.splitn(2, '.');
    let secs: u64 = parts.next()?.parse().ok()?;
    let frac = parts.next().unwrap_or("0");
    let micros: u64 = format!("{frac:0<6}")[..6].parse().ok()?;
    Some(secs * 1_000_000 + micros)
}

fn parse_ip_port(token: &str) -> Option<(IpAddr, Option<u16>)> {
    let trimmed = token.trim_end_matches(':').trim_end_matches(',');
    if let Some(idx) = trimmed.rfind('.') {
        let (addr_part, port_part) = trimmed.split_at(idx);
        let port_part = &port_part[1..];
        if let Ok(addr) = addr_part.parse::<IpAddr>() {
            return Some((addr, port_part.parse().ok()));
        }
    }
    trimmed.parse::<IpAddr>().ok().map(|a| (a, None))
}

fn find_addr_pair(rest: &str) -> Option<((IpAddr, Option<u16>), (IpAddr, Option<u16>))> {
    let idx = rest.find(" > ")?;
    let (before, after) = rest.split_at(idx);
    let after = &after[3..];
    let src_token = before.split_whitespace().last()?;
    let dst_token = after.split_whitespace().next()?;
    Some((parse_ip_port(src_token)?, parse_ip_port(dst_token)?))
}

fn parse_icmp(rest: &str, timestamp_us: u64, device: &str, iface: &str) -> Option<PacketEvent> {
    let ((src, _), (dst, _)) = find_addr_pair(rest)?;
    let subtag = if rest.contains("echo request") {
        PacketSubtag::EchoRequest
    } else if rest.contains("echo reply") {
        PacketSubtag::EchoReply
    } else if rest.contains("time exceeded") {
        PacketSubtag::TimeExceeded
    } else if rest.contains("unreachable") {
        PacketSubtag::DestinationUnreachable
    } else {
        PacketSubtag::Generic
    };
    Some(PacketEvent {
        timestamp_us,
        device: device.to_string(),
        interface: iface.to_string(),
        protocol: L3Protocol::Icmp,
        src: Some(src),
        dst: Some(dst),
        src_port: None,
        dst_port: None,
        subtag,
        length: extract_length(rest).unwrap_or(0),
        ttl: extract_ttl(rest),
        seq: None,
    })
}

fn parse_tcp(rest: &str, timestamp_us: u64, device: &str, iface: &str) -> Option<PacketEvent> {
    if !rest.contains("Flags [") {
        return None;
    }
    let ((src, src_port), (dst, dst_port)) = find_addr_pair(rest)?;
    let flags_start = rest.find("Flags [")? + "Flags [".len();
    let flags_end = rest[flags_start..].find(']')? + flags_start;
    let flags = &rest[flags_start..flags_end];
    let subtag = if flags.contains('S') && flags.contains('.') {
        PacketSubtag::SynAck
    } else if flags.contains('S') {
        PacketSubtag::Syn
    } else if flags.contains('F') {
        PacketSubtag::Fin
    } else if flags.contains('R') {
        PacketSubtag::Rst
    } else {
        PacketSubtag::Ack
    };
    Some(PacketEvent {
        timestamp_us,
        device: device.to_string(),
        interface: iface.to_string(),
        protocol: L3Protocol::Tcp,
        src: Some(src),
        dst: Some(dst),
        src_port,
        dst_port,
        subtag,
        length: extract_length(rest).unwrap_or(0),
        ttl: extract_ttl(rest),
        seq: None,
    })
}

fn parse_udp(rest: &str, timestamp_us: u64, device: &str, iface: &str) -> Option<PacketEvent> {
    if !rest.contains("UDP") {
        return None;
    }
    let ((src, src_port), (dst, dst_port)) = find_addr_pair(rest)?;
    let subtag = match (src_port, dst_port) {
        (Some(53), _) => PacketSubtag::DnsResponse,
        (_, Some(53)) => PacketSubtag::DnsQuery,
        _ => PacketSubtag::Generic,
    };
    Some(PacketEvent {
        timestamp_us,
        device: device.to_string(),
        interface: iface.to_string(),
        protocol: L3Protocol::Udp,
        src: Some(src),
        dst: Some(dst),
        src_port,
        dst_port,
        subtag,
        length: extract_length(rest).unwrap_or(0),
        ttl: extract_ttl(rest),
        seq: None,
    })
}

fn parse_arp(rest: &str, timestamp_us: u64, device: &str, iface: &str) -> Option<PacketEvent> {
    let subtag = if rest.contains("Request") {
        PacketSubtag::ArpRequest
    } else {
        PacketSubtag::ArpReply
    };
    Some(PacketEvent {
        timestamp_us,
        device: device.to_string(),
        interface: iface.to_string(),
        protocol: L3Protocol::Arp,
        src: None,
        dst: None,
        src_port: None,
        dst_port: None,
        subtag,
        length: extract_length(rest).unwrap_or(0),
        ttl: None,
        seq: None,
    })
}

fn extract_length(rest: &str) -> Option<u32> {
    let idx = rest.find("length ")? + "length ".len();
    let tail = &rest[idx..];
    let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn extract_ttl(rest: &str) -> Option<u8> {
    let idx = rest.find("ttl ")? + "ttl ".len();
    let tail = &rest[idx..];
    let digits: String = tail
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_timestamp() {
        assert_eq!(parse_timestamp_us("1699999999.123456"), Some(1699999999123456));
        assert_eq!(parse_timestamp_us("1699999999.5"), Some(1699999999500000));
    }

    #[test]
    fn classifies_icmp_echo_request() {
        let line = "1699999999.123456 IP 10.0.1.1 > 10.0.1.2: ICMP echo request, id 1, seq 1, length 64, ttl 64";
        let event = parse_line(line, "h1", "eth0").expect("should parse");
        assert_eq!(event.protocol, L3Protocol::Icmp);
        assert_eq!(event.subtag, PacketSubtag::EchoRequest);
        assert_eq!(event.length, 64);
    }

    #[test]
    fn classifies_tcp_syn() {
        let line = "1699999999.000001 IP 10.0.1.1.5000 > 10.0.1.2.80: Flags [S], seq 1, length 0";
        let event = parse_line(line, "h1", "eth0").expect("should parse");
        assert_eq!(event.protocol, L3Protocol::Tcp);
        assert_eq!(event.subtag, PacketSubtag::Syn);
        assert_eq!(event.src_port, Some(5000));
        assert_eq!(event.dst_port, Some(80));
    }

    #[test]
    fn classifies_dns_query() {
        let line = "1699999999.000001 IP 10.0.1.1.40000 > 10.0.1.2.53: UDP, length 30";
        let event = parse_line(line, "h1", "eth0").expect("should parse");
        assert_eq!(event.protocol, L3Protocol::Udp);
        assert_eq!(event.subtag, PacketSubtag::DnsQuery);
    }

    #[test]
    fn malformed_line_does_not_panic() {
        assert!(parse_line("not a capture line at all", "h1", "eth0").is_none());
    }
}
