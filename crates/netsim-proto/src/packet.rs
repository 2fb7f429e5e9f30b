use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum L3Protocol {
    Icmp,
    Tcp,
    Udp,
    Arp,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketSubtag {
    EchoRequest,
    EchoReply,
    TimeExceeded,
    DestinationUnreachable,
    Syn,
    SynAck,
    Ack,
    Fin,
    Rst,
    DnsQuery,
    DnsResponse,
    ArpRequest,
    ArpReply,
    Generic,
}

/// One classified capture record, published once to the global fan-out then
/// discarded. The server holds no history beyond the per-subscriber queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketEvent {
    pub timestamp_us: u64,
    pub device: String,
    pub interface: String,
    pub protocol: L3Protocol,
    pub src: Option<IpAddr>,
    pub dst: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub subtag: PacketSubtag,
    pub length: u32,
    pub ttl: Option<u8>,
    /// Monotonically increasing per-connection sequence number, assigned by
    /// the Control Server when framing onto the packet channel, not by the
    /// Observer itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}
