//! Orchestration core: namespace, link, PTY, packet-observer, and topology
//! management for the network emulator.

pub mod error;
pub mod link;
pub mod namespace;
pub mod observer;
pub mod pty;
pub mod qdisc;
pub mod registry;
pub mod subnet;
pub mod topology;
pub mod veth;

pub use error::EmulatorError;
pub use topology::Topology;
