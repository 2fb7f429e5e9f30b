//! Data model and wire types shared between the control server and its clients.
//!
//! Kept deliberately free of any orchestration logic, the way `scenarios` is
//! kept free of namespace/veth manipulation in the source tree this crate is
//! descended from: every type here is `Serialize`/`Deserialize` and owns no
//! kernel resource.

pub mod device;
pub mod error;
pub mod failure;
pub mod link;
pub mod packet;
pub mod request;

pub use device::{ArpEntry, Device, DeviceKind, Interface, LinkState, PositionHint, RouteEntry};
pub use error::{ApiError, ErrorKind};
pub use failure::{Failure, FailureKind, InterfaceRef};
pub use link::{Link, LinkEndpoint, LinkId, ShapingParams};
pub use packet::{L3Protocol, PacketEvent, PacketSubtag};
pub use request::{
    AddDeviceRequest, AddLinkRequest, CommandExecRequest, CommandExecResponse,
    InjectFailureRequest, SnapshotResponse, TerminalClientFrame, TerminalServerFrame,
};
