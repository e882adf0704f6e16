//! rcmd — reliable-connection manager.
//!
//! The [`CmContext`] engine negotiates RC queue-pair connections with remote
//! nodes over an unreliable datagram channel. `udp` carries the datagrams
//! and `qp` provides an in-process queue-pair model for nodes without
//! hardware.

pub mod cm;
pub mod dispatch;
pub mod qp;
pub mod udp;

pub use cm::{AcceptParams, CmContext, CmError, ConnectParams};
pub use qp::SoftQp;
pub use udp::UdpTransport;
