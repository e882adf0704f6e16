//! Port identities and path descriptors.
//!
//! A GID names one port on the fabric. It is a 128-bit value written in
//! IPv6 text form, which is also how the UDP control channel addresses a
//! node's CM endpoint.

use std::fmt;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};
use zerocopy::byteorder::{U16, U32};

use crate::wire::PathInfo;

/// Global port identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "Ipv6Addr", into = "Ipv6Addr")]
pub struct Gid(pub [u8; 16]);

impl Gid {
    pub const ZERO: Gid = Gid([0u8; 16]);

    pub fn as_ipv6(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.0)
    }
}

impl From<Ipv6Addr> for Gid {
    fn from(addr: Ipv6Addr) -> Self {
        Gid(addr.octets())
    }
}

impl From<Gid> for Ipv6Addr {
    fn from(gid: Gid) -> Self {
        gid.as_ipv6()
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ipv6())
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({})", self.as_ipv6())
    }
}

/// One direction of a route between two ports, as seen from the sender.
///
/// `sgid`/`slid` are always the side that owns this record. A record
/// received in a REQ or LAP is expressed from the requester's side and
/// must be [`reversed`](PathRecord::reversed) before the responder uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathRecord {
    pub sgid: Gid,
    pub dgid: Gid,
    pub slid: u16,
    pub dlid: u16,
    pub flow_label: u32,
    pub traffic_class: u8,
    pub hop_limit: u8,
    pub sl: u8,
    pub rate: u8,
    /// Log2 of the one-way packet lifetime in 4.096us units.
    pub packet_life_time: u8,
}

impl PathRecord {
    /// A link-local path with default QoS fields.
    pub fn between(sgid: Gid, dgid: Gid) -> Self {
        Self {
            sgid,
            dgid,
            slid: 0,
            dlid: 0,
            flow_label: 0,
            traffic_class: 0,
            hop_limit: 1,
            sl: 0,
            rate: 0,
            packet_life_time: 14,
        }
    }

    /// The same route seen from the other end.
    pub fn reversed(&self) -> Self {
        Self {
            sgid: self.dgid,
            dgid: self.sgid,
            slid: self.dlid,
            dlid: self.slid,
            ..*self
        }
    }

    /// Local ACK timeout the QP should use on this path: twice the packet
    /// lifetime, expressed in the same log2 encoding, capped at 31.
    pub fn local_ack_timeout(&self) -> u8 {
        (self.packet_life_time + 1).min(31)
    }

    pub fn to_wire(&self) -> PathInfo {
        PathInfo {
            local_lid: U16::new(self.slid),
            remote_lid: U16::new(self.dlid),
            local_gid: self.sgid.0,
            remote_gid: self.dgid.0,
            flow_label: U32::new(self.flow_label),
            traffic_class: self.traffic_class,
            hop_limit: self.hop_limit,
            sl: self.sl,
            rate: self.rate,
            packet_life_time: self.packet_life_time,
            subnet_local: u8::from(self.hop_limit <= 1),
            reserved: [0u8; 2],
        }
    }

    pub fn from_wire(info: &PathInfo) -> Self {
        Self {
            sgid: Gid(info.local_gid),
            dgid: Gid(info.remote_gid),
            slid: info.local_lid.get(),
            dlid: info.remote_lid.get(),
            flow_label: info.flow_label.get(),
            traffic_class: info.traffic_class,
            hop_limit: info.hop_limit,
            sl: info.sl,
            rate: info.rate,
            packet_life_time: info.packet_life_time,
        }
    }
}
