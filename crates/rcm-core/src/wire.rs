//! CM wire format — on-wire types for every connection management message.
//!
//! Every CM datagram is exactly [`MAD_SIZE`] bytes: a 24-byte common
//! header followed by a 232-byte attribute body. The attribute id in the
//! header selects which body layout follows. Multi-byte integers are
//! big-endian.
//!
//! All types are #[repr(C, packed)] for deterministic layout and use
//! zerocopy derives for allocation-free serialization. There is no unsafe
//! code in this module.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub type Be16 = U16<BigEndian>;
pub type Be32 = U32<BigEndian>;
pub type Be64 = U64<BigEndian>;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Total size of every CM datagram.
pub const MAD_SIZE: usize = 256;

/// Size of the common header.
pub const HEADER_SIZE: usize = 24;

/// Size of every attribute body.
pub const BODY_SIZE: usize = MAD_SIZE - HEADER_SIZE;

pub const BASE_VERSION: u8 = 1;
pub const CM_MGMT_CLASS: u8 = 0x07;
pub const CM_CLASS_VERSION: u8 = 2;
pub const METHOD_SEND: u8 = 0x03;

/// Transport type carried in REQ. Only RC is negotiated by this manager.
pub const TRANSPORT_RC: u8 = 0;

/// REQ flag: the sender is also listening and may lose a collision.
pub const REQ_FLAG_PEER_TO_PEER: u8 = 0x01;
/// REQ flag: `alternate_path` is populated.
pub const REQ_FLAG_ALT_PATH: u8 = 0x02;

/// REP flag: the responder accepts path failover.
pub const REP_FLAG_FAILOVER: u8 = 0x01;

pub const REQ_PRIVATE_DATA: usize = 88;
pub const REP_PRIVATE_DATA: usize = 196;
pub const RTU_PRIVATE_DATA: usize = 224;
pub const REJ_PRIVATE_DATA: usize = 148;
pub const MRA_PRIVATE_DATA: usize = 220;
pub const DREQ_PRIVATE_DATA: usize = 220;
pub const DREP_PRIVATE_DATA: usize = 224;
pub const LAP_PRIVATE_DATA: usize = 168;
pub const APR_PRIVATE_DATA: usize = 148;
pub const REJ_ARI_LENGTH: usize = 72;
pub const APR_INFO_LENGTH: usize = 72;

// ── Common header ─────────────────────────────────────────────────────────────

/// Management datagram header shared by all CM messages.
///
/// Wire size: 24 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct CmHeader {
    pub base_version: u8,
    pub mgmt_class: u8,
    pub class_version: u8,
    pub method: u8,
    pub status: Be16,
    pub class_specific: Be16,
    /// Transaction id. Copied unchanged into every response to a request
    /// so the requester can correlate them.
    pub tid: Be64,
    pub attr_id: Be16,
    pub reserved: Be16,
    pub attr_mod: Be32,
}

assert_eq_size!(CmHeader, [u8; HEADER_SIZE]);

impl CmHeader {
    /// Header for an outgoing CM Send with the given attribute and tid.
    pub fn new(attr: AttrId, tid: u64) -> Self {
        Self {
            base_version: BASE_VERSION,
            mgmt_class: CM_MGMT_CLASS,
            class_version: CM_CLASS_VERSION,
            method: METHOD_SEND,
            status: U16::new(0),
            class_specific: U16::new(0),
            tid: U64::new(tid),
            attr_id: U16::new(attr as u16),
            reserved: U16::new(0),
            attr_mod: U32::new(0),
        }
    }
}

// ── Path ──────────────────────────────────────────────────────────────────────

/// Path descriptor embedded in REQ (primary + alternate) and LAP.
///
/// Wire size: 48 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PathInfo {
    pub local_lid: Be16,
    pub remote_lid: Be16,
    pub local_gid: [u8; 16],
    pub remote_gid: [u8; 16],
    /// Low 20 bits only.
    pub flow_label: Be32,
    pub traffic_class: u8,
    pub hop_limit: u8,
    pub sl: u8,
    pub rate: u8,
    pub packet_life_time: u8,
    pub subnet_local: u8,
    pub reserved: [u8; 2],
}

assert_eq_size!(PathInfo, [u8; 48]);

// ── Attribute bodies ──────────────────────────────────────────────────────────

/// Connection request.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ReqMsg {
    pub local_comm_id: Be32,
    pub reserved: Be32,
    pub service_id: Be64,
    pub local_ca_guid: Be64,
    pub local_qkey: Be32,
    /// Low 24 bits only.
    pub local_qpn: Be32,
    pub starting_psn: Be32,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    /// How long the requester will wait for a response (log2, 4.096us units).
    pub remote_cm_response_timeout: u8,
    /// How long the requester takes to respond (log2, 4.096us units).
    pub local_cm_response_timeout: u8,
    pub transport_type: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
    pub max_cm_retries: u8,
    pub pkey: Be16,
    pub path_mtu: u8,
    /// REQ_FLAG_* bits.
    pub flags: u8,
    pub primary_path: PathInfo,
    pub alternate_path: PathInfo,
    pub private_data: [u8; REQ_PRIVATE_DATA],
}

assert_eq_size!(ReqMsg, [u8; BODY_SIZE]);

/// Connection reply.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RepMsg {
    pub local_comm_id: Be32,
    pub remote_comm_id: Be32,
    pub local_qkey: Be32,
    pub local_qpn: Be32,
    pub starting_psn: Be32,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub target_ack_delay: u8,
    /// REP_FLAG_* bits.
    pub flags: u8,
    pub rnr_retry_count: u8,
    pub reserved: [u8; 3],
    pub local_ca_guid: Be64,
    pub private_data: [u8; REP_PRIVATE_DATA],
}

assert_eq_size!(RepMsg, [u8; BODY_SIZE]);

/// Ready to use.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RtuMsg {
    pub local_comm_id: Be32,
    pub remote_comm_id: Be32,
    pub private_data: [u8; RTU_PRIVATE_DATA],
}

assert_eq_size!(RtuMsg, [u8; BODY_SIZE]);

/// Reject.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RejMsg {
    pub local_comm_id: Be32,
    /// Zero when the rejecting side never learned the recipient's id.
    pub remote_comm_id: Be32,
    /// [`MessageRef`] code of the message being rejected.
    pub message_rejected: u8,
    pub reject_info_length: u8,
    pub reason: Be16,
    pub ari: [u8; REJ_ARI_LENGTH],
    pub private_data: [u8; REJ_PRIVATE_DATA],
}

assert_eq_size!(RejMsg, [u8; BODY_SIZE]);

/// Message receipt acknowledgement.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MraMsg {
    pub local_comm_id: Be32,
    pub remote_comm_id: Be32,
    /// [`MessageRef`] code of the message being acknowledged.
    pub message_mraed: u8,
    /// Extra time the sender needs (log2, 4.096us units).
    pub service_timeout: u8,
    pub reserved: [u8; 2],
    pub private_data: [u8; MRA_PRIVATE_DATA],
}

assert_eq_size!(MraMsg, [u8; BODY_SIZE]);

/// Disconnect request.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct DreqMsg {
    pub local_comm_id: Be32,
    pub remote_comm_id: Be32,
    /// The recipient's QPN, as the sender knows it.
    pub remote_qpn: Be32,
    pub private_data: [u8; DREQ_PRIVATE_DATA],
}

assert_eq_size!(DreqMsg, [u8; BODY_SIZE]);

/// Disconnect reply.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct DrepMsg {
    pub local_comm_id: Be32,
    pub remote_comm_id: Be32,
    pub private_data: [u8; DREP_PRIVATE_DATA],
}

assert_eq_size!(DrepMsg, [u8; BODY_SIZE]);

/// Load alternate path.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct LapMsg {
    pub local_comm_id: Be32,
    pub remote_comm_id: Be32,
    pub remote_qpn: Be32,
    pub remote_cm_response_timeout: u8,
    pub reserved: [u8; 3],
    pub alternate_path: PathInfo,
    pub private_data: [u8; LAP_PRIVATE_DATA],
}

assert_eq_size!(LapMsg, [u8; BODY_SIZE]);

/// Alternate path response.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct AprMsg {
    pub local_comm_id: Be32,
    pub remote_comm_id: Be32,
    pub additional_info_length: u8,
    /// [`AprStatus`] code.
    pub status: u8,
    pub reserved: [u8; 2],
    pub additional_info: [u8; APR_INFO_LENGTH],
    pub private_data: [u8; APR_PRIVATE_DATA],
}

assert_eq_size!(AprMsg, [u8; BODY_SIZE]);

// ── Codes ─────────────────────────────────────────────────────────────────────

/// Attribute id in the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum AttrId {
    Req = 0x0010,
    Mra = 0x0011,
    Rej = 0x0012,
    Rep = 0x0013,
    Rtu = 0x0014,
    Dreq = 0x0015,
    Drep = 0x0016,
    Lap = 0x0019,
    Apr = 0x001a,
}

impl TryFrom<u16> for AttrId {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0010 => Ok(AttrId::Req),
            0x0011 => Ok(AttrId::Mra),
            0x0012 => Ok(AttrId::Rej),
            0x0013 => Ok(AttrId::Rep),
            0x0014 => Ok(AttrId::Rtu),
            0x0015 => Ok(AttrId::Dreq),
            0x0016 => Ok(AttrId::Drep),
            0x0019 => Ok(AttrId::Lap),
            0x001a => Ok(AttrId::Apr),
            other => Err(WireError::UnknownAttribute(other)),
        }
    }
}

/// Which earlier message an MRA or REJ refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageRef {
    Req = 0,
    Rep = 1,
    /// LAP for MRA, anything else for REJ.
    Other = 2,
}

impl TryFrom<u8> for MessageRef {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageRef::Req),
            1 => Ok(MessageRef::Rep),
            2 => Ok(MessageRef::Other),
            other => Err(WireError::UnknownMessageRef(other)),
        }
    }
}

/// Reason code carried in REJ.
///
/// Peers may send codes this manager never generates; those are kept
/// verbatim in `Other` and reported to the consumer unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoQp,
    NoResources,
    Timeout,
    Unsupported,
    InvalidCommId,
    InvalidServiceId,
    InvalidTransportType,
    StaleConn,
    ConsumerReject,
    Other(u16),
}

impl RejectReason {
    pub fn code(self) -> u16 {
        match self {
            RejectReason::NoQp => 1,
            RejectReason::NoResources => 3,
            RejectReason::Timeout => 4,
            RejectReason::Unsupported => 5,
            RejectReason::InvalidCommId => 6,
            RejectReason::InvalidServiceId => 8,
            RejectReason::InvalidTransportType => 9,
            RejectReason::StaleConn => 10,
            RejectReason::ConsumerReject => 28,
            RejectReason::Other(code) => code,
        }
    }
}

impl From<u16> for RejectReason {
    fn from(code: u16) -> Self {
        match code {
            1 => RejectReason::NoQp,
            3 => RejectReason::NoResources,
            4 => RejectReason::Timeout,
            5 => RejectReason::Unsupported,
            6 => RejectReason::InvalidCommId,
            8 => RejectReason::InvalidServiceId,
            9 => RejectReason::InvalidTransportType,
            10 => RejectReason::StaleConn,
            28 => RejectReason::ConsumerReject,
            other => RejectReason::Other(other),
        }
    }
}

/// Status carried in APR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AprStatus {
    Loaded = 0,
    InvalidCommId = 1,
    Unsupported = 2,
    Rejected = 3,
    QpnMismatch = 4,
}

impl TryFrom<u8> for AprStatus {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AprStatus::Loaded),
            1 => Ok(AprStatus::InvalidCommId),
            2 => Ok(AprStatus::Unsupported),
            3 => Ok(AprStatus::Rejected),
            4 => Ok(AprStatus::QpnMismatch),
            other => Err(WireError::UnknownAprStatus(other)),
        }
    }
}

// ── Decoded datagram ──────────────────────────────────────────────────────────

/// A typed CM attribute body.
#[derive(Debug, Clone)]
pub enum CmMessage {
    Req(ReqMsg),
    Mra(MraMsg),
    Rej(RejMsg),
    Rep(RepMsg),
    Rtu(RtuMsg),
    Dreq(DreqMsg),
    Drep(DrepMsg),
    Lap(LapMsg),
    Apr(AprMsg),
}

impl CmMessage {
    pub fn attr_id(&self) -> AttrId {
        match self {
            CmMessage::Req(_) => AttrId::Req,
            CmMessage::Mra(_) => AttrId::Mra,
            CmMessage::Rej(_) => AttrId::Rej,
            CmMessage::Rep(_) => AttrId::Rep,
            CmMessage::Rtu(_) => AttrId::Rtu,
            CmMessage::Dreq(_) => AttrId::Dreq,
            CmMessage::Drep(_) => AttrId::Drep,
            CmMessage::Lap(_) => AttrId::Lap,
            CmMessage::Apr(_) => AttrId::Apr,
        }
    }

    /// The sender's comm id. Every CM body starts with it.
    pub fn local_comm_id(&self) -> u32 {
        match self {
            CmMessage::Req(m) => m.local_comm_id.get(),
            CmMessage::Mra(m) => m.local_comm_id.get(),
            CmMessage::Rej(m) => m.local_comm_id.get(),
            CmMessage::Rep(m) => m.local_comm_id.get(),
            CmMessage::Rtu(m) => m.local_comm_id.get(),
            CmMessage::Dreq(m) => m.local_comm_id.get(),
            CmMessage::Drep(m) => m.local_comm_id.get(),
            CmMessage::Lap(m) => m.local_comm_id.get(),
            CmMessage::Apr(m) => m.local_comm_id.get(),
        }
    }

    fn body_bytes(&self) -> &[u8] {
        match self {
            CmMessage::Req(m) => m.as_bytes(),
            CmMessage::Mra(m) => m.as_bytes(),
            CmMessage::Rej(m) => m.as_bytes(),
            CmMessage::Rep(m) => m.as_bytes(),
            CmMessage::Rtu(m) => m.as_bytes(),
            CmMessage::Dreq(m) => m.as_bytes(),
            CmMessage::Drep(m) => m.as_bytes(),
            CmMessage::Lap(m) => m.as_bytes(),
            CmMessage::Apr(m) => m.as_bytes(),
        }
    }
}

/// One complete CM datagram.
#[derive(Debug, Clone)]
pub struct Mad {
    pub header: CmHeader,
    pub msg: CmMessage,
}

impl Mad {
    /// Wrap a body in a fresh header carrying `tid`.
    pub fn new(tid: u64, msg: CmMessage) -> Self {
        Self {
            header: CmHeader::new(msg.attr_id(), tid),
            msg,
        }
    }

    pub fn tid(&self) -> u64 {
        self.header.tid.get()
    }

    /// Serialize to exactly [`MAD_SIZE`] bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAD_SIZE);
        buf.put_slice(self.header.as_bytes());
        buf.put_slice(self.msg.body_bytes());
        buf.freeze()
    }

    /// Parse a received datagram.
    ///
    /// Trailing bytes beyond [`MAD_SIZE`] are ignored; anything shorter,
    /// from another management class, or with an unknown attribute is
    /// an error and the caller drops the datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < MAD_SIZE {
            return Err(WireError::Truncated(bytes.len()));
        }
        let header = CmHeader::read_from_prefix(bytes).ok_or(WireError::Truncated(bytes.len()))?;
        if header.mgmt_class != CM_MGMT_CLASS {
            return Err(WireError::WrongClass(header.mgmt_class));
        }
        if header.base_version != BASE_VERSION || header.class_version != CM_CLASS_VERSION {
            return Err(WireError::UnknownVersion(header.class_version));
        }
        let body = &bytes[HEADER_SIZE..MAD_SIZE];
        let attr = AttrId::try_from(header.attr_id.get())?;
        let short = || WireError::Truncated(bytes.len());
        let msg = match attr {
            AttrId::Req => CmMessage::Req(ReqMsg::read_from(body).ok_or_else(short)?),
            AttrId::Mra => CmMessage::Mra(MraMsg::read_from(body).ok_or_else(short)?),
            AttrId::Rej => CmMessage::Rej(RejMsg::read_from(body).ok_or_else(short)?),
            AttrId::Rep => CmMessage::Rep(RepMsg::read_from(body).ok_or_else(short)?),
            AttrId::Rtu => CmMessage::Rtu(RtuMsg::read_from(body).ok_or_else(short)?),
            AttrId::Dreq => CmMessage::Dreq(DreqMsg::read_from(body).ok_or_else(short)?),
            AttrId::Drep => CmMessage::Drep(DrepMsg::read_from(body).ok_or_else(short)?),
            AttrId::Lap => CmMessage::Lap(LapMsg::read_from(body).ok_or_else(short)?),
            AttrId::Apr => CmMessage::Apr(AprMsg::read_from(body).ok_or_else(short)?),
        };
        Ok(Self { header, msg })
    }
}

/// Copy `src` into a fixed private-data field. Longer input is an error.
pub fn fill_private_data(dst: &mut [u8], src: &[u8]) -> Result<(), WireError> {
    if src.len() > dst.len() {
        return Err(WireError::PrivateDataTooLarge(src.len(), dst.len()));
    }
    dst[..src.len()].copy_from_slice(src);
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram of {0} bytes is shorter than {}", MAD_SIZE)]
    Truncated(usize),

    #[error("management class 0x{0:02x} is not CM")]
    WrongClass(u8),

    #[error("unsupported CM class version {0}")]
    UnknownVersion(u8),

    #[error("unknown attribute id: 0x{0:04x}")]
    UnknownAttribute(u16),

    #[error("unknown message reference: {0}")]
    UnknownMessageRef(u8),

    #[error("unknown APR status: {0}")]
    UnknownAprStatus(u8),

    #[error("private data of {0} bytes exceeds field size {1}")]
    PrivateDataTooLarge(usize, usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
