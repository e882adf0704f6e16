//! Outgoing message construction.
//!
//! Each function returns a complete [`Mad`]: common header filled by
//! [`Mad::new`], body fields set from the arguments, unused fields zero.

use zerocopy::byteorder::{U16, U32, U64};
use zerocopy::FromZeroes;

use rcm_core::wire::{
    fill_private_data, AprMsg, AprStatus, CmMessage, DrepMsg, DreqMsg, LapMsg, Mad, MessageRef,
    MraMsg, RejMsg, RepMsg, ReqMsg, RtuMsg, WireError, REP_FLAG_FAILOVER, REQ_FLAG_ALT_PATH,
    REQ_FLAG_PEER_TO_PEER, TRANSPORT_RC,
};
use rcm_core::{PathRecord, RejectReason};
use rcm_services::connection::ConnState;
use rcm_services::AcceptParams;

/// Bytes of additional reject information this manager always sends: the
/// sender's CA GUID, so a REJ without a recipient comm id can still be
/// matched through the remote-id index.
pub const REJ_ARI_GUID_LEN: u8 = 8;

pub(crate) struct ReqFields<'a> {
    pub local_comm_id: u32,
    pub ca_guid: u64,
    pub response_timeout: u8,
    pub max_cm_retries: u8,
    pub st: &'a ConnState,
}

pub(crate) fn req(tid: u64, f: ReqFields<'_>, private_data: &[u8]) -> Result<Mad, WireError> {
    let st = f.st;
    let mut m = ReqMsg::new_zeroed();
    m.local_comm_id = U32::new(f.local_comm_id);
    m.service_id = U64::new(st.service_id);
    m.local_ca_guid = U64::new(f.ca_guid);
    m.local_qkey = U32::new(st.qkey);
    m.local_qpn = U32::new(st.local_qpn & 0x00ff_ffff);
    m.starting_psn = U32::new(st.sq_psn & 0x00ff_ffff);
    m.responder_resources = st.responder_resources;
    m.initiator_depth = st.initiator_depth;
    m.remote_cm_response_timeout = f.response_timeout;
    m.local_cm_response_timeout = f.response_timeout;
    m.transport_type = TRANSPORT_RC;
    m.retry_count = st.retry_count;
    m.rnr_retry_count = st.rnr_retry_count;
    m.max_cm_retries = f.max_cm_retries.min(15);
    m.pkey = U16::new(st.pkey);
    m.path_mtu = st.path_mtu;
    if st.peer_to_peer {
        m.flags |= REQ_FLAG_PEER_TO_PEER;
    }
    if let Some(primary) = &st.primary_path {
        m.primary_path = primary.to_wire();
    }
    if let Some(alternate) = &st.alternate_path {
        m.alternate_path = alternate.to_wire();
        m.flags |= REQ_FLAG_ALT_PATH;
    }
    fill_private_data(&mut m.private_data, private_data)?;
    Ok(Mad::new(tid, CmMessage::Req(m)))
}

pub(crate) fn rep(
    tid: u64,
    local_comm_id: u32,
    remote_comm_id: u32,
    ca_guid: u64,
    qkey: u32,
    params: &AcceptParams,
) -> Result<Mad, WireError> {
    let mut m = RepMsg::new_zeroed();
    m.local_comm_id = U32::new(local_comm_id);
    m.remote_comm_id = U32::new(remote_comm_id);
    m.local_qkey = U32::new(qkey);
    m.local_qpn = U32::new(params.qpn & 0x00ff_ffff);
    m.starting_psn = U32::new(params.starting_psn & 0x00ff_ffff);
    m.responder_resources = params.responder_resources;
    m.initiator_depth = params.initiator_depth;
    if params.failover_accepted {
        m.flags |= REP_FLAG_FAILOVER;
    }
    m.rnr_retry_count = params.rnr_retry_count;
    m.local_ca_guid = U64::new(ca_guid);
    fill_private_data(&mut m.private_data, &params.private_data)?;
    Ok(Mad::new(tid, CmMessage::Rep(m)))
}

pub(crate) fn rtu(tid: u64, local_comm_id: u32, remote_comm_id: u32) -> Mad {
    let mut m = RtuMsg::new_zeroed();
    m.local_comm_id = U32::new(local_comm_id);
    m.remote_comm_id = U32::new(remote_comm_id);
    Mad::new(tid, CmMessage::Rtu(m))
}

pub(crate) fn rej(
    tid: u64,
    local_comm_id: u32,
    remote_comm_id: u32,
    rejected: MessageRef,
    reason: RejectReason,
    ca_guid: u64,
) -> Mad {
    let mut m = RejMsg::new_zeroed();
    m.local_comm_id = U32::new(local_comm_id);
    m.remote_comm_id = U32::new(remote_comm_id);
    m.message_rejected = rejected as u8;
    m.reason = U16::new(reason.code());
    m.reject_info_length = REJ_ARI_GUID_LEN;
    m.ari[..8].copy_from_slice(&ca_guid.to_be_bytes());
    Mad::new(tid, CmMessage::Rej(m))
}

/// The CA GUID carried in a REJ's additional reject info, if present.
pub(crate) fn rej_sender_guid(m: &RejMsg) -> Option<u64> {
    if m.reject_info_length < REJ_ARI_GUID_LEN {
        return None;
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&m.ari[..8]);
    Some(u64::from_be_bytes(raw))
}

pub(crate) fn mra(
    tid: u64,
    local_comm_id: u32,
    remote_comm_id: u32,
    acknowledged: MessageRef,
    service_timeout: u8,
) -> Mad {
    let mut m = MraMsg::new_zeroed();
    m.local_comm_id = U32::new(local_comm_id);
    m.remote_comm_id = U32::new(remote_comm_id);
    m.message_mraed = acknowledged as u8;
    m.service_timeout = service_timeout.min(31);
    Mad::new(tid, CmMessage::Mra(m))
}

pub(crate) fn dreq(tid: u64, local_comm_id: u32, remote_comm_id: u32, remote_qpn: u32) -> Mad {
    let mut m = DreqMsg::new_zeroed();
    m.local_comm_id = U32::new(local_comm_id);
    m.remote_comm_id = U32::new(remote_comm_id);
    m.remote_qpn = U32::new(remote_qpn & 0x00ff_ffff);
    Mad::new(tid, CmMessage::Dreq(m))
}

pub(crate) fn drep(tid: u64, local_comm_id: u32, remote_comm_id: u32) -> Mad {
    let mut m = DrepMsg::new_zeroed();
    m.local_comm_id = U32::new(local_comm_id);
    m.remote_comm_id = U32::new(remote_comm_id);
    Mad::new(tid, CmMessage::Drep(m))
}

pub(crate) fn lap(
    tid: u64,
    local_comm_id: u32,
    remote_comm_id: u32,
    remote_qpn: u32,
    response_timeout: u8,
    path: &PathRecord,
) -> Mad {
    let mut m = LapMsg::new_zeroed();
    m.local_comm_id = U32::new(local_comm_id);
    m.remote_comm_id = U32::new(remote_comm_id);
    m.remote_qpn = U32::new(remote_qpn & 0x00ff_ffff);
    m.remote_cm_response_timeout = response_timeout;
    m.alternate_path = path.to_wire();
    Mad::new(tid, CmMessage::Lap(m))
}

pub(crate) fn apr(tid: u64, local_comm_id: u32, remote_comm_id: u32, status: AprStatus) -> Mad {
    let mut m = AprMsg::new_zeroed();
    m.local_comm_id = U32::new(local_comm_id);
    m.remote_comm_id = U32::new(remote_comm_id);
    m.status = status as u8;
    Mad::new(tid, CmMessage::Apr(m))
}

/// Copy consumer private data into a REJ.
pub(crate) fn with_rej_private_data(mut mad: Mad, data: &[u8]) -> Result<Mad, WireError> {
    if let CmMessage::Rej(m) = &mut mad.msg {
        fill_private_data(&mut m.private_data, data)?;
    }
    Ok(mad)
}
