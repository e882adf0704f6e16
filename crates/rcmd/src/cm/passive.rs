//! Passive side: REQ in, REP out, RTU in. Also peer-to-peer collision
//! resolution and duplicate/stale REQ handling.

use std::sync::Arc;

use bytes::Bytes;

use rcm_core::wire::{MessageRef, ReqMsg, REQ_FLAG_ALT_PATH, REQ_FLAG_PEER_TO_PEER, TRANSPORT_RC};
use rcm_core::{AttrId, Gid, PathRecord, RejectReason};
use rcm_services::connection::{RemoteId, RemoteQpKey, SentMad};
use rcm_services::{
    AcceptParams, CallbackOutcome, CmEventKind, CmState, Connection, DisconnectReason,
    IdleReason, QpAttr, ReplySlot, ReqEvent, Role, TimerPurpose,
};

use super::builder;
use super::{invalid_state, CmContext, CmError};

/// Identity of an inbound REQ's sender.
struct Requester {
    gid: Gid,
    ca_guid: u64,
    comm_id: u32,
    qpn: u32,
    tid: u64,
}

impl CmContext {
    pub(crate) async fn on_req(&self, src: Gid, tid: u64, m: &ReqMsg) {
        let inner = self.inner();
        let from = Requester {
            gid: src,
            ca_guid: m.local_ca_guid.get(),
            comm_id: m.local_comm_id.get(),
            qpn: m.local_qpn.get() & 0x00ff_ffff,
            tid,
        };

        if m.transport_type != TRANSPORT_RC {
            tracing::debug!(transport = m.transport_type, "REQ for unsupported transport");
            self.reject_requester(&from, RejectReason::InvalidTransportType);
            return;
        }

        if let Some(existing) = inner.conns.find_by_remote_id(from.ca_guid, from.comm_id) {
            self.duplicate_req(&existing, &from);
            return;
        }
        if let Some(existing) = inner.conns.find_by_remote_queue(from.gid, from.qpn) {
            // Same peer QP, new comm id: the peer restarted the connection.
            tracing::debug!(
                comm_id = existing.local_id(),
                remote_qpn = from.qpn,
                "REQ from a QP with a live connection"
            );
            self.reject_requester(&from, RejectReason::StaleConn);
            self.make_stale(&existing);
            return;
        }

        let service_id = m.service_id.get();
        let Some(service) = inner.services.find(service_id).await else {
            tracing::debug!(
                service_id = %format_args!("0x{service_id:016x}"),
                "REQ for unknown service"
            );
            self.reject_requester(&from, RejectReason::InvalidServiceId);
            return;
        };

        // Peer-to-peer collision: both sides sent REQ on the same service.
        let mut adopted = None;
        if m.flags & REQ_FLAG_PEER_TO_PEER != 0 {
            if let Some(own_id) = service.peer_to_peer_id() {
                if let Some(own) = inner.conns.find(own_id) {
                    let local = (inner.local_gid, own.lock().local_qpn);
                    let remote = (from.gid, from.qpn);
                    if local > remote {
                        tracing::debug!(comm_id = own_id, "peer-to-peer collision won, ignoring REQ");
                        return;
                    }
                    let mut st = own.lock();
                    if st.state == CmState::ReqSent {
                        st.cancel_timer();
                        st.role = Role::Passive;
                        st.retries = 0;
                        st.transition(own_id, CmState::ReqReceived);
                        drop(st);
                        service.clear_peer_to_peer(own_id);
                        tracing::debug!(comm_id = own_id, "peer-to-peer collision lost, now passive");
                        adopted = Some(own);
                    }
                }
            }
        }

        let conn = match &adopted {
            Some(conn) => conn.clone(),
            None => {
                let conn = inner.conns.create();
                {
                    let mut st = conn.lock();
                    st.role = Role::Passive;
                    st.handler = Some(service.handler());
                    st.transition(conn.local_id(), CmState::ReqReceived);
                }
                conn
            }
        };
        drop(service);
        let comm_id = conn.local_id();

        let event = {
            let mut st = conn.lock();
            let primary = PathRecord::from_wire(&m.primary_path).reversed();
            let alternate = (m.flags & REQ_FLAG_ALT_PATH != 0)
                .then(|| PathRecord::from_wire(&m.alternate_path).reversed());
            st.service_id = service_id;
            st.remote_id = from.comm_id;
            st.remote_ca_guid = from.ca_guid;
            st.remote_gid = from.gid;
            st.remote_qpn = from.qpn;
            st.tid = from.tid;
            st.primary_path = Some(primary);
            st.alternate_path = alternate;
            st.rq_psn = m.starting_psn.get() & 0x00ff_ffff;
            st.retry_count = m.retry_count;
            st.rnr_retry_count = m.rnr_retry_count;
            st.path_mtu = m.path_mtu;
            st.pkey = m.pkey.get();
            st.qkey = m.local_qkey.get();
            st.max_cm_retries = m.max_cm_retries.min(inner.timing.max_cm_retries);
            st.response_timeout = inner.timing.response_timeout();
            ReqEvent {
                service_id,
                remote_comm_id: from.comm_id,
                remote_gid: from.gid,
                remote_qpn: from.qpn,
                primary_path: primary,
                alternate_path: alternate,
                responder_resources: m.responder_resources,
                initiator_depth: m.initiator_depth,
                peer_to_peer: m.flags & REQ_FLAG_PEER_TO_PEER != 0,
                private_data: Bytes::copy_from_slice(&m.private_data),
                reply: ReplySlot::default(),
            }
        };

        let keys = (
            RemoteId {
                ca_guid: from.ca_guid,
                comm_id: from.comm_id,
            },
            RemoteQpKey {
                gid: from.gid,
                qpn: from.qpn,
            },
        );
        if let Err(dup) = inner.conns.insert_remote(&conn, keys.0, keys.1) {
            // Lost a race with a retransmission of the same REQ.
            let existing = dup.existing().clone();
            conn.lock().transition(comm_id, CmState::Idle);
            inner.conns.free(&conn);
            self.duplicate_req(&existing, &from);
            return;
        }
        tracing::debug!(
            comm_id,
            remote_comm_id = from.comm_id,
            service_id = %format_args!("0x{service_id:016x}"),
            "REQ received"
        );

        let outcome = conn.deliver(CmEventKind::ReqReceived(event.clone()));
        match outcome {
            Some(CallbackOutcome::Defer) => {}
            Some(CallbackOutcome::Abort) => {
                conn.take_handler();
                inner.fail_establishment(&conn, RejectReason::ConsumerReject, None);
            }
            Some(CallbackOutcome::Proceed) | None => {
                let reply = event.reply.take().or_else(|| {
                    adopted.as_ref().map(|own| {
                        let st = own.lock();
                        AcceptParams {
                            qpn: st.local_qpn,
                            starting_psn: st.sq_psn,
                            responder_resources: st.responder_resources,
                            initiator_depth: st.initiator_depth,
                            rnr_retry_count: st.rnr_retry_count,
                            failover_accepted: st.alternate_path.is_some(),
                            private_data: Bytes::new(),
                        }
                    })
                });
                match reply {
                    Some(params) => {
                        if let Err(e) = self.accept_inner(&conn, params) {
                            tracing::debug!(comm_id, error = %e, "REP not sent");
                        }
                    }
                    None if conn.state() == CmState::ReqReceived => {
                        tracing::warn!(comm_id, "REQ accepted without local QP parameters");
                        inner.fail_establishment(
                            &conn,
                            RejectReason::NoQp,
                            Some(IdleReason::Failed(RejectReason::NoQp)),
                        );
                    }
                    None => {}
                }
            }
        }
    }

    /// A REQ whose sender already has a connection here.
    fn duplicate_req(&self, existing: &Arc<Connection>, from: &Requester) {
        let inner = self.inner();
        let comm_id = existing.local_id();
        enum Action {
            Ignore,
            Resend(SentMad),
            Stale,
        }
        let action = {
            let st = existing.lock();
            if st.role == Role::Active {
                // The crossed peer-to-peer REQ; our own REQ is being answered.
                Action::Ignore
            } else {
                match st.state {
                    CmState::ReqReceived => Action::Ignore,
                    CmState::MraSent | CmState::RepSent => {
                        st.last_sent.clone().map_or(Action::Ignore, Action::Resend)
                    }
                    CmState::Established => {
                        let recent = st
                            .established_at
                            .map(|at| at.elapsed() < st.response_timeout)
                            .unwrap_or(false);
                        match (&st.last_sent, recent) {
                            (Some(sent), true) if sent.attr == AttrId::Rep => {
                                Action::Resend(sent.clone())
                            }
                            _ => Action::Stale,
                        }
                    }
                    _ => Action::Stale,
                }
            }
        };
        match action {
            Action::Ignore => {
                tracing::trace!(comm_id, "duplicate REQ ignored");
            }
            Action::Resend(sent) => inner.resend(comm_id, &sent),
            Action::Stale => {
                tracing::debug!(comm_id, "stale REQ");
                self.reject_requester(from, RejectReason::StaleConn);
                self.make_stale(existing);
            }
        }
    }

    /// The peer no longer knows `conn`. An established connection is torn
    /// down: DREQ and straight into Time-Wait.
    fn make_stale(&self, conn: &Arc<Connection>) {
        let inner = self.inner();
        let comm_id = conn.local_id();
        let dreq = {
            let st = conn.lock();
            if st.state != CmState::Established {
                return;
            }
            (
                st.remote_gid,
                builder::dreq(inner.next_tid(), comm_id, st.remote_id, st.remote_qpn),
            )
        };
        inner.send_logged(comm_id, dreq.0, &dreq.1);
        self.enter_time_wait(conn, DisconnectReason::Stale);
    }

    /// REJ straight back to a requester we hold no state for.
    fn reject_requester(&self, from: &Requester, reason: RejectReason) {
        let inner = self.inner();
        let rej = builder::rej(
            from.tid,
            0,
            from.comm_id,
            MessageRef::Req,
            reason,
            inner.ca_guid,
        );
        inner.send_logged(0, from.gid, &rej);
    }

    /// Accept a deferred REQ: QP to ready-to-receive, REP, REP_SENT.
    pub fn accept(&self, comm_id: u32, params: AcceptParams) -> Result<(), CmError> {
        let conn = self.find(comm_id)?;
        self.accept_inner(&conn, params)
    }

    fn accept_inner(&self, conn: &Arc<Connection>, params: AcceptParams) -> Result<(), CmError> {
        let inner = self.inner();
        let comm_id = conn.local_id();
        let built = {
            let mut st = conn.lock();
            if st.role != Role::Passive
                || !matches!(st.state, CmState::ReqReceived | CmState::MraSent)
            {
                return Err(invalid_state(conn, st.state, "accept"));
            }
            let mad = builder::rep(st.tid, comm_id, st.remote_id, inner.ca_guid, st.qkey, &params)?;
            let path = st
                .primary_path
                .unwrap_or_else(|| PathRecord::between(inner.local_gid, st.remote_gid));
            let prepared = inner
                .modify_qp(comm_id, params.qpn, &QpAttr::Init { pkey: st.pkey })
                .and_then(|()| {
                    inner.modify_qp(
                        comm_id,
                        params.qpn,
                        &QpAttr::ReadyToReceive {
                            remote_qpn: st.remote_qpn,
                            path,
                            alternate_path: st.alternate_path,
                            rq_psn: st.rq_psn,
                            path_mtu: st.path_mtu,
                            max_dest_rd_atomic: params.responder_resources,
                        },
                    )
                });
            st.local_qpn = params.qpn;
            match prepared {
                Ok(()) => {
                    st.sq_psn = params.starting_psn & 0x00ff_ffff;
                    st.responder_resources = params.responder_resources;
                    st.initiator_depth = params.initiator_depth;
                    st.alternate_loaded = st.alternate_path.is_some() && params.failover_accepted;
                    let bytes = mad.to_bytes();
                    st.transition(comm_id, CmState::RepSent);
                    st.last_sent = Some(SentMad {
                        attr: AttrId::Rep,
                        dest: st.remote_gid,
                        bytes: bytes.clone(),
                    });
                    st.retries = 0;
                    let timeout = st.response_timeout;
                    inner.arm_timer(conn, &mut st, TimerPurpose::Retransmit, timeout);
                    Ok((st.remote_gid, bytes))
                }
                Err(e) => Err(e),
            }
        };
        match built {
            Ok((dest, bytes)) => {
                if let Err(e) = inner.send(dest, bytes) {
                    tracing::warn!(comm_id, error = %e, "REP send failed");
                }
                tracing::debug!(comm_id, "REP sent");
                Ok(())
            }
            Err(e) => {
                inner.fail_establishment(
                    conn,
                    RejectReason::NoResources,
                    Some(IdleReason::Failed(RejectReason::NoResources)),
                );
                Err(e.into())
            }
        }
    }

    /// Refuse a connection that is still being negotiated: REJ with
    /// CONSUMER_REJECT. No callback follows.
    pub fn reject(&self, comm_id: u32, private_data: &[u8]) -> Result<(), CmError> {
        let inner = self.inner();
        let conn = self.find(comm_id)?;
        let (dest, rej) = {
            let mut st = conn.lock();
            let state = st.state;
            let allowed = matches!(
                state,
                CmState::ReqReceived | CmState::MraSent | CmState::RepReceived | CmState::MraRepSent
            );
            if !allowed {
                return Err(invalid_state(&conn, state, "reject"));
            }
            let rej = builder::rej(
                st.tid,
                comm_id,
                st.remote_id,
                super::rejected_message(&st),
                RejectReason::ConsumerReject,
                inner.ca_guid,
            );
            let rej = builder::with_rej_private_data(rej, private_data)?;
            st.cancel_timer();
            st.handler = None;
            inner.qp_to_error(comm_id, &mut st);
            st.transition(comm_id, CmState::Idle);
            (st.remote_gid, rej)
        };
        inner.send_logged(comm_id, dest, &rej);
        inner.conns.free(&conn);
        tracing::debug!(comm_id, "rejected by consumer");
        Ok(())
    }

    /// Tell the peer a deferred REQ or REP needs more time:
    /// `service_timeout` is log2 of 4.096us units.
    pub fn delay(&self, comm_id: u32, service_timeout: u8) -> Result<(), CmError> {
        let inner = self.inner();
        let conn = self.find(comm_id)?;
        let (dest, bytes) = {
            let mut st = conn.lock();
            let (acknowledged, next) = match st.state {
                CmState::ReqReceived => (MessageRef::Req, CmState::MraSent),
                CmState::RepReceived => (MessageRef::Rep, CmState::MraRepSent),
                state => return Err(invalid_state(&conn, state, "delay")),
            };
            let mad = builder::mra(st.tid, comm_id, st.remote_id, acknowledged, service_timeout);
            let bytes = mad.to_bytes();
            st.transition(comm_id, next);
            st.last_sent = Some(SentMad {
                attr: AttrId::Mra,
                dest: st.remote_gid,
                bytes: bytes.clone(),
            });
            (st.remote_gid, bytes)
        };
        if let Err(e) = inner.send(dest, bytes) {
            tracing::warn!(comm_id, error = %e, "MRA send failed");
        }
        Ok(())
    }

    pub(crate) fn on_rtu(&self, m: &rcm_core::wire::RtuMsg) {
        let inner = self.inner();
        let Some(conn) = inner.conns.find(m.remote_comm_id.get()) else {
            return;
        };
        let comm_id = conn.local_id();
        let ready = {
            let mut st = conn.lock();
            if st.remote_id != m.local_comm_id.get() || st.state != CmState::RepSent {
                tracing::debug!(comm_id, state = %st.state, "RTU ignored");
                return;
            }
            st.cancel_timer();
            let ack_timeout = st.primary_path.map(|p| p.local_ack_timeout()).unwrap_or(14);
            let attr = QpAttr::ReadyToSend {
                sq_psn: st.sq_psn,
                local_ack_timeout: ack_timeout,
                retry_count: st.retry_count,
                rnr_retry_count: st.rnr_retry_count,
                max_rd_atomic: st.initiator_depth,
            };
            let result = inner.modify_qp(comm_id, st.local_qpn, &attr);
            if result.is_ok() {
                st.transition(comm_id, CmState::Established);
            }
            result
        };
        match ready {
            Ok(()) => {
                tracing::debug!(comm_id, "established");
                conn.deliver(CmEventKind::Established);
            }
            Err(_) => inner.fail_establishment(
                &conn,
                RejectReason::NoResources,
                Some(IdleReason::Failed(RejectReason::NoResources)),
            ),
        }
    }
}
