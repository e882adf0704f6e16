//! Active side: REQ out, REP in, RTU out.

use std::sync::Arc;

use bytes::Bytes;

use rcm_core::wire::{MessageRef, MraMsg, RepMsg, REP_FLAG_FAILOVER};
use rcm_core::RejectReason;
use rcm_services::connection::{RemoteId, RemoteQpKey, SentMad};
use rcm_services::{
    CallbackOutcome, CmEventKind, CmHandler, CmState, Connection, IdleReason, QpAttr, RepEvent,
    Role, TimerPurpose,
};

use super::builder::{self, ReqFields};
use super::{exponent_duration, invalid_state, timeout_exponent, CmContext, CmError, ConnectParams};

impl CmContext {
    /// Start an active connection: REQ to the primary path's destination.
    ///
    /// Returns the new comm id once the REQ is on the wire. With
    /// `peer_to_peer`, a listener on the same service must already exist.
    pub async fn connect(
        &self,
        params: ConnectParams,
        handler: Arc<dyn CmHandler>,
    ) -> Result<u32, CmError> {
        let inner = self.inner();

        // Held until the attempt is registered, so an inbound REQ on the
        // same service sees it.
        let service = if params.peer_to_peer {
            let guard = inner
                .services
                .find(params.service_id)
                .await
                .ok_or(CmError::NoListener(params.service_id))?;
            if guard.peer_to_peer_id().is_some() {
                return Err(CmError::PeerToPeerBusy(params.service_id));
            }
            Some(guard)
        } else {
            None
        };

        inner.modify_qp(0, params.qpn, &QpAttr::Init { pkey: inner.pkey })?;

        let conn = inner.conns.create();
        let comm_id = conn.local_id();
        let built = {
            let mut st = conn.lock();
            st.role = Role::Active;
            st.service_id = params.service_id;
            st.peer_to_peer = params.peer_to_peer;
            st.local_qpn = params.qpn;
            st.remote_gid = params.primary_path.dgid;
            st.primary_path = Some(params.primary_path);
            st.alternate_path = params.alternate_path;
            st.sq_psn = params.starting_psn & 0x00ff_ffff;
            st.responder_resources = params.responder_resources;
            st.initiator_depth = params.initiator_depth;
            st.retry_count = params.retry_count;
            st.rnr_retry_count = params.rnr_retry_count;
            st.path_mtu = params.path_mtu;
            st.pkey = inner.pkey;
            st.qkey = params.qkey;
            st.max_cm_retries = inner.timing.max_cm_retries;
            st.response_timeout = inner.timing.response_timeout();
            st.tid = inner.next_tid();
            st.handler = Some(handler);

            let fields = ReqFields {
                local_comm_id: comm_id,
                ca_guid: inner.ca_guid,
                response_timeout: timeout_exponent(st.response_timeout),
                max_cm_retries: st.max_cm_retries,
                st: &st,
            };
            match builder::req(st.tid, fields, &params.private_data) {
                Ok(mad) => {
                    let bytes = mad.to_bytes();
                    st.transition(comm_id, CmState::ReqSent);
                    st.last_sent = Some(SentMad {
                        attr: mad.msg.attr_id(),
                        dest: st.remote_gid,
                        bytes: bytes.clone(),
                    });
                    let timeout = st.response_timeout;
                    inner.arm_timer(&conn, &mut st, TimerPurpose::Retransmit, timeout);
                    Ok((st.remote_gid, bytes))
                }
                Err(e) => Err(e),
            }
        };
        let (dest, bytes) = match built {
            Ok(b) => b,
            Err(e) => {
                inner.conns.free(&conn);
                return Err(e.into());
            }
        };
        if let Some(guard) = &service {
            guard.set_peer_to_peer(comm_id);
        }
        drop(service);

        if let Err(e) = inner.send(dest, bytes) {
            {
                let mut st = conn.lock();
                inner.clear_peer_to_peer(comm_id, &st);
                inner.qp_to_error(comm_id, &mut st);
                st.transition(comm_id, CmState::Idle);
            }
            inner.conns.free(&conn);
            return Err(e.into());
        }
        tracing::debug!(
            comm_id,
            service_id = %format_args!("0x{:016x}", params.service_id),
            dest = %dest,
            peer_to_peer = params.peer_to_peer,
            "REQ sent"
        );
        Ok(comm_id)
    }

    pub(crate) fn on_rep(&self, m: &RepMsg) {
        let inner = self.inner();
        let Some(conn) = inner.conns.find(m.remote_comm_id.get()) else {
            tracing::debug!(comm_id = m.remote_comm_id.get(), "REP for unknown connection");
            return;
        };
        let comm_id = conn.local_id();
        let sender = m.local_comm_id.get();

        let resend = {
            let mut st = conn.lock();
            if st.role != Role::Active {
                return;
            }
            match st.state {
                CmState::ReqSent => None,
                CmState::MraRepSent if st.remote_id == sender => st.last_sent.clone(),
                CmState::Established
                    if st.remote_id == sender
                        && st.last_sent_attr() == Some(rcm_core::AttrId::Rtu) =>
                {
                    st.last_sent.clone()
                }
                state => {
                    tracing::debug!(comm_id, state = %state, "REP ignored");
                    return;
                }
            }
        };
        if let Some(sent) = resend {
            inner.resend(comm_id, &sent);
            return;
        }

        // First REP for this attempt.
        let remote_id = RemoteId {
            ca_guid: m.local_ca_guid.get(),
            comm_id: sender,
        };
        let (remote_qp, event) = {
            let mut st = conn.lock();
            if st.state != CmState::ReqSent {
                return;
            }
            st.cancel_timer();
            st.remote_id = sender;
            st.remote_ca_guid = remote_id.ca_guid;
            st.remote_qpn = m.local_qpn.get() & 0x00ff_ffff;
            st.rq_psn = m.starting_psn.get() & 0x00ff_ffff;
            st.initiator_depth = st.initiator_depth.min(m.responder_resources);
            st.rnr_retry_count = m.rnr_retry_count;
            inner.clear_peer_to_peer(comm_id, &st);
            let event = RepEvent {
                remote_comm_id: sender,
                remote_qpn: st.remote_qpn,
                starting_psn: st.rq_psn,
                responder_resources: m.responder_resources,
                initiator_depth: m.initiator_depth,
                failover_accepted: m.flags & REP_FLAG_FAILOVER != 0,
                private_data: Bytes::copy_from_slice(&m.private_data),
            };
            (
                RemoteQpKey {
                    gid: st.remote_gid,
                    qpn: st.remote_qpn,
                },
                event,
            )
        };

        if let Err(dup) = inner.conns.insert_remote(&conn, remote_id, remote_qp) {
            tracing::warn!(
                comm_id,
                existing = dup.existing().local_id(),
                "REP duplicates a live connection"
            );
            inner.fail_establishment(
                &conn,
                RejectReason::StaleConn,
                Some(IdleReason::Failed(RejectReason::StaleConn)),
            );
            return;
        }

        let rtr = {
            let mut st = conn.lock();
            let attr = QpAttr::ReadyToReceive {
                remote_qpn: st.remote_qpn,
                path: st.primary_path.unwrap_or_else(|| {
                    rcm_core::PathRecord::between(inner.local_gid, st.remote_gid)
                }),
                alternate_path: st.alternate_path,
                rq_psn: st.rq_psn,
                path_mtu: st.path_mtu,
                max_dest_rd_atomic: st.responder_resources,
            };
            let result = inner.modify_qp(comm_id, st.local_qpn, &attr);
            if result.is_ok() {
                st.alternate_loaded = st.alternate_path.is_some();
                st.transition(comm_id, CmState::RepReceived);
            }
            result
        };
        if rtr.is_err() {
            inner.fail_establishment(
                &conn,
                RejectReason::NoResources,
                Some(IdleReason::Failed(RejectReason::NoResources)),
            );
            return;
        }
        tracing::debug!(comm_id, remote_comm_id = sender, "REP received");

        match conn.deliver(CmEventKind::RepReceived(event)) {
            Some(CallbackOutcome::Defer) => {}
            Some(CallbackOutcome::Abort) => self.abort_rep(&conn),
            Some(CallbackOutcome::Proceed) | None => {
                if let Err(e) = self.complete_active(&conn) {
                    tracing::debug!(comm_id, error = %e, "RTU not sent");
                }
            }
        }
    }

    /// Finish a deferred REP: RTU, QP to ready-to-send, ESTABLISHED.
    pub fn confirm(&self, comm_id: u32) -> Result<(), CmError> {
        let conn = self.find(comm_id)?;
        self.complete_active(&conn)
    }

    fn complete_active(&self, conn: &Arc<Connection>) -> Result<(), CmError> {
        let inner = self.inner();
        let comm_id = conn.local_id();
        let outcome = {
            let mut st = conn.lock();
            if st.role != Role::Active
                || !matches!(st.state, CmState::RepReceived | CmState::MraRepSent)
            {
                return Err(invalid_state(conn, st.state, "confirm"));
            }
            let ack_timeout = st.primary_path.map(|p| p.local_ack_timeout()).unwrap_or(14);
            let attr = QpAttr::ReadyToSend {
                sq_psn: st.sq_psn,
                local_ack_timeout: ack_timeout,
                retry_count: st.retry_count,
                rnr_retry_count: st.rnr_retry_count,
                max_rd_atomic: st.initiator_depth,
            };
            match inner.modify_qp(comm_id, st.local_qpn, &attr) {
                Ok(()) => {
                    let mad = builder::rtu(st.tid, comm_id, st.remote_id);
                    let bytes = mad.to_bytes();
                    st.transition(comm_id, CmState::Established);
                    st.last_sent = Some(SentMad {
                        attr: mad.msg.attr_id(),
                        dest: st.remote_gid,
                        bytes: bytes.clone(),
                    });
                    st.establish_pending = true;
                    Ok((st.remote_gid, bytes))
                }
                Err(e) => Err(e),
            }
        };
        match outcome {
            Ok((dest, bytes)) => {
                if let Err(e) = inner.send(dest, bytes) {
                    tracing::warn!(comm_id, error = %e, "RTU send failed");
                }
                tracing::debug!(comm_id, "established");
                // Delivered off the send path; a DREQ arriving first flushes
                // it itself. The flush may wait out another callback on this
                // connection, so it runs on the blocking pool.
                let conn = conn.clone();
                inner.runtime.spawn_blocking(move || conn.flush_established());
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

    /// The consumer refused the REP from inside its callback.
    fn abort_rep(&self, conn: &Arc<Connection>) {
        conn.take_handler();
        self.inner()
            .fail_establishment(conn, RejectReason::ConsumerReject, None);
    }

    /// MRA: the peer needs longer than our response timeout.
    pub(crate) fn on_mra(&self, m: &MraMsg) {
        let inner = self.inner();
        let Some(conn) = inner.conns.find(m.remote_comm_id.get()) else {
            return;
        };
        let comm_id = conn.local_id();
        let acknowledged = MessageRef::try_from(m.message_mraed);
        {
            let mut st = conn.lock();
            if st.remote_id != 0 && st.remote_id != m.local_comm_id.get() {
                return;
            }
            let purpose = match (acknowledged, st.state) {
                (Ok(MessageRef::Req), CmState::ReqSent) | (Ok(MessageRef::Rep), CmState::RepSent) => {
                    TimerPurpose::Retransmit
                }
                (Ok(MessageRef::Other), CmState::Established) if st.lap_pending => {
                    TimerPurpose::AltPath
                }
                (_, state) => {
                    tracing::debug!(comm_id, state = %state, "MRA ignored");
                    return;
                }
            };
            let wait = st.response_timeout + exponent_duration(m.service_timeout);
            inner.arm_timer(&conn, &mut st, purpose, wait);
        }
        tracing::debug!(comm_id, service_timeout = m.service_timeout, "MRA received");
        conn.deliver(CmEventKind::MraReceived {
            service_timeout: m.service_timeout,
        });
    }
}
