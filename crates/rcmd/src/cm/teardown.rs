//! Teardown: DREQ/DREP, Time-Wait, and REJ from the peer.

use std::sync::Arc;

use rcm_core::wire::{DrepMsg, DreqMsg, RejMsg};
use rcm_core::{Gid, RejectReason};
use rcm_services::connection::SentMad;
use rcm_services::{
    CmEventKind, CmState, Connection, DisconnectReason, IdleReason, Role, TimerPurpose,
    INVALID_COMM_ID,
};

use super::builder;
use super::{invalid_state, CmContext, CmError};

impl CmContext {
    /// Start closing an established connection: DREQ, DREQ_SENT.
    pub fn disconnect(&self, comm_id: u32) -> Result<(), CmError> {
        let inner = self.inner();
        let conn = self.find(comm_id)?;
        let (dest, bytes) = {
            let mut st = conn.lock();
            match st.state {
                CmState::Established => {}
                CmState::DreqSent | CmState::DreqReceived | CmState::TimeWait => return Ok(()),
                state => return Err(invalid_state(&conn, state, "disconnect")),
            }
            let mad = builder::dreq(inner.next_tid(), comm_id, st.remote_id, st.remote_qpn);
            let bytes = mad.to_bytes();
            st.transition(comm_id, CmState::DreqSent);
            st.last_sent = Some(SentMad {
                attr: mad.msg.attr_id(),
                dest: st.remote_gid,
                bytes: bytes.clone(),
            });
            st.lap_pending = false;
            st.retries = 0;
            let timeout = st.response_timeout;
            inner.arm_timer(&conn, &mut st, TimerPurpose::Retransmit, timeout);
            (st.remote_gid, bytes)
        };
        if let Err(e) = inner.send(dest, bytes) {
            tracing::warn!(comm_id, error = %e, "DREQ send failed");
        }
        tracing::debug!(comm_id, "DREQ sent");
        Ok(())
    }

    pub(crate) fn on_dreq(&self, src: Gid, tid: u64, m: &DreqMsg) {
        let inner = self.inner();
        let sender = m.local_comm_id.get();
        let Some(conn) = inner.conns.find(m.remote_comm_id.get()) else {
            // Our side is already gone; the peer still needs its DREP.
            let drep = builder::drep(tid, m.remote_comm_id.get(), sender);
            inner.send_logged(INVALID_COMM_ID, src, &drep);
            return;
        };
        let comm_id = conn.local_id();

        let (dest, enter) = {
            let mut st = conn.lock();
            if st.remote_id != sender || st.local_qpn != m.remote_qpn.get() {
                tracing::debug!(comm_id, "DREQ does not match connection");
                return;
            }
            let enter = match st.state {
                CmState::Established | CmState::DreqSent => {
                    st.cancel_timer();
                    st.transition(comm_id, CmState::DreqReceived);
                    inner.qp_to_error(comm_id, &mut st);
                    true
                }
                CmState::TimeWait => false,
                state => {
                    tracing::debug!(comm_id, state = %state, "DREQ ignored");
                    return;
                }
            };
            (st.remote_gid, enter)
        };
        inner.send_logged(comm_id, dest, &builder::drep(tid, comm_id, sender));
        if enter {
            self.enter_time_wait(&conn, DisconnectReason::RemoteClose);
        }
    }

    pub(crate) fn on_drep(&self, m: &DrepMsg) {
        let Some(conn) = self.inner().conns.find(m.remote_comm_id.get()) else {
            return;
        };
        {
            let st = conn.lock();
            if st.remote_id != m.local_comm_id.get() || st.state != CmState::DreqSent {
                tracing::debug!(comm_id = conn.local_id(), state = %st.state, "DREP ignored");
                return;
            }
        }
        self.enter_time_wait(&conn, DisconnectReason::LocalClose);
    }

    /// Time-Wait: QP to error, expiry armed, disconnected callback. An
    /// established callback still owed is delivered first.
    pub(crate) fn enter_time_wait(&self, conn: &Arc<Connection>, reason: DisconnectReason) {
        let inner = self.inner();
        let comm_id = conn.local_id();
        conn.flush_established();
        {
            let mut st = conn.lock();
            if !matches!(
                st.state,
                CmState::Established | CmState::DreqSent | CmState::DreqReceived
            ) {
                return;
            }
            st.cancel_timer();
            inner.qp_to_error(comm_id, &mut st);
            st.lap_pending = false;
            st.transition(comm_id, CmState::TimeWait);
            let timewait = inner.timing.timewait();
            inner.arm_timer(conn, &mut st, TimerPurpose::TimeWait, timewait);
        }
        tracing::debug!(comm_id, reason = ?reason, "time wait");
        conn.deliver(CmEventKind::Disconnected(reason));
    }

    pub(crate) fn on_rej(&self, m: &RejMsg) {
        let inner = self.inner();
        let sender = m.local_comm_id.get();
        let target = m.remote_comm_id.get();
        let conn = if target != INVALID_COMM_ID {
            inner.conns.find(target)
        } else {
            builder::rej_sender_guid(m).and_then(|guid| inner.conns.find_by_remote_id(guid, sender))
        };
        let Some(conn) = conn else {
            tracing::debug!(comm_id = target, "REJ for unknown connection");
            return;
        };
        let comm_id = conn.local_id();
        let reason = RejectReason::from(m.reason.get());

        {
            let mut st = conn.lock();
            if st.remote_id != INVALID_COMM_ID && st.remote_id != sender {
                tracing::debug!(comm_id, "REJ from an unrelated attempt ignored");
                return;
            }
            match st.state {
                CmState::Idle | CmState::Listening | CmState::TimeWait => {
                    tracing::debug!(comm_id, state = %st.state, "REJ ignored");
                    return;
                }
                _ => {}
            }
            st.cancel_timer();
            inner.qp_to_error(comm_id, &mut st);
            if st.role == Role::Active {
                inner.clear_peer_to_peer(comm_id, &st);
            }
            st.transition(comm_id, CmState::Idle);
        }
        tracing::debug!(comm_id, reason = ?reason, "REJ received");
        conn.flush_established();
        conn.deliver(CmEventKind::Idle(IdleReason::Rejected(reason)));
        inner.conns.free(&conn);
    }
}
