//! Per-connection timer.
//!
//! Each connection has at most one armed timer, a spawned task that sleeps
//! and then calls back into the engine. The task holds only a weak
//! reference to the context, so a dropped context cancels nothing it does
//! not own. Every arm gets a generation number; a task whose generation is
//! no longer the armed one does nothing when it wakes.

use std::sync::{Arc, Weak};
use std::time::Duration;

use rcm_core::RejectReason;
use rcm_services::connection::ConnState;
use rcm_services::{
    AltPathStatus, CmEventKind, CmState, Connection, DisconnectReason, IdleReason, TimerPurpose,
};

use super::{CmContext, Inner};

impl Inner {
    /// Arm the connection's timer, replacing any previous arm.
    pub(crate) fn arm_timer(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        st: &mut ConnState,
        purpose: TimerPurpose,
        after: Duration,
    ) {
        let generation = st.next_timer_generation();
        let ctx: Weak<Inner> = Arc::downgrade(self);
        let conn = conn.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = ctx.upgrade() {
                CmContext::from_inner(inner).on_timer(&conn, generation);
            }
        });
        st.set_timer(purpose, generation, task.abort_handle());
    }
}

impl CmContext {
    fn on_timer(&self, conn: &Arc<Connection>, generation: u64) {
        let comm_id = conn.local_id();
        let purpose = {
            let mut st = conn.lock();
            match st.take_expired_timer(generation) {
                Some(purpose) => purpose,
                None => return,
            }
        };
        tracing::trace!(comm_id, purpose = ?purpose, "timer expired");
        match purpose {
            TimerPurpose::Retransmit => self.retransmit_expired(conn),
            TimerPurpose::AltPath => self.lap_expired(conn),
            TimerPurpose::TimeWait => self.time_wait_expired(conn),
        }
    }

    fn retransmit_expired(&self, conn: &Arc<Connection>) {
        let inner = self.inner();
        let comm_id = conn.local_id();
        let resend = {
            let mut st = conn.lock();
            let waiting = matches!(
                st.state,
                CmState::ReqSent | CmState::RepSent | CmState::DreqSent
            );
            if !waiting {
                return;
            }
            if st.retries < st.max_cm_retries {
                st.retries += 1;
                let timeout = st.response_timeout;
                inner.arm_timer(conn, &mut st, TimerPurpose::Retransmit, timeout);
                st.last_sent.clone()
            } else {
                None
            }
        };
        if let Some(sent) = resend {
            inner.resend(comm_id, &sent);
            return;
        }

        let state = conn.state();
        tracing::debug!(comm_id, state = %state, "retries exhausted");
        match state {
            CmState::ReqSent | CmState::RepSent => inner.fail_establishment(
                conn,
                RejectReason::Timeout,
                Some(IdleReason::RemoteTimeout),
            ),
            CmState::DreqSent => self.enter_time_wait(conn, DisconnectReason::RemoteTimeout),
            _ => {}
        }
    }

    fn lap_expired(&self, conn: &Arc<Connection>) {
        let inner = self.inner();
        let comm_id = conn.local_id();
        let resend = {
            let mut st = conn.lock();
            if !st.lap_pending || st.state != CmState::Established {
                return;
            }
            if st.retries < st.max_cm_retries {
                st.retries += 1;
                let timeout = st.response_timeout;
                inner.arm_timer(conn, &mut st, TimerPurpose::AltPath, timeout);
                st.lap_sent.clone()
            } else {
                st.lap_pending = false;
                st.lap_sent = None;
                None
            }
        };
        match resend {
            Some(sent) => inner.resend(comm_id, &sent),
            None => {
                tracing::debug!(comm_id, "alternate path request timed out");
                conn.deliver(CmEventKind::AltPathResult(AltPathStatus::Timeout));
            }
        }
    }

    fn time_wait_expired(&self, conn: &Arc<Connection>) {
        let comm_id = conn.local_id();
        {
            let mut st = conn.lock();
            if st.state != CmState::TimeWait {
                return;
            }
            st.transition(comm_id, CmState::Idle);
        }
        conn.flush_established();
        conn.deliver(CmEventKind::Idle(IdleReason::TimeWaitDone));
        self.inner().conns.free(conn);
    }
}
