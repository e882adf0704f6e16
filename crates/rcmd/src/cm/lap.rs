//! Path migration: LAP/APR and explicit migrate.

use rcm_core::wire::{AprMsg, AprStatus, LapMsg};
use rcm_core::{AttrId, PathRecord};
use rcm_services::connection::SentMad;
use rcm_services::{
    AltPathStatus, CallbackOutcome, CmEventKind, CmState, QpAttr, Role, TimerPurpose,
};

use super::builder;
use super::{invalid_state, timeout_exponent, CmContext, CmError};

impl CmContext {
    /// Propose `path` to the peer as the new alternate path. Only the
    /// active side of an established connection may ask.
    pub fn load_alternate_path(&self, comm_id: u32, path: PathRecord) -> Result<(), CmError> {
        let inner = self.inner();
        let conn = self.find(comm_id)?;
        let (dest, bytes) = {
            let mut st = conn.lock();
            if st.state != CmState::Established || st.role != Role::Active {
                return Err(invalid_state(&conn, st.state, "load_alternate_path"));
            }
            if st.lap_pending {
                return Err(CmError::LapPending);
            }
            let mad = builder::lap(
                inner.next_tid(),
                comm_id,
                st.remote_id,
                st.remote_qpn,
                timeout_exponent(st.response_timeout),
                &path,
            );
            let bytes = mad.to_bytes();
            st.alternate_path = Some(path);
            st.alternate_loaded = false;
            st.lap_pending = true;
            st.lap_sent = Some(SentMad {
                attr: AttrId::Lap,
                dest: st.remote_gid,
                bytes: bytes.clone(),
            });
            st.retries = 0;
            let timeout = st.response_timeout;
            inner.arm_timer(&conn, &mut st, TimerPurpose::AltPath, timeout);
            (st.remote_gid, bytes)
        };
        if let Err(e) = inner.send(dest, bytes) {
            tracing::warn!(comm_id, error = %e, "LAP send failed");
        }
        tracing::debug!(comm_id, "LAP sent");
        Ok(())
    }

    pub(crate) fn on_lap(&self, tid: u64, m: &LapMsg) {
        let inner = self.inner();
        let Some(conn) = inner.conns.find(m.remote_comm_id.get()) else {
            return;
        };
        let comm_id = conn.local_id();
        let sender = m.local_comm_id.get();
        let path = PathRecord::from_wire(&m.alternate_path).reversed();

        let (dest, qpn, mismatch) = {
            let st = conn.lock();
            if st.remote_id != sender
                || st.state != CmState::Established
                || st.role != Role::Passive
            {
                tracing::debug!(comm_id, state = %st.state, "LAP ignored");
                return;
            }
            (st.remote_gid, st.local_qpn, st.local_qpn != m.remote_qpn.get())
        };

        let status = if mismatch {
            AprStatus::QpnMismatch
        } else {
            match conn.deliver(CmEventKind::LapReceived(path)) {
                Some(CallbackOutcome::Abort) => AprStatus::Rejected,
                _ => match inner.modify_qp(comm_id, qpn, &QpAttr::LoadAlternatePath(path)) {
                    Ok(()) => {
                        let mut st = conn.lock();
                        st.alternate_path = Some(path);
                        st.alternate_loaded = true;
                        AprStatus::Loaded
                    }
                    Err(_) => AprStatus::Rejected,
                },
            }
        };
        tracing::debug!(comm_id, status = ?status, "APR sent");
        inner.send_logged(comm_id, dest, &builder::apr(tid, comm_id, sender, status));
    }

    pub(crate) fn on_apr(&self, m: &AprMsg) {
        let inner = self.inner();
        let Some(conn) = inner.conns.find(m.remote_comm_id.get()) else {
            return;
        };
        let comm_id = conn.local_id();
        let status = match AprStatus::try_from(m.status) {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(comm_id, error = %e, "APR dropped");
                return;
            }
        };
        {
            let mut st = conn.lock();
            if st.remote_id != m.local_comm_id.get() || !st.lap_pending {
                tracing::debug!(comm_id, "APR ignored");
                return;
            }
            st.lap_pending = false;
            st.lap_sent = None;
            if st.timer.as_ref().map(|t| t.purpose) == Some(TimerPurpose::AltPath) {
                st.cancel_timer();
            }
            if status == AprStatus::Loaded {
                if let Some(path) = st.alternate_path {
                    st.alternate_loaded = inner
                        .modify_qp(comm_id, st.local_qpn, &QpAttr::LoadAlternatePath(path))
                        .is_ok();
                }
            }
        }
        tracing::debug!(comm_id, status = ?status, "APR received");
        conn.deliver(CmEventKind::AltPathResult(AltPathStatus::Response(status)));
    }

    /// Switch the connection onto its loaded alternate path.
    pub fn migrate(&self, comm_id: u32) -> Result<(), CmError> {
        let inner = self.inner();
        let conn = self.find(comm_id)?;
        let mut st = conn.lock();
        if st.state != CmState::Established {
            return Err(invalid_state(&conn, st.state, "migrate"));
        }
        let alternate = match (st.alternate_loaded, st.alternate_path) {
            (true, Some(path)) => path,
            _ => return Err(CmError::NoAlternatePath),
        };
        inner.modify_qp(comm_id, st.local_qpn, &QpAttr::Migrate)?;
        st.primary_path = Some(alternate);
        st.alternate_path = None;
        st.alternate_loaded = false;
        tracing::info!(comm_id, dgid = %alternate.dgid, "migrated to alternate path");
        Ok(())
    }
}
