//! The connection manager engine.
//!
//! [`CmContext`] owns the connection and service registries and drives every
//! connection's state machine, from inbound datagrams (see `dispatch`),
//! from timer tasks, and from the application API below. All state lives in
//! the context; there are no statics.

mod active;
pub(crate) mod builder;
mod lap;
mod passive;
mod teardown;
mod timer;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::runtime::Handle;

use rcm_core::config::{CmConfig, TimingConfig};
use rcm_core::wire::{Mad, MessageRef, WireError};
use rcm_core::{Gid, PathRecord, RejectReason};
use rcm_services::connection::ConnState;
use rcm_services::{
    CmEventKind, CmHandler, CmState, ConnTable, Connection, IdleReason, MadTransport, QpAttr,
    QpControl, QpError, Role, Service, ServiceError, ServiceTable, TransportError,
};

pub use rcm_services::AcceptParams;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CmError {
    #[error("no connection with comm id {0}")]
    UnknownConnection(u32),

    #[error("comm id {comm_id} is {state}; {operation} is not allowed")]
    InvalidState {
        comm_id: u32,
        state: CmState,
        operation: &'static str,
    },

    #[error("no listener for service 0x{0:016x}")]
    NoListener(u64),

    #[error("a peer-to-peer connect is already pending on service 0x{0:016x}")]
    PeerToPeerBusy(u64),

    #[error("alternate path request already pending")]
    LapPending,

    #[error("no alternate path loaded")]
    NoAlternatePath,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Qp(#[from] QpError),
}

fn invalid_state(conn: &Connection, state: CmState, operation: &'static str) -> CmError {
    CmError::InvalidState {
        comm_id: conn.local_id(),
        state,
        operation,
    }
}

// ── Parameters ────────────────────────────────────────────────────────────────

/// Everything `connect` needs to build a REQ.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub service_id: u64,
    pub qpn: u32,
    pub primary_path: PathRecord,
    pub alternate_path: Option<PathRecord>,
    pub starting_psn: u32,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
    pub path_mtu: u8,
    pub qkey: u32,
    /// Also listening on `service_id`; a simultaneous REQ from the peer is
    /// resolved by collision rules instead of creating a second connection.
    pub peer_to_peer: bool,
    pub private_data: Bytes,
}

impl ConnectParams {
    pub fn new(service_id: u64, qpn: u32, primary_path: PathRecord) -> Self {
        Self {
            service_id,
            qpn,
            primary_path,
            alternate_path: None,
            starting_psn: rand::random::<u32>() & 0x00ff_ffff,
            responder_resources: 4,
            initiator_depth: 4,
            retry_count: 7,
            rnr_retry_count: 7,
            path_mtu: 5,
            qkey: 0,
            peer_to_peer: false,
            private_data: Bytes::new(),
        }
    }
}

// ── Context ───────────────────────────────────────────────────────────────────

/// A running connection manager. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CmContext {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) local_gid: Gid,
    pub(crate) ca_guid: u64,
    pub(crate) pkey: u16,
    pub(crate) timing: TimingConfig,
    pub(crate) conns: ConnTable,
    pub(crate) services: ServiceTable,
    /// Listen handles (LISTENING connections) and the service each owns.
    listeners: DashMap<u32, Arc<Service>>,
    transport: Arc<dyn MadTransport>,
    pub(crate) qp: Arc<dyn QpControl>,
    tid_high: u32,
    tid_low: AtomicU32,
    /// Timers and deferred deliveries run here, so the synchronous API
    /// works from threads outside the runtime.
    pub(crate) runtime: Handle,
}

impl CmContext {
    /// Build a connection manager bound to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(
        config: &CmConfig,
        transport: Arc<dyn MadTransport>,
        qp: Arc<dyn QpControl>,
    ) -> Self {
        let inner = Inner {
            local_gid: Gid::from(config.identity.port_gid),
            ca_guid: config.identity.effective_ca_guid(),
            pkey: config.identity.pkey,
            timing: config.timing.clone(),
            conns: ConnTable::new(),
            services: ServiceTable::new(),
            listeners: DashMap::new(),
            transport,
            qp,
            tid_high: rand::random(),
            tid_low: AtomicU32::new(0),
            runtime: Handle::current(),
        };
        tracing::debug!(
            gid = %inner.local_gid,
            ca_guid = %format_args!("0x{:016x}", inner.ca_guid),
            "connection manager ready"
        );
        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    pub fn local_gid(&self) -> Gid {
        self.inner.local_gid
    }

    /// Protocol state of a live connection.
    pub fn state(&self, comm_id: u32) -> Option<CmState> {
        self.inner.conns.find(comm_id).map(|c| c.state())
    }

    /// States a live connection has passed through, oldest first.
    pub fn history(&self, comm_id: u32) -> Option<Vec<CmState>> {
        self.inner
            .conns
            .find(comm_id)
            .map(|c| c.lock().history().to_vec())
    }

    /// Number of live connections, listen handles included.
    pub fn connection_count(&self) -> usize {
        self.inner.conns.len()
    }

    // ── Listening ────────────────────────────────────────────────────────────

    /// Accept REQs for every service id matching `service_id` under
    /// `service_mask`. Returns the listen handle.
    pub fn listen(
        &self,
        service_id: u64,
        service_mask: u64,
        handler: Arc<dyn CmHandler>,
    ) -> Result<u32, CmError> {
        let service = self.inner.services.create(service_id, service_mask, handler)?;
        let conn = self.inner.conns.create();
        {
            let mut st = conn.lock();
            st.service_id = service.id();
            st.transition(conn.local_id(), CmState::Listening);
        }
        self.inner.listeners.insert(conn.local_id(), service);
        tracing::info!(
            comm_id = conn.local_id(),
            service_id = %format_args!("0x{service_id:016x}"),
            "listening"
        );
        Ok(conn.local_id())
    }

    /// Remove a listener. Waits for any REQ currently being matched
    /// against it; connections it already produced are unaffected.
    pub async fn stop_listen(&self, listen_id: u32) -> Result<(), CmError> {
        let (_, service) = self
            .inner
            .listeners
            .remove(&listen_id)
            .ok_or(CmError::UnknownConnection(listen_id))?;
        self.inner.services.free(&service).await;
        if let Some(conn) = self.inner.conns.find(listen_id) {
            conn.lock().transition(listen_id, CmState::Idle);
            self.inner.conns.free(&conn);
        }
        tracing::info!(comm_id = listen_id, "stopped listening");
        Ok(())
    }

    /// A locally administered service id nothing listens on yet.
    pub fn assign_local_service_id(&self) -> u64 {
        self.inner.services.assign_local_service_id()
    }

    // ── Forced teardown ──────────────────────────────────────────────────────

    /// Tear a connection down without further callbacks.
    ///
    /// Clears the consumer first and waits for any callback already running
    /// to return, then sends REJ (still establishing) or DREQ (established)
    /// and frees the connection. Must not be called from inside the same
    /// connection's callback.
    pub async fn kill(&self, comm_id: u32) -> Result<(), CmError> {
        if self.inner.listeners.contains_key(&comm_id) {
            return self.stop_listen(comm_id).await;
        }
        let conn = self
            .inner
            .conns
            .find(comm_id)
            .ok_or(CmError::UnknownConnection(comm_id))?;

        conn.take_handler();
        conn.callbacks_drained().await;

        let outgoing = {
            let mut st = conn.lock();
            st.cancel_timer();
            let state = st.state;
            let outgoing = if state.is_establishing() {
                let msg_ref = rejected_message(&st);
                Some(builder::rej(
                    st.tid,
                    comm_id,
                    st.remote_id,
                    msg_ref,
                    RejectReason::ConsumerReject,
                    self.inner.ca_guid,
                ))
            } else if state == CmState::Established {
                Some(builder::dreq(
                    self.inner.next_tid(),
                    comm_id,
                    st.remote_id,
                    st.remote_qpn,
                ))
            } else {
                None
            };
            self.inner.qp_to_error(comm_id, &mut st);
            self.inner.clear_peer_to_peer(comm_id, &st);
            st.transition(comm_id, CmState::Idle);
            outgoing.map(|mad| (st.remote_gid, mad))
        };
        if let Some((dest, mad)) = outgoing {
            self.inner.send_logged(comm_id, dest, &mad);
        }
        self.inner.conns.free(&conn);
        tracing::debug!(comm_id, "connection killed");
        Ok(())
    }

    /// Kill every connection and drop every listener.
    pub async fn shutdown(&self) {
        let listeners: Vec<u32> = self.inner.listeners.iter().map(|e| *e.key()).collect();
        for id in listeners {
            let _ = self.stop_listen(id).await;
        }
        for conn in self.inner.conns.connections() {
            let _ = self.kill(conn.local_id()).await;
        }
    }

    pub(crate) fn find(&self, comm_id: u32) -> Result<Arc<Connection>, CmError> {
        self.inner
            .conns
            .find(comm_id)
            .ok_or(CmError::UnknownConnection(comm_id))
    }
}

// ── Shared engine helpers ─────────────────────────────────────────────────────

impl Inner {
    /// High 32 bits fixed per context, low 32 bits counting.
    pub(crate) fn next_tid(&self) -> u64 {
        let low = self.tid_low.fetch_add(1, Ordering::Relaxed);
        (u64::from(self.tid_high) << 32) | u64::from(low)
    }

    pub(crate) fn send(&self, dest: Gid, bytes: Bytes) -> Result<(), TransportError> {
        self.transport.send_mad(dest, bytes)
    }

    /// Send and only log a failure. Used where a lost datagram is covered
    /// by a retry timer or by the peer's own retransmission.
    pub(crate) fn send_logged(&self, comm_id: u32, dest: Gid, mad: &Mad) {
        let attr = mad.msg.attr_id();
        tracing::trace!(comm_id, attr = ?attr, dest = %dest, "send");
        if let Err(e) = self.send(dest, mad.to_bytes()) {
            tracing::warn!(comm_id, attr = ?attr, dest = %dest, error = %e, "send failed");
        }
    }

    pub(crate) fn resend(&self, comm_id: u32, sent: &rcm_services::connection::SentMad) {
        tracing::debug!(comm_id, attr = ?sent.attr, "retransmit");
        if let Err(e) = self.send(sent.dest, sent.bytes.clone()) {
            tracing::warn!(comm_id, attr = ?sent.attr, error = %e, "retransmit failed");
        }
    }

    pub(crate) fn modify_qp(&self, comm_id: u32, qpn: u32, attr: &QpAttr) -> Result<(), QpError> {
        let result = self.qp.modify(qpn, attr);
        match &result {
            Ok(()) => tracing::trace!(comm_id, qpn, state = ?attr.target_state(), "qp modified"),
            Err(e) => tracing::warn!(comm_id, qpn, error = %e, "qp modify failed"),
        }
        result
    }

    /// Force the connection's QP into the error state once.
    pub(crate) fn qp_to_error(&self, comm_id: u32, st: &mut ConnState) {
        if st.local_qpn == 0 || st.qp_in_error {
            return;
        }
        st.qp_in_error = true;
        let _ = self.modify_qp(comm_id, st.local_qpn, &QpAttr::Error);
    }

    /// Forget an outstanding peer-to-peer attempt owned by this connection.
    pub(crate) fn clear_peer_to_peer(&self, comm_id: u32, st: &ConnState) {
        if !st.peer_to_peer || st.role != Role::Active {
            return;
        }
        if let Some(service) = self.services.peek(st.service_id) {
            service.clear_peer_to_peer(comm_id);
        }
    }

    /// Abandon a connection that has not reached ESTABLISHED: REJ to the
    /// peer, QP to error, optional idle callback, free.
    pub(crate) fn fail_establishment(
        &self,
        conn: &Arc<Connection>,
        reason: RejectReason,
        idle: Option<IdleReason>,
    ) {
        let comm_id = conn.local_id();
        let (dest, rej) = {
            let mut st = conn.lock();
            if st.state == CmState::Idle {
                return;
            }
            st.cancel_timer();
            let rej = builder::rej(
                st.tid,
                comm_id,
                st.remote_id,
                rejected_message(&st),
                reason,
                self.ca_guid,
            );
            self.qp_to_error(comm_id, &mut st);
            self.clear_peer_to_peer(comm_id, &st);
            st.transition(comm_id, CmState::Idle);
            (st.remote_gid, rej)
        };
        tracing::debug!(comm_id, reason = ?reason, "establishment failed");
        self.send_logged(comm_id, dest, &rej);
        if let Some(idle) = idle {
            conn.flush_established();
            conn.deliver(CmEventKind::Idle(idle));
        }
        self.conns.free(conn);
    }
}

/// Which message a REJ sent from the current state refers to.
pub(crate) fn rejected_message(st: &ConnState) -> MessageRef {
    match st.state {
        CmState::ReqReceived | CmState::MraSent => MessageRef::Req,
        CmState::RepReceived | CmState::MraRepSent => MessageRef::Rep,
        _ => MessageRef::Other,
    }
}

/// Extra wait requested by an MRA: 4.096us * 2^exponent.
pub(crate) fn exponent_duration(exponent: u8) -> Duration {
    Duration::from_nanos(4_096u64 << exponent.min(31))
}

/// Smallest exponent whose [`exponent_duration`] covers `timeout`.
pub(crate) fn timeout_exponent(timeout: Duration) -> u8 {
    (0u8..31)
        .find(|e| exponent_duration(*e) >= timeout)
        .unwrap_or(31)
}
