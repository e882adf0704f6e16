//! Per-connection state shared by the registry and the state machines.
//!
//! A [`Connection`] is always handled through an `Arc`; holding one is a
//! pin. Protocol state lives behind a short-lived mutex that is never held
//! across a send, an await, or a consumer callback.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use rcm_core::wire::AttrId;
use rcm_core::{Gid, PathRecord};

use crate::callback::{CallbackOutcome, CmEvent, CmEventKind, CmHandler};

/// Reserved comm id. Never assigned to a live connection; on the wire it
/// means "not yet known".
pub const INVALID_COMM_ID: u32 = 0;

/// Most recent states kept per connection for diagnostics.
const HISTORY_LIMIT: usize = 32;

// ── Protocol state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmState {
    Idle,
    ReqSent,
    RepReceived,
    MraRepSent,
    Established,
    Listening,
    ReqReceived,
    MraSent,
    RepSent,
    DreqSent,
    DreqReceived,
    TimeWait,
}

impl CmState {
    /// Edges of the connection state graph.
    pub fn can_transition(self, to: CmState) -> bool {
        use CmState::*;
        matches!(
            (self, to),
            (Idle, ReqSent)
                | (Idle, ReqReceived)
                | (Idle, Listening)
                | (Listening, Idle)
                | (ReqSent, RepReceived)
                | (ReqSent, ReqReceived)
                | (ReqSent, Idle)
                | (RepReceived, MraRepSent)
                | (RepReceived, Established)
                | (RepReceived, Idle)
                | (MraRepSent, Established)
                | (MraRepSent, Idle)
                | (ReqReceived, MraSent)
                | (ReqReceived, RepSent)
                | (ReqReceived, Idle)
                | (MraSent, RepSent)
                | (MraSent, Idle)
                | (RepSent, Established)
                | (RepSent, Idle)
                | (Established, DreqSent)
                | (Established, DreqReceived)
                | (Established, TimeWait)
                | (Established, Idle)
                | (DreqSent, DreqReceived)
                | (DreqSent, TimeWait)
                | (DreqSent, Idle)
                | (DreqReceived, TimeWait)
                | (DreqReceived, Idle)
                | (TimeWait, Idle)
        )
    }

    /// States in which the connection is still negotiating.
    pub fn is_establishing(self) -> bool {
        use CmState::*;
        matches!(
            self,
            ReqSent | RepReceived | MraRepSent | ReqReceived | MraSent | RepSent
        )
    }
}

impl fmt::Display for CmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CmState::Idle => "idle",
            CmState::ReqSent => "req sent",
            CmState::RepReceived => "rep received",
            CmState::MraRepSent => "mra rep sent",
            CmState::Established => "established",
            CmState::Listening => "listening",
            CmState::ReqReceived => "req received",
            CmState::MraSent => "mra sent",
            CmState::RepSent => "rep sent",
            CmState::DreqSent => "dreq sent",
            CmState::DreqReceived => "dreq received",
            CmState::TimeWait => "time wait",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Active,
    Passive,
}

// ── Timer and retransmission bookkeeping ─────────────────────────────────────

/// What the connection's single timer is currently armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPurpose {
    /// Resend `last_sent` (REQ, REP, or DREQ) or give up.
    Retransmit,
    /// Resend LAP or give up on the alternate path.
    AltPath,
    /// Release the connection after Time-Wait.
    TimeWait,
}

#[derive(Debug)]
pub struct ArmedTimer {
    pub purpose: TimerPurpose,
    pub generation: u64,
    handle: AbortHandle,
}

/// The last datagram sent for this connection, kept so a retransmission
/// puts exactly the same bytes back on the wire.
#[derive(Debug, Clone)]
pub struct SentMad {
    pub attr: AttrId,
    pub dest: Gid,
    pub bytes: Bytes,
}

/// Secondary index keys this connection is currently registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteQpKey {
    pub gid: Gid,
    pub qpn: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteId {
    pub ca_guid: u64,
    pub comm_id: u32,
}

// ── Mutable state ─────────────────────────────────────────────────────────────

pub struct ConnState {
    pub state: CmState,
    pub role: Role,
    pub remote_id: u32,
    pub remote_ca_guid: u64,
    pub remote_gid: Gid,
    pub tid: u64,
    pub service_id: u64,
    pub peer_to_peer: bool,

    pub local_qpn: u32,
    pub remote_qpn: u32,
    pub primary_path: Option<PathRecord>,
    pub alternate_path: Option<PathRecord>,
    /// The alternate path has been programmed into the QP and may be
    /// migrated to.
    pub alternate_loaded: bool,
    pub sq_psn: u32,
    pub rq_psn: u32,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub path_mtu: u8,
    pub pkey: u16,
    pub qkey: u32,

    pub max_cm_retries: u8,
    pub retries: u8,
    pub response_timeout: Duration,
    pub last_sent: Option<SentMad>,
    /// Outstanding LAP, retransmitted by the `AltPath` timer.
    pub lap_sent: Option<SentMad>,
    pub timer: Option<ArmedTimer>,
    timer_generation: u64,

    pub handler: Option<Arc<dyn CmHandler>>,
    pub lap_pending: bool,
    pub establish_pending: bool,
    pub established_at: Option<Instant>,
    pub qp_in_error: bool,

    pub indexed_remote_id: Option<RemoteId>,
    pub indexed_remote_qp: Option<RemoteQpKey>,

    history: Vec<CmState>,
}

impl ConnState {
    fn new() -> Self {
        Self {
            state: CmState::Idle,
            role: Role::Active,
            remote_id: INVALID_COMM_ID,
            remote_ca_guid: 0,
            remote_gid: Gid::ZERO,
            tid: 0,
            service_id: 0,
            peer_to_peer: false,
            local_qpn: 0,
            remote_qpn: 0,
            primary_path: None,
            alternate_path: None,
            alternate_loaded: false,
            sq_psn: 0,
            rq_psn: 0,
            retry_count: 0,
            rnr_retry_count: 0,
            responder_resources: 0,
            initiator_depth: 0,
            path_mtu: 0,
            pkey: 0xffff,
            qkey: 0,
            max_cm_retries: 0,
            retries: 0,
            response_timeout: Duration::ZERO,
            last_sent: None,
            lap_sent: None,
            timer: None,
            timer_generation: 0,
            handler: None,
            lap_pending: false,
            establish_pending: false,
            established_at: None,
            qp_in_error: false,
            indexed_remote_id: None,
            indexed_remote_qp: None,
            history: vec![CmState::Idle],
        }
    }

    /// Move to `to`. Edges outside the state graph are refused and logged;
    /// the caller treats a refusal as a protocol state violation.
    pub fn transition(&mut self, local_id: u32, to: CmState) -> bool {
        if !self.state.can_transition(to) {
            tracing::warn!(comm_id = local_id, from = %self.state, to = %to, "refused state transition");
            return false;
        }
        tracing::debug!(comm_id = local_id, from = %self.state, to = %to, "state transition");
        self.state = to;
        if self.history.len() == HISTORY_LIMIT {
            self.history.remove(0);
        }
        self.history.push(to);
        if to == CmState::Established {
            self.established_at = Some(Instant::now());
        }
        true
    }

    /// States visited so far, oldest first.
    pub fn history(&self) -> &[CmState] {
        &self.history
    }

    /// The attribute of the last message sent, if any.
    pub fn last_sent_attr(&self) -> Option<AttrId> {
        self.last_sent.as_ref().map(|m| m.attr)
    }

    /// Reserve a generation number for a new timer arm.
    pub fn next_timer_generation(&mut self) -> u64 {
        self.timer_generation += 1;
        self.timer_generation
    }

    /// Record a freshly spawned timer. Any previous arm is aborted.
    pub fn set_timer(&mut self, purpose: TimerPurpose, generation: u64, handle: AbortHandle) {
        if let Some(old) = self.timer.replace(ArmedTimer {
            purpose,
            generation,
            handle,
        }) {
            old.handle.abort();
        }
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }

    /// If the timer with `generation` is still the armed one, disarm it and
    /// return its purpose. A stale fire (the arm was replaced or cancelled
    /// after the sleep completed) returns `None`.
    pub fn take_expired_timer(&mut self, generation: u64) -> Option<TimerPurpose> {
        match &self.timer {
            Some(t) if t.generation == generation => self.timer.take().map(|t| t.purpose),
            _ => None,
        }
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

pub struct Connection {
    local_id: u32,
    inner: Mutex<ConnState>,
    /// Serializes callback delivery so events reach the consumer in the
    /// order they were produced.
    order: Mutex<()>,
    /// Thread currently holding `order`.
    order_owner: Mutex<Option<ThreadId>>,
    freed: AtomicBool,
    callbacks: AtomicUsize,
    drained: Notify,
}

impl Connection {
    pub(crate) fn new(local_id: u32) -> Self {
        Self {
            local_id,
            inner: Mutex::new(ConnState::new()),
            order: Mutex::new(()),
            order_owner: Mutex::new(None),
            freed: AtomicBool::new(false),
            callbacks: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Lock the protocol state. Never hold the guard across an await or a
    /// consumer callback.
    pub fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CmState {
        self.lock().state
    }

    /// True once the registry has detached this connection.
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_freed(&self) -> bool {
        !self.freed.swap(true, Ordering::AcqRel)
    }

    // ── Callback dispatch ────────────────────────────────────────────────────

    /// Invoke the consumer callback for this connection.
    ///
    /// Returns `None` when there is no consumer (never set, dropped after an
    /// abort, or cleared by `kill`). The in-flight count is raised while the
    /// state lock is still held, so a concurrent [`Self::take_handler`]
    /// followed by [`Self::callbacks_drained`] always waits for this call.
    pub fn deliver(&self, kind: CmEventKind) -> Option<CallbackOutcome> {
        self.in_order(|| self.deliver_ordered(kind))
    }

    /// Deliver a deferred `Established` if one is still owed. Whoever
    /// clears `establish_pending` delivers it, and it always lands before
    /// any event delivered after this call returns.
    pub fn flush_established(&self) {
        self.in_order(|| {
            let owed = std::mem::take(&mut self.lock().establish_pending);
            if owed {
                self.deliver_ordered(CmEventKind::Established);
            }
        });
    }

    /// Run `f` holding the delivery order. A consumer that calls back into
    /// the manager from its callback already holds it on this thread, so
    /// the nested delivery runs in place. Any other thread blocks until the
    /// running callback returns.
    fn in_order<R>(&self, f: impl FnOnce() -> R) -> R {
        let me = std::thread::current().id();
        if *self.order_owner.lock().unwrap_or_else(PoisonError::into_inner) == Some(me) {
            return f();
        }
        let _order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        let _owner = OrderOwner::claim(self, me);
        f()
    }

    fn deliver_ordered(&self, kind: CmEventKind) -> Option<CallbackOutcome> {
        let handler = {
            let st = self.lock();
            let handler = st.handler.clone()?;
            self.callbacks.fetch_add(1, Ordering::SeqCst);
            handler
        };
        let _in_flight = InFlight(self);
        let event = CmEvent {
            comm_id: self.local_id,
            kind,
        };
        Some(handler.on_event(&event))
    }

    /// Drop the consumer so no further callbacks start.
    pub fn take_handler(&self) -> Option<Arc<dyn CmHandler>> {
        self.lock().handler.take()
    }

    /// Callbacks currently executing for this connection.
    pub fn callbacks_in_flight(&self) -> usize {
        self.callbacks.load(Ordering::SeqCst)
    }

    /// Wait until no callback is executing.
    pub async fn callbacks_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.callbacks.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local_id", &self.local_id)
            .field("state", &self.state())
            .field("freed", &self.is_freed())
            .finish()
    }
}

struct OrderOwner<'a>(&'a Connection);

impl<'a> OrderOwner<'a> {
    fn claim(conn: &'a Connection, thread: ThreadId) -> Self {
        *conn.order_owner.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread);
        Self(conn)
    }
}

impl Drop for OrderOwner<'_> {
    fn drop(&mut self) {
        *self.0.order_owner.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

struct InFlight<'a>(&'a Connection);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.callbacks.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}
