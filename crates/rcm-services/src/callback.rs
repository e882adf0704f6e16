//! Consumer callback contract.
//!
//! The manager reports every protocol event for a connection through one
//! [`CmHandler`]. Events that expect a decision (a REQ or REP arriving, a
//! proposed alternate path) read the returned [`CallbackOutcome`]; for the
//! others the outcome is ignored.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use rcm_core::wire::{AprStatus, RejectReason};
use rcm_core::{Gid, PathRecord};

/// What the consumer wants done after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Continue the handshake immediately.
    Proceed,
    /// Take no action now. The consumer finishes later through the API
    /// (`accept`, `confirm`, `reject`, `delay`).
    Defer,
    /// Refuse. The manager rejects on the consumer's behalf and stops
    /// reporting events for this connection.
    Abort,
}

/// Why a connection left the established state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent DREQ.
    RemoteClose,
    /// This side called `disconnect` and the peer answered.
    LocalClose,
    /// A repeated REQ showed the peer no longer knows this connection.
    Stale,
    /// The peer never answered our DREQ.
    RemoteTimeout,
}

/// Why a connection reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReason {
    /// The peer sent REJ with this reason.
    Rejected(RejectReason),
    /// Our request was retransmitted the maximum number of times.
    RemoteTimeout,
    /// Time-Wait elapsed after a disconnect.
    TimeWaitDone,
    /// This node abandoned the handshake and sent REJ with this reason.
    Failed(RejectReason),
}

/// Outcome of an alternate path negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AltPathStatus {
    /// The peer answered with APR.
    Response(AprStatus),
    /// LAP was retransmitted the maximum number of times without an APR.
    Timeout,
}

/// Local side of a passive connection, supplied when accepting a REQ.
#[derive(Debug, Clone, Default)]
pub struct AcceptParams {
    pub qpn: u32,
    pub starting_psn: u32,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub rnr_retry_count: u8,
    pub failover_accepted: bool,
    pub private_data: Bytes,
}

/// Where a handler leaves its [`AcceptParams`] before returning `Proceed`
/// for a REQ. Clones share the slot.
#[derive(Debug, Clone, Default)]
pub struct ReplySlot(Arc<Mutex<Option<AcceptParams>>>);

impl ReplySlot {
    pub fn set(&self, params: AcceptParams) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(params);
    }

    pub fn take(&self) -> Option<AcceptParams> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn is_set(&self) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

/// Parameters of an inbound connection request.
#[derive(Debug, Clone)]
pub struct ReqEvent {
    pub service_id: u64,
    pub remote_comm_id: u32,
    pub remote_gid: Gid,
    pub remote_qpn: u32,
    /// Already expressed from this node's side.
    pub primary_path: PathRecord,
    pub alternate_path: Option<PathRecord>,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub peer_to_peer: bool,
    pub private_data: Bytes,
    /// Filled by a handler that returns `Proceed`. Without it the REQ is
    /// rejected with NO_QP, unless this node lost a peer-to-peer collision
    /// and already knows its own QP from `connect`.
    pub reply: ReplySlot,
}

/// Parameters of a connection reply.
#[derive(Debug, Clone)]
pub struct RepEvent {
    pub remote_comm_id: u32,
    pub remote_qpn: u32,
    pub starting_psn: u32,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub failover_accepted: bool,
    pub private_data: Bytes,
}

#[derive(Debug, Clone)]
pub enum CmEventKind {
    ReqReceived(ReqEvent),
    RepReceived(RepEvent),
    /// The peer needs more time; `service_timeout` is log2 of 4.096us units.
    MraReceived { service_timeout: u8 },
    Established,
    Disconnected(DisconnectReason),
    /// Terminal. No further events follow for this comm id.
    Idle(IdleReason),
    /// The peer proposes a new alternate path. Returning `Abort` refuses it.
    LapReceived(PathRecord),
    AltPathResult(AltPathStatus),
}

#[derive(Debug, Clone)]
pub struct CmEvent {
    pub comm_id: u32,
    pub kind: CmEventKind,
}

/// Consumer callback.
///
/// Called with no manager lock held, so the consumer may call back into the
/// manager (`reject`, `disconnect`, ...) from inside `on_event`. It must not
/// call `kill` on the same comm id from inside its own callback.
pub trait CmHandler: Send + Sync {
    fn on_event(&self, event: &CmEvent) -> CallbackOutcome;
}

impl<F> CmHandler for F
where
    F: Fn(&CmEvent) -> CallbackOutcome + Send + Sync,
{
    fn on_event(&self, event: &CmEvent) -> CallbackOutcome {
        self(event)
    }
}
