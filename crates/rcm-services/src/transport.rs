//! Collaborator seams — the datagram channel that carries CM messages and
//! the queue-pair layer the negotiated parameters are applied to.

use bytes::Bytes;

use rcm_core::{Gid, PathRecord};

/// Unreliable datagram channel to other nodes' CM endpoints.
pub trait MadTransport: Send + Sync {
    /// Hand one encoded CM datagram to the channel. Must not block; a full
    /// queue is reported as an error and the retry timer covers the loss.
    fn send_mad(&self, dest: Gid, mad: Bytes) -> Result<(), TransportError>;
}

/// Queue-pair states the manager moves a connection's QP through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

/// One change applied to an RC queue pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QpAttr {
    Init {
        pkey: u16,
    },
    ReadyToReceive {
        remote_qpn: u32,
        path: PathRecord,
        alternate_path: Option<PathRecord>,
        rq_psn: u32,
        path_mtu: u8,
        max_dest_rd_atomic: u8,
    },
    ReadyToSend {
        sq_psn: u32,
        local_ack_timeout: u8,
        retry_count: u8,
        rnr_retry_count: u8,
        max_rd_atomic: u8,
    },
    /// Arm an alternate path for automatic migration.
    LoadAlternatePath(PathRecord),
    /// Switch traffic to the armed alternate path.
    Migrate,
    Error,
}

impl QpAttr {
    /// The state the QP is in after this change is applied.
    pub fn target_state(&self) -> Option<QpState> {
        match self {
            QpAttr::Init { .. } => Some(QpState::Init),
            QpAttr::ReadyToReceive { .. } => Some(QpState::ReadyToReceive),
            QpAttr::ReadyToSend { .. } => Some(QpState::ReadyToSend),
            QpAttr::Error => Some(QpState::Error),
            QpAttr::LoadAlternatePath(_) | QpAttr::Migrate => None,
        }
    }
}

/// Queue-pair control. Treated as an opaque effectful call.
pub trait QpControl: Send + Sync {
    fn modify(&self, qpn: u32, attr: &QpAttr) -> Result<(), QpError>;
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no route to {0}")]
    Unreachable(Gid),
    #[error("send queue full")]
    QueueFull,
    #[error("send failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QpError {
    #[error("unknown qp 0x{0:06x}")]
    UnknownQp(u32),
    #[error("qp 0x{qpn:06x} refused {attr}: {detail}")]
    Refused {
        qpn: u32,
        attr: &'static str,
        detail: String,
    },
}
