//! In-process queue-pair model.
//!
//! Tracks each QP's state and loaded paths and refuses out-of-order
//! transitions the way a verbs provider would. The daemon uses it when no
//! hardware is attached; tests use it to observe what the engine applied.

use dashmap::DashMap;

use rcm_core::PathRecord;
use rcm_services::{QpAttr, QpControl, QpError, QpState};

#[derive(Debug, Clone, Default)]
pub struct QpEntry {
    pub state: Option<QpState>,
    pub remote_qpn: u32,
    pub path: Option<PathRecord>,
    pub alternate: Option<PathRecord>,
    pub sq_psn: u32,
    pub rq_psn: u32,
}

#[derive(Debug, Default)]
pub struct SoftQp {
    qps: DashMap<u32, QpEntry>,
}

impl SoftQp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, qpn: u32) -> Option<QpState> {
        self.qps.get(&qpn).and_then(|e| e.state)
    }

    pub fn entry(&self, qpn: u32) -> Option<QpEntry> {
        self.qps.get(&qpn).map(|e| e.clone())
    }
}

fn refused(qpn: u32, attr: &'static str, from: Option<QpState>) -> QpError {
    QpError::Refused {
        qpn,
        attr,
        detail: format!("not allowed from {from:?}"),
    }
}

impl QpControl for SoftQp {
    fn modify(&self, qpn: u32, attr: &QpAttr) -> Result<(), QpError> {
        if let QpAttr::Init { .. } = attr {
            // Init resets a QP regardless of what it was doing.
            self.qps.insert(
                qpn,
                QpEntry {
                    state: Some(QpState::Init),
                    ..QpEntry::default()
                },
            );
            tracing::trace!(qpn, "qp init");
            return Ok(());
        }

        let mut entry = self.qps.get_mut(&qpn).ok_or(QpError::UnknownQp(qpn))?;
        let from = entry.state;
        match attr {
            QpAttr::Init { .. } => {}
            QpAttr::ReadyToReceive {
                remote_qpn,
                path,
                alternate_path,
                rq_psn,
                ..
            } => {
                if from != Some(QpState::Init) {
                    return Err(refused(qpn, "rtr", from));
                }
                entry.state = Some(QpState::ReadyToReceive);
                entry.remote_qpn = *remote_qpn;
                entry.path = Some(*path);
                entry.alternate = *alternate_path;
                entry.rq_psn = *rq_psn;
            }
            QpAttr::ReadyToSend { sq_psn, .. } => {
                if from != Some(QpState::ReadyToReceive) {
                    return Err(refused(qpn, "rts", from));
                }
                entry.state = Some(QpState::ReadyToSend);
                entry.sq_psn = *sq_psn;
            }
            QpAttr::LoadAlternatePath(path) => {
                if !matches!(from, Some(QpState::ReadyToReceive | QpState::ReadyToSend)) {
                    return Err(refused(qpn, "load alternate", from));
                }
                entry.alternate = Some(*path);
            }
            QpAttr::Migrate => {
                if from != Some(QpState::ReadyToSend) {
                    return Err(refused(qpn, "migrate", from));
                }
                let Some(alternate) = entry.alternate.take() else {
                    return Err(QpError::Refused {
                        qpn,
                        attr: "migrate",
                        detail: "no alternate path".into(),
                    });
                };
                entry.path = Some(alternate);
            }
            QpAttr::Error => entry.state = Some(QpState::Error),
        }
        tracing::trace!(qpn, from = ?from, to = ?entry.state, "qp modified");
        Ok(())
    }
}
