//! Connection registry.
//!
//! Live connections are indexed three ways: by local comm id, by the
//! peer's (CA GUID, comm id), and by the peer's (GID, QPN). Each index is
//! its own `DashMap`; a shard lock is held only for the lookup or splice
//! itself. Returned `Arc`s are pins; dropping one is the release.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::try_result::TryResult;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::connection::{Connection, RemoteId, RemoteQpKey, INVALID_COMM_ID};

/// `insert_remote` found another live connection under one of the keys.
/// Nothing was left inserted.
#[derive(Debug)]
pub enum DuplicateRemote {
    RemoteId(Arc<Connection>),
    RemoteQp(Arc<Connection>),
}

impl DuplicateRemote {
    pub fn existing(&self) -> &Arc<Connection> {
        match self {
            DuplicateRemote::RemoteId(c) | DuplicateRemote::RemoteQp(c) => c,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("lookup interrupted")]
pub struct Interrupted;

pub struct ConnTable {
    by_local: DashMap<u32, Arc<Connection>>,
    by_remote_id: DashMap<RemoteId, Arc<Connection>>,
    by_remote_qp: DashMap<RemoteQpKey, Arc<Connection>>,
    next_id: AtomicU32,
}

impl ConnTable {
    /// Comm ids start at a random point so a restarted node does not reuse
    /// the ids its peers still remember.
    pub fn new() -> Self {
        Self::with_first_id(rand::random())
    }

    pub fn with_first_id(first: u32) -> Self {
        Self {
            by_local: DashMap::new(),
            by_remote_id: DashMap::new(),
            by_remote_qp: DashMap::new(),
            next_id: AtomicU32::new(first),
        }
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    pub fn find(&self, local_id: u32) -> Option<Arc<Connection>> {
        live(self.by_local.get(&local_id).map(|e| e.value().clone()))
    }

    /// Like [`Self::find`], but a contended index shard is waited out by
    /// yielding instead of blocking the thread. Returns `Interrupted` if
    /// `cancel` fires (or its sender is gone) before the entry is read.
    pub async fn find_interruptible(
        &self,
        local_id: u32,
        cancel: &mut broadcast::Receiver<()>,
    ) -> Result<Option<Arc<Connection>>, Interrupted> {
        loop {
            match self.by_local.try_get(&local_id) {
                TryResult::Present(entry) => return Ok(live(Some(entry.value().clone()))),
                TryResult::Absent => return Ok(None),
                TryResult::Locked => {}
            }
            tokio::select! {
                biased;
                _ = cancel.recv() => return Err(Interrupted),
                _ = tokio::task::yield_now() => {}
            }
        }
    }

    pub fn find_by_remote_queue(&self, gid: rcm_core::Gid, qpn: u32) -> Option<Arc<Connection>> {
        let key = RemoteQpKey { gid, qpn };
        live(self.by_remote_qp.get(&key).map(|e| e.value().clone()))
    }

    pub fn find_by_remote_id(&self, ca_guid: u64, comm_id: u32) -> Option<Arc<Connection>> {
        let key = RemoteId { ca_guid, comm_id };
        live(self.by_remote_id.get(&key).map(|e| e.value().clone()))
    }

    /// Every live connection. Used for shutdown.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.by_local
            .iter()
            .map(|e| e.value().clone())
            .filter(|c| !c.is_freed())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_local.is_empty()
    }

    // ── Create / index / free ────────────────────────────────────────────────

    /// Allocate a connection under the next unused local id.
    pub fn create(&self) -> Arc<Connection> {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == INVALID_COMM_ID {
                continue;
            }
            if let Entry::Vacant(slot) = self.by_local.entry(id) {
                let conn = Arc::new(Connection::new(id));
                slot.insert(conn.clone());
                tracing::trace!(comm_id = id, "connection created");
                return conn;
            }
        }
    }

    /// Register `conn` under both secondary keys, or under neither.
    pub fn insert_remote(
        &self,
        conn: &Arc<Connection>,
        remote_id: RemoteId,
        remote_qp: RemoteQpKey,
    ) -> Result<(), DuplicateRemote> {
        match self.by_remote_id.entry(remote_id) {
            Entry::Occupied(e) if !e.get().is_freed() => {
                return Err(DuplicateRemote::RemoteId(e.get().clone()));
            }
            Entry::Occupied(mut e) => {
                e.insert(conn.clone());
            }
            Entry::Vacant(e) => {
                e.insert(conn.clone());
            }
        }

        let duplicate = match self.by_remote_qp.entry(remote_qp) {
            Entry::Occupied(e) if !e.get().is_freed() => Some(e.get().clone()),
            Entry::Occupied(mut e) => {
                e.insert(conn.clone());
                None
            }
            Entry::Vacant(e) => {
                e.insert(conn.clone());
                None
            }
        };
        if let Some(existing) = duplicate {
            self.by_remote_id
                .remove_if(&remote_id, |_, c| Arc::ptr_eq(c, conn));
            return Err(DuplicateRemote::RemoteQp(existing));
        }

        let mut st = conn.lock();
        st.indexed_remote_id = Some(remote_id);
        st.indexed_remote_qp = Some(remote_qp);
        Ok(())
    }

    /// Detach `conn` from every index and cancel its timer. Entries that
    /// now point at a different connection are left alone. The memory goes
    /// when the last pin is dropped.
    pub fn free(&self, conn: &Arc<Connection>) {
        if !conn.mark_freed() {
            return;
        }
        let (remote_id, remote_qp) = {
            let mut st = conn.lock();
            st.cancel_timer();
            st.handler = None;
            (st.indexed_remote_id.take(), st.indexed_remote_qp.take())
        };
        self.by_local
            .remove_if(&conn.local_id(), |_, c| Arc::ptr_eq(c, conn));
        if let Some(key) = remote_id {
            self.by_remote_id.remove_if(&key, |_, c| Arc::ptr_eq(c, conn));
        }
        if let Some(key) = remote_qp {
            self.by_remote_qp.remove_if(&key, |_, c| Arc::ptr_eq(c, conn));
        }
        tracing::debug!(comm_id = conn.local_id(), "connection freed");
    }
}

impl Default for ConnTable {
    fn default() -> Self {
        Self::new()
    }
}

fn live(conn: Option<Arc<Connection>>) -> Option<Arc<Connection>> {
    conn.filter(|c| !c.is_freed())
}
