//! Service registry: listeners keyed by (service id, mask).
//!
//! Entries live in a binary trie of split nodes held in an index-addressed
//! arena. Every internal node routes on one bit. Entries whose mask ignores
//! that bit stay on the node itself in a short spanning list, checked before
//! routing. Each internal node carries the prefix (bits every entry below
//! agrees on) so a lookup can stop early. Registrations whose id/mask sets
//! overlap are refused, so at most one entry matches any service id.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{Mutex, Notify, OwnedMutexGuard};

use crate::callback::CmHandler;
use crate::connection::INVALID_COMM_ID;

/// Locally administered service ids carry this tag in the top byte.
pub const LOCAL_SERVICE_ID_TAG: u64 = 0x0200_0000_0000_0000;
const LOCAL_SERVICE_ID_COUNTER: u64 = 0x00ff_ffff_ffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("service 0x{id:016x}/0x{mask:016x} overlaps a registered service")]
    Conflict { id: u64, mask: u64 },
}

// ── Service ───────────────────────────────────────────────────────────────────

pub struct Service {
    id: u64,
    mask: u64,
    handler: Arc<dyn CmHandler>,
    /// Comm id of an outstanding peer-to-peer connect on this service.
    peer_to_peer_id: AtomicU32,
    freeing: AtomicBool,
    waiters: AtomicUsize,
    drained: Notify,
    lock: Arc<Mutex<()>>,
}

impl Service {
    fn new(id: u64, mask: u64, handler: Arc<dyn CmHandler>) -> Self {
        Self {
            id: id & mask,
            mask,
            handler,
            peer_to_peer_id: AtomicU32::new(INVALID_COMM_ID),
            freeing: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
            drained: Notify::new(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn handler(&self) -> Arc<dyn CmHandler> {
        self.handler.clone()
    }

    pub fn matches(&self, service_id: u64) -> bool {
        service_id & self.mask == self.id
    }

    pub fn is_freeing(&self) -> bool {
        self.freeing.load(Ordering::Acquire)
    }

    pub fn peer_to_peer_id(&self) -> Option<u32> {
        match self.peer_to_peer_id.load(Ordering::Acquire) {
            INVALID_COMM_ID => None,
            id => Some(id),
        }
    }

    pub fn set_peer_to_peer(&self, comm_id: u32) {
        self.peer_to_peer_id.store(comm_id, Ordering::Release);
    }

    /// Forget the peer-to-peer attempt if it is still `comm_id`.
    pub fn clear_peer_to_peer(&self, comm_id: u32) {
        let _ = self.peer_to_peer_id.compare_exchange(
            comm_id,
            INVALID_COMM_ID,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn overlaps(&self, id: u64, mask: u64) -> bool {
        (self.id & mask) == (id & self.mask)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &format_args!("0x{:016x}", self.id))
            .field("mask", &format_args!("0x{:016x}", self.mask))
            .field("peer_to_peer_id", &self.peer_to_peer_id())
            .field("freeing", &self.is_freeing())
            .finish()
    }
}

/// A service found by [`ServiceTable::find`]. Holds the service mutex and
/// a waiter reference; `free` on the same service waits for it to drop.
pub struct ServiceGuard {
    service: Arc<Service>,
    _lock: OwnedMutexGuard<()>,
    _waiter: Waiter,
}

impl ServiceGuard {
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }
}

impl std::ops::Deref for ServiceGuard {
    type Target = Service;

    fn deref(&self) -> &Service {
        &self.service
    }
}

struct Waiter(Arc<Service>);

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.0.waiters.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

// ── Trie arena ────────────────────────────────────────────────────────────────

type NodeId = usize;

enum Node {
    Internal {
        bit: u32,
        prefix_id: u64,
        prefix_mask: u64,
        parent: Option<NodeId>,
        children: [NodeId; 2],
        /// Entries under this node whose mask ignores `bit`.
        spanning: Vec<Arc<Service>>,
    },
    Leaf {
        parent: Option<NodeId>,
        service: Arc<Service>,
    },
}

enum Location {
    Leaf(NodeId),
    Spanning(NodeId),
}

#[derive(Default)]
struct Trie {
    nodes: Vec<Option<Node>>,
    free_slots: Vec<NodeId>,
    root: Option<NodeId>,
    len: usize,
}

fn route(id: u64, bit: u32) -> usize {
    ((id >> bit) & 1) as usize
}

fn cares_about(mask: u64, bit: u32) -> bool {
    mask & (1u64 << bit) != 0
}

impl Trie {
    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, slot: NodeId) {
        self.nodes[slot] = None;
        self.free_slots.push(slot);
    }

    fn node(&self, slot: NodeId) -> &Node {
        match &self.nodes[slot] {
            Some(node) => node,
            None => unreachable!("dangling trie slot {slot}"),
        }
    }

    fn node_mut(&mut self, slot: NodeId) -> &mut Node {
        match &mut self.nodes[slot] {
            Some(node) => node,
            None => unreachable!("dangling trie slot {slot}"),
        }
    }

    /// (prefix id, prefix mask) shared by everything under `slot`,
    /// spanning entries included.
    fn prefix(&self, slot: NodeId) -> (u64, u64) {
        match self.node(slot) {
            Node::Internal {
                prefix_id,
                prefix_mask,
                ..
            } => (*prefix_id, *prefix_mask),
            Node::Leaf { service, .. } => (service.id, service.mask),
        }
    }

    fn parent(&self, slot: NodeId) -> Option<NodeId> {
        match self.node(slot) {
            Node::Internal { parent, .. } | Node::Leaf { parent, .. } => *parent,
        }
    }

    fn set_parent(&mut self, slot: NodeId, to: Option<NodeId>) {
        match self.node_mut(slot) {
            Node::Internal { parent, .. } | Node::Leaf { parent, .. } => *parent = to,
        }
    }

    /// Point whatever referenced `old` (a parent's child slot or the root)
    /// at `new`.
    fn replace_child(&mut self, parent: Option<NodeId>, old: NodeId, new: NodeId) {
        match parent {
            None => self.root = Some(new),
            Some(p) => {
                if let Node::Internal { children, .. } = self.node_mut(p) {
                    for child in children.iter_mut() {
                        if *child == old {
                            *child = new;
                        }
                    }
                }
            }
        }
    }

    /// Recompute prefixes from `slot` up to the root.
    fn refresh_from(&mut self, mut slot: Option<NodeId>) {
        while let Some(s) = slot {
            let kids = match self.node(s) {
                Node::Internal { children, .. } => Some(*children),
                Node::Leaf { .. } => None,
            };
            if let Some([c0, c1]) = kids {
                let (p0, m0) = self.prefix(c0);
                let (p1, m1) = self.prefix(c1);
                let mut mask = m0 & m1 & !(p0 ^ p1);
                let mut id = p0 & mask;
                if let Node::Internal {
                    prefix_id,
                    prefix_mask,
                    spanning,
                    ..
                } = self.node_mut(s)
                {
                    for service in spanning.iter() {
                        mask &= service.mask & !(id ^ service.id);
                        id &= mask;
                    }
                    *prefix_mask = mask;
                    *prefix_id = id;
                }
            }
            slot = self.parent(s);
        }
    }

    fn lookup(&self, service_id: u64) -> Option<&Arc<Service>> {
        let mut slot = self.root?;
        loop {
            let (prefix_id, prefix_mask) = self.prefix(slot);
            if service_id & prefix_mask != prefix_id {
                return None;
            }
            match self.node(slot) {
                Node::Leaf { service, .. } => return Some(service),
                Node::Internal {
                    bit,
                    children,
                    spanning,
                    ..
                } => {
                    if let Some(service) = spanning.iter().find(|s| s.matches(service_id)) {
                        return Some(service);
                    }
                    slot = children[route(service_id, *bit)];
                }
            }
        }
    }

    fn insert(&mut self, service: Arc<Service>) -> Result<(), ServiceError> {
        let (id, mask) = (service.id, service.mask);
        let Some(mut slot) = self.root else {
            let leaf = self.alloc(Node::Leaf {
                parent: None,
                service,
            });
            self.root = Some(leaf);
            self.len += 1;
            return Ok(());
        };

        loop {
            let (prefix_id, prefix_mask) = self.prefix(slot);
            let differ = (prefix_id ^ id) & prefix_mask & mask;
            if differ != 0 {
                // Split above `slot` on the highest bit where the new entry
                // and everything under `slot` disagree.
                let bit = 63 - differ.leading_zeros();
                let parent = self.parent(slot);
                let leaf = self.alloc(Node::Leaf {
                    parent: None,
                    service,
                });
                let mut children = [slot, slot];
                children[route(id, bit)] = leaf;
                let split = self.alloc(Node::Internal {
                    bit,
                    prefix_id: 0,
                    prefix_mask: 0,
                    parent,
                    children,
                    spanning: Vec::new(),
                });
                self.set_parent(leaf, Some(split));
                self.set_parent(slot, Some(split));
                self.replace_child(parent, slot, split);
                self.refresh_from(Some(split));
                self.len += 1;
                return Ok(());
            }

            let (bit, [c0, c1]) = match self.node(slot) {
                Node::Leaf { .. } => return Err(ServiceError::Conflict { id, mask }),
                Node::Internal {
                    bit,
                    children,
                    spanning,
                    ..
                } => {
                    if spanning.iter().any(|s| s.overlaps(id, mask)) {
                        return Err(ServiceError::Conflict { id, mask });
                    }
                    (*bit, *children)
                }
            };
            if cares_about(mask, bit) {
                slot = [c0, c1][route(id, bit)];
                continue;
            }
            // Both halves may hold ids this entry matches.
            if self.any_overlap(c0, id, mask) || self.any_overlap(c1, id, mask) {
                return Err(ServiceError::Conflict { id, mask });
            }
            if let Node::Internal { spanning, .. } = self.node_mut(slot) {
                spanning.push(service);
            }
            self.refresh_from(Some(slot));
            self.len += 1;
            return Ok(());
        }
    }

    fn any_overlap(&self, slot: NodeId, id: u64, mask: u64) -> bool {
        match self.node(slot) {
            Node::Leaf { service, .. } => service.overlaps(id, mask),
            Node::Internal {
                children, spanning, ..
            } => {
                let [c0, c1] = *children;
                spanning.iter().any(|s| s.overlaps(id, mask))
                    || self.any_overlap(c0, id, mask)
                    || self.any_overlap(c1, id, mask)
            }
        }
    }

    fn locate(&self, target: &Arc<Service>) -> Option<Location> {
        let mut slot = self.root?;
        loop {
            match self.node(slot) {
                Node::Leaf { service, .. } => {
                    return Arc::ptr_eq(service, target).then_some(Location::Leaf(slot));
                }
                Node::Internal {
                    bit,
                    children,
                    spanning,
                    ..
                } => {
                    if spanning.iter().any(|s| Arc::ptr_eq(s, target)) {
                        return Some(Location::Spanning(slot));
                    }
                    if !cares_about(target.mask, *bit) {
                        return None;
                    }
                    slot = children[route(target.id, *bit)];
                }
            }
        }
    }

    /// Unlink `target`. A removed leaf's parent is replaced by the surviving
    /// sibling, and the parent's spanning entries are inserted again below.
    fn remove(&mut self, target: &Arc<Service>) -> bool {
        let leaf = match self.locate(target) {
            None => return false,
            Some(Location::Spanning(node)) => {
                if let Node::Internal { spanning, .. } = self.node_mut(node) {
                    spanning.retain(|s| !Arc::ptr_eq(s, target));
                }
                self.len -= 1;
                self.refresh_from(Some(node));
                return true;
            }
            Some(Location::Leaf(leaf)) => leaf,
        };
        let parent = self.parent(leaf);
        self.release(leaf);
        self.len -= 1;

        let Some(split) = parent else {
            self.root = None;
            return true;
        };
        let (sibling, grandparent, orphans) = match self.node_mut(split) {
            Node::Internal {
                children,
                parent,
                spanning,
                ..
            } => {
                let sibling = if children[0] == leaf { children[1] } else { children[0] };
                (sibling, *parent, std::mem::take(spanning))
            }
            Node::Leaf { .. } => unreachable!("leaf parent is always a split node"),
        };
        self.release(split);
        self.set_parent(sibling, grandparent);
        self.replace_child(grandparent, split, sibling);
        self.refresh_from(grandparent);

        self.len -= orphans.len();
        for service in orphans {
            let reinserted = self.insert(service);
            debug_assert!(reinserted.is_ok(), "registered services are disjoint");
        }
        true
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub struct ServiceTable {
    trie: RwLock<Trie>,
    next_local_id: AtomicU64,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(Trie::default()),
            next_local_id: AtomicU64::new(1),
        }
    }

    /// A locally administered service id no registered service matches.
    pub fn assign_local_service_id(&self) -> u64 {
        loop {
            let n = self.next_local_id.fetch_add(1, Ordering::Relaxed) & LOCAL_SERVICE_ID_COUNTER;
            let id = LOCAL_SERVICE_ID_TAG | n;
            if self.read().lookup(id).is_none() {
                return id;
            }
        }
    }

    /// Register a listener. The id is stored masked.
    pub fn create(
        &self,
        service_id: u64,
        service_mask: u64,
        handler: Arc<dyn CmHandler>,
    ) -> Result<Arc<Service>, ServiceError> {
        let service = Arc::new(Service::new(service_id, service_mask, handler));
        self.write().insert(service.clone())?;
        tracing::debug!(
            service_id = %format_args!("0x{:016x}", service.id),
            service_mask = %format_args!("0x{:016x}", service.mask),
            "service registered"
        );
        Ok(service)
    }

    /// The registered service matching `service_id`, locked for the caller.
    ///
    /// Waits for the service mutex. Returns `None` if nothing matches or the
    /// service is being freed.
    pub async fn find(&self, service_id: u64) -> Option<ServiceGuard> {
        let service = {
            let trie = self.read();
            let service = trie.lookup(service_id)?.clone();
            // Counted under the trie lock so a concurrent `free` sees us.
            service.waiters.fetch_add(1, Ordering::AcqRel);
            service
        };
        let waiter = Waiter(service.clone());
        let lock = service.lock.clone().lock_owned().await;
        if service.is_freeing() {
            return None;
        }
        Some(ServiceGuard {
            service,
            _lock: lock,
            _waiter: waiter,
        })
    }

    /// Lookup without taking the service mutex.
    pub fn peek(&self, service_id: u64) -> Option<Arc<Service>> {
        self.read()
            .lookup(service_id)
            .filter(|s| !s.is_freeing())
            .cloned()
    }

    /// Unregister `service` and wait for every in-flight `find` holding it
    /// to finish.
    pub async fn free(&self, service: &Arc<Service>) {
        {
            let mut trie = self.write();
            if !trie.remove(service) {
                return;
            }
            service.freeing.store(true, Ordering::Release);
        }
        loop {
            let drained = service.drained.notified();
            if service.waiters.load(Ordering::Acquire) == 0 {
                break;
            }
            drained.await;
        }
        tracing::debug!(
            service_id = %format_args!("0x{:016x}", service.id),
            "service unregistered"
        );
    }

    pub fn len(&self) -> usize {
        self.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Trie> {
        self.trie.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Trie> {
        self.trie.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ServiceTable {
    fn default() -> Self {
        Self::new()
    }
}
