//! The pager bucket and pager handles (§3 "Pager bucket", §9 weak
//! back-reference).
//!
//! A `PagerHandle` stands in for a Mach port backed by a pager user-info
//! blob. There is no real send-right/port-right distinction to borrow
//! from Rust's ownership model, so send rights are modeled explicitly as
//! a counter (`send_rights`) rather than folded into `Arc`'s strong
//! count: the bucket and the node-to-pager map both hold their own
//! genuine strong `Arc` references (keeping the handle allocated) that
//! are independent of how many "callers" are pretending to hold a send
//! right to it. `FilesystemInstance::release_filemap` decrements the
//! counter and runs the deallocation hook when it reaches zero — the
//! explicit analogue of the kernel reaping the last send right.
//!
//! `alive` implements strategy (b) from the Design Notes (§9): a boolean
//! cleared at the start of deallocation and checked by
//! `get_filemap`'s retry loop after reacquiring the node-to-pager lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use blockmap::Node;
use common::Prot;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PagerId(pub u64);

pub enum PagerKind {
    /// Exactly one per filesystem instance (§3).
    Disk,
    /// Holds a light reference on its node and the OR-accumulated
    /// protection ever requested by a mapper (§3, §4.5).
    File {
        node: Arc<Node>,
        max_prot: Mutex<Prot>,
        send_rights: AtomicU64,
    },
}

pub struct PagerHandle {
    pub id: PagerId,
    pub kind: PagerKind,
    alive: AtomicBool,
}

impl PagerHandle {
    pub fn new_disk(id: PagerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind: PagerKind::Disk,
            alive: AtomicBool::new(true),
        })
    }

    pub fn new_file(id: PagerId, node: Arc<Node>, prot: Prot) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind: PagerKind::File {
                node,
                max_prot: Mutex::new(prot),
                send_rights: AtomicU64::new(0),
            },
            alive: AtomicBool::new(true),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn node(&self) -> Option<&Arc<Node>> {
        match &self.kind {
            PagerKind::Disk => None,
            PagerKind::File { node, .. } => Some(node),
        }
    }

    pub fn or_prot(&self, prot: Prot) {
        if let PagerKind::File { max_prot, .. } = &self.kind {
            *max_prot.lock() |= prot;
        }
    }

    pub fn max_prot(&self) -> Prot {
        match &self.kind {
            PagerKind::Disk => Prot::empty(),
            PagerKind::File { max_prot, .. } => *max_prot.lock(),
        }
    }

    /// Adds one send right, returning the new count.
    pub fn add_send_right(&self) -> u64 {
        match &self.kind {
            PagerKind::Disk => 0,
            PagerKind::File { send_rights, .. } => send_rights.fetch_add(1, Ordering::AcqRel) + 1,
        }
    }

    /// Removes one send right, returning the count *after* removal. The
    /// caller runs the deallocation hook when this reaches zero.
    pub fn remove_send_right(&self) -> u64 {
        match &self.kind {
            PagerKind::Disk => 0,
            PagerKind::File { send_rights, .. } => {
                send_rights.fetch_sub(1, Ordering::AcqRel) - 1
            }
        }
    }

    /// The current send-right count.
    pub fn send_rights(&self) -> u64 {
        match &self.kind {
            PagerKind::Disk => 0,
            PagerKind::File { send_rights, .. } => send_rights.load(Ordering::Acquire),
        }
    }
}

/// A process-wide registry of all live pagers (§3 "Pager bucket"),
/// iterable and countable, with acceptance of new entries that can be
/// disabled during the cache-quiesce dance (§4.5).
pub struct Bucket {
    pagers: Mutex<HashMap<u64, Arc<PagerHandle>>>,
    accepting: AtomicBool,
    next_id: AtomicU64,
}

impl Bucket {
    pub fn new() -> Self {
        Self {
            pagers: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn alloc_id(&self) -> PagerId {
        PagerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&self, handle: Arc<PagerHandle>) {
        self.pagers.lock().insert(handle.id.0, handle);
    }

    pub fn remove(&self, id: PagerId) {
        self.pagers.lock().remove(&id.0);
    }

    pub fn len(&self) -> usize {
        self.pagers.lock().len()
    }

    pub fn is_disk_only(&self) -> bool {
        self.pagers
            .lock()
            .values()
            .all(|h| matches!(h.kind, PagerKind::Disk))
    }

    pub fn file_pagers(&self) -> Vec<Arc<PagerHandle>> {
        self.pagers
            .lock()
            .values()
            .filter(|h| matches!(h.kind, PagerKind::File { .. }))
            .cloned()
            .collect()
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}
