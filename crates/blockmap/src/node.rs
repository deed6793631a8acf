use common::Geometry;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::BlockId;

/// Identifies an inode within a single filesystem instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeId(pub u64);

/// The fields of a `Node` guarded by `alloc_lock` (§3): `alloc_size`, the
/// block map, and `last_page_partially_writable` all move together under
/// one reader/writer lock, exactly as `ext2fs/pager.c` holds `dn->alloc_lock`
/// across both the block-map walk and the size update.
pub struct NodeState {
    /// File length rounded up to whole filesystem blocks. Invariant:
    /// a multiple of `block_size` (checked by every mutator here).
    pub alloc_size: u64,

    /// True iff the final page of the file ends mid-page and some but not
    /// all of the blocks in that final page have been allocated.
    pub last_page_partially_writable: bool,

    /// Dirty indirect/metadata blocks queued for the next sync of this
    /// node, mirroring `struct disknode`'s `indir_pokel`.
    pub indir_pokel: Vec<BlockId>,
}

impl NodeState {
    fn new() -> Self {
        Self {
            alloc_size: 0,
            last_page_partially_writable: false,
            indir_pokel: Vec::new(),
        }
    }

    /// Queues `block` for the next sync, if it isn't already queued.
    pub fn queue_indirect_dirty(&mut self, block: BlockId) {
        if !self.indir_pokel.contains(&block) {
            self.indir_pokel.push(block);
        }
    }
}

/// One live inode, as referenced by a mapping (§3: "Node").
pub struct Node {
    pub id: InodeId,
    pub geometry: Geometry,
    state: RwLock<NodeState>,
}

impl Node {
    pub fn new(id: InodeId, geometry: Geometry) -> Self {
        Self {
            id,
            geometry,
            state: RwLock::new(NodeState::new()),
        }
    }

    /// Acquires `alloc_lock` for reading — used by pagein/pageout (§4.4).
    pub fn read(&self) -> RwLockReadGuard<'_, NodeState> {
        self.state.read()
    }

    /// Acquires `alloc_lock` for writing — used by unlock/grow (§4.4).
    pub fn write(&self) -> RwLockWriteGuard<'_, NodeState> {
        self.state.write()
    }

    pub fn alloc_size(&self) -> u64 {
        self.state.read().alloc_size
    }
}
