//! Shared numeric types and error kinds used across the paging core.
//!
//! Kept dependency-free except for `bitflags`/`thiserror`, mirroring how
//! the workspace's `common` crate carries only cross-cutting types.

use thiserror::Error;

/// A filesystem block number (units of `block_size` bytes).
///
/// Block `0` is the hole sentinel: "unallocated", never a real data block.
/// This mirrors `ext2fs/pager.c`'s convention that `find_block` returns
/// `*block = 0` for an unmapped filesystem block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u64);

impl BlockId {
    pub const HOLE: BlockId = BlockId(0);

    pub fn is_hole(self) -> bool {
        self == Self::HOLE
    }

    pub fn checked_add(self, delta: u64) -> Option<BlockId> {
        self.0.checked_add(delta).map(BlockId)
    }
}

/// A device block number (units of `device_block_size` bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceBlockId(pub u64);

bitflags::bitflags! {
    /// Memory protection bits requested by a mapper, OR-accumulated per
    /// file-data pager as `max_prot` (§3, §4.5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Prot: u8 {
        const READ    = 0b001;
        const WRITE   = 0b010;
        const EXECUTE = 0b100;
    }
}

impl Prot {
    /// True once read, write, and execute have all been requested at least
    /// once — the point at which `max_user_pager_prot`'s bucket iteration
    /// can short-circuit (§4.5).
    pub fn is_saturated(self) -> bool {
        self.contains(Prot::READ | Prot::WRITE | Prot::EXECUTE)
    }
}

/// Filesystem-wide block/page geometry (§3: "Block numbering").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub log2_block_size: u32,
    pub log2_device_block_size: u32,
    pub page_size: u64,
}

impl Geometry {
    /// Builds a geometry, checking the invariants from §3: `block_size` is
    /// a multiple of `device_block_size`, and `page_size` is a multiple of
    /// `block_size`.
    pub fn new(log2_block_size: u32, log2_device_block_size: u32, page_size: u64) -> Self {
        let g = Self {
            log2_block_size,
            log2_device_block_size,
            page_size,
        };
        assert!(log2_block_size >= log2_device_block_size);
        assert_eq!(page_size % g.block_size(), 0);
        g
    }

    pub fn block_size(&self) -> u64 {
        1u64 << self.log2_block_size
    }

    pub fn device_block_size(&self) -> u64 {
        1u64 << self.log2_device_block_size
    }

    pub fn dev_blocks_per_fs_block(&self) -> u64 {
        1u64 << (self.log2_block_size - self.log2_device_block_size)
    }

    pub fn blocks_per_page(&self) -> u64 {
        self.page_size / self.block_size()
    }

    pub fn round_up_to_block(&self, bytes: u64) -> u64 {
        let block_size = self.block_size();
        bytes.div_ceil(block_size) * block_size
    }

    pub fn round_up_to_page(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.page_size) * self.page_size
    }

    pub fn file_block_of(&self, offset: u64) -> u64 {
        offset / self.block_size()
    }

    pub fn page_of(&self, offset: u64) -> u64 {
        (offset / self.page_size) * self.page_size
    }
}

/// Errors surfaced by the paging core (§7: Error handling design).
#[derive(Debug, Error)]
pub enum PagerError {
    /// A pagein/pageout request fell (partly or fully) outside `alloc_size`.
    #[error("page at offset {offset} is out of range (alloc_size={alloc_size})")]
    OutOfRange { offset: u64, alloc_size: u64 },

    /// C4 pageout found a hole where every block must already be backed.
    /// This is an invariant violation, not a recoverable condition.
    #[error("pageout encountered an unallocated block at file block {file_block}")]
    HoleDuringPageout { file_block: u64 },

    /// Propagated from the block device or block allocator.
    #[error("device i/o error: {0}")]
    Io(String),

    /// The block allocator had no free blocks left.
    #[error("out of space")]
    OutOfSpace,

    /// An indirect block read faulted during allocation.
    #[error("i/o fault reading indirect block: {0}")]
    IndirectFault(String),
}

pub type PagerResult<T> = Result<T, PagerError>;
