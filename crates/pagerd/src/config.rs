//! Filesystem-wide configuration (ambient stack: there is no separate
//! config-file format in the original, so this mirrors `db`'s pattern of
//! a plain struct built from CLI flags or defaults and handed straight to
//! the constructor).

use std::time::Duration;

use common::Geometry;

#[derive(Debug, Clone)]
pub struct FilesystemConfig {
    pub log2_block_size: u32,
    pub log2_device_block_size: u32,
    pub page_size: u64,
    /// Whether the disk pager tracks a modified-global-blocks bitmap and
    /// does selective writeback (§4.3); off by default, matching the
    /// common case where the disk pager writes whole pages.
    pub modified_bitmap_enabled: bool,
    /// The "disable caching, wait, recount" quiesce barrier used by
    /// `pager_users`/`max_user_pager_prot` (§4.5, §9 Design Notes: "keep
    /// the sleep as a tunable with a sane default").
    pub cache_quiesce: Duration,
    /// Direct block slots per inode, handed to `SimpleBlockAllocator`.
    pub direct_block_count: u64,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            log2_block_size: 12,       // 4096-byte filesystem blocks
            log2_device_block_size: 9, // 512-byte device blocks
            page_size: 16384,
            modified_bitmap_enabled: false,
            cache_quiesce: Duration::from_secs(1),
            direct_block_count: 12,
        }
    }
}

impl FilesystemConfig {
    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.log2_block_size, self.log2_device_block_size, self.page_size)
    }
}
