//! `FilesystemInstance`: the facade exposed to the filesystem surface
//! (§4.5, §6 "Exposed to the filesystem surface"), tying the device,
//! block allocator, disk-pager and file-pager engines, and the pager
//! registry together into one process-wide (but not globally static —
//! §9 "Global mutable state") value.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use blockmap::{BlockAllocator, BlockId, InodeId, Node, SimpleBlockAllocator};
use common::{Geometry, PagerError, Prot};
use device::BlockDevice;
use pager::{DiskPagerEngine, FilePagerEngine, ModifiedBitmap};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::FilesystemConfig;
use crate::registry::{Bucket, PagerHandle};

#[derive(Debug, Error)]
pub enum FsError {
    #[error(transparent)]
    Pager(#[from] PagerError),
    #[error(transparent)]
    Device(#[from] device::DeviceError),
}

pub type FsResult<T> = Result<T, FsError>;

pub struct FilesystemInstance {
    config: FilesystemConfig,
    geometry: Geometry,
    device: Arc<dyn BlockDevice>,
    allocator: Arc<dyn BlockAllocator>,
    disk_engine: DiskPagerEngine,
    file_engine: FilePagerEngine,
    bucket: Bucket,
    /// The node-to-pager spinlock (§5, lock order #1): process-wide, held
    /// only for short lookups/inserts, never across device I/O.
    node_to_pager: Mutex<HashMap<InodeId, Arc<PagerHandle>>>,
    nodes: Mutex<HashMap<InodeId, Arc<Node>>>,
    disk_pager: Arc<PagerHandle>,
}

impl FilesystemInstance {
    /// Opens a filesystem instance over `device` and creates the disk
    /// pager (§6: "`create_disk_pager()` — called once at startup").
    pub fn new(device: Arc<dyn BlockDevice>, config: FilesystemConfig) -> Self {
        let geometry = config.geometry();
        let allocator: Arc<dyn BlockAllocator> = Arc::new(SimpleBlockAllocator::new(
            device.clone(),
            geometry,
            config.direct_block_count,
        ));
        let modified = if config.modified_bitmap_enabled {
            let block_count = device.device_size_bytes() / geometry.block_size();
            Some(ModifiedBitmap::new(block_count))
        } else {
            None
        };
        let disk_engine = DiskPagerEngine::new(device.clone(), geometry, modified);
        let file_engine = FilePagerEngine::new(allocator.clone(), device.clone(), geometry);
        let bucket = Bucket::new();
        let disk_pager = PagerHandle::new_disk(bucket.alloc_id());
        bucket.insert(disk_pager.clone());

        Self {
            config,
            geometry,
            device,
            allocator,
            disk_engine,
            file_engine,
            bucket,
            node_to_pager: Mutex::new(HashMap::new()),
            nodes: Mutex::new(HashMap::new()),
            disk_pager,
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn disk_engine(&self) -> &DiskPagerEngine {
        &self.disk_engine
    }

    pub fn file_engine(&self) -> &FilePagerEngine {
        &self.file_engine
    }

    fn get_or_create_node(&self, inode: InodeId) -> Arc<Node> {
        self.nodes
            .lock()
            .entry(inode)
            .or_insert_with(|| Arc::new(Node::new(inode, self.geometry)))
            .clone()
    }

    pub fn node(&self, inode: InodeId) -> Option<Arc<Node>> {
        self.nodes.lock().get(&inode).cloned()
    }

    /// `get_filemap(node, prot)` (§4.5): returns the pager for `inode`,
    /// creating it on first mapping. Concurrent callers mapping the same
    /// inode converge on the same pager, with `prot` OR-accumulated into
    /// `max_prot`.
    pub fn get_filemap(&self, inode: InodeId, prot: Prot) -> Arc<PagerHandle> {
        loop {
            let mut map = self.node_to_pager.lock();
            if let Some(handle) = map.get(&inode).cloned() {
                if handle.is_alive() {
                    handle.or_prot(prot);
                    handle.add_send_right();
                    return handle;
                }
                // Mid-deallocation: the slot is stale, reset it and retry.
                map.remove(&inode);
                continue;
            }

            let node = self.get_or_create_node(inode);
            let handle = PagerHandle::new_file(self.bucket.alloc_id(), node, prot);
            map.insert(inode, handle.clone());
            drop(map);

            self.bucket.insert(handle.clone());
            handle.add_send_right();
            return handle;
        }
    }

    /// Releases one send right on `handle`. The decrement and the
    /// zero-test happen under the node-to-pager lock — the same lock
    /// `get_filemap` holds while adding a send right to an existing
    /// handle. Deciding "reached zero" outside that lock would leave a
    /// window where a concurrent `get_filemap` observes the handle as
    /// still live, resurrects it to one send right, and hands it to a
    /// caller just before this call tears it down anyway (§4.5's narrow
    /// race window).
    pub fn release_filemap(&self, handle: &Arc<PagerHandle>) {
        let mut map = self.node_to_pager.lock();
        if handle.remove_send_right() != 0 {
            return;
        }
        // Still holding the lock: nothing could have added a send right
        // back since the decrement above, so this is a genuine zero.
        debug_assert_eq!(handle.send_rights(), 0);
        self.evict_locked(&mut map, handle);
    }

    /// Tears down `handle` unconditionally: used by `shutdown`, which
    /// discards every live file pager regardless of outstanding send
    /// rights.
    fn clear_user_data(&self, handle: &Arc<PagerHandle>) {
        let mut map = self.node_to_pager.lock();
        self.evict_locked(&mut map, handle);
    }

    /// The shared teardown body: clears the node's back-reference if it
    /// still points at `handle`, marks it dead, and evicts it from the
    /// bucket. A no-op for the disk pager, which has no node
    /// back-reference to clear. Must be called with `node_to_pager`
    /// already held, which is what keeps this race-free against
    /// `get_filemap`'s own lookup-and-bump under the same lock.
    fn evict_locked(&self, map: &mut HashMap<InodeId, Arc<PagerHandle>>, handle: &Arc<PagerHandle>) {
        let Some(node) = handle.node() else { return };
        if let Some(existing) = map.get(&node.id)
            && Arc::ptr_eq(existing, handle)
        {
            map.remove(&node.id);
        }
        handle.mark_dead();
        self.bucket.remove(handle.id);
    }

    /// Grows `node` to (at least) `new_size` (§4.4, exposed per §6).
    pub fn grow(&self, inode: InodeId, new_size: u64) -> FsResult<()> {
        let node = self.get_or_create_node(inode);
        self.file_engine.grow(&node, new_size).map_err(FsError::from)
    }

    /// `file_update(node, wait)` (§6): syncs one file's indirect-block
    /// queue. The inode itself and its data pages are synced by the
    /// (external) filesystem surface and kernel respectively; this core's
    /// share of a file sync is the indirect-block queue.
    pub fn file_update(&self, inode: InodeId) -> FsResult<()> {
        let Some(node) = self.node(inode) else {
            return Ok(());
        };
        self.sync_node_indirect(&node)
    }

    fn sync_node_indirect(&self, node: &Arc<Node>) -> FsResult<()> {
        let dirtied = {
            let mut state = node.write();
            std::mem::take(&mut state.indir_pokel)
        };
        if dirtied.is_empty() {
            return Ok(());
        }
        self.allocator
            .sync_indirect(&dirtied)
            .map_err(|e| FsError::Pager(PagerError::Io(e.to_string())))
    }

    /// `flush_node_pager(node)` (§6): discard cached pages for a node.
    /// This core does not itself cache pages (that's the kernel's job via
    /// the external paging framework); the hook exists so callers have a
    /// place to invalidate their own derived state.
    pub fn flush_node_pager(&self, inode: InodeId) {
        log::debug!("flush_node_pager: inode {inode:?}");
    }

    /// `sync_everything(wait)` (§6): syncs every live file pager's
    /// indirect-block queue.
    pub fn sync_everything(&self) -> FsResult<()> {
        for handle in self.bucket.file_pagers() {
            if let Some(node) = handle.node() {
                self.sync_node_indirect(node)?;
            }
        }
        Ok(())
    }

    fn disable_caching(&self) {
        self.bucket.set_accepting(false);
    }

    fn enable_caching(&self) {
        self.bucket.set_accepting(true);
    }

    /// `pager_users()` (§4.5): the cache-disable-quiesce-recount dance.
    pub fn pager_users(&self) -> u8 {
        if self.bucket.is_disk_only() {
            return 0;
        }
        self.disable_caching();
        thread::sleep(self.config.cache_quiesce);
        let result = if self.bucket.is_disk_only() {
            0
        } else {
            self.enable_caching();
            1
        };
        self.bucket.set_accepting(true);
        result
    }

    /// `max_user_pager_prot()` (§4.5): OR together `max_prot` over every
    /// live file pager, short-circuiting once saturated, wrapped in the
    /// same quiesce dance as `pager_users`.
    pub fn max_user_pager_prot(&self) -> Prot {
        self.disable_caching();
        thread::sleep(self.config.cache_quiesce);
        let mut prot = Prot::empty();
        for handle in self.bucket.file_pagers() {
            prot |= handle.max_prot();
            if prot.is_saturated() {
                break;
            }
        }
        self.enable_caching();
        prot
    }

    /// `shutdown_pager()` (§6, §9 supplement C): writes all dirty inodes
    /// (external to this core), tears down every non-disk pager, then the
    /// disk pager last.
    pub fn shutdown(&self) -> FsResult<()> {
        log::info!("shutdown: syncing live file pagers before teardown");
        self.sync_everything()?;
        for handle in self.bucket.file_pagers() {
            self.clear_user_data(&handle);
        }
        log::info!("shutdown: disk pager going down");
        self.device.sync().map_err(FsError::from)
    }

    pub fn disk_pager(&self) -> &Arc<PagerHandle> {
        &self.disk_pager
    }

    pub fn modified_disk_block(&self, block: BlockId) {
        if let Some(bitmap) = self.disk_engine.modified_bitmap() {
            bitmap.set(block);
        }
    }
}
