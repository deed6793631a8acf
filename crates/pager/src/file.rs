//! The file-pager engine (C4, §4.4): pagein, pageout, unlock, and growth
//! for a single file, honoring lazy allocation and partial-last-page
//! semantics.

use std::sync::Arc;

use blockmap::{BlockAllocator, BlockMap, Node, ReadRun, WriteRun};
use common::{Geometry, PagerError, PagerResult};
use device::BlockDevice;

pub struct FilePagerEngine {
    allocator: Arc<dyn BlockAllocator>,
    device: Arc<dyn BlockDevice>,
    geometry: Geometry,
}

impl FilePagerEngine {
    pub fn new(allocator: Arc<dyn BlockAllocator>, device: Arc<dyn BlockDevice>, geometry: Geometry) -> Self {
        Self {
            allocator,
            device,
            geometry,
        }
    }

    /// Fills `dest` (one page) for `node` at file offset `page_offset`.
    /// Returns `writable`: true iff any constituent block was a hole, in
    /// which case the kernel must be told to expect an unlock callback on
    /// first write.
    pub fn pagein(&self, node: &Node, page_offset: u64, dest: &mut [u8]) -> PagerResult<bool> {
        let state = node.read();
        let alloc_size = state.alloc_size;
        if page_offset >= alloc_size {
            return Err(PagerError::OutOfRange {
                offset: page_offset,
                alloc_size,
            });
        }
        let block_size = self.geometry.block_size();
        let span = (alloc_size - page_offset).min(self.geometry.page_size);
        let blocks_in_span = span / block_size;
        let blocks_per_page = self.geometry.blocks_per_page();
        let first_file_block = page_offset / block_size;

        let mut writable = false;
        let mut run = ReadRun::new();
        for i in 0..blocks_per_page {
            let offset = (i * block_size) as usize;
            if i >= blocks_in_span {
                dest[offset..offset + block_size as usize].fill(0);
                continue;
            }
            let disk_block = BlockMap::resolve(&*self.allocator, node.id, first_file_block + i)?;
            if disk_block.is_hole() {
                writable = true;
                run.flush(self.device.as_ref(), &self.geometry, dest)
                    .map_err(|e| PagerError::Io(e.to_string()))?;
                dest[offset..offset + block_size as usize].fill(0);
            } else {
                run.add(i, disk_block, self.device.as_ref(), &self.geometry, dest)
                    .map_err(|e| PagerError::Io(e.to_string()))?;
            }
        }
        run.flush(self.device.as_ref(), &self.geometry, dest)
            .map_err(|e| PagerError::Io(e.to_string()))?;
        drop(state);
        Ok(writable)
    }

    /// Writes back one page for `node`. Every constituent in-range block
    /// must already be backed; a hole here is an invariant violation
    /// (pages can only become dirty after `unlock` has allocated them).
    pub fn pageout(&self, node: &Node, page_offset: u64, src: &[u8]) -> PagerResult<()> {
        let state = node.read();
        let alloc_size = state.alloc_size;
        if page_offset >= alloc_size {
            return Err(PagerError::OutOfRange {
                offset: page_offset,
                alloc_size,
            });
        }
        let block_size = self.geometry.block_size();
        let span = (alloc_size - page_offset).min(self.geometry.page_size);
        let blocks_in_span = span / block_size;
        let first_file_block = page_offset / block_size;

        let mut run = WriteRun::new(src);
        for i in 0..blocks_in_span {
            let disk_block = BlockMap::resolve(&*self.allocator, node.id, first_file_block + i)?;
            if disk_block.is_hole() {
                return Err(PagerError::HoleDuringPageout {
                    file_block: first_file_block + i,
                });
            }
            run.add(disk_block, self.device.as_ref(), &self.geometry)
                .map_err(|e| PagerError::Io(e.to_string()))?;
        }
        run.flush(self.device.as_ref(), &self.geometry)
            .map_err(|e| PagerError::Io(e.to_string()))?;
        drop(state);
        Ok(())
    }

    /// Makes the page at `page_offset` writable by allocating every disk
    /// block it needs, per §4.4's unlock protocol.
    pub fn unlock(&self, node: &Node, page_offset: u64) -> PagerResult<()> {
        let mut state = node.write();
        let block_size = self.geometry.block_size();
        let page_end = page_offset + self.geometry.page_size;
        let partial = page_end > state.alloc_size;
        let span = if partial {
            state.alloc_size.saturating_sub(page_offset)
        } else {
            self.geometry.page_size
        };
        let count = span / block_size;
        let first_file_block = page_offset / block_size;

        let mut result = Ok(());
        for i in 0..count {
            match BlockMap::resolve_alloc(&*self.allocator, node.id, first_file_block + i) {
                Ok((_, Some(dirtied))) => state.queue_indirect_dirty(dirtied),
                Ok((_, None)) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        match (&result, partial) {
            (Ok(()), true) => state.last_page_partially_writable = true,
            (Err(_), true) => state.last_page_partially_writable = false,
            (Ok(()), false) if page_end == state.alloc_size => {
                state.last_page_partially_writable = false
            }
            _ => {}
        }

        if let Err(PagerError::OutOfSpace) = &result {
            log::error!(
                "unlock: out of space allocating page at offset {page_offset} for node {:?}; filesystem is effectively wedged",
                node.id
            );
        }
        result
    }

    /// Grows `node` to (at least) `new_size`, allocating any blocks that
    /// the kernel now considers writable because they fall within a
    /// previously partial final page (§4.4).
    pub fn grow(&self, node: &Node, new_size: u64) -> PagerResult<()> {
        let mut state = node.write();
        let new_size = self.geometry.round_up_to_block(new_size);
        if new_size <= state.alloc_size {
            return Ok(());
        }

        let block_size = self.geometry.block_size();
        let old_page_end_block = self.geometry.round_up_to_page(state.alloc_size) / block_size;
        let old_end_block = state.alloc_size / block_size;
        let new_end_block = new_size / block_size;

        if state.last_page_partially_writable && old_page_end_block > old_end_block {
            let upper = old_page_end_block.min(new_end_block);
            let mut last_success = old_end_block;
            let mut failure = None;
            for b in old_end_block..upper {
                match BlockMap::resolve_alloc(&*self.allocator, node.id, b) {
                    Ok((_, Some(dirtied))) => {
                        state.queue_indirect_dirty(dirtied);
                        last_success = b + 1;
                    }
                    Ok((_, None)) => last_success = b + 1,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = failure {
                let actual_size = last_success * block_size;
                state.alloc_size = actual_size;
                state.last_page_partially_writable =
                    self.geometry.round_up_to_page(actual_size) / block_size > last_success;
                if let PagerError::OutOfSpace = &e {
                    log::error!(
                        "grow: out of space extending node {:?} to {new_size}; truncated to {actual_size}",
                        node.id
                    );
                }
                return Err(e);
            }
            if upper >= old_page_end_block {
                state.last_page_partially_writable = false;
            }
        }

        state.alloc_size = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockmap::{InodeId, SimpleBlockAllocator};
    use device::MemBlockDevice;

    fn engine() -> (FilePagerEngine, Node) {
        let geometry = Geometry::new(12, 9, 16384); // 4096-byte blocks, 16KiB pages
        let device: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(512, 1 << 20));
        let allocator: Arc<dyn BlockAllocator> =
            Arc::new(SimpleBlockAllocator::new(device.clone(), geometry, 12));
        let node = Node::new(InodeId(1), geometry);
        (FilePagerEngine::new(allocator, device, geometry), node)
    }

    #[test]
    fn scenario_grow_then_unlock_then_grow_again() {
        let (engine, node) = engine();

        // 1. grow(file, 1) -> alloc_size == 4096, not partially writable, no blocks allocated.
        engine.grow(&node, 1).unwrap();
        assert_eq!(node.alloc_size(), 4096);
        assert!(!node.read().last_page_partially_writable);

        // 2. touch offset 0 -> unlock(page=0) allocates block 0 only; page is now partial.
        engine.unlock(&node, 0).unwrap();
        assert!(node.read().last_page_partially_writable);

        // 3. grow(file, 8192): allocate block 1; still partial (blocks 2,3 unallocated).
        engine.grow(&node, 8192).unwrap();
        assert_eq!(node.alloc_size(), 8192);
        assert!(node.read().last_page_partially_writable);

        // 4. grow(file, 16384): allocate blocks 2,3; no longer partial.
        engine.grow(&node, 16384).unwrap();
        assert_eq!(node.alloc_size(), 16384);
        assert!(!node.read().last_page_partially_writable);
    }

    #[test]
    fn pagein_of_all_holes_is_zero_and_writable() {
        let (engine, node) = engine();
        engine.grow(&node, 16384).unwrap(); // alloc_size grows; nothing allocated yet

        let mut dest = vec![0xFFu8; 16384];
        let writable = engine.pagein(&node, 0, &mut dest).unwrap();
        assert!(writable);
        assert!(dest.iter().all(|&b| b == 0));
    }

    #[test]
    fn pageout_of_hole_is_invariant_violation() {
        let (engine, node) = engine();
        engine.grow(&node, 16384).unwrap();
        let src = vec![0u8; 16384];
        let err = engine.pageout(&node, 0, &src).unwrap_err();
        assert!(matches!(err, PagerError::HoleDuringPageout { .. }));
    }

    #[test]
    fn pagein_after_unlock_and_pageout_round_trips() {
        let (engine, node) = engine();
        engine.grow(&node, 16384).unwrap();
        for block in 0..4 {
            engine.unlock(&node, 0).unwrap();
            let _ = block;
        }
        assert!(!node.read().last_page_partially_writable);

        let pattern = vec![0x7Au8; 16384];
        engine.pageout(&node, 0, &pattern).unwrap();

        let mut dest = vec![0u8; 16384];
        let writable = engine.pagein(&node, 0, &mut dest).unwrap();
        assert!(!writable);
        assert_eq!(dest, pattern);
    }

    #[test]
    fn pagein_past_alloc_size_is_out_of_range() {
        let (engine, node) = engine();
        engine.grow(&node, 4096).unwrap();
        let mut dest = vec![0u8; 16384];
        assert!(engine.pagein(&node, 16384, &mut dest).is_err());
    }
}
