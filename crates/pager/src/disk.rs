//! The disk-pager engine (C3, §4.3): serves the raw device as one
//! contiguous pageable object, exactly one per filesystem instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blockmap::{BlockId, WriteRun};
use common::{DeviceBlockId, Geometry, PagerError, PagerResult};
use device::BlockDevice;

/// One bit per filesystem block on the device, set when a block was
/// dirtied through a file path (§3). Concurrently readable; setters use
/// atomic bit ops, per §5's shared-resource policy.
pub struct ModifiedBitmap {
    words: Vec<AtomicU64>,
}

impl ModifiedBitmap {
    pub fn new(block_count: u64) -> Self {
        let word_count = block_count.div_ceil(64) as usize;
        let mut words = Vec::with_capacity(word_count);
        words.resize_with(word_count, || AtomicU64::new(0));
        Self { words }
    }

    pub fn set(&self, block: BlockId) {
        let (word, bit) = Self::locate(block);
        self.words[word].fetch_or(1 << bit, Ordering::Relaxed);
    }

    pub fn is_set(&self, block: BlockId) -> bool {
        let (word, bit) = Self::locate(block);
        self.words[word].load(Ordering::Relaxed) & (1 << bit) != 0
    }

    fn locate(block: BlockId) -> (usize, u32) {
        ((block.0 / 64) as usize, (block.0 % 64) as u32)
    }
}

/// Serves pagein/pageout for the raw device (§4.3). The disk pager's
/// "filesystem block" numbering is the identity mapping onto the device:
/// filesystem block `n` begins at device byte offset `n * block_size`.
pub struct DiskPagerEngine {
    device: Arc<dyn BlockDevice>,
    geometry: Geometry,
    modified: Option<ModifiedBitmap>,
}

impl DiskPagerEngine {
    pub fn new(device: Arc<dyn BlockDevice>, geometry: Geometry, modified: Option<ModifiedBitmap>) -> Self {
        Self {
            device,
            geometry,
            modified,
        }
    }

    pub fn modified_bitmap(&self) -> Option<&ModifiedBitmap> {
        self.modified.as_ref()
    }

    /// Fills `dest` (one page) from the device, zero-filling any trailing
    /// shortfall past `device_size_bytes`. Always reports non-writable:
    /// the disk pager never asks the kernel to make its pages writable on
    /// fault, since writes flow through filesystem code that dirties
    /// cached pages directly.
    pub fn pagein(&self, page_offset: u64, dest: &mut [u8]) -> PagerResult<bool> {
        let device_size_bytes = self.device.device_size_bytes();
        if page_offset >= device_size_bytes {
            return Err(PagerError::OutOfRange {
                offset: page_offset,
                alloc_size: device_size_bytes,
            });
        }
        let avail = (device_size_bytes - page_offset).min(self.geometry.page_size) as usize;
        let dev_block = DeviceBlockId(page_offset / self.geometry.device_block_size());
        self.device
            .read_at(dev_block, &mut dest[..avail])
            .map_err(|e| PagerError::Io(e.to_string()))?;
        dest[avail..].fill(0);
        Ok(false)
    }

    /// Writes back one page, clamped to the device end exactly as pagein
    /// clamps its read. Without a modified-blocks bitmap, the in-range
    /// prefix goes out as one transfer. With a bitmap, only blocks whose
    /// bit is set are written; the bit is deliberately left set afterward
    /// (see the module-level note below and §7's documented known issue).
    pub fn pageout(&self, page_offset: u64, src: &[u8]) -> PagerResult<()> {
        let device_size_bytes = self.device.device_size_bytes();
        if page_offset >= device_size_bytes {
            return Err(PagerError::OutOfRange {
                offset: page_offset,
                alloc_size: device_size_bytes,
            });
        }
        let len = (device_size_bytes - page_offset).min(self.geometry.page_size) as usize;
        let dev_block = DeviceBlockId(page_offset / self.geometry.device_block_size());
        match &self.modified {
            None => {
                self.device
                    .write_at(dev_block, &src[..len])
                    .map_err(|e| PagerError::Io(e.to_string()))?;
            }
            Some(bitmap) => {
                let first_block = BlockId(page_offset / self.geometry.block_size());
                let block_size = self.geometry.block_size() as usize;
                let full_blocks = (len / block_size) as u64;
                let remainder = len % block_size;
                let mut run = WriteRun::new(&src[..full_blocks as usize * block_size]);
                for i in 0..full_blocks {
                    let block = first_block.checked_add(i).expect("block overflow");
                    if bitmap.is_set(block) {
                        run.add(block, self.device.as_ref(), &self.geometry)
                            .map_err(|e| PagerError::Io(e.to_string()))?;
                    } else {
                        run.skip(self.device.as_ref(), &self.geometry)
                            .map_err(|e| PagerError::Io(e.to_string()))?;
                    }
                }
                run.flush(self.device.as_ref(), &self.geometry)
                    .map_err(|e| PagerError::Io(e.to_string()))?;
                if remainder > 0 {
                    // A trailing partial block at the device end: too short
                    // for the run accumulator's full-block-size units, so
                    // written directly if its bit is set.
                    let straggler = first_block.checked_add(full_blocks).expect("block overflow");
                    if bitmap.is_set(straggler) {
                        let straggler_dev_block = DeviceBlockId(
                            dev_block.0 + full_blocks * self.geometry.dev_blocks_per_fs_block(),
                        );
                        self.device
                            .write_at(straggler_dev_block, &src[len - remainder..len])
                            .map_err(|e| PagerError::Io(e.to_string()))?;
                    }
                }
                // The bit is not cleared: the page contents flushed here
                // may predate the write that set it. Harmless redundant
                // writes on a future pageout are preferred over silently
                // dropping a later modification (§7 known issue).
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device::MemBlockDevice;

    fn geometry() -> Geometry {
        Geometry::new(12, 9, 16384)
    }

    #[test]
    fn pagein_zero_fills_past_device_end() {
        let geometry = geometry();
        let device = Arc::new(MemBlockDevice::new(512, 24)); // 12288 bytes total
        let engine = DiskPagerEngine::new(device, geometry, None);

        let mut dest = vec![0xFFu8; geometry.page_size as usize];
        let writable = engine.pagein(0, &mut dest).unwrap();
        assert!(!writable);
        assert!(dest[12288..].iter().all(|&b| b == 0));
    }

    #[test]
    fn pagein_past_device_end_is_out_of_range() {
        let geometry = geometry();
        let device = Arc::new(MemBlockDevice::new(512, 24));
        let engine = DiskPagerEngine::new(device, geometry, None);
        let mut dest = vec![0u8; geometry.page_size as usize];
        assert!(engine.pagein(geometry.page_size, &mut dest).is_err());
    }

    #[test]
    fn unconditional_pageout_writes_full_page() {
        let geometry = geometry();
        let device = Arc::new(MemBlockDevice::new(512, 64));
        let engine = DiskPagerEngine::new(device.clone(), geometry, None);

        let src = vec![0x42u8; geometry.page_size as usize];
        engine.pageout(0, &src).unwrap();

        let mut check = vec![0u8; geometry.page_size as usize];
        device.read_at(DeviceBlockId(0), &mut check).unwrap();
        assert_eq!(check, src);
    }

    #[test]
    fn unconditional_pageout_clamps_to_device_end() {
        let geometry = geometry();
        // 25 device blocks of 512 bytes = 12800 bytes: 3 full fs blocks
        // (12288 bytes) plus a 512-byte straggler, well short of one page.
        let device = Arc::new(MemBlockDevice::new(512, 25));
        let engine = DiskPagerEngine::new(device.clone(), geometry, None);

        let src = vec![0x42u8; geometry.page_size as usize];
        engine.pageout(0, &src).unwrap(); // must not error with OutOfBounds

        let mut check = vec![0u8; 12800];
        device.read_at(DeviceBlockId(0), &mut check).unwrap();
        assert!(check.iter().all(|&b| b == 0x42));
    }

    #[test]
    fn selective_pageout_only_writes_modified_blocks() {
        let geometry = geometry();
        let device = Arc::new(MemBlockDevice::new(512, 64));
        device
            .write_at(DeviceBlockId(0), &vec![0xAAu8; geometry.page_size as usize])
            .unwrap();

        let bitmap = ModifiedBitmap::new(64);
        bitmap.set(BlockId(1)); // only the second fs block of the page
        let engine = DiskPagerEngine::new(device.clone(), geometry, Some(bitmap));

        let src = vec![0x11u8; geometry.page_size as usize];
        engine.pageout(0, &src).unwrap();

        let mut check = vec![0u8; geometry.page_size as usize];
        device.read_at(DeviceBlockId(0), &mut check).unwrap();
        let block_size = geometry.block_size() as usize;
        assert!(check[..block_size].iter().all(|&b| b == 0xAA)); // untouched
        assert!(check[block_size..block_size * 2].iter().all(|&b| b == 0x11)); // written
        assert!(check[block_size * 2..].iter().all(|&b| b == 0xAA)); // untouched
    }

    #[test]
    fn selective_pageout_clamps_and_handles_straggler_block() {
        let geometry = geometry();
        // 25 device blocks of 512 bytes = 12800 bytes: 3 full fs blocks
        // plus a 512-byte straggler that doesn't fill block index 3.
        let device = Arc::new(MemBlockDevice::new(512, 25));
        device.write_at(DeviceBlockId(0), &vec![0xAAu8; 12800]).unwrap();

        let bitmap = ModifiedBitmap::new(4);
        bitmap.set(BlockId(1)); // written
        bitmap.set(BlockId(3)); // the straggler block: also written
        let engine = DiskPagerEngine::new(device.clone(), geometry, Some(bitmap));

        let src = vec![0x11u8; geometry.page_size as usize];
        engine.pageout(0, &src).unwrap(); // must not error with OutOfBounds

        let mut check = vec![0u8; 12800];
        device.read_at(DeviceBlockId(0), &mut check).unwrap();
        let block_size = geometry.block_size() as usize;
        assert!(check[..block_size].iter().all(|&b| b == 0xAA)); // untouched
        assert!(check[block_size..block_size * 2].iter().all(|&b| b == 0x11)); // written
        assert!(check[block_size * 2..block_size * 3].iter().all(|&b| b == 0xAA)); // untouched
        assert!(check[block_size * 3..].iter().all(|&b| b == 0x11)); // straggler written
    }
}
