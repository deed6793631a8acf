//! The block run accumulator (C1, §4.1).
//!
//! The original `ext2fs/pager.c` shares this state between an outer and an
//! inner routine via lexical closures (`do_pending_reads`, the
//! `pending_blocks_*` family). Per the Design Notes (§9) this becomes two
//! explicit structs passed by reference: `ReadRun` for pagein consolidation
//! and `WriteRun` for pageout consolidation. Both coalesce consecutive
//! filesystem blocks into a single device transfer and both discard
//! themselves (no retry) on the first device error, per §4.1's error
//! policy.

use common::{BlockId, DeviceBlockId, Geometry};
use device::{BlockDevice, DeviceResult};

/// Coalesces consecutive disk blocks being *read* into one device transfer,
/// landing the result directly in the destination page at the byte range
/// that corresponds to the accumulated blocks' position within the page.
#[derive(Default)]
pub struct ReadRun {
    first_disk_block: Option<BlockId>,
    start_index: u64,
    count: u64,
}

impl ReadRun {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the block at page-relative block `index` to the run, flushing
    /// first if it doesn't extend the current run.
    pub fn add(
        &mut self,
        index: u64,
        disk_block: BlockId,
        device: &dyn BlockDevice,
        geometry: &Geometry,
        dest: &mut [u8],
    ) -> DeviceResult<()> {
        if let Some(first) = self.first_disk_block
            && first.checked_add(self.count) == Some(disk_block)
        {
            self.count += 1;
            return Ok(());
        }
        self.flush(device, geometry, dest)?;
        self.first_disk_block = Some(disk_block);
        self.start_index = index;
        self.count = 1;
        Ok(())
    }

    /// Issues the pending read, if any.
    pub fn flush(
        &mut self,
        device: &dyn BlockDevice,
        geometry: &Geometry,
        dest: &mut [u8],
    ) -> DeviceResult<()> {
        if self.count == 0 {
            return Ok(());
        }
        let first = self.first_disk_block.expect("count > 0 implies a run");
        let dev_block = DeviceBlockId(first.0 * geometry.dev_blocks_per_fs_block());
        let len = (self.count * geometry.block_size()) as usize;
        let offset = (self.start_index * geometry.block_size()) as usize;
        device.read_at(dev_block, &mut dest[offset..offset + len])?;
        self.count = 0;
        Ok(())
    }
}

/// Coalesces consecutive disk blocks being *written* into one device
/// transfer, matching `struct pending_blocks` in the original. `skip`
/// expresses a hole in the writeback run (used by the disk pager's
/// selective-writeback mode, §4.3).
pub struct WriteRun<'a> {
    first_disk_block: Option<BlockId>,
    count: u64,
    buf_offset: usize,
    src: &'a [u8],
}

impl<'a> WriteRun<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self {
            first_disk_block: None,
            count: 0,
            buf_offset: 0,
            src,
        }
    }

    /// Adds `block` as the destination for the next `block_size` bytes of
    /// `src`, flushing first if it doesn't extend the current run.
    pub fn add(
        &mut self,
        block: BlockId,
        device: &dyn BlockDevice,
        geometry: &Geometry,
    ) -> DeviceResult<()> {
        let extends = self
            .first_disk_block
            .and_then(|first| first.checked_add(self.count))
            == Some(block);
        if !extends {
            self.flush(device, geometry)?;
            self.first_disk_block = Some(block);
        }
        self.count += 1;
        Ok(())
    }

    /// Skips writing the next `block_size` bytes of `src` (a hole in the
    /// writeback run), flushing any pending run first.
    pub fn skip(&mut self, device: &dyn BlockDevice, geometry: &Geometry) -> DeviceResult<()> {
        self.flush(device, geometry)?;
        self.buf_offset += geometry.block_size() as usize;
        Ok(())
    }

    /// Issues the pending write, if any.
    pub fn flush(&mut self, device: &dyn BlockDevice, geometry: &Geometry) -> DeviceResult<()> {
        if self.count == 0 {
            return Ok(());
        }
        let first = self.first_disk_block.expect("count > 0 implies a run");
        let dev_block = DeviceBlockId(first.0 * geometry.dev_blocks_per_fs_block());
        let len = (self.count * geometry.block_size()) as usize;
        let slice = &self.src[self.buf_offset..self.buf_offset + len];
        if self.buf_offset > 0 {
            // Some device interfaces require a page-aligned source; once
            // we're not writing from the start of the page, source from a
            // freshly owned scratch buffer instead of a mid-page slice.
            let scratch = slice.to_vec();
            device.write_at(dev_block, &scratch)?;
        } else {
            device.write_at(dev_block, slice)?;
        }
        self.buf_offset += len;
        self.count = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device::MemBlockDevice;

    fn geometry() -> Geometry {
        Geometry::new(12, 9, 16384) // 4096-byte blocks, 512-byte dev blocks, 16KiB pages
    }

    #[test]
    fn read_run_coalesces_contiguous_blocks() {
        let geometry = geometry();
        let device = MemBlockDevice::new(512, 4096);
        // Seed disk blocks 10..14 (4 fs blocks) with a recognizable pattern.
        let mut pattern = vec![0u8; geometry.block_size() as usize * 4];
        for (i, byte) in pattern.iter_mut().enumerate() {
            *byte = (i / geometry.block_size() as usize) as u8;
        }
        device
            .write_at(
                DeviceBlockId(10 * geometry.dev_blocks_per_fs_block()),
                &pattern,
            )
            .unwrap();

        let mut dest = vec![0xFFu8; geometry.page_size as usize];
        let mut run = ReadRun::new();
        for i in 0..4u64 {
            run.add(i, BlockId(10 + i), &device, &geometry, &mut dest)
                .unwrap();
        }
        run.flush(&device, &geometry, &mut dest).unwrap();
        assert_eq!(&dest[..pattern.len()], &pattern[..]);
    }

    #[test]
    fn read_run_flushes_on_discontinuity() {
        let geometry = geometry();
        let device = MemBlockDevice::new(512, 4096);
        device
            .write_at(
                DeviceBlockId(0 * geometry.dev_blocks_per_fs_block()),
                &[1u8; 4096],
            )
            .unwrap();
        device
            .write_at(
                DeviceBlockId(5 * geometry.dev_blocks_per_fs_block()),
                &[2u8; 4096],
            )
            .unwrap();

        let mut dest = vec![0u8; geometry.page_size as usize];
        let mut run = ReadRun::new();
        run.add(0, BlockId(0), &device, &geometry, &mut dest)
            .unwrap();
        run.add(1, BlockId(5), &device, &geometry, &mut dest)
            .unwrap(); // discontinuous: forces a flush of block 0 first
        run.flush(&device, &geometry, &mut dest).unwrap();

        assert!(dest[..4096].iter().all(|&b| b == 1));
        assert!(dest[4096..8192].iter().all(|&b| b == 2));
    }

    #[test]
    fn write_run_skip_leaves_destination_untouched() {
        let geometry = geometry();
        let device = MemBlockDevice::new(512, 4096);
        device
            .write_at(DeviceBlockId(0), &[0xAAu8; 4096 * 2])
            .unwrap();

        let src = vec![0x11u8; geometry.page_size as usize];
        let mut run = WriteRun::new(&src);
        run.skip(&device, &geometry).unwrap(); // block 0 of the page: skipped
        run.add(BlockId(1), &device, &geometry).unwrap(); // block 1: written
        run.flush(&device, &geometry).unwrap();

        let mut check = vec![0u8; 4096 * 2];
        device.read_at(DeviceBlockId(0), &mut check).unwrap();
        assert!(check[..4096].iter().all(|&b| b == 0xAA)); // untouched
        assert!(check[4096..].iter().all(|&b| b == 0x11)); // written
    }
}
