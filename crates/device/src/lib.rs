//! The block-device transport (§6: "Device transport").
//!
//! This is a true external collaborator in the original design — the Mach
//! device port reached through `libstore/device.c` — so the trait here is
//! deliberately thin: synchronous read/write in device-block units, plus the
//! two facts every pager needs (`device_size`, `device_block_size`). The
//! file-backed implementation exists so the rest of the workspace has
//! something concrete to run against in tests and the CLI.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;

use common::DeviceBlockId;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer of {len} bytes at device block {block:?} crosses device end (size={size})")]
    OutOfBounds {
        block: DeviceBlockId,
        len: usize,
        size: u64,
    },
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Synchronous block transport, in device-block units.
///
/// Implementations must honor the invariant from `store_device_create`
/// (`libstore/device.c`): `device_size` and `device_block_size` are fixed
/// for the object's lifetime once opened.
pub trait BlockDevice: Send + Sync {
    /// Size of one device block, in bytes. Always a power of two.
    fn device_block_size(&self) -> u64;

    /// Total device size, in device blocks.
    fn device_size(&self) -> u64;

    /// Reads `buf.len()` bytes starting at device block `block` into `buf`.
    /// `buf.len()` need not be a multiple of `device_block_size`.
    fn read_at(&self, block: DeviceBlockId, buf: &mut [u8]) -> DeviceResult<()>;

    /// Writes `buf` starting at device block `block`.
    fn write_at(&self, block: DeviceBlockId, buf: &[u8]) -> DeviceResult<()>;

    /// Forces any buffered writes to stable storage.
    fn sync(&self) -> DeviceResult<()>;

    fn device_size_bytes(&self) -> u64 {
        self.device_size() * self.device_block_size()
    }
}

/// A `BlockDevice` backed by a plain file, opened for synchronous
/// positioned reads/writes the way `storage::DiskManager` uses
/// `read_at`/`write_at`/`sync_data` over a `std::fs::File`.
pub struct FileBlockDevice {
    file: File,
    device_block_size: u64,
    device_size: u64,
}

impl FileBlockDevice {
    /// Opens (creating if absent) a backing file and extends it to exactly
    /// `device_size` device blocks of `device_block_size` bytes each.
    pub fn open<P: AsRef<Path>>(
        path: P,
        device_block_size: u64,
        device_size: u64,
    ) -> DeviceResult<Self> {
        assert!(device_block_size.is_power_of_two());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let total = device_size * device_block_size;
        file.set_len(total)?;

        Ok(Self {
            file,
            device_block_size,
            device_size,
        })
    }

    /// Opens a backing file, inferring `device_size` from its current
    /// length (rounded down to whole device blocks).
    pub fn open_existing<P: AsRef<Path>>(path: P, device_block_size: u64) -> DeviceResult<Self> {
        assert!(device_block_size.is_power_of_two());
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file,
            device_block_size,
            device_size: len / device_block_size,
        })
    }

    fn check_bounds(&self, block: DeviceBlockId, len: usize) -> DeviceResult<u64> {
        let offset = block
            .0
            .checked_mul(self.device_block_size)
            .expect("device block overflow");
        let end = offset + len as u64;
        if end > self.device_size_bytes() {
            return Err(DeviceError::OutOfBounds {
                block,
                len,
                size: self.device_size_bytes(),
            });
        }
        Ok(offset)
    }
}

impl BlockDevice for FileBlockDevice {
    fn device_block_size(&self) -> u64 {
        self.device_block_size
    }

    fn device_size(&self) -> u64 {
        self.device_size
    }

    fn read_at(&self, block: DeviceBlockId, buf: &mut [u8]) -> DeviceResult<()> {
        let offset = self.check_bounds(block, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, block: DeviceBlockId, buf: &[u8]) -> DeviceResult<()> {
        let offset = self.check_bounds(block, buf.len())?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> DeviceResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// An in-memory `BlockDevice`, used by unit tests in `blockmap`/`pager` that
/// would otherwise need a scratch file per case.
pub struct MemBlockDevice {
    data: Mutex<Vec<u8>>,
    device_block_size: u64,
}

impl MemBlockDevice {
    pub fn new(device_block_size: u64, device_size: u64) -> Self {
        assert!(device_block_size.is_power_of_two());
        Self {
            data: Mutex::new(vec![0u8; (device_block_size * device_size) as usize]),
            device_block_size,
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BlockDevice for MemBlockDevice {
    fn device_block_size(&self) -> u64 {
        self.device_block_size
    }

    fn device_size(&self) -> u64 {
        self.data.lock().len() as u64 / self.device_block_size
    }

    fn read_at(&self, block: DeviceBlockId, buf: &mut [u8]) -> DeviceResult<()> {
        let data = self.data.lock();
        let offset = (block.0 * self.device_block_size) as usize;
        let end = offset + buf.len();
        if end > data.len() {
            return Err(DeviceError::OutOfBounds {
                block,
                len: buf.len(),
                size: data.len() as u64,
            });
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_at(&self, block: DeviceBlockId, buf: &[u8]) -> DeviceResult<()> {
        let mut data = self.data.lock();
        let offset = (block.0 * self.device_block_size) as usize;
        let end = offset + buf.len();
        if end > data.len() {
            return Err(DeviceError::OutOfBounds {
                block,
                len: buf.len(),
                size: data.len() as u64,
            });
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> DeviceResult<()> {
        Ok(())
    }
}
