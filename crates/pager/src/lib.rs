//! Disk-pager and file-pager engines (C3/C4, §4.3–§4.4).

pub mod disk;
pub mod file;

pub use disk::{DiskPagerEngine, ModifiedBitmap};
pub use file::FilePagerEngine;
