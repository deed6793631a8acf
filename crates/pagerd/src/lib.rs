//! Pager registry & lifecycle (C5, §4.5) and the `FilesystemInstance`
//! facade exposed to the filesystem surface (§6).

pub mod config;
pub mod instance;
pub mod registry;

pub use config::FilesystemConfig;
pub use instance::{FilesystemInstance, FsError, FsResult};
pub use registry::{Bucket, PagerHandle, PagerId};
