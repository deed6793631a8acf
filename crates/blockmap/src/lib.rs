//! Node model, block run accumulator, and block map resolution (C1/C2, §4.1–§4.2).

pub mod accum;
pub mod map;
pub mod node;

pub use accum::{ReadRun, WriteRun};
pub use common::BlockId;
pub use map::{AllocError, BlockAllocator, BlockMap, SimpleBlockAllocator};
pub use node::{InodeId, Node, NodeState};
