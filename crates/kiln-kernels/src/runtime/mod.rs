//! Device runtime facade: queues, launch ranges and staging memory.

pub mod context;
pub mod memory;
pub mod queue;

pub use context::QueueRegistry;
pub use memory::{DeviceBuffer, StagingArena, StagingBuffer, UnsafeSlice};
pub use queue::{DeviceInfo, Event, NdRange, Queue, WorkItem};
