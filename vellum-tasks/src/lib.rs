//! VELLUM Tasks - Task Registry and Checkpointing
//!
//! The registry tracks every asynchronous task's lifecycle through a single
//! mutator, `transition`, which appends to the audit history and notifies
//! progress observers after the write commits. The checkpoint log stores
//! durable, integrity-hashed recovery points; `latest_valid` returns the
//! newest checkpoint that passes verification, not the newest row.

mod checkpoint;
mod registry;

pub use checkpoint::CheckpointLog;
pub use registry::{NewTask, ProgressEvent, ProgressSink, TaskRegistry, TransitionOptions};
