//! In-memory task queue and scheduler (C6), plus its on-disk persistence
//! (C7). `engine::Queue` is the only thing allowed to mutate a `Task`.

pub mod engine;
pub mod persistence;
pub mod task;

pub use engine::{Dispatch, Queue, QueueError, SchedulingConfig};
pub use persistence::{load_queue_state, save_queue_state, QueueSnapshotFile, SCHEMA_VERSION};
pub use task::{SchedulingKey, Task, TaskId, TaskProgress, TaskState};
