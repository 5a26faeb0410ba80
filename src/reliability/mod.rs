pub mod checkpoint;
pub mod retry;

pub use checkpoint::{Checkpoint, CheckpointError};
pub use retry::{execute, JitterMode, RetryError, RetryPolicy};
