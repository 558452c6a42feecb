//! Command dispatch: the cancel-aware task queue and the batch executor

pub mod executor;
pub mod queue;

pub use executor::{CommandExecutor, ExecutionMode};
pub use queue::{CancellableQueue, QueueHandle};
