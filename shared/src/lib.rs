//! Cuedriver Shared Types
//!
//! This crate provides the data model shared between the cuedriver engine and
//! device adapters: resolved timeline state, commands, layer mappings and
//! execution measurements.

pub mod command;
pub mod measurement;
pub mod timeline;

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

// Re-export commonly used types at crate root
pub use command::Command;
pub use measurement::{CommandMeasurement, Measurement};
pub use timeline::{DeviceTimelineState, Mapping, Mappings, TimelineObject};

/// Milliseconds since Unix epoch.
pub type Time = u64;

/// Key identifying one independently trackable sub-state of a device
/// (e.g. one output, one channel).
pub type Address = String;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> Time {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Time
}

/// Timing parameters for the engine
pub mod timing {
    /// Debounce window before a device-reported state is treated as settled
    pub const SETTLE_TIME_MS: u64 = 200;

    /// Interval of the scheduler's background wall-clock check
    pub const CHECK_INTERVAL_MS: u64 = 50;
}

/// Errors surfaced by the engine itself (adapter errors travel as `anyhow`)
#[derive(Debug, Error)]
pub enum EngineError {
    /// The queue worker is gone, so a pending task handle can never resolve
    #[error("task queue was terminated before the task could run")]
    QueueTerminated,
}
