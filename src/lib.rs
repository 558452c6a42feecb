//! Cuedriver - timeline-driven state engine for broadcast devices
//!
//! Drives physical and virtual broadcast devices (vision mixers, media
//! players, audio mixers, graphics renderers, ...) from a resolved show
//! timeline. For each device the engine converts a point-in-time intended
//! state into a device-shaped state, computes the minimal commands to move
//! the device from its last known state to the new one, and fires those
//! commands at the right wall-clock moment - including slightly early for
//! slow commands such as clip pre-loads.
//!
//! One [`StateHandler`] runs per device; devices are fully independent. Each
//! device plugs in as a [`DeviceAdapter`] implementation providing state
//! conversion, diffing and command sending; the engine owns timing, ordering,
//! cancellation of superseded work, and reconciliation when an operator takes
//! over part of a device.

pub mod command;
pub mod device;
pub mod scheduler;
pub mod tracker;

pub use command::{CancellableQueue, CommandExecutor, ExecutionMode, QueueHandle};
pub use device::{ConvertedState, DeviceAdapter, DeviceContext};
pub use scheduler::{StateHandler, StateHandlerOptions};
pub use tracker::StateTracker;

pub use cuedriver_shared::{
    Address, Command, CommandMeasurement, DeviceTimelineState, EngineError, Mapping, Mappings,
    Measurement, Time, TimelineObject,
};
