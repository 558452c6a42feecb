//! Per-device scheduling: the state handler and its supporting types

pub mod state_handler;

pub use state_handler::{StateHandler, StateHandlerOptions};
