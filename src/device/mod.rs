//! Device adapter contract and host context

pub mod traits;

#[cfg(test)]
pub(crate) mod mock;

pub use traits::{ConvertedState, DeviceAdapter, DeviceContext};
