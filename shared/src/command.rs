//! Device commands produced by state diffing

use crate::Time;

/// One command to send to a device, as produced by an adapter's diff.
///
/// The payload type is defined by the adapter; the engine only reads the
/// bookkeeping fields around it.
#[derive(Debug, Clone, PartialEq)]
pub struct Command<P> {
    pub payload: P,
    /// Human-readable reason this command exists (for logs and error reports)
    pub context: String,
    /// Id of the timeline object this command traces back to
    pub timeline_obj_id: String,
    /// Milliseconds before the state's nominal time this command should be
    /// sent, e.g. to pre-load a clip before playing it
    pub preliminary: Option<Time>,
}

impl<P> Command<P> {
    pub fn new(payload: P, context: impl Into<String>, timeline_obj_id: impl Into<String>) -> Self {
        Self {
            payload,
            context: context.into(),
            timeline_obj_id: timeline_obj_id.into(),
            preliminary: None,
        }
    }

    /// Mark this command for early sending
    pub fn with_preliminary(mut self, preliminary: Time) -> Self {
        self.preliminary = Some(preliminary);
        self
    }

    /// Absolute moment this command should be sent, given the nominal time of
    /// the state it belongs to
    pub fn send_time(&self, state_time: Time) -> Time {
        state_time.saturating_sub(self.preliminary.unwrap_or(0))
    }
}
