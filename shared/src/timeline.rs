//! Resolved timeline state as consumed by a device
//!
//! The timeline resolver (out of scope here) turns a declarative show
//! description into the set of objects active at a given instant. These types
//! carry that result to one device's state handler.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::Time;

/// One entity active on the timeline during some interval.
///
/// The content is opaque to the engine; only the device adapter that owns the
/// mapped layer knows its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineObject {
    pub id: String,
    /// Show-timeline layer this object plays on
    pub layer: String,
    /// Higher priority wins when objects collide on a layer
    #[serde(default)]
    pub priority: i64,
    /// Non-committal look-ahead placement (pre-load hint, not a real cue)
    #[serde(default)]
    pub is_lookahead: bool,
    /// Device-typed payload, interpreted by the adapter only
    #[serde(default)]
    pub content: Value,
}

/// The timeline objects relevant to one device at one instant.
///
/// Objects are kept sorted by `(layer, id)` so downstream diffing never
/// depends on the order the resolver produced them in.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTimelineState {
    pub time: Time,
    objects: Vec<TimelineObject>,
}

impl DeviceTimelineState {
    /// Create a new timeline state, normalizing object order
    pub fn new(time: Time, mut objects: Vec<TimelineObject>) -> Self {
        objects.sort_by(|a, b| a.layer.cmp(&b.layer).then_with(|| a.id.cmp(&b.id)));
        Self { time, objects }
    }

    /// Create an empty state (nothing should be on the device)
    pub fn empty(time: Time) -> Self {
        Self {
            time,
            objects: Vec::new(),
        }
    }

    pub fn objects(&self) -> &[TimelineObject] {
        &self.objects
    }
}

/// Association from a show-timeline layer to a device and its options.
///
/// Supplied by configuration and passed through the engine unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub device_id: String,
    /// Device-specific mapping options, interpreted by the adapter only
    #[serde(default)]
    pub options: Value,
}

/// Layer name to mapping. BTreeMap keeps iteration order stable.
pub type Mappings = BTreeMap<String, Mapping>;
