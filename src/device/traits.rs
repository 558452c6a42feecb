//! Device adapter and host context trait abstractions
//!
//! Every device the engine drives (vision mixer, media player, audio mixer,
//! graphics renderer, ...) is plugged in as one [`DeviceAdapter`]
//! implementation selected at configuration time. The engine composes over an
//! adapter value; there is no inheritance hierarchy.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

use cuedriver_shared::{Address, Command, DeviceTimelineState, Mappings, Measurement, Time};

/// Result of converting a timeline state into a device-shaped state.
///
/// Adapters that support reconciliation with externally driven changes also
/// break the state out per address; others leave `address_states` as `None`.
pub struct ConvertedState<DS, AS> {
    pub device_state: DS,
    pub address_states: Option<BTreeMap<Address, AS>>,
}

impl<DS, AS> From<DS> for ConvertedState<DS, AS> {
    fn from(device_state: DS) -> Self {
        Self {
            device_state,
            address_states: None,
        }
    }
}

/// The contract a device implementation provides to the engine.
///
/// `convert_timeline_state` and `diff_states` must be pure functions of their
/// inputs; `send_command` is the only side-effecting call.
#[async_trait]
pub trait DeviceAdapter: Send + Sync + 'static {
    /// What the device should display/do; opaque to the engine
    type DeviceState: Clone + Send + Sync + 'static;
    /// Slice of the device state addressable in isolation
    type AddressState: Clone + Send + Sync + 'static;
    /// Wire-level payload of one command
    type CommandPayload: Clone + fmt::Debug + Send + Sync + 'static;

    /// Convert a resolved timeline state into the device-shaped state
    fn convert_timeline_state(
        &self,
        state: &DeviceTimelineState,
        mappings: &Mappings,
    ) -> ConvertedState<Self::DeviceState, Self::AddressState>;

    /// Compute the minimal commands moving the device from `old` to `new`.
    /// `old` is `None` when the device's state is unknown (startup).
    fn diff_states(
        &self,
        old: Option<&Self::DeviceState>,
        new: &Self::DeviceState,
        mappings: &Mappings,
        now: Time,
    ) -> Result<Vec<Command<Self::CommandPayload>>>;

    /// Send one command to the device
    async fn send_command(&self, command: &Command<Self::CommandPayload>) -> Result<()>;

    /// Whether this adapter breaks its state out per address, enabling
    /// reconciliation with externally driven device changes
    fn supports_address_states(&self) -> bool {
        false
    }

    /// Splice one address's state into a whole device state
    fn apply_address_state(
        &self,
        _state: &mut Self::DeviceState,
        _address: &Address,
        _address_state: &Self::AddressState,
    ) {
    }

    /// Whether two address states differ (true = they differ)
    fn diff_address_states(&self, _a: &Self::AddressState, _b: &Self::AddressState) -> bool {
        false
    }

    /// Whether a newly intended address state should re-take an address the
    /// device has driven away from what we last asserted
    fn address_state_reasserts_control(
        &self,
        _old_expected: Option<&Self::AddressState>,
        _new_expected: &Self::AddressState,
    ) -> bool {
        false
    }
}

/// Host-side accessors the engine needs around one device.
///
/// Lifecycle signals (command errors, measurements) flow out through this
/// interface rather than a global event bus; the host decides whether to log
/// them, forward them on a channel or drop them.
pub trait DeviceContext<P>: Send + Sync + 'static {
    /// Current wall-clock time. The engine never reads the system clock
    /// directly; tests inject a controlled clock here.
    fn current_time(&self) -> Time;

    /// Identifier of the device this engine instance drives
    fn device_id(&self) -> &str;

    /// A command send failed. Isolated per command; sibling commands in the
    /// same batch are unaffected.
    fn command_error(&self, error: anyhow::Error, command: &Command<P>);

    /// An executed transition produced a timing record
    fn report_measurement(&self, measurement: &Measurement);
}
