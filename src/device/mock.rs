//! Test fixtures: a key-value mock device, a controllable clock and a
//! recording host context
//!
//! The mock device models the simplest possible addressable device: a map of
//! address -> entry. Its diff emits one Added/Changed/Removed command per
//! address that moved, which is exactly the granularity the engine tests
//! need. Diff and send failures are scriptable.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use cuedriver_shared::{
    Address, Command, DeviceTimelineState, Mappings, Measurement, Time, TimelineObject,
};

use super::traits::{ConvertedState, DeviceAdapter, DeviceContext};

/// Deterministic clock: a fixed base plus time elapsed on the tokio clock.
/// Under `#[tokio::test(start_paused = true)]` it only moves when the test
/// lets the runtime advance.
#[derive(Clone)]
pub struct MockClock {
    base: Time,
    start: tokio::time::Instant,
}

impl MockClock {
    pub fn new(base: Time) -> Self {
        Self {
            base,
            start: tokio::time::Instant::now(),
        }
    }

    pub fn now(&self) -> Time {
        self.base + self.start.elapsed().as_millis() as Time
    }
}

/// One addressable slice of the mock device's state
#[derive(Debug, Clone, PartialEq)]
pub struct MockEntry {
    pub value: String,
    pub obj_id: String,
    pub preliminary: Option<Time>,
    /// Intended state explicitly re-takes the address even if an operator
    /// changed it on the device
    pub reassert: bool,
}

impl MockEntry {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            obj_id: String::new(),
            preliminary: None,
            reassert: false,
        }
    }
}

pub type MockState = BTreeMap<Address, MockEntry>;

#[derive(Debug, Clone, PartialEq)]
pub enum MockCommand {
    Added { address: Address, value: String },
    Changed { address: Address, value: String },
    Removed { address: Address },
}

impl MockCommand {
    pub fn address(&self) -> &str {
        match self {
            MockCommand::Added { address, .. }
            | MockCommand::Changed { address, .. }
            | MockCommand::Removed { address } => address,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SentCommand {
    pub time: Time,
    pub payload: MockCommand,
}

pub struct MockDevice {
    clock: MockClock,
    address_states: bool,
    send_delay: Option<Duration>,
    fail_next_diff: AtomicBool,
    fail_addresses: Mutex<BTreeSet<Address>>,
    sent: Mutex<Vec<SentCommand>>,
}

impl MockDevice {
    pub fn new(clock: MockClock) -> Self {
        Self {
            clock,
            address_states: false,
            send_delay: None,
            fail_next_diff: AtomicBool::new(false),
            fail_addresses: Mutex::new(BTreeSet::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Advertise per-address states, enabling reconciliation
    pub fn with_address_states(mut self) -> Self {
        self.address_states = true;
        self
    }

    /// Make every send take this long
    pub fn with_send_delay(mut self, millis: u64) -> Self {
        self.send_delay = Some(Duration::from_millis(millis));
        self
    }

    /// Make the next diff fail
    pub fn fail_next_diff(&self) {
        self.fail_next_diff.store(true, Ordering::SeqCst);
    }

    /// Make sends touching this address fail
    pub fn fail_sends_to(&self, address: &str) {
        self.fail_addresses.lock().unwrap().insert(address.into());
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_payloads(&self) -> Vec<MockCommand> {
        self.sent.lock().unwrap().iter().map(|s| s.payload.clone()).collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }
}

/// Build a mock entry from one timeline object. Content is either a plain
/// string or `{"value": ..., "preliminary": ..., "reassert": ...}`.
fn entry_from_object(object: &TimelineObject) -> MockEntry {
    let mut entry = match &object.content {
        Value::String(value) => MockEntry::new(value.clone()),
        Value::Object(map) => {
            let mut entry = MockEntry::new(
                map.get("value").and_then(Value::as_str).unwrap_or_default(),
            );
            entry.preliminary = map.get("preliminary").and_then(Value::as_u64);
            entry.reassert = map
                .get("reassert")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            entry
        }
        _ => MockEntry::new(""),
    };
    entry.obj_id = object.id.clone();
    entry
}

#[async_trait]
impl DeviceAdapter for MockDevice {
    type DeviceState = MockState;
    type AddressState = MockEntry;
    type CommandPayload = MockCommand;

    fn convert_timeline_state(
        &self,
        state: &DeviceTimelineState,
        mappings: &Mappings,
    ) -> ConvertedState<MockState, MockEntry> {
        let mut device_state = MockState::new();
        for object in state.objects() {
            // A mapping may redirect a layer to another address
            let address = mappings
                .get(&object.layer)
                .and_then(|m| m.options.get("address"))
                .and_then(Value::as_str)
                .unwrap_or(&object.layer)
                .to_string();

            let entry = entry_from_object(object);
            match device_state.get(&address) {
                // Committed placements beat look-aheads, then priority wins
                Some(existing) => {
                    let existing_obj = state
                        .objects()
                        .iter()
                        .find(|o| o.id == existing.obj_id);
                    let keep = existing_obj.map_or(false, |e| {
                        (!e.is_lookahead && object.is_lookahead)
                            || (e.is_lookahead == object.is_lookahead
                                && e.priority >= object.priority)
                    });
                    if !keep {
                        device_state.insert(address, entry);
                    }
                }
                None => {
                    device_state.insert(address, entry);
                }
            }
        }

        let address_states = self
            .address_states
            .then(|| device_state.clone());
        ConvertedState {
            device_state,
            address_states,
        }
    }

    fn diff_states(
        &self,
        old: Option<&MockState>,
        new: &MockState,
        _mappings: &Mappings,
        _now: Time,
    ) -> Result<Vec<Command<MockCommand>>> {
        if self.fail_next_diff.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("scripted diff failure"));
        }

        let mut commands = Vec::new();
        for (address, entry) in new {
            let previous = old.and_then(|o| o.get(address));
            let mut command = match previous {
                None => Command::new(
                    MockCommand::Added {
                        address: address.clone(),
                        value: entry.value.clone(),
                    },
                    format!("added {address}"),
                    entry.obj_id.clone(),
                ),
                Some(prev) if prev.value != entry.value => Command::new(
                    MockCommand::Changed {
                        address: address.clone(),
                        value: entry.value.clone(),
                    },
                    format!("changed {address}"),
                    entry.obj_id.clone(),
                ),
                Some(_) => continue,
            };
            command.preliminary = entry.preliminary;
            commands.push(command);
        }
        if let Some(old) = old {
            for (address, entry) in old {
                if !new.contains_key(address) {
                    commands.push(Command::new(
                        MockCommand::Removed {
                            address: address.clone(),
                        },
                        format!("removed {address}"),
                        entry.obj_id.clone(),
                    ));
                }
            }
        }
        Ok(commands)
    }

    async fn send_command(&self, command: &Command<MockCommand>) -> Result<()> {
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_addresses
            .lock()
            .unwrap()
            .contains(command.payload.address())
        {
            return Err(anyhow!("send to {} refused", command.payload.address()));
        }
        self.sent.lock().unwrap().push(SentCommand {
            time: self.clock.now(),
            payload: command.payload.clone(),
        });
        Ok(())
    }

    fn supports_address_states(&self) -> bool {
        self.address_states
    }

    fn apply_address_state(
        &self,
        state: &mut MockState,
        address: &Address,
        address_state: &MockEntry,
    ) {
        state.insert(address.clone(), address_state.clone());
    }

    fn diff_address_states(&self, a: &MockEntry, b: &MockEntry) -> bool {
        a.value != b.value
    }

    fn address_state_reasserts_control(
        &self,
        _old_expected: Option<&MockEntry>,
        new_expected: &MockEntry,
    ) -> bool {
        new_expected.reassert
    }
}

/// Records everything the engine reports
pub struct MockContext {
    clock: MockClock,
    device_id: String,
    errors: Mutex<Vec<(String, String)>>,
    measurements: Mutex<Vec<Measurement>>,
}

impl MockContext {
    pub fn new(clock: MockClock) -> Self {
        Self {
            clock,
            device_id: "mock0".into(),
            errors: Mutex::new(Vec::new()),
            measurements: Mutex::new(Vec::new()),
        }
    }

    /// Reported command errors as (error, command context) pairs
    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().unwrap().clone()
    }

    pub fn measurements(&self) -> Vec<Measurement> {
        self.measurements.lock().unwrap().clone()
    }
}

impl DeviceContext<MockCommand> for MockContext {
    fn current_time(&self) -> Time {
        self.clock.now()
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn command_error(&self, error: anyhow::Error, command: &Command<MockCommand>) {
        self.errors
            .lock()
            .unwrap()
            .push((format!("{error:#}"), command.context.clone()));
    }

    fn report_measurement(&self, measurement: &Measurement) {
        self.measurements.lock().unwrap().push(measurement.clone());
    }
}

/// Call at the top of a test to see engine logs under RUST_LOG
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Timeline object with a plain string value on a layer
pub fn obj(id: &str, layer: &str, value: &str) -> TimelineObject {
    TimelineObject {
        id: id.into(),
        layer: layer.into(),
        priority: 0,
        is_lookahead: false,
        content: Value::String(value.into()),
    }
}

/// Timeline object with structured content
pub fn obj_with(id: &str, layer: &str, content: Value) -> TimelineObject {
    TimelineObject {
        id: id.into(),
        layer: layer.into(),
        priority: 0,
        is_lookahead: false,
        content,
    }
}
