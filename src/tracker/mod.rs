//! Externally-asserted-state reconciler
//!
//! Per address, tracks what this system last asserted ("expected") against
//! what the device itself last reported ("current"). When a settled report
//! disagrees with the expectation the address is flagged device-ahead: an
//! operator (or anything else with hands on the device) has taken it over,
//! and the scheduler should stop fighting them until the timeline genuinely
//! re-takes the address.
//!
//! Reports are debounced: device feedback is noisy during transitions, and
//! reacting to every intermediate report would cause false flags and command
//! storms. Only a report that stays unchallenged for the settle time is
//! compared against the expectation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use cuedriver_shared::{timing, Address};

/// Debounce window before a device-reported state counts as settled
pub const SETTLE_TIME: Duration = Duration::from_millis(timing::SETTLE_TIME_MS);

struct AddressEntry<S> {
    expected: Option<S>,
    current: Option<S>,
    device_ahead: bool,
    /// Bumped on every report; a settle task only acts if its generation is
    /// still the latest when it wakes up
    generation: u64,
    /// No expectation has ever been recorded and no report has settled yet
    first_contact: bool,
}

impl<S> Default for AddressEntry<S> {
    fn default() -> Self {
        Self {
            expected: None,
            current: None,
            device_ahead: false,
            generation: 0,
            first_contact: true,
        }
    }
}

type DifferFn<S> = Arc<dyn Fn(&S, &S) -> bool + Send + Sync>;

/// Tracks expected vs device-reported state per address
pub struct StateTracker<S>
where
    S: Clone + Send + Sync + 'static,
{
    entries: Arc<Mutex<BTreeMap<Address, AddressEntry<S>>>>,
    /// Returns true when the two states differ
    differ: DifferFn<S>,
    /// Treat the first settled report of an unseen address as the baseline
    /// rather than drift
    sync_on_first_blood: bool,
}

impl<S> StateTracker<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new<F>(differ: F, sync_on_first_blood: bool) -> Self
    where
        F: Fn(&S, &S) -> bool + Send + Sync + 'static,
    {
        Self {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            differ: Arc::new(differ),
            sync_on_first_blood,
        }
    }

    /// Record what this system asserts (or is about to assert) at an address.
    /// `did_assert` means a command actually went out for it, which takes the
    /// address back from the device if it had been flagged ahead.
    pub fn update_expected_state(&self, address: &str, state: S, did_assert: bool) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(address.to_string()).or_default();
        entry.expected = Some(state);
        entry.first_contact = false;
        if did_assert && entry.device_ahead {
            debug!(address, "address back under timeline control");
            entry.device_ahead = false;
        }
    }

    /// Record a state the device itself reported. The comparison against the
    /// expectation runs only after the report has stayed unchallenged for
    /// [`SETTLE_TIME`].
    pub fn update_state(&self, address: &str, state: S) {
        let generation = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(address.to_string()).or_default();
            entry.current = Some(state);
            entry.generation += 1;
            entry.generation
        };

        let entries = self.entries.clone();
        let differ = self.differ.clone();
        let sync_on_first_blood = self.sync_on_first_blood;
        let address = address.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(SETTLE_TIME).await;
            let mut entries = entries.lock().unwrap();
            let Some(entry) = entries.get_mut(&address) else {
                return;
            };
            if entry.generation != generation {
                // A newer report superseded this one
                return;
            }
            let Some(current) = entry.current.clone() else {
                return;
            };
            match &entry.expected {
                None => {
                    if sync_on_first_blood && entry.first_contact {
                        debug!(address, "first contact, taking report as baseline");
                        entry.expected = Some(current);
                    } else {
                        debug!(address, "device ahead: no expectation for settled report");
                        entry.device_ahead = true;
                    }
                }
                Some(expected) => {
                    if (differ)(expected, &current) {
                        debug!(address, "device ahead: settled report differs from expectation");
                        entry.device_ahead = true;
                    } else {
                        // The device came back in line
                        entry.device_ahead = false;
                    }
                }
            }
            entry.first_contact = false;
        });
    }

    pub fn is_device_ahead(&self, address: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(address)
            .map_or(false, |e| e.device_ahead)
    }

    pub fn get_expected_state(&self, address: &str) -> Option<S> {
        self.entries
            .lock()
            .unwrap()
            .get(address)
            .and_then(|e| e.expected.clone())
    }

    pub fn get_current_state(&self, address: &str) -> Option<S> {
        self.entries
            .lock()
            .unwrap()
            .get(address)
            .and_then(|e| e.current.clone())
    }

    /// The timeline no longer describes this address at all
    pub fn unset_expected_state(&self, address: &str) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(address) {
            entry.expected = None;
        }
    }

    pub fn get_all_addresses(&self) -> Vec<Address> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    /// Addresses currently flagged device-ahead
    pub fn ahead_addresses(&self) -> Vec<Address> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.device_ahead)
            .map(|(a, _)| a.clone())
            .collect()
    }
}
