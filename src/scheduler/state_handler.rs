//! State handler - the per-device scheduling orchestrator
//!
//! Owns the queue of upcoming intended states for one device, a background
//! wall-clock check, and the logic deciding when to diff and when to execute.
//! The device adapter does the actual conversion, diffing and sending; this
//! module owns timing correctness, ordering, and recovery when the device's
//! real state drifts out from under the timeline.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use cuedriver_shared::{
    timing, Address, Command, DeviceTimelineState, Mappings, Measurement, Time,
};

use crate::command::{CancellableQueue, CommandExecutor, ExecutionMode};
use crate::device::{DeviceAdapter, DeviceContext};
use crate::tracker::StateTracker;

/// Interval of the background wall-clock check
const CHECK_INTERVAL: Duration = Duration::from_millis(timing::CHECK_INTERVAL_MS);

/// Tunables for one state handler
#[derive(Debug, Clone, Default)]
pub struct StateHandlerOptions {
    pub execution_mode: ExecutionMode,
    /// Treat the first settled device report per address as baseline instead
    /// of drift (see [`StateTracker`])
    pub sync_on_first_blood: bool,
}

/// One pending transition: an intended state plus everything computed for it
struct StateChange<A: DeviceAdapter> {
    state: DeviceTimelineState,
    device_state: A::DeviceState,
    address_states: Option<BTreeMap<Address, A::AddressState>>,
    mappings: Mappings,
    /// Computed lazily once this change is the queue head; invalidated when
    /// the state it would be diffed against changes
    commands: Option<Vec<Command<A::CommandPayload>>>,
    /// Largest preliminary offset among the computed commands
    max_preliminary: Time,
    /// Device state as actually asserted, with device-held addresses spliced
    /// in by the reconciliation pass
    effective_device_state: Option<A::DeviceState>,
    /// Addresses the reconciliation pass left under device control
    untouched_addresses: BTreeSet<Address>,
    /// A one-shot timer has been armed for this change
    scheduled: bool,
}

impl<A: DeviceAdapter> StateChange<A> {
    /// When this change should start executing: the intended time, pulled
    /// forward by the largest preliminary offset
    fn due_time(&self) -> Time {
        self.state.time.saturating_sub(self.max_preliminary)
    }
}

/// The last state known to be on the device
struct CurrentState<A: DeviceAdapter> {
    time: Time,
    device_state: A::DeviceState,
    address_states: Option<BTreeMap<Address, A::AddressState>>,
}

/// Mutual exclusion between "settled on a current state" and "a transition is
/// in flight", made explicit: the current state is moved out when execution
/// starts and a new one is installed when it completes.
enum ExecutionSlot<A: DeviceAdapter> {
    Idle(Option<CurrentState<A>>),
    Executing { time: Time },
}

struct HandlerInner<A: DeviceAdapter> {
    /// Pending changes, always sorted by non-decreasing intended time with at
    /// most one change per distinct time
    queue: Vec<StateChange<A>>,
    slot: ExecutionSlot<A>,
}

struct HandlerCore<A, C>
where
    A: DeviceAdapter,
    C: DeviceContext<A::CommandPayload>,
{
    adapter: Arc<A>,
    context: Arc<C>,
    executor: CommandExecutor<A, C>,
    tracker: StateTracker<A::AddressState>,
    inner: Mutex<HandlerInner<A>>,
}

/// Drives one device from resolved timeline states
pub struct StateHandler<A, C>
where
    A: DeviceAdapter,
    C: DeviceContext<A::CommandPayload>,
{
    core: Arc<HandlerCore<A, C>>,
    clock_task: JoinHandle<()>,
}

impl<A, C> StateHandler<A, C>
where
    A: DeviceAdapter,
    C: DeviceContext<A::CommandPayload>,
{
    pub fn new(adapter: Arc<A>, context: Arc<C>, options: StateHandlerOptions) -> Self {
        let differ_adapter = adapter.clone();
        let core = Arc::new(HandlerCore {
            executor: CommandExecutor::new(adapter.clone(), context.clone(), options.execution_mode),
            tracker: StateTracker::new(
                move |a, b| differ_adapter.diff_address_states(a, b),
                options.sync_on_first_blood,
            ),
            adapter,
            context,
            inner: Mutex::new(HandlerInner {
                queue: Vec::new(),
                slot: ExecutionSlot::Idle(None),
            }),
        });

        let clock_core = core.clone();
        let clock_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHECK_INTERVAL);
            loop {
                ticker.tick().await;
                clock_core.check_due().await;
            }
        });

        Self { core, clock_task }
    }

    /// Feed a newly resolved timeline state. States not after the current
    /// state's time are silently discarded (a normal race between producer
    /// and scheduler); a queued state at or after the same time is replaced.
    pub async fn handle_state(&self, state: DeviceTimelineState, mappings: Mappings) {
        self.core.handle_state(state, mappings).await;
    }

    /// Force the last known device state outside the normal flow (startup,
    /// external resync) and recompute the pending diff against it.
    pub async fn set_current_state(
        &self,
        device_state: A::DeviceState,
        address_states: Option<BTreeMap<Address, A::AddressState>>,
    ) {
        self.core.set_current_state(device_state, address_states).await;
    }

    /// Like [`set_current_state`](Self::set_current_state), but the states
    /// come from the device itself: per-address states are also recorded as
    /// device reports in the tracker.
    pub async fn update_state_from_device_state(
        &self,
        device_state: A::DeviceState,
        address_states: Option<BTreeMap<Address, A::AddressState>>,
    ) {
        self.core
            .update_state_from_device_state(device_state, address_states)
            .await;
    }

    /// Drop every queued transition. No commands are computed or sent for
    /// them; an in-flight transition is unaffected.
    pub async fn clear_future_states(&self) {
        self.core.inner.lock().await.queue.clear();
    }

    /// Drop queued transitions intended for after `time`
    pub async fn clear_future_after_timestamp(&self, time: Time) {
        self.core
            .inner
            .lock()
            .await
            .queue
            .retain(|c| c.state.time <= time);
    }

    /// The reconciliation tracker for this device
    pub fn tracker(&self) -> &StateTracker<A::AddressState> {
        &self.core.tracker
    }

    /// The executor's task queue, for adapters that want cancel groups for
    /// their own device I/O
    pub fn command_queue(&self) -> &CancellableQueue {
        self.core.executor.queue()
    }

    /// Intended times of everything still queued (oldest first)
    pub async fn queued_times(&self) -> Vec<Time> {
        self.core
            .inner
            .lock()
            .await
            .queue
            .iter()
            .map(|c| c.state.time)
            .collect()
    }

    /// Intended time of the current (last executed) state, if any
    pub async fn current_state_time(&self) -> Option<Time> {
        match &self.core.inner.lock().await.slot {
            ExecutionSlot::Idle(current) => current.as_ref().map(|c| c.time),
            ExecutionSlot::Executing { time } => Some(*time),
        }
    }

    /// Stop the background clock and the command queue
    pub async fn terminate(&self) {
        self.clock_task.abort();
        self.executor_terminate().await;
    }

    async fn executor_terminate(&self) {
        self.core.executor.terminate().await;
    }
}

impl<A, C> Drop for StateHandler<A, C>
where
    A: DeviceAdapter,
    C: DeviceContext<A::CommandPayload>,
{
    fn drop(&mut self) {
        self.clock_task.abort();
    }
}

impl<A, C> HandlerCore<A, C>
where
    A: DeviceAdapter,
    C: DeviceContext<A::CommandPayload>,
{
    async fn handle_state(self: &Arc<Self>, state: DeviceTimelineState, mappings: Mappings) {
        // Conversion is a pure function; do it outside the lock
        let converted = self.adapter.convert_timeline_state(&state, &mappings);

        {
            let mut inner = self.inner.lock().await;

            let current_time = match &inner.slot {
                ExecutionSlot::Idle(current) => current.as_ref().map(|c| c.time),
                // The in-flight transition is about to become current
                ExecutionSlot::Executing { time } => Some(*time),
            };
            if let Some(current_time) = current_time {
                if state.time <= current_time {
                    trace!(
                        device = %self.context.device_id(),
                        time = state.time,
                        "discarding state at or before the current state"
                    );
                    return;
                }
            }

            // Last write wins for the future, but never rewrites the past:
            // every queued change at or after this time is superseded
            inner.queue.retain(|c| c.state.time < state.time);
            debug!(
                device = %self.context.device_id(),
                time = state.time,
                objects = state.objects().len(),
                "queueing state change"
            );
            inner.queue.push(StateChange {
                state,
                device_state: converted.device_state,
                address_states: converted.address_states,
                mappings,
                commands: None,
                max_preliminary: 0,
                effective_device_state: None,
                untouched_addresses: BTreeSet::new(),
                scheduled: false,
            });

            if inner.queue.len() == 1 {
                // The head changed; whatever was cached for the old head died
                // with it. Diff the new head right away.
                self.calculate_next_state_change(&mut inner);
            }
        }

        self.check_due().await;
    }

    async fn set_current_state(
        self: &Arc<Self>,
        device_state: A::DeviceState,
        address_states: Option<BTreeMap<Address, A::AddressState>>,
    ) {
        {
            let mut inner = self.inner.lock().await;
            if let ExecutionSlot::Executing { .. } = inner.slot {
                // The in-flight completion would immediately clobber this
                warn!(
                    device = %self.context.device_id(),
                    "ignoring current-state override while a transition is executing"
                );
                return;
            }
            let time = self.context.current_time();
            debug!(device = %self.context.device_id(), time, "current state overridden externally");
            inner.slot = ExecutionSlot::Idle(Some(CurrentState {
                time,
                device_state,
                address_states,
            }));
            // The pending diff was computed against the old current state
            if let Some(head) = inner.queue.first_mut() {
                head.commands = None;
            }
            self.calculate_next_state_change(&mut inner);
        }
        self.check_due().await;
    }

    async fn update_state_from_device_state(
        self: &Arc<Self>,
        device_state: A::DeviceState,
        address_states: Option<BTreeMap<Address, A::AddressState>>,
    ) {
        if let Some(states) = &address_states {
            for (address, state) in states {
                self.tracker.update_state(address, state.clone());
            }
        }
        self.set_current_state(device_state, address_states).await;
    }

    /// Diff the queue head against the current state, including the
    /// reconciliation pass for device-held addresses. Idempotent; safe to
    /// call whenever the head or the current state changes.
    fn calculate_next_state_change(&self, inner: &mut HandlerInner<A>) {
        let HandlerInner { queue, slot } = inner;
        let current = match slot {
            ExecutionSlot::Idle(current) => current,
            // Recomputed when the in-flight transition completes
            ExecutionSlot::Executing { .. } => return,
        };
        let Some(head) = queue.first_mut() else {
            return;
        };

        let mut old_device_state = current.as_ref().map(|c| c.device_state.clone());
        let mut new_device_state = head.device_state.clone();
        head.untouched_addresses.clear();

        if self.adapter.supports_address_states() {
            for address in self.tracker.ahead_addresses() {
                let Some(device_current) = self.tracker.get_current_state(&address) else {
                    continue;
                };
                let intended = head
                    .address_states
                    .as_ref()
                    .and_then(|states| states.get(&address));
                if let Some(intended) = intended {
                    let expected = self.tracker.get_expected_state(&address);
                    if self
                        .adapter
                        .address_state_reasserts_control(expected.as_ref(), intended)
                    {
                        // The timeline genuinely changed; take the address back
                        continue;
                    }
                }
                // Leave the address under device control: make both sides of
                // the diff agree with what the device reported, so no command
                // touches it
                trace!(
                    device = %self.context.device_id(),
                    address,
                    "leaving device-held address untouched"
                );
                if let Some(old) = old_device_state.as_mut() {
                    self.adapter.apply_address_state(old, &address, &device_current);
                }
                self.adapter
                    .apply_address_state(&mut new_device_state, &address, &device_current);
                head.untouched_addresses.insert(address);
            }
        }

        let now = self.context.current_time();
        let commands = match self.adapter.diff_states(
            old_device_state.as_ref(),
            &new_device_state,
            &head.mappings,
            now,
        ) {
            Ok(commands) => commands,
            Err(error) => {
                // A single bad diff must not freeze the scheduler
                warn!(
                    device = %self.context.device_id(),
                    time = head.state.time,
                    "state diff failed, executing transition with no commands: {error:#}"
                );
                Vec::new()
            }
        };

        head.max_preliminary = commands
            .iter()
            .filter_map(|c| c.preliminary)
            .max()
            .unwrap_or(0);
        head.effective_device_state = Some(new_device_state);
        head.commands = Some(commands);
        head.scheduled = false;
    }

    /// One pass of the wall-clock check: execute the head if it is already
    /// due, or arm a one-shot timer if it comes due within the next tick.
    async fn check_due(self: &Arc<Self>) {
        let execute_now = {
            let mut inner = self.inner.lock().await;
            if let ExecutionSlot::Executing { .. } = inner.slot {
                return;
            }
            if inner.queue.first().is_some_and(|h| h.commands.is_none()) {
                self.calculate_next_state_change(&mut inner);
            }
            let now = self.context.current_time();
            match inner.queue.first_mut() {
                None => return,
                Some(head) if head.due_time() <= now => true,
                Some(head) => {
                    let due = head.due_time();
                    if due <= now + timing::CHECK_INTERVAL_MS && !head.scheduled {
                        head.scheduled = true;
                        let delay = due - now;
                        let core = self.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                            core.execute_until_idle().await;
                        });
                    }
                    false
                }
            }
        };

        if execute_now {
            self.execute_until_idle().await;
        }
    }

    /// Execute due transitions back to back until the head is no longer due
    async fn execute_until_idle(self: &Arc<Self>) {
        while self.execute_next_state_change().await {}
    }

    /// Execute the queue head if it is due. Returns whether a transition ran.
    /// Guarded by the execution slot: only one transition is ever in flight.
    async fn execute_next_state_change(self: &Arc<Self>) -> bool {
        let mut change = {
            let mut inner = self.inner.lock().await;
            if let ExecutionSlot::Executing { .. } = inner.slot {
                return false;
            }
            if inner.queue.first().is_some_and(|h| h.commands.is_none()) {
                self.calculate_next_state_change(&mut inner);
            }
            let now = self.context.current_time();
            if !inner.queue.first().is_some_and(|h| h.due_time() <= now) {
                return false;
            }
            let change = inner.queue.remove(0);
            inner.slot = ExecutionSlot::Executing {
                time: change.state.time,
            };
            change
        };

        let commands = change.commands.take().unwrap_or_default();
        let mut measurement = Measurement::new(change.state.time);
        measurement.expected_execute_time = change.due_time();
        measurement.execute_begin = Some(self.context.current_time());

        debug!(
            device = %self.context.device_id(),
            time = change.state.time,
            commands = commands.len(),
            "executing state change"
        );

        // Preliminary commands form earlier sub-batches; relative order is
        // preserved within each sub-batch.
        let mut batches: BTreeMap<Time, Vec<Command<A::CommandPayload>>> = BTreeMap::new();
        for command in commands {
            batches
                .entry(command.send_time(change.state.time))
                .or_default()
                .push(command);
        }
        for (send_time, batch) in batches {
            loop {
                let now = self.context.current_time();
                if now >= send_time {
                    break;
                }
                let wait = (send_time - now).min(timing::CHECK_INTERVAL_MS);
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }
            self.executor.execute_commands(batch, &mut measurement).await;
        }

        measurement.execute_end = Some(self.context.current_time());
        self.context.report_measurement(&measurement);

        // The intended address states are now what we expect the device to
        // hold; addresses the timeline no longer mentions stop being expected.
        // This must run before the next head is diffed: a reassert clears the
        // device-ahead flag here, and the next head's reconciliation pass has
        // to see the cleared flag or it would splice the operator's stale
        // value back in.
        if self.adapter.supports_address_states() {
            if let Some(address_states) = &change.address_states {
                for (address, state) in address_states {
                    let did_assert = !change.untouched_addresses.contains(address);
                    self.tracker
                        .update_expected_state(address, state.clone(), did_assert);
                }
                for address in self.tracker.get_all_addresses() {
                    if !address_states.contains_key(&address) {
                        self.tracker.unset_expected_state(&address);
                    }
                }
            }
        }

        // Promote to current; the next head must be re-diffed against it
        {
            let mut inner = self.inner.lock().await;
            let device_state = change
                .effective_device_state
                .take()
                .unwrap_or(change.device_state);
            inner.slot = ExecutionSlot::Idle(Some(CurrentState {
                time: change.state.time,
                device_state,
                address_states: change.address_states.clone(),
            }));
            self.calculate_next_state_change(&mut inner);
        }

        true
    }
}
