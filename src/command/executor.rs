//! Command executor - dispatches diffed commands to the device adapter
//!
//! The executor owns how a batch of commands reaches the device: all at once
//! ("salvo") or one at a time, each awaited ("sequential"). Failures are
//! isolated per command and reported through the host context; the executor
//! never retries - retry policy, if any, belongs to the adapter.

use futures::future::join_all;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use cuedriver_shared::{Command, CommandMeasurement, Measurement};

use super::queue::CancellableQueue;
use crate::device::{DeviceAdapter, DeviceContext};

/// How a batch of commands is dispatched to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// All commands are dispatched concurrently
    #[default]
    Salvo,
    /// Commands are dispatched one at a time, each awaited before the next
    Sequential,
}

/// Dispatches command batches for one device
pub struct CommandExecutor<A, C>
where
    A: DeviceAdapter,
    C: DeviceContext<A::CommandPayload>,
{
    adapter: Arc<A>,
    context: Arc<C>,
    mode: ExecutionMode,
    queue: CancellableQueue,
}

impl<A, C> CommandExecutor<A, C>
where
    A: DeviceAdapter,
    C: DeviceContext<A::CommandPayload>,
{
    pub fn new(adapter: Arc<A>, context: Arc<C>, mode: ExecutionMode) -> Self {
        Self {
            adapter,
            context,
            mode,
            queue: CancellableQueue::new(),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// The executor's task queue. Sequential batches drain through it;
    /// adapters may also use it directly with cancel groups for their own
    /// idempotent device I/O.
    pub fn queue(&self) -> &CancellableQueue {
        &self.queue
    }

    /// Dispatch one batch of commands, folding per-command timings into the
    /// batch measurement. A failed command never blocks or cancels its
    /// siblings.
    pub async fn execute_commands(
        &self,
        commands: Vec<Command<A::CommandPayload>>,
        measurement: &mut Measurement,
    ) {
        if commands.is_empty() {
            return;
        }
        debug!(
            device = %self.context.device_id(),
            count = commands.len(),
            mode = ?self.mode,
            "dispatching commands"
        );

        match self.mode {
            ExecutionMode::Salvo => {
                let sends = commands
                    .iter()
                    .map(|command| send_timed(&*self.adapter, &*self.context, command));
                measurement.commands.extend(join_all(sends).await);
            }
            ExecutionMode::Sequential => {
                // Routing through the queue serializes commands within this
                // batch and behind any batch still draining.
                let recorded: Arc<Mutex<Vec<CommandMeasurement>>> =
                    Arc::new(Mutex::new(Vec::new()));
                for command in commands {
                    let adapter = self.adapter.clone();
                    let context = self.context.clone();
                    let recorded = recorded.clone();
                    let handle = self
                        .queue
                        .add(None, async move {
                            let timing = send_timed(&*adapter, &*context, &command).await;
                            recorded.lock().unwrap().push(timing);
                            Ok(())
                        })
                        .await;
                    if let Err(error) = handle.wait().await {
                        warn!(
                            device = %self.context.device_id(),
                            "command task did not run: {error:#}"
                        );
                    }
                }
                measurement.commands.append(&mut recorded.lock().unwrap());
            }
        }
    }

    pub async fn terminate(&self) {
        self.queue.terminate().await;
    }
}

/// Send one command, timing it against the context clock. Errors are reported
/// through the context and recorded on the measurement; they do not propagate.
async fn send_timed<A, C>(
    adapter: &A,
    context: &C,
    command: &Command<A::CommandPayload>,
) -> CommandMeasurement
where
    A: DeviceAdapter,
    C: DeviceContext<A::CommandPayload>,
{
    let send_begin = context.current_time();
    let result = adapter.send_command(command).await;
    let send_end = context.current_time();

    let ok = result.is_ok();
    if let Err(error) = result {
        debug!(
            device = %context.device_id(),
            command = %command.context,
            timeline_obj = %command.timeline_obj_id,
            "command failed: {error:#}"
        );
        context.command_error(error, command);
    }

    CommandMeasurement {
        context: command.context.clone(),
        timeline_obj_id: command.timeline_obj_id.clone(),
        send_begin,
        send_end,
        ok,
    }
}
