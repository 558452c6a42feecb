//! Execution timing records for observability
//!
//! Every executed state transition produces one [`Measurement`] describing
//! when it was supposed to run, when it actually ran, and how long each
//! command send took. The engine reports it through the host context; what
//! the host does with it (metrics, logs) is its own business.

use crate::Time;

/// Timing record for a single command dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct CommandMeasurement {
    pub context: String,
    pub timeline_obj_id: String,
    pub send_begin: Time,
    pub send_end: Time,
    /// Whether the adapter's send completed without error
    pub ok: bool,
}

impl CommandMeasurement {
    pub fn duration(&self) -> Time {
        self.send_end.saturating_sub(self.send_begin)
    }
}

/// Timing record for one executed state transition
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Nominal time of the intended state
    pub state_time: Time,
    /// When the transition was due to start (state time minus the largest
    /// preliminary offset of its commands)
    pub expected_execute_time: Time,
    pub execute_begin: Option<Time>,
    pub execute_end: Option<Time>,
    pub commands: Vec<CommandMeasurement>,
}

impl Measurement {
    pub fn new(state_time: Time) -> Self {
        Self {
            state_time,
            expected_execute_time: state_time,
            execute_begin: None,
            execute_end: None,
            commands: Vec::new(),
        }
    }

    /// How late execution started relative to the expected moment
    pub fn start_delay(&self) -> Option<Time> {
        self.execute_begin
            .map(|begin| begin.saturating_sub(self.expected_execute_time))
    }

    pub fn failed_commands(&self) -> usize {
        self.commands.iter().filter(|c| !c.ok).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_delay() {
        let mut m = Measurement::new(12000);
        m.expected_execute_time = 11700;
        m.execute_begin = Some(11750);
        assert_eq!(m.start_delay(), Some(50));
    }

    #[test]
    fn test_failed_command_count() {
        let mut m = Measurement::new(1000);
        m.commands.push(CommandMeasurement {
            context: "a".into(),
            timeline_obj_id: "o1".into(),
            send_begin: 1000,
            send_end: 1005,
            ok: true,
        });
        m.commands.push(CommandMeasurement {
            context: "b".into(),
            timeline_obj_id: "o2".into(),
            send_begin: 1000,
            send_end: 1001,
            ok: false,
        });
        assert_eq!(m.failed_commands(), 1);
        assert_eq!(m.commands[0].duration(), 5);
    }
}
