//! Runtime state representation for the engine

use microclr_asm::wire::{execution_result_frame, Encoder};
use microclr_asm::ExecState;

use crate::error::EngineError;
use crate::value::Variable;

/// Resulting state of a single instruction execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteState {
    /// The interpreter should proceed normally.
    Proceed,
    /// The root frame returned; the task is complete.
    TaskComplete(Variable),
}

impl ExecuteState {
    /// Return true if the slice should keep executing instructions.
    pub const fn should_continue(&self) -> bool {
        matches!(self, Self::Proceed)
    }
}

impl Default for ExecuteState {
    fn default() -> Self {
        Self::Proceed
    }
}

/// Resulting state of a task after a slice.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    /// The instruction budget ran out; call again to continue.
    Running,
    /// The task completed; the root method's result slot.
    Stopped(Variable),
    /// The task was torn down by an engine fault or unhandled exception.
    Aborted(EngineError),
    /// The task was killed by the host. No finally handlers ran.
    Killed,
}

impl TaskState {
    /// Return true while the task needs further slices.
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// The wire representation of this state.
    pub const fn exec_state(&self) -> ExecState {
        match self {
            Self::Running => ExecState::Running,
            Self::Stopped(_) => ExecState::Stopped,
            Self::Aborted(_) => ExecState::Aborted,
            Self::Killed => ExecState::Killed,
        }
    }
}

/// The report sent to the host when a task leaves the running state.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// The root method's code reference.
    pub code_reference: u32,
    /// Final state.
    pub state: TaskState,
}

impl ExecutionResult {
    /// Encode the execution-result frame: code reference, state, then the
    /// result slot as `(kind, size, payload)`. Aborted tasks carry the
    /// exception kind and faulting token instead of a result.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut payload = Encoder::new();
        match &self.state {
            TaskState::Stopped(value) => {
                payload.write_u8(value.kind() as u8);
                let bytes = value.payload_bytes();
                payload.write_u16(bytes.len() as u16);
                payload.write_bytes(&bytes);
            }
            TaskState::Aborted(error) => {
                payload.write_u8(error.exception_kind().map(|k| k as u8).unwrap_or(0));
                payload.write_u16(4);
                payload.write_u32(error.token().unwrap_or(0));
            }
            TaskState::Running | TaskState::Killed => {}
        }
        execution_result_frame(self.code_reference as u8, self.state.exec_state(), &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microclr_asm::wire::{END_SYSEX, SCHEDULER_DATA, START_SYSEX};

    #[test]
    fn stopped_result_carries_the_slot() {
        let result = ExecutionResult {
            code_reference: 3,
            state: TaskState::Stopped(Variable::from(33i32)),
        };
        let frame = result.to_frame();
        assert_eq!(frame[0], START_SYSEX);
        assert_eq!(frame[1], SCHEDULER_DATA);
        assert_eq!(frame[2], 3);
        assert_eq!(frame[3], ExecState::Stopped as u8);
        assert_eq!(frame[4], 1);
        assert_eq!(frame[frame.len() - 1], END_SYSEX);
    }

    #[test]
    fn killed_result_has_no_payload() {
        let result = ExecutionResult {
            code_reference: 1,
            state: TaskState::Killed,
        };
        let frame = result.to_frame();
        assert_eq!(frame[3], ExecState::Killed as u8);
        assert_eq!(frame[4], 0);
        assert_eq!(frame.len(), 6);
    }
}
