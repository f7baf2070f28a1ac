//! The slice loop and task lifecycle.

use crate::consts::*;
use crate::error::RuntimeError;
use crate::flash::FlashStorage;
use crate::hardware::HardwareAccess;
use crate::interpreter::{Frame, Interpreter, Task};
use crate::state::{ExecuteState, TaskState};
use crate::value::Variable;

use microclr_asm::{MethodFlags, SystemException, Token};

use tracing::{debug, warn};

impl<F: FlashStorage, H: HardwareAccess> Interpreter<F, H> {
    /// Seed the root frame for `method_token` and mark the engine busy.
    /// The host supplies one slot per declared argument.
    pub fn start_task(&mut self, method_token: Token, args: Vec<Variable>) -> Result<(), RuntimeError> {
        let method = self.resolve_method(method_token)?;
        if method.flags.contains(MethodFlags::SPECIAL) {
            // Built-ins are callees, not task roots.
            return Err(RuntimeError::exception(SystemException::InvalidOperation, method_token));
        }

        let mut frame = Frame::new(method.clone());
        for (i, value) in args.into_iter().enumerate() {
            if i >= frame.arguments.len() {
                return Err(RuntimeError::exception(SystemException::InvalidOperation, method_token));
            }
            frame.arguments[i].assign(value)?;
        }

        debug!(token = method_token, "task started");
        self.task = Some(Task {
            code_reference: method.code_reference,
            frames: vec![frame],
            unwind: None,
            current_exception: None,
        });
        Ok(())
    }

    /// Execute up to one slice worth of instructions, then yield back to
    /// the host loop. State between slices lives in the frame chain, so
    /// slicing is semantically invisible.
    pub fn run_slice(&mut self) -> Option<TaskState> {
        self.task.as_ref()?;

        for _ in 0..INSTRUCTIONS_PER_SLICE {
            match self.execute() {
                Ok(ExecuteState::Proceed) => {}
                Ok(ExecuteState::TaskComplete(value)) => {
                    self.finish_task();
                    return Some(TaskState::Stopped(value));
                }
                Err(RuntimeError::Recoverable(exception)) => {
                    match self.dispatch_exception(exception) {
                        Ok(None) => {}
                        Ok(Some(error)) => {
                            warn!(%error, "task aborted");
                            self.finish_task();
                            return Some(TaskState::Aborted(error));
                        }
                        Err(fault) => {
                            warn!(%fault, "task aborted by engine fault");
                            self.finish_task();
                            return Some(TaskState::Aborted(fault.into()));
                        }
                    }
                }
                Err(RuntimeError::Halt(fault)) => {
                    warn!(%fault, "task aborted by engine fault");
                    self.finish_task();
                    return Some(TaskState::Aborted(fault.into()));
                }
            }
        }
        Some(TaskState::Running)
    }

    /// Run the current task to completion.
    pub fn run(&mut self) -> Option<TaskState> {
        loop {
            match self.run_slice()? {
                TaskState::Running => {}
                done => return Some(done),
            }
        }
    }

    /// Hard abort: tear every frame down innermost first. No finally
    /// clauses run.
    pub fn kill_task(&mut self) -> Option<u32> {
        let mut task = self.task.take()?;
        while task.frames.pop().is_some() {}
        debug!(code_reference = task.code_reference, "task killed");
        Some(task.code_reference)
    }

    fn finish_task(&mut self) {
        self.task = None;
    }

    /// Cold-start bootstrap: RAM self-test, flash image mount, and an
    /// auto-start task when the image requests one.
    pub fn boot(&mut self) -> Result<(), RuntimeError> {
        self.gc.self_test()?;
        self.mount_flash_image()?;

        if self.startup_flags.contains(microclr_asm::StartupFlags::AUTO_START)
            && self.startup_token != 0
        {
            let token = self.startup_token;
            debug!(token, "auto-starting flash task");
            self.start_task(token, Vec::new())?;
        }
        Ok(())
    }
}
