//! Call dispatch, returns and protected-region control transfers.

use super::{Continuation, Frame, Interpreter, Unwind};
use crate::consts::*;
use crate::error::{EngineFault, RuntimeError};
use crate::hardware::HardwareAccess;
use crate::method::MethodBody;
use crate::state::ExecuteState;
use crate::value::{Value, Variable};

use microclr_asm::{ClauseKind, MethodFlags, SystemException, Token};

use std::sync::Arc;
use tracing::trace;

impl<F, H: HardwareAccess> Interpreter<F, H> {
    /// `call`: resolve the site token through the current method's remap
    /// table and invoke directly.
    pub(crate) fn op_call(&mut self, site_token: Token) -> Result<(), RuntimeError> {
        let token = self.cur_frame()?.method.resolve_call_token(site_token);
        let method = self.resolve_method(token)?;
        self.invoke(method)
    }

    /// `calli`: the callee is a function pointer on the stack.
    pub(crate) fn op_calli(&mut self) -> Result<(), RuntimeError> {
        let target = self.pop()?;
        let token = match target.value {
            Value::FunctionPointer(t) | Value::Method(t) => t,
            _ => {
                return Err(RuntimeError::exception(
                    SystemException::InvalidOperation,
                    self.cur_frame()?.method.token,
                ))
            }
        };
        let method = self.resolve_method(token)?;
        self.invoke(method)
    }

    /// `callvirt`: read the receiver under the arguments, load its class
    /// and walk the parent chain for an override whose declaration tokens
    /// include the call-site token.
    pub(crate) fn op_callvirt(
        &mut self,
        site_token: Token,
        constrained: Option<Token>,
    ) -> Result<(), RuntimeError> {
        let token = self.cur_frame()?.method.resolve_call_token(site_token);
        let declared = self.resolve_method(token)?;
        let arg_slot = declared.num_args.max(1) as usize - 1;

        if let Some(constraint_token) = constrained {
            self.apply_constrained(constraint_token, arg_slot)?;
        }

        let receiver = self.cur_frame()?.stack.nth(arg_slot)?.clone();
        if matches!(receiver.value, Value::Address(_)) {
            // A value-type receiver without a resolving `constrained.`
            // prefix dispatches to the declared method directly.
            return self.invoke(declared);
        }
        let receiver_class = match self.class_token_of(&receiver)? {
            Some(class_token) => class_token,
            None => {
                if receiver.kind().is_reference() {
                    return Err(RuntimeError::exception(SystemException::NullReference, token));
                }
                // Primitive receivers carry no class header; the declared
                // implementation is the only candidate.
                return self.invoke(declared);
            }
        };

        let resolved = self
            .find_override(receiver_class, token, site_token)
            .unwrap_or(declared);
        if resolved.flags.contains(MethodFlags::ABSTRACT) {
            return Err(RuntimeError::exception(SystemException::MissingMethod, token));
        }
        self.invoke(resolved)
    }

    /// `constrained.` prefix: a value-type receiver is boxed in place
    /// before dispatch; reference receivers are dereferenced.
    fn apply_constrained(&mut self, constraint_token: Token, arg_slot: usize) -> Result<(), RuntimeError> {
        let receiver = self.cur_frame()?.stack.nth(arg_slot)?.clone();
        let Value::Address(address) = receiver.value else {
            // Already an object reference; the prefix is transparent.
            return Ok(());
        };
        let pointee = self.read_address(address)?;
        let class = self.resolve_class(constraint_token)?;
        let replacement = if class.is_value_type {
            let boxed = self.box_value(constraint_token, &pointee)?;
            Variable::new(Value::Object(Some(boxed)))
        } else {
            pointee
        };
        *self.cur_frame_mut()?.stack.nth_mut(arg_slot)? = replacement;
        Ok(())
    }

    /// Walk `class -> parent -> ...` searching each method table for an
    /// implementation declared under the call-site token.
    pub(crate) fn find_override(
        &self,
        receiver_class: Token,
        token: Token,
        site_token: Token,
    ) -> Option<Arc<MethodBody>> {
        let mut current = receiver_class;
        let mut hops = 0;
        while current != 0 && hops < 64 {
            let class = self.classes.get_by_key(current)?;
            for method_ref in &class.methods {
                if method_ref.matches(token) || method_ref.matches(site_token) {
                    return self.methods.get_by_key(method_ref.token).cloned();
                }
            }
            current = class.parent_token;
            hops += 1;
        }
        None
    }

    /// Push a frame for an IL method, or dispatch a built-in through the
    /// hardware hook. Arguments pop in reverse so argument 0 is leftmost.
    pub(crate) fn invoke(&mut self, method: Arc<MethodBody>) -> Result<(), RuntimeError> {
        if method.flags.contains(MethodFlags::ABSTRACT) {
            return Err(RuntimeError::exception(SystemException::MissingMethod, method.token));
        }
        if method.flags.contains(MethodFlags::SPECIAL) {
            return self.invoke_native(&method);
        }

        if self.task_ref()?.frames.len() >= MAX_CALL_DEPTH {
            return Err(RuntimeError::exception(SystemException::StackOverflow, method.token));
        }

        trace!(token = method.token, "call");
        let mut frame = Frame::new(method.clone());
        for i in (0..method.num_args as usize).rev() {
            let value = self.pop()?;
            frame.arguments[i].assign(value)?;
        }
        self.task_mut()?.frames.push(frame);
        Ok(())
    }

    fn invoke_native(&mut self, method: &Arc<MethodBody>) -> Result<(), RuntimeError> {
        let native = method
            .native()
            .ok_or(EngineFault::MemoryCorruption("special method without native tag"))?;
        let argc = method.num_args as usize;
        let mut args = vec![Variable::empty(); argc];
        for i in (0..argc).rev() {
            args[i] = self.pop()?;
        }
        let mut result = Variable::empty();
        trace!(?native, "native call");
        let handled = self
            .hardware
            .execute_hardware_access(native, &mut args, &mut result);
        if !handled {
            return Err(RuntimeError::exception(SystemException::MissingMethod, method.token));
        }
        if !method.is_void() {
            self.push(result)?;
        }
        Ok(())
    }

    /// `ret`: pop the frame; push the return slot to the caller, or end
    /// the task when the root frame returns.
    pub(crate) fn op_ret(&mut self) -> Result<ExecuteState, RuntimeError> {
        let task = self.task_mut()?;
        let mut frame = task
            .frames
            .pop()
            .ok_or(EngineFault::MemoryCorruption("return without a frame"))?;
        frame.check_guard()?;

        let result = if frame.stack.is_empty() {
            Variable::empty()
        } else {
            frame.stack.pop()?
        };
        let is_void = frame.method.is_void();

        if task.frames.is_empty() {
            let value = if is_void { Variable::empty() } else { result };
            return Ok(ExecuteState::TaskComplete(value));
        }
        if !is_void {
            self.push(result)?;
        }
        Ok(ExecuteState::Proceed)
    }

    /// `leave`: clear the operand stack and run every finally whose try
    /// range is being exited, innermost first, before transferring to the
    /// target.
    pub(crate) fn op_leave(&mut self, target: u16) -> Result<(), RuntimeError> {
        let frame_index = self.task_ref()?.frames.len() - 1;
        let (method_token, instr_start) = {
            let frame = self.cur_frame()?;
            (frame.method.token, frame.instr_start)
        };

        let mut pending: Vec<_> = self
            .clauses_for(method_token)
            .into_iter()
            .filter(|c| {
                c.kind == ClauseKind::Finally && c.covers(instr_start) && !c.covers(target)
            })
            .map(|c| (frame_index, c))
            .collect();
        // The clause list is outermost-first for nested ranges; exits run
        // innermost-first.
        pending.reverse();

        self.cur_frame_mut()?.stack.clear();
        if pending.is_empty() {
            self.cur_frame_mut()?.pc = target;
            return Ok(());
        }

        self.task_mut()?.unwind = Some(Unwind {
            pending,
            continuation: Continuation::Branch {
                frame: frame_index,
                target,
            },
        });
        self.advance_unwind()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::util::test_helpers::TestRig;
    use microclr_asm::OpCode;

    #[test]
    fn arguments_pop_in_reverse_order() {
        let mut rig = TestRig::new();
        // callee(a, b) returns a - b; call with (10, 4) must yield 6.
        let callee = rig.method_builder(2, 2).il(|il| {
            il.op(OpCode::LDARG_0);
            il.op(OpCode::LDARG_1);
            il.op(OpCode::SUB);
            il.op(OpCode::RET);
        });
        let caller = rig.method_builder(0, 2).il(|il| {
            il.ldc_i4(10);
            il.ldc_i4(4);
            il.call(callee);
            il.op(OpCode::RET);
        });
        assert_eq!(rig.run_i32(caller, &[]), 6);
    }
}
