//! The exception machine: throw and rethrow, the two-pass unwind through
//! typed catch, filter, finally and fault clauses, and the continuation
//! state that carries an unwind across interpreter slices.

use super::Interpreter;
use crate::error::{ClrException, EngineError, EngineFault, RuntimeError};
use crate::gc::ObjRef;
use crate::hardware::HardwareAccess;
use crate::method::ExceptionClause;
use crate::stack::VariableStack;
use crate::value::{Value, Variable};

use microclr_asm::{ClauseKind, OpCode, SystemException, Token};

use tracing::{debug, trace};

/// Where control goes once the pending finally chain is drained.
#[derive(Debug, Clone)]
pub(crate) enum Continuation {
    /// A `leave` transfer inside one frame.
    Branch {
        /// Frame index the transfer happens in.
        frame: usize,
        /// Target pc.
        target: u16,
    },
    /// Enter a matched handler with the exception object pushed.
    Handler {
        /// Frame index of the handler.
        frame: usize,
        /// The matched clause.
        clause: ExceptionClause,
        /// The exception being delivered.
        exception: ClrException,
    },
}

/// In-flight unwind state: the finally/fault clauses still to run
/// (next-first) and the continuation applied once they are done.
#[derive(Debug, Clone)]
pub(crate) struct Unwind {
    pub(crate) pending: Vec<(usize, ExceptionClause)>,
    pub(crate) continuation: Continuation,
}

impl Unwind {
    /// The exception object this unwind delivers, for GC rooting.
    pub(crate) fn exception_object(&self) -> Option<ObjRef> {
        match &self.continuation {
            Continuation::Handler { exception, .. } => exception.object,
            Continuation::Branch { .. } => None,
        }
    }
}

impl<F, H: HardwareAccess> Interpreter<F, H> {
    /// `throw`: the exception object is on the stack.
    pub(crate) fn op_throw(&mut self) -> Result<(), RuntimeError> {
        let token = self.cur_frame()?.method.token;
        let thrown = self.pop()?;
        match thrown.heap_ref() {
            None => Err(RuntimeError::exception(SystemException::NullReference, token)),
            Some(obj) => Err(ClrException::custom(self.gc.class_token(obj)?, obj).into()),
        }
    }

    /// `rethrow`: valid only inside a handler; re-raises the exception
    /// being handled.
    pub(crate) fn op_rethrow(&mut self) -> Result<(), RuntimeError> {
        let token = self.cur_frame()?.method.token;
        match &self.task_ref()?.current_exception {
            Some(exception) => Err(exception.clone().into()),
            None => Err(RuntimeError::exception(SystemException::InvalidOperation, token)),
        }
    }

    /// First pass of the unwind: walk the frames from innermost outward
    /// looking for the innermost active clause that matches; second pass:
    /// queue every finally/fault between the throw point and the handler,
    /// innermost first, and transfer.
    ///
    /// Returns `Some(error)` when no handler exists; the caller aborts the
    /// task.
    pub(crate) fn dispatch_exception(
        &mut self,
        exception: ClrException,
    ) -> Result<Option<EngineError>, EngineFault> {
        let exception = self.materialize_exception(exception)?;
        let class_token = match exception.object {
            Some(obj) => self.gc.class_token(obj)?,
            None => self
                .special_tokens
                .exception_token(exception.kind)
                .unwrap_or(0),
        };
        debug!(kind = %exception.kind, token = exception.token, "dispatching exception");

        let frame_count = self.task_ref()?.frames.len();
        let mut handler = None;
        'frames: for frame_index in (0..frame_count).rev() {
            let (method_token, pc) = {
                let frame = &self.task_ref()?.frames[frame_index];
                (frame.method.token, frame.instr_start)
            };
            // Innermost active clause first: tightest covering try range
            // wins.
            let mut candidates: Vec<ExceptionClause> = self
                .clauses_for(method_token)
                .into_iter()
                .filter(|c| c.covers(pc))
                .collect();
            candidates.sort_by_key(|c| c.try_length);

            for clause in candidates {
                let matched = match clause.kind {
                    ClauseKind::Clause => self.is_assignable(clause.filter_token, class_token),
                    ClauseKind::Filter => {
                        self.evaluate_filter(frame_index, &clause, &exception)?
                    }
                    ClauseKind::Finally | ClauseKind::Fault => false,
                };
                if matched {
                    handler = Some((frame_index, clause));
                    break 'frames;
                }
            }
        }

        let Some((handler_frame, handler_clause)) = handler else {
            // Unhandled: the task aborts without running finallys.
            return Ok(Some(EngineError::UnhandledException(exception)));
        };

        // Pass two: finally and fault clauses of every unwound frame, plus
        // those of the handler frame nested inside the matched try range.
        let mut pending = Vec::new();
        for frame_index in ((handler_frame + 1)..frame_count).rev() {
            let (method_token, pc) = {
                let frame = &self.task_ref()?.frames[frame_index];
                (frame.method.token, frame.instr_start)
            };
            let mut frame_clauses: Vec<_> = self
                .clauses_for(method_token)
                .into_iter()
                .filter(|c| {
                    matches!(c.kind, ClauseKind::Finally | ClauseKind::Fault) && c.covers(pc)
                })
                .map(|c| (frame_index, c))
                .collect();
            frame_clauses.reverse();
            pending.extend(frame_clauses);
        }
        {
            let pc = self.task_ref()?.frames[handler_frame].instr_start;
            let mut own: Vec<_> = self
                .clauses_for(handler_clause.method_token)
                .into_iter()
                .filter(|c| {
                    matches!(c.kind, ClauseKind::Finally | ClauseKind::Fault)
                        && c.covers(pc)
                        && c.nested_within(&handler_clause)
                })
                .map(|c| (handler_frame, c))
                .collect();
            own.reverse();
            pending.extend(own);
        }
        // Deeper frames must unwind before the handler frame's own
        // finallys; the vector is consumed front first. The sort is
        // stable, so the innermost-first order within a frame holds.
        pending.sort_by(|a, b| b.0.cmp(&a.0));

        self.task_mut()?.unwind = Some(Unwind {
            pending,
            continuation: Continuation::Handler {
                frame: handler_frame,
                clause: handler_clause,
                exception,
            },
        });
        self.advance_unwind()?;
        Ok(None)
    }

    /// Materialise the managed exception object for engine-raised
    /// exceptions whose class is registered. Allocation failures leave the
    /// exception objectless rather than cascading.
    fn materialize_exception(&mut self, mut exception: ClrException) -> Result<ClrException, EngineFault> {
        if exception.object.is_none() {
            if let Some(class_token) = self.special_tokens.exception_token(exception.kind) {
                if self.classes.get_by_key(class_token).is_some() {
                    if let Ok(obj) = self.new_instance(class_token) {
                        exception.object = Some(obj);
                    }
                }
            }
        }
        Ok(exception)
    }

    /// Step the unwind machine: enter the next pending finally, or apply
    /// the continuation when the chain is drained. `endfinally` re-enters
    /// here.
    pub(crate) fn advance_unwind(&mut self) -> Result<(), EngineFault> {
        let task = self.task_mut()?;
        let Some(mut unwind) = task.unwind.take() else {
            return Err(EngineFault::MemoryCorruption("endfinally outside an unwind"));
        };

        if !unwind.pending.is_empty() {
            let (frame_index, clause) = unwind.pending.remove(0);
            trace!(frame = frame_index, offset = clause.handler_offset, "running finally");
            task.frames.truncate(frame_index + 1);
            let frame = &mut task.frames[frame_index];
            // Finally handlers run with an empty operand stack.
            frame.stack = VariableStack::with_capacity(frame.method.max_stack as usize);
            frame.pc = clause.handler_offset;
            task.unwind = Some(unwind);
            return Ok(());
        }

        match unwind.continuation {
            Continuation::Branch { frame, target } => {
                task.frames.truncate(frame + 1);
                let frame = &mut task.frames[frame];
                frame.stack.clear();
                frame.pc = target;
            }
            Continuation::Handler { frame, clause, exception } => {
                task.frames.truncate(frame + 1);
                let entry = &mut task.frames[frame];
                entry.stack = VariableStack::with_capacity(entry.method.max_stack as usize);
                entry.stack.push(Variable::new(Value::Object(exception.object)));
                entry.pc = clause.handler_offset;
                task.current_exception = Some(exception);
            }
        }
        Ok(())
    }

    /// `endfinally` / `endfault`.
    pub(crate) fn op_endfinally(&mut self) -> Result<(), RuntimeError> {
        self.advance_unwind()?;
        Ok(())
    }

    /// Run a filter region synchronously. Filters are restricted to
    /// stack-local computation (loads, constants, comparisons, branches,
    /// type tests); anything else makes the filter not match, as an
    /// exception inside a filter would.
    fn evaluate_filter(
        &mut self,
        frame_index: usize,
        clause: &ExceptionClause,
        exception: &ClrException,
    ) -> Result<bool, EngineFault> {
        let (method, locals, arguments) = {
            let frame = &self.task_ref()?.frames[frame_index];
            (frame.method.clone(), frame.locals.clone(), frame.arguments.clone())
        };
        let Some(il) = method.il() else { return Ok(false) };
        let exception_class = match exception.object {
            Some(obj) => self.gc.class_token(obj)?,
            None => self
                .special_tokens
                .exception_token(exception.kind)
                .unwrap_or(0),
        };

        let mut stack: Vec<Variable> = vec![Variable::new(Value::Object(exception.object))];
        let mut pc = clause.filter_token as usize;
        let mut budget = 10_000usize;

        while budget > 0 {
            budget -= 1;
            let Ok((op, oplen)) = OpCode::decode(&il[pc.min(il.len())..]) else {
                return Ok(false);
            };
            let operand_start = pc + oplen;
            let operand_len = match op.operand().len() {
                Some(n) => n,
                None => return Ok(false),
            };
            let operand = il.get(operand_start..operand_start + operand_len).unwrap_or(&[]);
            if operand.len() != operand_len {
                return Ok(false);
            }
            pc = operand_start + operand_len;

            match op {
                OpCode::NOP => {}
                OpCode::ENDFILTER => {
                    let verdict = pop_slot(&mut stack);
                    return Ok(verdict.is_true());
                }
                OpCode::POP => {
                    let _ = pop_slot(&mut stack);
                }
                OpCode::DUP => {
                    let top = stack.last().cloned().unwrap_or_else(Variable::empty);
                    stack.push(top);
                }
                OpCode::LDNULL => stack.push(Variable::null()),
                OpCode::LDC_I4_M1 => stack.push(Variable::from(-1i32)),
                OpCode::LDC_I4_0
                | OpCode::LDC_I4_1
                | OpCode::LDC_I4_2
                | OpCode::LDC_I4_3
                | OpCode::LDC_I4_4
                | OpCode::LDC_I4_5
                | OpCode::LDC_I4_6
                | OpCode::LDC_I4_7
                | OpCode::LDC_I4_8 => {
                    stack.push(Variable::from(op as u16 as i32 - OpCode::LDC_I4_0 as u16 as i32))
                }
                OpCode::LDC_I4_S => stack.push(Variable::from(operand[0] as i8 as i32)),
                OpCode::LDC_I4 => stack.push(Variable::from(i32::from_le_bytes([
                    operand[0], operand[1], operand[2], operand[3],
                ]))),
                OpCode::LDLOC_0 | OpCode::LDLOC_1 | OpCode::LDLOC_2 | OpCode::LDLOC_3 => {
                    let idx = (op as u16 - OpCode::LDLOC_0 as u16) as usize;
                    stack.push(locals.get(idx).cloned().unwrap_or_else(Variable::empty));
                }
                OpCode::LDLOC_S => {
                    stack.push(locals.get(operand[0] as usize).cloned().unwrap_or_else(Variable::empty))
                }
                OpCode::LDARG_0 | OpCode::LDARG_1 | OpCode::LDARG_2 | OpCode::LDARG_3 => {
                    let idx = (op as u16 - OpCode::LDARG_0 as u16) as usize;
                    stack.push(arguments.get(idx).cloned().unwrap_or_else(Variable::empty));
                }
                OpCode::ISINST => {
                    let token = Token::from_le_bytes([operand[0], operand[1], operand[2], operand[3]]);
                    let value = pop_slot(&mut stack);
                    let matches = value.heap_ref().is_some()
                        && self.is_assignable(token, exception_class);
                    if matches {
                        stack.push(value);
                    } else {
                        stack.push(Variable::null());
                    }
                }
                OpCode::CEQ => {
                    let b = pop_slot(&mut stack);
                    let a = pop_slot(&mut stack);
                    let eq = match (a.as_i64(), b.as_i64()) {
                        (Some(x), Some(y)) => x == y,
                        _ => a.heap_ref() == b.heap_ref(),
                    };
                    stack.push(Variable::from(eq as i32));
                }
                OpCode::CGT | OpCode::CGT_UN => {
                    let b = pop_slot(&mut stack);
                    let a = pop_slot(&mut stack);
                    let gt = match (a.as_i64(), b.as_i64()) {
                        (Some(x), Some(y)) => x > y,
                        _ => a.heap_ref().is_some() && b.heap_ref().is_none(),
                    };
                    stack.push(Variable::from(gt as i32));
                }
                OpCode::CLT | OpCode::CLT_UN => {
                    let b = pop_slot(&mut stack);
                    let a = pop_slot(&mut stack);
                    let lt = matches!((a.as_i64(), b.as_i64()), (Some(x), Some(y)) if x < y);
                    stack.push(Variable::from(lt as i32));
                }
                OpCode::BR | OpCode::BR_S => {
                    pc = branch_target(pc, op, operand);
                }
                OpCode::BRTRUE | OpCode::BRTRUE_S => {
                    if pop_slot(&mut stack).is_true() {
                        pc = branch_target(pc, op, operand);
                    }
                }
                OpCode::BRFALSE | OpCode::BRFALSE_S => {
                    if !pop_slot(&mut stack).is_true() {
                        pc = branch_target(pc, op, operand);
                    }
                }
                _ => return Ok(false),
            }
        }
        Ok(false)
    }
}

fn pop_slot(stack: &mut Vec<Variable>) -> Variable {
    stack.pop().unwrap_or_else(Variable::empty)
}

fn branch_target(next_pc: usize, op: OpCode, operand: &[u8]) -> usize {
    let delta = match op.operand() {
        microclr_asm::OperandKind::ShortTarget => operand[0] as i8 as i64,
        _ => i32::from_le_bytes([operand[0], operand[1], operand[2], operand[3]]) as i64,
    };
    (next_pc as i64 + delta).max(0) as usize
}
