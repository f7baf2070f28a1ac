//! The opcode decoder and per-instruction dispatch.

use crate::error::{EngineFault, RuntimeError};
use crate::hardware::HardwareAccess;
use crate::interpreter::Interpreter;
use crate::state::ExecuteState;
use crate::value::{SlotAddress, Value, Variable};

use microclr_asm::{OpCode, OperandKind, SystemException, Token, VariableKind};

use core::cmp::Ordering;

/// Decoded inline operand of one instruction.
#[derive(Debug, Clone)]
enum Operand {
    None,
    I8(i8),
    U8(u8),
    U16(u16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Token(Token),
    Target(i32),
    Switch(Vec<i32>),
}

impl Operand {
    fn token(&self) -> Result<Token, EngineFault> {
        match self {
            Self::Token(t) => Ok(*t),
            _ => Err(EngineFault::MemoryCorruption("expected token operand")),
        }
    }

    fn index(&self) -> Result<usize, EngineFault> {
        match self {
            Self::U8(v) => Ok(*v as usize),
            Self::U16(v) => Ok(*v as usize),
            _ => Err(EngineFault::MemoryCorruption("expected index operand")),
        }
    }

    fn target(&self) -> Result<i32, EngineFault> {
        match self {
            Self::I8(v) => Ok(*v as i32),
            Self::Target(v) => Ok(*v),
            _ => Err(EngineFault::MemoryCorruption("expected branch operand")),
        }
    }
}

fn read_le<const N: usize>(il: &[u8], pos: usize) -> Result<[u8; N], EngineFault> {
    il.get(pos..pos + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(EngineFault::InvalidOpCode {
            pc: pos as u16,
            raw: 0xffff,
        })
}

fn read_operand(il: &[u8], pos: usize, op: OpCode) -> Result<(Operand, usize), EngineFault> {
    let operand = match op.operand() {
        OperandKind::None => return Ok((Operand::None, pos)),
        OperandKind::ShortI => Operand::I8(read_le::<1>(il, pos)?[0] as i8),
        OperandKind::ShortVar => Operand::U8(read_le::<1>(il, pos)?[0]),
        OperandKind::ShortTarget => Operand::I8(read_le::<1>(il, pos)?[0] as i8),
        OperandKind::Var => Operand::U16(u16::from_le_bytes(read_le::<2>(il, pos)?)),
        OperandKind::Int => Operand::I32(i32::from_le_bytes(read_le::<4>(il, pos)?)),
        OperandKind::Target => Operand::Target(i32::from_le_bytes(read_le::<4>(il, pos)?)),
        OperandKind::Token => Operand::Token(u32::from_le_bytes(read_le::<4>(il, pos)?)),
        OperandKind::Long => Operand::I64(i64::from_le_bytes(read_le::<8>(il, pos)?)),
        OperandKind::Float => Operand::F32(f32::from_bits(u32::from_le_bytes(read_le::<4>(il, pos)?))),
        OperandKind::Double => {
            Operand::F64(f64::from_bits(u64::from_le_bytes(read_le::<8>(il, pos)?)))
        }
        OperandKind::Switch => {
            let count = u32::from_le_bytes(read_le::<4>(il, pos)?) as usize;
            let mut table = Vec::with_capacity(count);
            let mut cursor = pos + 4;
            for _ in 0..count {
                table.push(i32::from_le_bytes(read_le::<4>(il, cursor)?));
                cursor += 4;
            }
            return Ok((Operand::Switch(table), cursor));
        }
    };
    let len = op.operand().len().unwrap_or(0);
    Ok((operand, pos + len))
}

impl<F, H: HardwareAccess> Interpreter<F, H> {
    /// Decode and execute one instruction of the innermost frame.
    /// Recoverable errors are managed exceptions the caller hands to the
    /// exception machine; halts abort the task.
    pub(crate) fn execute(&mut self) -> Result<ExecuteState, RuntimeError> {
        let method = {
            let frame = self.cur_frame()?;
            frame.check_guard()?;
            frame.method.clone()
        };
        let il = method
            .il()
            .ok_or(EngineFault::MemoryCorruption("frame holds a native method"))?;

        let start_pc = self.cur_frame()?.pc;
        self.cur_frame_mut()?.instr_start = start_pc;

        // Prefixes are decoded inline; only `constrained.` carries
        // semantics here.
        let mut pc = start_pc as usize;
        let mut constrained: Option<Token> = None;
        let (op, operand, next_pc) = loop {
            let (op, oplen) = OpCode::decode(&il[pc.min(il.len())..]).map_err(|raw| {
                EngineFault::InvalidOpCode {
                    pc: pc as u16,
                    raw,
                }
            })?;
            let operand_pos = pc + oplen;
            if op.is_prefix() {
                match op {
                    OpCode::CONSTRAINED => {
                        constrained = Some(u32::from_le_bytes(read_le::<4>(il, operand_pos)?));
                        pc = operand_pos + 4;
                    }
                    OpCode::UNALIGNED => pc = operand_pos + 1,
                    _ => pc = operand_pos,
                }
                continue;
            }
            let (operand, next) = read_operand(il, operand_pos, op)?;
            break (op, operand, next as u16);
        };
        self.cur_frame_mut()?.pc = next_pc;

        self.instruction(op, operand, constrained, next_pc, il.len())
    }

    fn instruction(
        &mut self,
        op: OpCode,
        operand: Operand,
        constrained: Option<Token>,
        next_pc: u16,
        il_len: usize,
    ) -> Result<ExecuteState, RuntimeError> {
        use OpCode::*;

        let frame_index = self.task_ref()?.frames.len() - 1;

        match op {
            NOP => {}
            BREAK => {
                return Err(EngineFault::InvalidOpCode {
                    pc: next_pc,
                    raw: op as u16,
                }
                .into())
            }

            // Argument and local transfer.
            LDARG_0 | LDARG_1 | LDARG_2 | LDARG_3 => {
                let index = (op as u16 - LDARG_0 as u16) as usize;
                self.load_argument(index)?;
            }
            LDARG_S | LDARG => {
                let index = operand.index()?;
                self.load_argument(index)?;
            }
            LDARGA_S | LDARGA => {
                let index = operand.index()?;
                self.push(Variable::new(Value::Address(SlotAddress::Argument {
                    frame: frame_index,
                    index,
                })))?;
            }
            STARG_S | STARG => {
                let index = operand.index()?;
                let value = self.pop()?;
                self.store_argument(index, value)?;
            }
            LDLOC_0 | LDLOC_1 | LDLOC_2 | LDLOC_3 => {
                let index = (op as u16 - LDLOC_0 as u16) as usize;
                self.load_local(index)?;
            }
            LDLOC_S | LDLOC => {
                let index = operand.index()?;
                self.load_local(index)?;
            }
            LDLOCA_S | LDLOCA => {
                let index = operand.index()?;
                self.push(Variable::new(Value::Address(SlotAddress::Local {
                    frame: frame_index,
                    index,
                })))?;
            }
            STLOC_0 | STLOC_1 | STLOC_2 | STLOC_3 => {
                let index = (op as u16 - STLOC_0 as u16) as usize;
                let value = self.pop()?;
                self.store_local(index, value)?;
            }
            STLOC_S | STLOC => {
                let index = operand.index()?;
                let value = self.pop()?;
                self.store_local(index, value)?;
            }

            // Constants.
            LDNULL => self.push(Variable::null())?,
            LDC_I4_M1 => self.push(Variable::from(-1i32))?,
            LDC_I4_0 | LDC_I4_1 | LDC_I4_2 | LDC_I4_3 | LDC_I4_4 | LDC_I4_5 | LDC_I4_6
            | LDC_I4_7 | LDC_I4_8 => {
                self.push(Variable::from(op as u16 as i32 - LDC_I4_0 as u16 as i32))?
            }
            LDC_I4_S => {
                let Operand::I8(v) = operand else {
                    return Err(EngineFault::MemoryCorruption("ldc.i4.s operand").into());
                };
                self.push(Variable::from(v as i32))?;
            }
            LDC_I4 => {
                let Operand::I32(v) = operand else {
                    return Err(EngineFault::MemoryCorruption("ldc.i4 operand").into());
                };
                self.push(Variable::from(v))?;
            }
            LDC_I8 => {
                let Operand::I64(v) = operand else {
                    return Err(EngineFault::MemoryCorruption("ldc.i8 operand").into());
                };
                self.push(Variable::from(v))?;
            }
            LDC_R4 => {
                let Operand::F32(v) = operand else {
                    return Err(EngineFault::MemoryCorruption("ldc.r4 operand").into());
                };
                self.push(Variable::from(v))?;
            }
            LDC_R8 => {
                let Operand::F64(v) = operand else {
                    return Err(EngineFault::MemoryCorruption("ldc.r8 operand").into());
                };
                self.push(Variable::from(v))?;
            }

            DUP => {
                let top = self.cur_frame()?.stack.top()?.clone();
                self.push(top)?;
            }
            POP => {
                self.pop()?;
            }

            // Arithmetic and logic.
            ADD | SUB | MUL | DIV | DIV_UN | REM | REM_UN | AND | OR | XOR | ADD_OVF
            | ADD_OVF_UN | SUB_OVF | SUB_OVF_UN | MUL_OVF | MUL_OVF_UN => self.alu_binary(op)?,
            SHL | SHR | SHR_UN => self.alu_shift(op)?,
            NEG | NOT => self.alu_unary(op)?,
            CKFINITE => self.op_ckfinite()?,

            // Conversions.
            CONV_I1 | CONV_I2 | CONV_I4 | CONV_I8 | CONV_R4 | CONV_R8 | CONV_U1 | CONV_U2
            | CONV_U4 | CONV_U8 | CONV_I | CONV_U | CONV_R_UN | CONV_OVF_I1 | CONV_OVF_I2
            | CONV_OVF_I4 | CONV_OVF_I8 | CONV_OVF_U1 | CONV_OVF_U2 | CONV_OVF_U4
            | CONV_OVF_U8 | CONV_OVF_I | CONV_OVF_U | CONV_OVF_I1_UN | CONV_OVF_I2_UN
            | CONV_OVF_I4_UN | CONV_OVF_I8_UN | CONV_OVF_U1_UN | CONV_OVF_U2_UN
            | CONV_OVF_U4_UN | CONV_OVF_U8_UN | CONV_OVF_I_UN | CONV_OVF_U_UN => {
                self.convert(op)?
            }

            // Comparisons.
            CEQ => {
                let ord = self.compare(false)?;
                self.push(Variable::from((ord == Some(Ordering::Equal)) as i32))?;
            }
            CGT => {
                let ord = self.compare(false)?;
                self.push(Variable::from((ord == Some(Ordering::Greater)) as i32))?;
            }
            CGT_UN => {
                let ord = self.compare(true)?;
                self.push(Variable::from(
                    matches!(ord, Some(Ordering::Greater) | None) as i32,
                ))?;
            }
            CLT => {
                let ord = self.compare(false)?;
                self.push(Variable::from((ord == Some(Ordering::Less)) as i32))?;
            }
            CLT_UN => {
                let ord = self.compare(true)?;
                self.push(Variable::from(
                    matches!(ord, Some(Ordering::Less) | None) as i32,
                ))?;
            }

            // Branches. Signed comparisons treat unordered floats as
            // no-branch; the unsigned forms branch on unordered.
            BR | BR_S => self.do_branch(next_pc, operand.target()?, il_len)?,
            BRTRUE | BRTRUE_S => {
                if self.pop()?.is_true() {
                    self.do_branch(next_pc, operand.target()?, il_len)?;
                }
            }
            BRFALSE | BRFALSE_S => {
                if !self.pop()?.is_true() {
                    self.do_branch(next_pc, operand.target()?, il_len)?;
                }
            }
            BEQ | BEQ_S => {
                if self.compare(false)? == Some(Ordering::Equal) {
                    self.do_branch(next_pc, operand.target()?, il_len)?;
                }
            }
            BNE_UN | BNE_UN_S => {
                if self.compare(true)? != Some(Ordering::Equal) {
                    self.do_branch(next_pc, operand.target()?, il_len)?;
                }
            }
            BGE | BGE_S => {
                if matches!(
                    self.compare(false)?,
                    Some(Ordering::Greater) | Some(Ordering::Equal)
                ) {
                    self.do_branch(next_pc, operand.target()?, il_len)?;
                }
            }
            BGE_UN | BGE_UN_S => {
                if !matches!(self.compare(true)?, Some(Ordering::Less)) {
                    self.do_branch(next_pc, operand.target()?, il_len)?;
                }
            }
            BGT | BGT_S => {
                if self.compare(false)? == Some(Ordering::Greater) {
                    self.do_branch(next_pc, operand.target()?, il_len)?;
                }
            }
            BGT_UN | BGT_UN_S => {
                if matches!(self.compare(true)?, Some(Ordering::Greater) | None) {
                    self.do_branch(next_pc, operand.target()?, il_len)?;
                }
            }
            BLE | BLE_S => {
                if matches!(
                    self.compare(false)?,
                    Some(Ordering::Less) | Some(Ordering::Equal)
                ) {
                    self.do_branch(next_pc, operand.target()?, il_len)?;
                }
            }
            BLE_UN | BLE_UN_S => {
                if !matches!(self.compare(true)?, Some(Ordering::Greater)) {
                    self.do_branch(next_pc, operand.target()?, il_len)?;
                }
            }
            BLT | BLT_S => {
                if self.compare(false)? == Some(Ordering::Less) {
                    self.do_branch(next_pc, operand.target()?, il_len)?;
                }
            }
            BLT_UN | BLT_UN_S => {
                if matches!(self.compare(true)?, Some(Ordering::Less) | None) {
                    self.do_branch(next_pc, operand.target()?, il_len)?;
                }
            }
            SWITCH => {
                let Operand::Switch(table) = operand else {
                    return Err(EngineFault::MemoryCorruption("switch operand").into());
                };
                let selector = self.pop()?.as_i64().unwrap_or(i64::MAX);
                if selector >= 0 && (selector as usize) < table.len() {
                    self.do_branch(next_pc, table[selector as usize], il_len)?;
                }
            }

            // Indirect loads and stores.
            LDIND_I1 => self.op_ldind(VariableKind::Int32, 1)?,
            LDIND_U1 => self.op_ldind(VariableKind::Uint32, 1)?,
            LDIND_I2 => self.op_ldind(VariableKind::Int32, 2)?,
            LDIND_U2 => self.op_ldind(VariableKind::Uint32, 2)?,
            LDIND_I4 | LDIND_I => self.op_ldind(VariableKind::Int32, 4)?,
            LDIND_U4 => self.op_ldind(VariableKind::Uint32, 4)?,
            LDIND_I8 => self.op_ldind(VariableKind::Int64, 8)?,
            LDIND_R4 => self.op_ldind(VariableKind::Float, 4)?,
            LDIND_R8 => self.op_ldind(VariableKind::Double, 8)?,
            LDIND_REF => self.op_ldind(VariableKind::Object, 4)?,
            STIND_REF | STIND_I1 | STIND_I2 | STIND_I4 | STIND_I8 | STIND_R4 | STIND_R8
            | STIND_I => self.op_stind()?,

            // Object model.
            LDOBJ => self.op_ldobj(operand.token()?)?,
            STOBJ => self.op_stobj(operand.token()?)?,
            CPOBJ => self.op_cpobj(operand.token()?)?,
            INITOBJ => self.op_initobj(operand.token()?)?,
            LDSTR => self.op_ldstr(operand.token()?)?,
            NEWOBJ => self.op_newobj(operand.token()?)?,
            NEWARR => self.op_newarr(operand.token()?)?,
            LDLEN => self.op_ldlen()?,
            CASTCLASS => self.op_castclass(operand.token()?, false)?,
            ISINST => self.op_castclass(operand.token()?, true)?,
            BOX => self.op_box(operand.token()?)?,
            UNBOX => self.op_unbox(operand.token()?)?,
            UNBOX_ANY => self.op_unbox_any(operand.token()?)?,
            LDTOKEN => self.op_ldtoken(operand.token()?)?,
            SIZEOF => self.op_sizeof(operand.token()?)?,

            LDELEMA => self.op_ldelem(None, true)?,
            LDELEM => self.op_ldelem(None, false)?,
            LDELEM_I1 => self.op_ldelem(Some((VariableKind::Int32, 1)), false)?,
            LDELEM_U1 => self.op_ldelem(Some((VariableKind::Uint32, 1)), false)?,
            LDELEM_I2 => self.op_ldelem(Some((VariableKind::Int32, 2)), false)?,
            LDELEM_U2 => self.op_ldelem(Some((VariableKind::Uint32, 2)), false)?,
            LDELEM_I4 | LDELEM_I => self.op_ldelem(Some((VariableKind::Int32, 4)), false)?,
            LDELEM_U4 => self.op_ldelem(Some((VariableKind::Uint32, 4)), false)?,
            LDELEM_I8 => self.op_ldelem(Some((VariableKind::Int64, 8)), false)?,
            LDELEM_R4 => self.op_ldelem(Some((VariableKind::Float, 4)), false)?,
            LDELEM_R8 => self.op_ldelem(Some((VariableKind::Double, 8)), false)?,
            LDELEM_REF => self.op_ldelem(Some((VariableKind::Object, 4)), false)?,
            STELEM => self.op_stelem(None)?,
            STELEM_I1 => self.op_stelem(Some((VariableKind::Int32, 1)))?,
            STELEM_I2 => self.op_stelem(Some((VariableKind::Int32, 2)))?,
            STELEM_I4 | STELEM_I => self.op_stelem(Some((VariableKind::Int32, 4)))?,
            STELEM_I8 => self.op_stelem(Some((VariableKind::Int64, 8)))?,
            STELEM_R4 => self.op_stelem(Some((VariableKind::Float, 4)))?,
            STELEM_R8 => self.op_stelem(Some((VariableKind::Double, 8)))?,
            STELEM_REF => self.op_stelem(Some((VariableKind::Object, 4)))?,

            LDFLD => self.op_ldfld(operand.token()?, false)?,
            LDFLDA => self.op_ldfld(operand.token()?, true)?,
            STFLD => self.op_stfld(operand.token()?)?,
            LDSFLD => {
                let value = self.static_value(operand.token()?);
                self.push(value)?;
            }
            LDSFLDA => {
                self.push(Variable::new(Value::Address(SlotAddress::Static(
                    operand.token()?,
                ))))?;
            }
            STSFLD => {
                let value = self.pop()?;
                self.statics.insert(operand.token()?, value);
            }

            // Calls and returns.
            CALL => self.op_call(operand.token()?)?,
            CALLI => self.op_calli()?,
            CALLVIRT => self.op_callvirt(operand.token()?, constrained)?,
            RET => return self.op_ret(),
            LDFTN => {
                let token = self.cur_frame()?.method.resolve_call_token(operand.token()?);
                self.push(Variable::new(Value::FunctionPointer(token)))?;
            }
            LDVIRTFTN => {
                let site = operand.token()?;
                let token = self.cur_frame()?.method.resolve_call_token(site);
                let receiver = self.pop()?;
                let target = match self.class_token_of(&receiver)? {
                    Some(class) => self
                        .find_override(class, token, site)
                        .map(|m| m.token)
                        .unwrap_or(token),
                    None => token,
                };
                self.push(Variable::new(Value::FunctionPointer(target)))?;
            }

            // Exceptions and protected regions.
            THROW => self.op_throw()?,
            RETHROW => self.op_rethrow()?,
            LEAVE | LEAVE_S => {
                let target = checked_target(next_pc, operand.target()?, il_len)?;
                self.op_leave(target)?;
            }
            ENDFINALLY => self.op_endfinally()?,
            ENDFILTER => {
                // Filter regions are evaluated by the exception machine;
                // reaching one in the main loop is malformed IL.
                return Err(EngineFault::InvalidOpCode {
                    pc: next_pc,
                    raw: op as u16,
                }
                .into());
            }

            UNALIGNED | VOLATILE | TAIL | CONSTRAINED | READONLY => {
                // Prefixes are consumed by the decode loop.
                unreachable!("prefix opcodes are handled during decode")
            }
        }

        Ok(ExecuteState::Proceed)
    }

    fn load_argument(&mut self, index: usize) -> Result<(), RuntimeError> {
        let frame = self.cur_frame()?;
        let value = frame
            .arguments
            .get(index)
            .cloned()
            .ok_or_else(|| RuntimeError::exception(SystemException::InvalidOperation, frame.method.token))?;
        self.push(value)?;
        Ok(())
    }

    fn store_argument(&mut self, index: usize, value: Variable) -> Result<(), RuntimeError> {
        let frame = self.cur_frame_mut()?;
        let token = frame.method.token;
        let slot = frame
            .arguments
            .get_mut(index)
            .ok_or_else(|| RuntimeError::exception(SystemException::InvalidOperation, token))?;
        slot.assign(value)?;
        Ok(())
    }

    fn load_local(&mut self, index: usize) -> Result<(), RuntimeError> {
        let frame = self.cur_frame()?;
        let value = frame
            .locals
            .get(index)
            .cloned()
            .ok_or_else(|| RuntimeError::exception(SystemException::InvalidOperation, frame.method.token))?;
        self.push(value)?;
        Ok(())
    }

    fn store_local(&mut self, index: usize, value: Variable) -> Result<(), RuntimeError> {
        let frame = self.cur_frame_mut()?;
        let token = frame.method.token;
        let slot = frame
            .locals
            .get_mut(index)
            .ok_or_else(|| RuntimeError::exception(SystemException::InvalidOperation, token))?;
        slot.assign(value)?;
        Ok(())
    }

    fn do_branch(&mut self, next_pc: u16, delta: i32, il_len: usize) -> Result<(), RuntimeError> {
        let target = checked_target(next_pc, delta, il_len)?;
        self.cur_frame_mut()?.pc = target;
        Ok(())
    }
}

/// Branch displacements are relative to the next instruction and must land
/// inside the method body.
fn checked_target(next_pc: u16, delta: i32, il_len: usize) -> Result<u16, EngineFault> {
    let target = next_pc as i64 + delta as i64;
    if target < 0 || target as usize >= il_len {
        return Err(EngineFault::InvalidOpCode {
            pc: next_pc,
            raw: 0xffff,
        });
    }
    Ok(target as u16)
}
