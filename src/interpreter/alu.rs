//! Arithmetic, logic, comparison and conversion over typed slots.
//!
//! Binary operations follow the CIL evaluation-stack rules: 32-bit
//! integers widen to 64-bit when mixed, floats widen to double when mixed,
//! and the unsigned variants reinterpret the operand bit patterns.

use super::Interpreter;
use crate::error::RuntimeError;
use crate::value::{Value, Variable};

use microclr_asm::{OpCode, SystemException, Token};

/// A numeric operand canonicalised for the ALU.
#[derive(Debug, Clone, Copy)]
enum Num {
    Int { value: i64, wide: bool },
    Real { value: f64, wide: bool },
}

fn numeric(v: &Variable, token: Token) -> Result<Num, RuntimeError> {
    match &v.value {
        Value::Int32(x) => Ok(Num::Int { value: *x as i64, wide: false }),
        Value::Uint32(x) => Ok(Num::Int { value: *x as i32 as i64, wide: false }),
        Value::Boolean(x) => Ok(Num::Int { value: *x as i64, wide: false }),
        Value::Int64(x) => Ok(Num::Int { value: *x, wide: true }),
        Value::Uint64(x) => Ok(Num::Int { value: *x as i64, wide: true }),
        Value::NativeHandle(x) => Ok(Num::Int { value: *x as i64, wide: false }),
        Value::Float(x) => Ok(Num::Real { value: *x as f64, wide: false }),
        Value::Double(x) => Ok(Num::Real { value: *x, wide: true }),
        _ => Err(RuntimeError::exception(SystemException::InvalidOperation, token)),
    }
}

fn push_int(wide: bool, value: i64) -> Variable {
    if wide {
        Variable::from(value)
    } else {
        Variable::from(value as i32)
    }
}

fn push_real(wide: bool, value: f64) -> Variable {
    if wide {
        Variable::from(value)
    } else {
        Variable::from(value as f32)
    }
}

impl<F, H> Interpreter<F, H> {
    fn fault_token(&self) -> Token {
        self.cur_frame().map(|f| f.method.token).unwrap_or(0)
    }

    /// The `add`/`sub`/`mul`/`div`/`rem`/bitwise family, including the
    /// unsigned and checked variants.
    pub(crate) fn alu_binary(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let token = self.fault_token();
        let b = self.pop()?;
        let a = self.pop()?;

        // Reference equality filters through `ceq`-style opcodes only; the
        // arithmetic family requires numbers.
        let (a, b) = (numeric(&a, token)?, numeric(&b, token)?);

        let result = match (a, b) {
            (Num::Int { value: x, wide: wx }, Num::Int { value: y, wide: wy }) => {
                let wide = wx || wy;
                self.int_binary(op, x, y, wide, token)?
            }
            (Num::Real { value: x, wide: wx }, Num::Real { value: y, wide: wy }) => {
                let wide = wx || wy;
                self.real_binary(op, x, y, wide, token)?
            }
            // Mixing int and float is not verifiable IL; promote the
            // integer side, as the host compiler never emits this for
            // checked code paths.
            (Num::Int { value: x, .. }, Num::Real { value: y, wide }) => {
                self.real_binary(op, x as f64, y, wide, token)?
            }
            (Num::Real { value: x, wide }, Num::Int { value: y, .. }) => {
                self.real_binary(op, x, y as f64, wide, token)?
            }
        };
        self.push(result)?;
        Ok(())
    }

    fn int_binary(
        &self,
        op: OpCode,
        x: i64,
        y: i64,
        wide: bool,
        token: Token,
    ) -> Result<Variable, RuntimeError> {
        use OpCode::*;

        let div_by_zero = || RuntimeError::exception(SystemException::DivideByZero, token);
        let overflow = || RuntimeError::exception(SystemException::Overflow, token);

        // Unsigned variants reinterpret the operand bit patterns at the
        // operand width.
        let (ux, uy) = if wide {
            (x as u64, y as u64)
        } else {
            (x as u32 as u64, y as u32 as u64)
        };

        let wrap = |v: i64| if wide { v } else { v as i32 as i64 };

        let value = match op {
            ADD => wrap(x.wrapping_add(y)),
            SUB => wrap(x.wrapping_sub(y)),
            MUL => wrap(x.wrapping_mul(y)),
            DIV => {
                if y == 0 {
                    return Err(div_by_zero());
                }
                if !wide && x == i32::MIN as i64 && y == -1 {
                    return Err(RuntimeError::exception(SystemException::Arithmetic, token));
                }
                wrap(x.wrapping_div(y))
            }
            REM => {
                if y == 0 {
                    return Err(div_by_zero());
                }
                wrap(x.wrapping_rem(y))
            }
            DIV_UN => {
                if uy == 0 {
                    return Err(div_by_zero());
                }
                wrap((ux / uy) as i64)
            }
            REM_UN => {
                if uy == 0 {
                    return Err(div_by_zero());
                }
                wrap((ux % uy) as i64)
            }
            AND => wrap(x & y),
            OR => wrap(x | y),
            XOR => wrap(x ^ y),
            ADD_OVF => {
                let checked = if wide {
                    x.checked_add(y)
                } else {
                    (x as i32).checked_add(y as i32).map(|v| v as i64)
                };
                checked.ok_or_else(overflow)?
            }
            SUB_OVF => {
                let checked = if wide {
                    x.checked_sub(y)
                } else {
                    (x as i32).checked_sub(y as i32).map(|v| v as i64)
                };
                checked.ok_or_else(overflow)?
            }
            MUL_OVF => {
                let checked = if wide {
                    x.checked_mul(y)
                } else {
                    (x as i32).checked_mul(y as i32).map(|v| v as i64)
                };
                checked.ok_or_else(overflow)?
            }
            ADD_OVF_UN => {
                let checked = if wide {
                    ux.checked_add(uy)
                } else {
                    (ux as u32).checked_add(uy as u32).map(|v| v as u64)
                };
                checked.ok_or_else(overflow)? as i64
            }
            SUB_OVF_UN => {
                let checked = if wide {
                    ux.checked_sub(uy)
                } else {
                    (ux as u32).checked_sub(uy as u32).map(|v| v as u64)
                };
                checked.ok_or_else(overflow)? as i64
            }
            MUL_OVF_UN => {
                let checked = if wide {
                    ux.checked_mul(uy)
                } else {
                    (ux as u32).checked_mul(uy as u32).map(|v| v as u64)
                };
                checked.ok_or_else(overflow)? as i64
            }
            _ => return Err(RuntimeError::exception(SystemException::InvalidOperation, token)),
        };
        Ok(push_int(wide, value))
    }

    fn real_binary(
        &self,
        op: OpCode,
        x: f64,
        y: f64,
        wide: bool,
        token: Token,
    ) -> Result<Variable, RuntimeError> {
        use OpCode::*;
        let value = match op {
            ADD | ADD_OVF => x + y,
            SUB | SUB_OVF => x - y,
            MUL | MUL_OVF => x * y,
            DIV | DIV_UN => x / y,
            REM | REM_UN => x % y,
            _ => return Err(RuntimeError::exception(SystemException::InvalidOperation, token)),
        };
        Ok(push_real(wide, value))
    }

    /// `shl`/`shr`/`shr.un`: the count always pops as a 32-bit integer.
    pub(crate) fn alu_shift(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let token = self.fault_token();
        let count = self.pop()?;
        let value = self.pop()?;
        let count = count
            .as_i64()
            .ok_or_else(|| RuntimeError::exception(SystemException::InvalidOperation, token))?
            as u32;
        let num = numeric(&value, token)?;
        let Num::Int { value: x, wide } = num else {
            return Err(RuntimeError::exception(SystemException::InvalidOperation, token));
        };
        let result = match op {
            OpCode::SHL => {
                if wide {
                    x.wrapping_shl(count)
                } else {
                    ((x as i32).wrapping_shl(count)) as i64
                }
            }
            OpCode::SHR => {
                if wide {
                    x.wrapping_shr(count)
                } else {
                    ((x as i32).wrapping_shr(count)) as i64
                }
            }
            OpCode::SHR_UN => {
                if wide {
                    ((x as u64).wrapping_shr(count)) as i64
                } else {
                    ((x as u32).wrapping_shr(count)) as i64
                }
            }
            _ => return Err(RuntimeError::exception(SystemException::InvalidOperation, token)),
        };
        self.push(push_int(wide, if wide { result } else { result as i32 as i64 }))?;
        Ok(())
    }

    /// `neg`/`not`.
    pub(crate) fn alu_unary(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let token = self.fault_token();
        let value = self.pop()?;
        let result = match (numeric(&value, token)?, op) {
            (Num::Int { value, wide }, OpCode::NEG) => push_int(wide, value.wrapping_neg()),
            (Num::Int { value, wide }, OpCode::NOT) => push_int(wide, !value),
            (Num::Real { value, wide }, OpCode::NEG) => push_real(wide, -value),
            _ => return Err(RuntimeError::exception(SystemException::InvalidOperation, token)),
        };
        self.push(result)?;
        Ok(())
    }

    /// Three-way comparison used by `ceq`/`cgt`/`clt` and the branch
    /// family. Returns `None` when the operands are unordered (float NaN).
    pub(crate) fn compare(
        &mut self,
        unsigned: bool,
    ) -> Result<Option<core::cmp::Ordering>, RuntimeError> {
        let token = self.fault_token();
        let b = self.pop()?;
        let a = self.pop()?;

        // Reference comparison: equality only; `cgt.un` against null is
        // the standard non-null test.
        if a.kind().is_reference() || b.kind().is_reference() {
            let (ra, rb) = (a.heap_ref(), b.heap_ref());
            return Ok(Some(if ra == rb {
                core::cmp::Ordering::Equal
            } else if rb.is_none() {
                core::cmp::Ordering::Greater
            } else {
                core::cmp::Ordering::Less
            }));
        }

        let result = match (numeric(&a, token)?, numeric(&b, token)?) {
            (Num::Int { value: x, wide: wx }, Num::Int { value: y, wide: wy }) => {
                if unsigned {
                    let wide = wx || wy;
                    let (ux, uy) = if wide {
                        (x as u64, y as u64)
                    } else {
                        (x as u32 as u64, y as u32 as u64)
                    };
                    Some(ux.cmp(&uy))
                } else {
                    Some(x.cmp(&y))
                }
            }
            (a, b) => {
                let fa = match a {
                    Num::Int { value, .. } => value as f64,
                    Num::Real { value, .. } => value,
                };
                let fb = match b {
                    Num::Int { value, .. } => value as f64,
                    Num::Real { value, .. } => value,
                };
                fa.partial_cmp(&fb)
            }
        };
        Ok(result)
    }

    /// The `conv.*` family. `checked` raises Overflow when the value does
    /// not fit; `from_unsigned` reinterprets the source bit pattern first
    /// (`conv.*.un` and `conv.r.un`).
    pub(crate) fn convert(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        use OpCode::*;
        let token = self.fault_token();
        let value = self.pop()?;
        let num = numeric(&value, token)?;

        let (target, checked, from_unsigned): (ConvTarget, bool, bool) = match op {
            CONV_I1 => (ConvTarget::I8, false, false),
            CONV_I2 => (ConvTarget::I16, false, false),
            CONV_I4 | CONV_I => (ConvTarget::I32, false, false),
            CONV_I8 => (ConvTarget::I64, false, false),
            CONV_U1 => (ConvTarget::U8, false, false),
            CONV_U2 => (ConvTarget::U16, false, false),
            CONV_U4 | CONV_U => (ConvTarget::U32, false, false),
            CONV_U8 => (ConvTarget::U64, false, false),
            CONV_R4 => (ConvTarget::F32, false, false),
            CONV_R8 => (ConvTarget::F64, false, false),
            CONV_R_UN => (ConvTarget::F64, false, true),
            CONV_OVF_I1 => (ConvTarget::I8, true, false),
            CONV_OVF_I2 => (ConvTarget::I16, true, false),
            CONV_OVF_I4 | CONV_OVF_I => (ConvTarget::I32, true, false),
            CONV_OVF_I8 => (ConvTarget::I64, true, false),
            CONV_OVF_U1 => (ConvTarget::U8, true, false),
            CONV_OVF_U2 => (ConvTarget::U16, true, false),
            CONV_OVF_U4 | CONV_OVF_U => (ConvTarget::U32, true, false),
            CONV_OVF_U8 => (ConvTarget::U64, true, false),
            CONV_OVF_I1_UN => (ConvTarget::I8, true, true),
            CONV_OVF_I2_UN => (ConvTarget::I16, true, true),
            CONV_OVF_I4_UN | CONV_OVF_I_UN => (ConvTarget::I32, true, true),
            CONV_OVF_I8_UN => (ConvTarget::I64, true, true),
            CONV_OVF_U1_UN => (ConvTarget::U8, true, true),
            CONV_OVF_U2_UN => (ConvTarget::U16, true, true),
            CONV_OVF_U4_UN | CONV_OVF_U_UN => (ConvTarget::U32, true, true),
            CONV_OVF_U8_UN => (ConvTarget::U64, true, true),
            _ => return Err(RuntimeError::exception(SystemException::InvalidOperation, token)),
        };

        let result = convert_num(num, target, checked, from_unsigned)
            .ok_or_else(|| RuntimeError::exception(SystemException::Overflow, token))?;
        self.push(result)?;
        Ok(())
    }

    /// `ckfinite`: the top of stack must be a finite float.
    pub(crate) fn op_ckfinite(&mut self) -> Result<(), RuntimeError> {
        let token = self.fault_token();
        let value = self.cur_frame()?.stack.top()?.clone();
        match value.as_f64() {
            Some(f) if f.is_finite() => Ok(()),
            _ => Err(RuntimeError::exception(SystemException::Arithmetic, token)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ConvTarget {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

/// IEEE-754 to integer uses truncation toward zero; checked conversions
/// fail on NaN or out-of-range values.
fn convert_num(num: Num, target: ConvTarget, checked: bool, from_unsigned: bool) -> Option<Variable> {
    // Canonical 64-bit views of the source.
    let (int_src, uint_src, real_src) = match num {
        Num::Int { value, wide } => {
            let unsigned = if wide {
                value as u64
            } else {
                value as u32 as u64
            };
            let signed = if from_unsigned { unsigned as i64 } else { value };
            (Some(signed), Some(unsigned), None)
        }
        Num::Real { value, .. } => (None, None, Some(value)),
    };

    let to_int = |lo: i64, hi: i64| -> Option<i64> {
        if let Some(f) = real_src {
            if f.is_nan() {
                return if checked { None } else { Some(0) };
            }
            let t = f.trunc();
            if checked && (t < lo as f64 || t > hi as f64) {
                return None;
            }
            // Unchecked float conversion truncates and wraps at the
            // target width.
            return Some((t as i64).clamp(lo.min(i64::MIN), hi.max(i64::MAX)));
        }
        let v = if from_unsigned {
            uint_src.unwrap_or(0) as i64
        } else {
            int_src.unwrap_or(0)
        };
        if checked && (v < lo || v > hi) {
            return None;
        }
        Some(v)
    };

    let to_u64 = || -> Option<u64> {
        if let Some(f) = real_src {
            if f.is_nan() || (checked && (f.trunc() < 0.0 || f.trunc() > u64::MAX as f64)) {
                return if checked { None } else { Some(0) };
            }
            return Some(f.trunc() as u64);
        }
        let v = int_src.unwrap_or(0);
        if checked && !from_unsigned && v < 0 {
            return None;
        }
        Some(if from_unsigned { uint_src.unwrap_or(0) } else { v as u64 })
    };

    Some(match target {
        ConvTarget::I8 => Variable::from(to_int(i8::MIN as i64, i8::MAX as i64)? as i8 as i32),
        ConvTarget::I16 => Variable::from(to_int(i16::MIN as i64, i16::MAX as i64)? as i16 as i32),
        ConvTarget::I32 => Variable::from(to_int(i32::MIN as i64, i32::MAX as i64)? as i32),
        ConvTarget::I64 => {
            if let Some(f) = real_src {
                if f.is_nan() || (checked && (f.trunc() < i64::MIN as f64 || f.trunc() >= i64::MAX as f64)) {
                    if checked {
                        return None;
                    }
                    return Some(Variable::from(0i64));
                }
                Variable::from(f.trunc() as i64)
            } else if from_unsigned {
                let u = uint_src.unwrap_or(0);
                if checked && u > i64::MAX as u64 {
                    return None;
                }
                Variable::from(u as i64)
            } else {
                Variable::from(int_src.unwrap_or(0))
            }
        }
        ConvTarget::U8 => Variable::from(to_int(0, u8::MAX as i64)? as u8 as i32),
        ConvTarget::U16 => Variable::from(to_int(0, u16::MAX as i64)? as u16 as i32),
        ConvTarget::U32 => Variable::from(to_int(0, u32::MAX as i64)? as u32),
        ConvTarget::U64 => Variable::from(to_u64()?),
        ConvTarget::F32 => {
            let f = real_src.unwrap_or_else(|| {
                if from_unsigned {
                    uint_src.unwrap_or(0) as f64
                } else {
                    int_src.unwrap_or(0) as f64
                }
            });
            Variable::from(f as f32)
        }
        ConvTarget::F64 => {
            let f = real_src.unwrap_or_else(|| {
                if from_unsigned {
                    uint_src.unwrap_or(0) as f64
                } else {
                    int_src.unwrap_or(0) as f64
                }
            });
            Variable::from(f)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchecked_narrowing_wraps() {
        let v = convert_num(Num::Int { value: 0x1_2345, wide: false }, ConvTarget::I8, false, false)
            .unwrap();
        assert_eq!(v, Variable::from(0x45i32));
    }

    #[test]
    fn checked_narrowing_overflows() {
        assert!(convert_num(Num::Int { value: 300, wide: false }, ConvTarget::I8, true, false).is_none());
        assert!(convert_num(Num::Int { value: -1, wide: false }, ConvTarget::U8, true, false).is_none());
        assert!(convert_num(Num::Int { value: 255, wide: false }, ConvTarget::U8, true, false).is_some());
    }

    #[test]
    fn float_to_int_truncates_toward_zero() {
        let v = convert_num(Num::Real { value: -2.9, wide: true }, ConvTarget::I32, false, false)
            .unwrap();
        assert_eq!(v, Variable::from(-2i32));
        let v = convert_num(Num::Real { value: 2.9, wide: true }, ConvTarget::I32, false, false)
            .unwrap();
        assert_eq!(v, Variable::from(2i32));
    }

    #[test]
    fn checked_float_conversion_rejects_nan_and_range() {
        assert!(convert_num(Num::Real { value: f64::NAN, wide: true }, ConvTarget::I32, true, false).is_none());
        assert!(convert_num(Num::Real { value: 3e10, wide: true }, ConvTarget::I32, true, false).is_none());
        assert!(convert_num(Num::Real { value: 3e10, wide: true }, ConvTarget::I64, true, false).is_some());
    }

    #[test]
    fn conv_r_un_treats_source_as_unsigned() {
        let v = convert_num(Num::Int { value: -1, wide: false }, ConvTarget::F64, false, true)
            .unwrap();
        assert_eq!(v, Variable::from(u32::MAX as f64));
    }
}
