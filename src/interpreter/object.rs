//! The object model: allocation, arrays, strings, boxing and casts.

use super::Interpreter;
use crate::consts::*;
use crate::error::RuntimeError;
use crate::gc::ObjRef;
use crate::hardware::HardwareAccess;
use crate::value::{SlotAddress, Value, Variable, VariableDescription};

use microclr_asm::{token_kind, KnownTypeToken, SystemException, Token, TokenKind, VariableKind};

impl<F, H: HardwareAccess> Interpreter<F, H> {
    /// Allocate a zeroed instance of `class_token` and stamp its header.
    pub(crate) fn new_instance(&mut self, class_token: Token) -> Result<ObjRef, RuntimeError> {
        let class = self.resolve_class(class_token)?;
        let size = OBJECT_HEADER_SIZE + class.dynamic_size as usize;
        let obj = self.alloc_managed(size, class_token)?;
        self.gc.write_word(obj, 0, class_token)?;
        Ok(obj)
    }

    /// `newobj`: allocate, then run the constructor with the fresh object
    /// as argument 0. The reference is left under the constructor
    /// arguments so it remains on the stack after the call returns.
    pub(crate) fn op_newobj(&mut self, ctor_site: Token) -> Result<(), RuntimeError> {
        let ctor_token = self.cur_frame()?.method.resolve_call_token(ctor_site);
        let ctor = self.resolve_method(ctor_token)?;
        let class_token = self
            .class_of_ctor(ctor_token)
            .ok_or_else(|| RuntimeError::exception(SystemException::ClassNotFound, ctor_token))?;
        let obj = self.new_instance(class_token)?;

        // Stack holds the ctor arguments (without `this`). Insert the
        // reference under them as argument 0 and one copy below as the
        // expression result.
        let explicit_args = ctor.num_args.max(1) as usize - 1;
        let frame = self.cur_frame_mut()?;
        let mut args = Vec::with_capacity(explicit_args);
        for _ in 0..explicit_args {
            args.push(frame.stack.pop()?);
        }
        frame.stack.push(Variable::from(obj));
        frame.stack.push(Variable::from(obj));
        for value in args.into_iter().rev() {
            frame.stack.push(value);
        }
        self.invoke(ctor)
    }

    /// The class a constructor belongs to: the class whose method table
    /// lists the token.
    fn class_of_ctor(&self, ctor_token: Token) -> Option<Token> {
        self.classes
            .iter()
            .find(|class| class.methods.iter().any(|m| m.token == ctor_token))
            .map(|class| class.token)
    }

    /// Element layout of an array class: `(element size, element kind)`.
    fn element_layout(&self, elem_token: Token) -> Result<(u16, VariableKind), RuntimeError> {
        if let Some(class) = self.classes.get_by_key(elem_token) {
            if class.is_value_type {
                return Ok((class.value_size().max(1), class.value_kind()));
            }
            return Ok((POINTER_SIZE as u16, VariableKind::Object));
        }
        // Element classes may be absent for reference types declared
        // elsewhere; treat them as plain references.
        match token_kind(elem_token) {
            TokenKind::TypeDef | TokenKind::TypeRef => Ok((POINTER_SIZE as u16, VariableKind::Object)),
            _ => Err(RuntimeError::exception(SystemException::ClassNotFound, elem_token)),
        }
    }

    /// `newarr`: header, length, element token, zeroed element storage.
    pub(crate) fn op_newarr(&mut self, elem_token: Token) -> Result<(), RuntimeError> {
        let length = self
            .pop()?
            .as_i64()
            .ok_or_else(|| RuntimeError::exception(SystemException::InvalidOperation, elem_token))?;
        if length < 0 {
            return Err(RuntimeError::exception(SystemException::Overflow, elem_token));
        }
        let (elem_size, elem_kind) = self.element_layout(elem_token)?;
        let payload = ARRAY_DATA_OFFSET + length as usize * elem_size as usize;
        let obj = self.alloc_managed(payload, elem_token)?;

        let header_class = self
            .special_tokens
            .get(KnownTypeToken::Array)
            .unwrap_or(elem_token);
        self.gc.write_word(obj, 0, header_class)?;
        self.gc.write_word(obj, ARRAY_LENGTH_OFFSET, length as u32)?;
        self.gc.write_word(obj, ARRAY_TYPE_OFFSET, elem_token)?;

        let value = if elem_kind.is_reference() || elem_kind == VariableKind::Object {
            Value::ReferenceArray(Some(obj))
        } else {
            Value::ValueArray(Some(obj))
        };
        self.push(Variable::new(value))?;
        Ok(())
    }

    /// Length, element token and layout of the array referenced by a slot.
    pub(crate) fn array_info(
        &self,
        array: &Variable,
    ) -> Result<(ObjRef, u32, u16, VariableKind), RuntimeError> {
        let obj = array.heap_ref().ok_or_else(|| {
            RuntimeError::exception(SystemException::NullReference, 0)
        })?;
        let length = self.gc.read_word(obj, ARRAY_LENGTH_OFFSET)?;
        let elem_token = self.gc.read_word(obj, ARRAY_TYPE_OFFSET)?;
        let (elem_size, elem_kind) = self.element_layout(elem_token)?;
        Ok((obj, length, elem_size, elem_kind))
    }

    /// `ldlen`. Reads the count directly so it also serves string
    /// objects, whose element class is not declared.
    pub(crate) fn op_ldlen(&mut self) -> Result<(), RuntimeError> {
        let array = self.pop()?;
        let obj = array
            .heap_ref()
            .ok_or_else(|| RuntimeError::exception(SystemException::NullReference, 0))?;
        let length = self.gc.read_word(obj, ARRAY_LENGTH_OFFSET)?;
        self.push(Variable::from(length as i32))?;
        Ok(())
    }

    /// `ldelem` family. `typed` carries the requested element width for
    /// the suffixed variants; `None` uses the array's own element layout.
    pub(crate) fn op_ldelem(
        &mut self,
        typed: Option<(VariableKind, u16)>,
        as_address: bool,
    ) -> Result<(), RuntimeError> {
        let index = self.pop()?;
        let array = self.pop()?;
        let (obj, length, elem_size, elem_kind) = self.array_info(&array)?;
        let index = index
            .as_i64()
            .ok_or_else(|| RuntimeError::exception(SystemException::InvalidOperation, 0))?;
        if index < 0 || index as u32 >= length {
            return Err(RuntimeError::exception(SystemException::IndexOutOfRange, 0));
        }
        let (kind, size) = typed.unwrap_or((elem_kind, elem_size));

        if as_address {
            let address = SlotAddress::Element {
                obj,
                index: index as u32,
                kind: elem_kind,
                size: elem_size,
            };
            self.push(Variable::new(Value::Address(address)))?;
            return Ok(());
        }

        let offset = ARRAY_DATA_OFFSET + index as usize * elem_size as usize;
        let value = self.heap_read(obj, offset, kind, size.min(elem_size))?;
        self.push(value)?;
        Ok(())
    }

    /// `stelem` family. Stores into reference arrays check assignability.
    pub(crate) fn op_stelem(&mut self, typed: Option<(VariableKind, u16)>) -> Result<(), RuntimeError> {
        let value = self.pop()?;
        let index = self.pop()?;
        let array = self.pop()?;
        let (obj, length, elem_size, elem_kind) = self.array_info(&array)?;
        let index = index
            .as_i64()
            .ok_or_else(|| RuntimeError::exception(SystemException::InvalidOperation, 0))?;
        if index < 0 || index as u32 >= length {
            return Err(RuntimeError::exception(SystemException::IndexOutOfRange, 0));
        }

        if elem_kind == VariableKind::Object {
            let elem_token = self.gc.read_word(obj, ARRAY_TYPE_OFFSET)?;
            if let Some(value_class) = self.class_token_of(&value)? {
                if self.classes.get_by_key(elem_token).is_some()
                    && !self.is_assignable(elem_token, value_class)
                {
                    return Err(RuntimeError::exception(
                        SystemException::ArrayTypeMismatch,
                        elem_token,
                    ));
                }
            }
        }

        let (kind, size) = typed.unwrap_or((elem_kind, elem_size));
        let offset = ARRAY_DATA_OFFSET + index as usize * elem_size as usize;
        self.heap_write(obj, offset, kind, size.min(elem_size), &value)
    }

    /// `box`: copy a value into a fresh heap object of the value class.
    pub(crate) fn box_value(&mut self, class_token: Token, value: &Variable) -> Result<ObjRef, RuntimeError> {
        let obj = self.new_instance(class_token)?;
        let class = self.resolve_class(class_token)?;
        self.heap_write(
            obj,
            OBJECT_HEADER_SIZE,
            class.value_kind(),
            class.value_size().max(value.field_size()),
            value,
        )?;
        Ok(obj)
    }

    /// `box` opcode: reference types pass through unchanged.
    pub(crate) fn op_box(&mut self, class_token: Token) -> Result<(), RuntimeError> {
        let class = self.resolve_class(class_token)?;
        if !class.is_value_type {
            return Ok(());
        }
        let value = self.pop()?;
        let obj = self.box_value(class_token, &value)?;
        self.push(Variable::from(obj))?;
        Ok(())
    }

    /// `unbox`: push a managed address of the boxed payload.
    pub(crate) fn op_unbox(&mut self, class_token: Token) -> Result<(), RuntimeError> {
        let boxed = self.pop()?;
        let obj = boxed
            .heap_ref()
            .ok_or_else(|| RuntimeError::exception(SystemException::NullReference, class_token))?;
        self.check_cast(class_token, obj)?;
        let class = self.resolve_class(class_token)?;
        let address = SlotAddress::Field {
            obj,
            offset: 0,
            kind: class.value_kind(),
            size: class.value_size().max(1),
        };
        self.push(Variable::new(Value::Address(address)))?;
        Ok(())
    }

    /// `unbox.any`: load the value itself (equivalent to `castclass` for
    /// reference classes).
    pub(crate) fn op_unbox_any(&mut self, class_token: Token) -> Result<(), RuntimeError> {
        let class = self.resolve_class(class_token)?;
        if !class.is_value_type {
            return self.op_castclass(class_token, false);
        }
        let boxed = self.pop()?;
        let obj = boxed
            .heap_ref()
            .ok_or_else(|| RuntimeError::exception(SystemException::NullReference, class_token))?;
        self.check_cast(class_token, obj)?;
        let value = self.heap_read(
            obj,
            OBJECT_HEADER_SIZE,
            class.value_kind(),
            class.value_size().max(1),
        )?;
        self.push(value)?;
        Ok(())
    }

    fn check_cast(&self, class_token: Token, obj: ObjRef) -> Result<(), RuntimeError> {
        let actual = self.gc.class_token(obj)?;
        if !self.is_assignable(class_token, actual) {
            return Err(RuntimeError::exception(SystemException::InvalidCast, class_token));
        }
        Ok(())
    }

    /// `castclass` / `isinst`. A failed `isinst` pushes null instead of
    /// throwing.
    pub(crate) fn op_castclass(&mut self, class_token: Token, is_inst: bool) -> Result<(), RuntimeError> {
        let value = self.pop()?;
        match value.heap_ref() {
            None => {
                // Null casts to anything.
                self.push(value)?;
                Ok(())
            }
            Some(obj) => {
                let actual = self.gc.class_token(obj)?;
                if self.is_assignable(class_token, actual) {
                    self.push(value)?;
                } else if is_inst {
                    self.push(Variable::null())?;
                } else {
                    return Err(RuntimeError::exception(SystemException::InvalidCast, class_token));
                }
                Ok(())
            }
        }
    }

    /// `ldstr`: materialise a string object (array layout with 2-byte
    /// elements) from the constant heap.
    pub(crate) fn op_ldstr(&mut self, string_token: Token) -> Result<(), RuntimeError> {
        let bytes = self
            .constants
            .get(string_token)
            .ok_or_else(|| RuntimeError::exception(SystemException::ClassNotFound, string_token))?
            .to_vec();
        let chars = bytes.len() / 2;
        let obj = self.alloc_managed(ARRAY_DATA_OFFSET + bytes.len(), string_token)?;
        let header_class = self
            .special_tokens
            .get(KnownTypeToken::String)
            .unwrap_or(string_token);
        self.gc.write_word(obj, 0, header_class)?;
        self.gc.write_word(obj, ARRAY_LENGTH_OFFSET, chars as u32)?;
        self.gc.write_word(obj, ARRAY_TYPE_OFFSET, 0)?;
        let payload = self.gc.payload_mut(obj)?;
        payload[ARRAY_DATA_OFFSET..ARRAY_DATA_OFFSET + bytes.len()].copy_from_slice(&bytes);
        self.push(Variable::from(obj))?;
        Ok(())
    }

    /// `ldtoken`: runtime handles carry the raw token.
    pub(crate) fn op_ldtoken(&mut self, token: Token) -> Result<(), RuntimeError> {
        let value = match token_kind(token) {
            TokenKind::FieldDef => Value::FieldHandle(token),
            _ => Value::TypeHandle(token),
        };
        self.push(Variable::new(value))?;
        Ok(())
    }

    /// `sizeof`.
    pub(crate) fn op_sizeof(&mut self, class_token: Token) -> Result<(), RuntimeError> {
        let class = self.resolve_class(class_token)?;
        let size = if class.is_value_type {
            class.value_size() as i32
        } else {
            POINTER_SIZE as i32
        };
        self.push(Variable::from(size))?;
        Ok(())
    }

    /// `initobj`: zero the value behind an address.
    pub(crate) fn op_initobj(&mut self, class_token: Token) -> Result<(), RuntimeError> {
        let address = self.pop_address()?;
        let class = self.resolve_class(class_token)?;
        let desc = VariableDescription::sized(class.value_kind(), class.value_size());
        self.write_address(address, Variable::zero_of(&desc))
    }

    /// `ldobj`: load the value behind an address.
    pub(crate) fn op_ldobj(&mut self, _class_token: Token) -> Result<(), RuntimeError> {
        let address = self.pop_address()?;
        let value = self.read_address(address)?;
        self.push(value)?;
        Ok(())
    }

    /// `stobj`: store a value through an address.
    pub(crate) fn op_stobj(&mut self, _class_token: Token) -> Result<(), RuntimeError> {
        let value = self.pop()?;
        let address = self.pop_address()?;
        self.write_address(address, value)
    }

    /// `cpobj`: copy between two addresses.
    pub(crate) fn op_cpobj(&mut self, _class_token: Token) -> Result<(), RuntimeError> {
        let src = self.pop_address()?;
        let dst = self.pop_address()?;
        let value = self.read_address(src)?;
        self.write_address(dst, value)
    }
}
