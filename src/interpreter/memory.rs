//! Typed access to managed storage: object fields, array elements, statics
//! and the indirect-load/store family working through slot addresses.

use super::Interpreter;
use crate::consts::*;
use crate::error::{EngineFault, RuntimeError};
use crate::gc::ObjRef;
use crate::value::{SlotAddress, Value, Variable, VariableDescription};

use microclr_asm::{SystemException, Token, VariableKind};

impl<F, H> Interpreter<F, H> {
    /// Read a value of the given layout from an object payload.
    pub(crate) fn heap_read(
        &self,
        obj: ObjRef,
        offset: usize,
        kind: VariableKind,
        size: u16,
    ) -> Result<Variable, RuntimeError> {
        let payload = self.gc.payload(obj)?;
        let size = size as usize;
        let bytes = payload
            .get(offset..offset + size.max(1))
            .ok_or(EngineFault::MemoryCorruption("field read past object end"))?;

        let word = |n: usize| -> u64 {
            let mut buf = [0u8; 8];
            buf[..n].copy_from_slice(&bytes[..n]);
            u64::from_le_bytes(buf)
        };

        let value = match kind {
            VariableKind::Void => Value::Empty,
            VariableKind::Uint32 => Value::Uint32(word(size.min(4)) as u32),
            VariableKind::Boolean => Value::Boolean(word(1) != 0),
            VariableKind::Int32 => {
                // Narrow fields are sign-extended on load.
                let raw = word(size.min(4).max(1));
                let shift = 64 - 8 * size.clamp(1, 4);
                Value::Int32(((raw << shift) as i64 >> shift) as i32)
            }
            VariableKind::Object => Value::Object(ObjRef::from_word(word(4) as u32)),
            VariableKind::ValueArray => Value::ValueArray(ObjRef::from_word(word(4) as u32)),
            VariableKind::ReferenceArray => {
                Value::ReferenceArray(ObjRef::from_word(word(4) as u32))
            }
            VariableKind::Method => Value::Method(word(4) as u32),
            VariableKind::Float => Value::Float(f32::from_bits(word(4) as u32)),
            VariableKind::LargeValueType => Value::LargeValue(bytes.to_vec().into_boxed_slice()),
            VariableKind::Int64 => Value::Int64(word(8) as i64),
            VariableKind::Uint64 => Value::Uint64(word(8)),
            VariableKind::Double => Value::Double(f64::from_bits(word(8))),
            VariableKind::RuntimeFieldHandle => Value::FieldHandle(word(4) as u32),
            VariableKind::RuntimeTypeHandle => Value::TypeHandle(word(4) as u32),
            VariableKind::FunctionPointer => Value::FunctionPointer(word(4) as u32),
            VariableKind::NativeHandle => Value::NativeHandle(word(4) as u32),
            VariableKind::AddressOfVariable => {
                return Err(EngineFault::MemoryCorruption("address stored in object").into())
            }
        };
        Ok(Variable::new(value))
    }

    /// Write a slot into an object payload with the given layout.
    pub(crate) fn heap_write(
        &mut self,
        obj: ObjRef,
        offset: usize,
        kind: VariableKind,
        size: u16,
        value: &Variable,
    ) -> Result<(), RuntimeError> {
        let size = size as usize;
        let bytes: Vec<u8> = match kind {
            VariableKind::Object | VariableKind::ValueArray | VariableKind::ReferenceArray => {
                let word = value.heap_ref().map(ObjRef::to_word).unwrap_or(0);
                word.to_le_bytes().to_vec()
            }
            VariableKind::Float => match &value.value {
                Value::Float(f) => f.to_bits().to_le_bytes().to_vec(),
                _ => (value.as_f64().unwrap_or(0.0) as f32).to_bits().to_le_bytes().to_vec(),
            },
            VariableKind::Double => {
                let d = value.as_f64().unwrap_or(0.0);
                d.to_bits().to_le_bytes().to_vec()
            }
            VariableKind::LargeValueType => match &value.value {
                Value::LargeValue(b) => b.to_vec(),
                _ => value.payload_bytes(),
            },
            _ => {
                let raw = value
                    .as_i64()
                    .unwrap_or_else(|| value.as_f64().unwrap_or(0.0) as i64);
                raw.to_le_bytes().to_vec()
            }
        };

        let n = size.max(1).min(bytes.len());
        let payload = self.gc.payload_mut(obj)?;
        let target = payload
            .get_mut(offset..offset + n)
            .ok_or(EngineFault::MemoryCorruption("field write past object end"))?;
        target.copy_from_slice(&bytes[..n]);
        Ok(())
    }

    /// Load the value behind a slot address.
    pub(crate) fn read_address(&self, address: SlotAddress) -> Result<Variable, RuntimeError> {
        match address {
            SlotAddress::Local { frame, index } => {
                let task = self.task_ref()?;
                task.frames
                    .get(frame)
                    .and_then(|f| f.locals.get(index))
                    .cloned()
                    .ok_or_else(|| EngineFault::MemoryCorruption("stale local address").into())
            }
            SlotAddress::Argument { frame, index } => {
                let task = self.task_ref()?;
                task.frames
                    .get(frame)
                    .and_then(|f| f.arguments.get(index))
                    .cloned()
                    .ok_or_else(|| EngineFault::MemoryCorruption("stale argument address").into())
            }
            SlotAddress::Static(token) => Ok(self.static_value(token)),
            SlotAddress::Field { obj, offset, kind, size } => {
                self.heap_read(obj, OBJECT_HEADER_SIZE + offset as usize, kind, size)
            }
            SlotAddress::Element { obj, index, kind, size } => {
                let offset = ARRAY_DATA_OFFSET + index as usize * size.max(1) as usize;
                self.heap_read(obj, offset, kind, size)
            }
        }
    }

    /// Store a value through a slot address.
    pub(crate) fn write_address(
        &mut self,
        address: SlotAddress,
        value: Variable,
    ) -> Result<(), RuntimeError> {
        match address {
            SlotAddress::Local { frame, index } => {
                let task = self.task_mut()?;
                let slot = task
                    .frames
                    .get_mut(frame)
                    .and_then(|f| f.locals.get_mut(index))
                    .ok_or(EngineFault::MemoryCorruption("stale local address"))?;
                slot.assign(value)?;
                Ok(())
            }
            SlotAddress::Argument { frame, index } => {
                let task = self.task_mut()?;
                let slot = task
                    .frames
                    .get_mut(frame)
                    .and_then(|f| f.arguments.get_mut(index))
                    .ok_or(EngineFault::MemoryCorruption("stale argument address"))?;
                slot.assign(value)?;
                Ok(())
            }
            SlotAddress::Static(token) => {
                self.statics.insert(token, value);
                Ok(())
            }
            SlotAddress::Field { obj, offset, kind, size } => {
                self.heap_write(obj, OBJECT_HEADER_SIZE + offset as usize, kind, size, &value)
            }
            SlotAddress::Element { obj, index, kind, size } => {
                let offset = ARRAY_DATA_OFFSET + index as usize * size.max(1) as usize;
                self.heap_write(obj, offset, kind, size, &value)
            }
        }
    }

    /// The current value of a static slot; never-written slots read as the
    /// declared zero value.
    pub(crate) fn static_value(&self, token: Token) -> Variable {
        if let Some(value) = self.statics.get(&token) {
            return value.clone();
        }
        match self.find_static_desc(token) {
            Some(desc) => Variable::zero_of(&desc),
            None => Variable::empty(),
        }
    }

    /// `ldfld`-family resolution: the receiver may be an object reference,
    /// a slot address, or an inline value type sitting on the stack.
    pub(crate) fn op_ldfld(&mut self, field_token: Token, as_address: bool) -> Result<(), RuntimeError> {
        let receiver = self.pop()?;
        let (offset, desc) = self
            .field_layout_for(&receiver, field_token)?
            .ok_or_else(|| RuntimeError::exception(SystemException::FieldAccess, field_token))?;

        match (&receiver.value, as_address) {
            (Value::Object(None), _) => {
                Err(RuntimeError::exception(SystemException::NullReference, field_token))
            }
            (Value::Object(Some(obj)), true) => {
                let address = SlotAddress::Field {
                    obj: *obj,
                    offset,
                    kind: desc.kind,
                    size: desc.field_size(),
                };
                self.push(Variable::new(Value::Address(address)))?;
                Ok(())
            }
            (Value::Object(Some(obj)), false) => {
                let value = self.heap_read(
                    *obj,
                    OBJECT_HEADER_SIZE + offset as usize,
                    desc.kind,
                    desc.field_size(),
                )?;
                self.push(value)?;
                Ok(())
            }
            (Value::Address(address), _) => {
                let base = *address;
                if as_address {
                    // Address of a field of an addressed value: only heap
                    // targets can be re-addressed.
                    match base {
                        SlotAddress::Field { obj, offset: base_offset, .. } => {
                            let address = SlotAddress::Field {
                                obj,
                                offset: base_offset + offset,
                                kind: desc.kind,
                                size: desc.field_size(),
                            };
                            self.push(Variable::new(Value::Address(address)))?;
                            Ok(())
                        }
                        _ => Err(RuntimeError::exception(
                            SystemException::NotSupported,
                            field_token,
                        )),
                    }
                } else {
                    let container = self.read_address(base)?;
                    let value = self.value_type_field(&container, offset, &desc)?;
                    self.push(value)?;
                    Ok(())
                }
            }
            (Value::LargeValue(_), false) => {
                let value = self.value_type_field(&receiver, offset, &desc)?;
                self.push(value)?;
                Ok(())
            }
            _ => Err(RuntimeError::exception(SystemException::NotSupported, field_token)),
        }
    }

    /// `stfld`: value and receiver are popped; the receiver may be an
    /// object reference or a slot address of a value type.
    pub(crate) fn op_stfld(&mut self, field_token: Token) -> Result<(), RuntimeError> {
        let value = self.pop()?;
        let receiver = self.pop()?;
        let (offset, desc) = self
            .field_layout_for(&receiver, field_token)?
            .ok_or_else(|| RuntimeError::exception(SystemException::FieldAccess, field_token))?;

        match &receiver.value {
            Value::Object(None) => {
                Err(RuntimeError::exception(SystemException::NullReference, field_token))
            }
            Value::Object(Some(obj)) => self.heap_write(
                *obj,
                OBJECT_HEADER_SIZE + offset as usize,
                desc.kind,
                desc.field_size(),
                &value,
            ),
            Value::Address(address) => match address {
                SlotAddress::Field { obj, offset: base, .. } => self.heap_write(
                    *obj,
                    OBJECT_HEADER_SIZE + (*base + offset) as usize,
                    desc.kind,
                    desc.field_size(),
                    &value,
                ),
                address => {
                    let mut container = self.read_address(*address)?;
                    self.store_value_type_field(&mut container, offset, &desc, &value)?;
                    self.write_address(*address, container)
                }
            },
            _ => Err(RuntimeError::exception(SystemException::NotSupported, field_token)),
        }
    }

    /// Field layout resolution: by the receiver's dynamic class when it is
    /// an object, falling back to the declaring class found by token.
    fn field_layout_for(
        &self,
        receiver: &Variable,
        field_token: Token,
    ) -> Result<Option<(u16, VariableDescription)>, RuntimeError> {
        if let Value::Object(Some(obj)) = &receiver.value {
            let class_token = self.gc.class_token(*obj)?;
            let mut current = class_token;
            let mut hops = 0;
            while current != 0 && hops < 64 {
                let Some(class) = self.classes.get_by_key(current) else { break };
                if let Some((offset, field)) = class.field_offset(field_token) {
                    return Ok(Some((offset, field.desc)));
                }
                current = class.parent_token;
                hops += 1;
            }
        }
        Ok(self.find_field(field_token).map(|(_, offset, desc)| (offset, desc)))
    }

    /// Extract a field from an inline value-type payload.
    fn value_type_field(
        &self,
        container: &Variable,
        offset: u16,
        desc: &VariableDescription,
    ) -> Result<Variable, RuntimeError> {
        match &container.value {
            Value::LargeValue(bytes) => {
                let offset = offset as usize;
                let size = desc.field_size() as usize;
                let slice = bytes
                    .get(offset..offset + size)
                    .ok_or(EngineFault::MemoryCorruption("field outside value type"))?;
                let mut boxed = Variable::zero_of(desc);
                let mut buf = [0u8; 8];
                buf[..size.min(8)].copy_from_slice(&slice[..size.min(8)]);
                let word = u64::from_le_bytes(buf);
                boxed.value = match desc.kind {
                    VariableKind::Int32 => Value::Int32(word as i32),
                    VariableKind::Uint32 => Value::Uint32(word as u32),
                    VariableKind::Boolean => Value::Boolean(word != 0),
                    VariableKind::Int64 => Value::Int64(word as i64),
                    VariableKind::Uint64 => Value::Uint64(word),
                    VariableKind::Float => Value::Float(f32::from_bits(word as u32)),
                    VariableKind::Double => Value::Double(f64::from_bits(word)),
                    VariableKind::Object => Value::Object(ObjRef::from_word(word as u32)),
                    VariableKind::ValueArray => Value::ValueArray(ObjRef::from_word(word as u32)),
                    VariableKind::ReferenceArray => {
                        Value::ReferenceArray(ObjRef::from_word(word as u32))
                    }
                    VariableKind::LargeValueType => {
                        Value::LargeValue(slice.to_vec().into_boxed_slice())
                    }
                    _ => Value::Uint32(word as u32),
                };
                Ok(boxed)
            }
            // A single-field value type is carried unwrapped; field 0 is
            // the container itself.
            _ if offset == 0 => Ok(container.clone()),
            _ => Err(EngineFault::MemoryCorruption("field access on scalar").into()),
        }
    }

    fn store_value_type_field(
        &self,
        container: &mut Variable,
        offset: u16,
        desc: &VariableDescription,
        value: &Variable,
    ) -> Result<(), RuntimeError> {
        match &mut container.value {
            Value::LargeValue(bytes) => {
                let offset = offset as usize;
                let size = desc.field_size() as usize;
                let payload = value.payload_bytes();
                let n = size.min(payload.len());
                let slice = bytes
                    .get_mut(offset..offset + n)
                    .ok_or(EngineFault::MemoryCorruption("field outside value type"))?;
                slice.copy_from_slice(&payload[..n]);
                Ok(())
            }
            _ if offset == 0 => {
                container.assign(value.clone())?;
                Ok(())
            }
            _ => Err(EngineFault::MemoryCorruption("field store on scalar").into()),
        }
    }

    /// `ldind.*`: pop an address, load through it and coerce to the
    /// requested width.
    pub(crate) fn op_ldind(&mut self, kind: VariableKind, size: u16) -> Result<(), RuntimeError> {
        let address = self.pop_address()?;
        let loaded = self.read_address(address)?;
        let coerced = coerce_indirect(loaded, kind, size);
        self.push(coerced)?;
        Ok(())
    }

    /// `stind.*`: value then address are popped.
    pub(crate) fn op_stind(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop()?;
        let address = self.pop_address()?;
        self.write_address(address, value)
    }

    /// `ldobj`/`stobj`/`cpobj`/`initobj` all work through addresses with a
    /// class-described layout.
    pub(crate) fn pop_address(&mut self) -> Result<SlotAddress, RuntimeError> {
        let slot = self.pop()?;
        match slot.value {
            Value::Address(address) => Ok(address),
            Value::Object(None) => Err(RuntimeError::exception(
                SystemException::NullReference,
                self.cur_frame()?.method.token,
            )),
            _ => Err(EngineFault::MemoryCorruption("expected an address slot").into()),
        }
    }
}

/// Width coercion applied by `ldind.*`: narrow integers sign- or
/// zero-extend into an Int32 slot.
fn coerce_indirect(value: Variable, kind: VariableKind, size: u16) -> Variable {
    let Some(raw) = value.as_i64() else {
        return value;
    };
    let slot = match (kind, size) {
        (VariableKind::Int32, 1) => Value::Int32(raw as i8 as i32),
        (VariableKind::Int32, 2) => Value::Int32(raw as i16 as i32),
        (VariableKind::Int32, _) => Value::Int32(raw as i32),
        (VariableKind::Uint32, 1) => Value::Int32(raw as u8 as i32),
        (VariableKind::Uint32, 2) => Value::Int32(raw as u16 as i32),
        (VariableKind::Uint32, _) => Value::Uint32(raw as u32),
        (VariableKind::Int64, _) | (VariableKind::Uint64, _) => Value::Int64(raw),
        _ => return value,
    };
    Variable::new(slot)
}
