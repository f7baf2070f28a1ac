//! Variable slots: the tagged values flowing through operand stacks, locals,
//! arguments, statics and object fields.

use microclr_asm::{Token, VariableKind};

use crate::consts::*;
use crate::error::EngineFault;
use crate::gc::ObjRef;

/// Address of a slot living outside the operand stack, produced by
/// `ldloca`/`ldarga`/`ldsflda`/`ldflda`/`ldelema`. The engine owns all
/// frames, so addresses are handles rather than raw pointers; the garbage
/// collector does not follow them because the addressed storage is always
/// reachable through its owner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlotAddress {
    /// A local slot of some frame.
    Local {
        /// Frame index within the task (0 is the root frame).
        frame: usize,
        /// Local index.
        index: usize,
    },
    /// An argument slot of some frame.
    Argument {
        /// Frame index within the task.
        frame: usize,
        /// Argument index (0 is `this` for instance methods).
        index: usize,
    },
    /// A static slot, keyed by field token.
    Static(Token),
    /// A field inside a managed object.
    Field {
        /// The containing object.
        obj: ObjRef,
        /// Byte offset of the field past the object header.
        offset: u16,
        /// Field layout.
        kind: VariableKind,
        /// Field width in bytes.
        size: u16,
    },
    /// An element of a managed array.
    Element {
        /// The containing array.
        obj: ObjRef,
        /// Element index.
        index: u32,
        /// Element layout.
        kind: VariableKind,
        /// Element width in bytes.
        size: u16,
    },
}

/// The payload of a variable slot. One variant per [`VariableKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No data.
    Empty,
    /// Unsigned 32-bit integer.
    Uint32(u32),
    /// Signed 32-bit integer.
    Int32(i32),
    /// True or false.
    Boolean(bool),
    /// Object reference; `None` is the null reference.
    Object(Option<ObjRef>),
    /// A method handle.
    Method(Token),
    /// Reference to an array of value types.
    ValueArray(Option<ObjRef>),
    /// Reference to an array of reference types.
    ReferenceArray(Option<ObjRef>),
    /// 32-bit float.
    Float(f32),
    /// A value type wider than 8 bytes, carried in a tail buffer owned by
    /// this slot.
    LargeValue(Box<[u8]>),
    /// Signed 64-bit integer.
    Int64(i64),
    /// Unsigned 64-bit integer.
    Uint64(u64),
    /// 64-bit float.
    Double(f64),
    /// A pointer to a constant initializer.
    FieldHandle(Token),
    /// A type handle.
    TypeHandle(Token),
    /// Address of another slot.
    Address(SlotAddress),
    /// A function pointer.
    FunctionPointer(Token),
    /// An opaque native handle.
    NativeHandle(u32),
}

impl Value {
    /// The kind tag of this payload.
    pub const fn kind(&self) -> VariableKind {
        match self {
            Self::Empty => VariableKind::Void,
            Self::Uint32(_) => VariableKind::Uint32,
            Self::Int32(_) => VariableKind::Int32,
            Self::Boolean(_) => VariableKind::Boolean,
            Self::Object(_) => VariableKind::Object,
            Self::Method(_) => VariableKind::Method,
            Self::ValueArray(_) => VariableKind::ValueArray,
            Self::ReferenceArray(_) => VariableKind::ReferenceArray,
            Self::Float(_) => VariableKind::Float,
            Self::LargeValue(_) => VariableKind::LargeValueType,
            Self::Int64(_) => VariableKind::Int64,
            Self::Uint64(_) => VariableKind::Uint64,
            Self::Double(_) => VariableKind::Double,
            Self::FieldHandle(_) => VariableKind::RuntimeFieldHandle,
            Self::TypeHandle(_) => VariableKind::RuntimeTypeHandle,
            Self::Address(_) => VariableKind::AddressOfVariable,
            Self::FunctionPointer(_) => VariableKind::FunctionPointer,
            Self::NativeHandle(_) => VariableKind::NativeHandle,
        }
    }
}

/// Declaration of a slot without its data: kind, explicit size and the
/// static-member flag. Used for field, local and argument descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableDescription {
    /// Kind tag.
    pub kind: VariableKind,
    /// Explicit payload width; 0 means "infer from the kind".
    pub size: u16,
    /// Set on static field declarations.
    pub is_static: bool,
}

impl VariableDescription {
    /// A description with an inferred size.
    pub const fn new(kind: VariableKind) -> Self {
        Self {
            kind,
            size: 0,
            is_static: false,
        }
    }

    /// A description with an explicit size.
    pub const fn sized(kind: VariableKind, size: u16) -> Self {
        Self {
            kind,
            size,
            is_static: false,
        }
    }

    /// Effective width in bytes: pointer-sized for references, the explicit
    /// size if set, 8 for kinds with bit 4 set, 4 otherwise.
    pub const fn field_size(&self) -> u16 {
        if self.kind.is_reference() {
            return POINTER_SIZE as u16;
        }
        if self.size != 0 {
            return self.size;
        }
        self.kind.default_size()
    }

    /// Decode a `(kind, size)` descriptor pair from the wire.
    pub fn from_wire(kind_byte: u8, size: u16) -> Option<Self> {
        let (kind, is_static) = VariableKind::from_wire(kind_byte)?;
        Some(Self {
            kind,
            size,
            is_static,
        })
    }

    /// Encode the kind byte including the static flag.
    pub const fn wire_kind(&self) -> u8 {
        let mut b = self.kind as u8;
        if self.is_static {
            b |= VariableKind::STATIC_FLAG;
        }
        b
    }
}

/// A variable slot: marker, explicit size and the tagged payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    marker: u8,
    size: u16,
    /// The payload.
    pub value: Value,
}

impl Variable {
    /// An ordinary slot carrying `value`, size inferred.
    pub const fn new(value: Value) -> Self {
        Self {
            marker: VARIABLE_DEFAULT_MARKER,
            size: 0,
            value,
        }
    }

    /// An empty (void) slot.
    pub const fn empty() -> Self {
        Self::new(Value::Empty)
    }

    /// The null object reference.
    pub const fn null() -> Self {
        Self::new(Value::Object(None))
    }

    /// A zero-initialised slot matching a declaration. Large value types get
    /// a zeroed tail buffer of the declared size.
    pub fn zero_of(desc: &VariableDescription) -> Self {
        let value = match desc.kind {
            VariableKind::Void => Value::Empty,
            VariableKind::Uint32 => Value::Uint32(0),
            VariableKind::Int32 => Value::Int32(0),
            VariableKind::Boolean => Value::Boolean(false),
            VariableKind::Object => Value::Object(None),
            VariableKind::Method => Value::Method(0),
            VariableKind::ValueArray => Value::ValueArray(None),
            VariableKind::ReferenceArray => Value::ReferenceArray(None),
            VariableKind::Float => Value::Float(0.0),
            VariableKind::LargeValueType => {
                Value::LargeValue(vec![0u8; desc.field_size() as usize].into_boxed_slice())
            }
            VariableKind::Int64 => Value::Int64(0),
            VariableKind::Uint64 => Value::Uint64(0),
            VariableKind::Double => Value::Double(0.0),
            VariableKind::RuntimeFieldHandle => Value::FieldHandle(0),
            VariableKind::RuntimeTypeHandle => Value::TypeHandle(0),
            VariableKind::AddressOfVariable => Value::Object(None),
            VariableKind::FunctionPointer => Value::FunctionPointer(0),
            VariableKind::NativeHandle => Value::NativeHandle(0),
        };
        Self {
            marker: VARIABLE_DEFAULT_MARKER,
            size: desc.size,
            value,
        }
    }

    /// The kind tag of the payload.
    pub const fn kind(&self) -> VariableKind {
        self.value.kind()
    }

    /// The marker byte.
    pub const fn marker(&self) -> u8 {
        self.marker
    }

    /// Payload width in bytes: pointer-sized for references, the explicit or
    /// tail-buffer size for large values, 8 for wide kinds, 4 otherwise.
    pub fn field_size(&self) -> u16 {
        if self.kind().is_reference() {
            return POINTER_SIZE as u16;
        }
        if let Value::LargeValue(bytes) = &self.value {
            return bytes.len() as u16;
        }
        if self.size != 0 {
            return self.size;
        }
        self.kind().default_size()
    }

    /// Overwrite this slot with `other`. Two large-value slots must agree on
    /// their tail-buffer size; any other combination simply replaces the
    /// payload (the slot adopts the source kind, as assignment does on the
    /// original engine).
    pub fn assign(&mut self, other: Variable) -> Result<(), EngineFault> {
        if let (Value::LargeValue(dst), Value::LargeValue(src)) = (&self.value, &other.value) {
            if dst.len() != src.len() && self.marker != VARIABLE_DECLARATION_MARKER {
                return Err(EngineFault::MemoryCorruption("large value size mismatch"));
            }
        }
        self.size = other.size;
        self.value = other.value;
        Ok(())
    }

    /// The managed reference held by this slot, if its kind is a reference.
    pub const fn heap_ref(&self) -> Option<ObjRef> {
        match &self.value {
            Value::Object(r) | Value::ValueArray(r) | Value::ReferenceArray(r) => *r,
            _ => None,
        }
    }

    /// Truthiness for `brtrue`/`brfalse`: non-zero integer or non-null
    /// reference.
    pub fn is_true(&self) -> bool {
        match &self.value {
            Value::Empty => false,
            Value::Uint32(v) => *v != 0,
            Value::Int32(v) => *v != 0,
            Value::Boolean(v) => *v,
            Value::Object(r) | Value::ValueArray(r) | Value::ReferenceArray(r) => r.is_some(),
            Value::Method(t) | Value::FunctionPointer(t) => *t != 0,
            Value::Float(v) => *v != 0.0,
            Value::LargeValue(bytes) => bytes.iter().any(|b| *b != 0),
            Value::Int64(v) => *v != 0,
            Value::Uint64(v) => *v != 0,
            Value::Double(v) => *v != 0.0,
            Value::FieldHandle(t) | Value::TypeHandle(t) => *t != 0,
            Value::Address(_) => true,
            Value::NativeHandle(v) => *v != 0,
        }
    }

    /// The integer payload widened to 64 bits with its own signedness.
    /// `None` for non-integer kinds.
    pub fn as_i64(&self) -> Option<i64> {
        match &self.value {
            Value::Uint32(v) => Some(*v as i64),
            Value::Int32(v) => Some(*v as i64),
            Value::Boolean(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            Value::Uint64(v) => Some(*v as i64),
            Value::NativeHandle(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// The float payload widened to 64 bits. `None` for non-float kinds.
    pub fn as_f64(&self) -> Option<f64> {
        match &self.value {
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Serialize the payload for the wire: little-endian bytes of
    /// `field_size` length. References encode their packed handle.
    pub fn payload_bytes(&self) -> Vec<u8> {
        match &self.value {
            Value::Empty => Vec::new(),
            Value::Uint32(v) => v.to_le_bytes().to_vec(),
            Value::Int32(v) => v.to_le_bytes().to_vec(),
            Value::Boolean(v) => (*v as u32).to_le_bytes().to_vec(),
            Value::Object(r) | Value::ValueArray(r) | Value::ReferenceArray(r) => {
                r.map(ObjRef::to_word).unwrap_or(0).to_le_bytes().to_vec()
            }
            Value::Method(t) | Value::FunctionPointer(t) => t.to_le_bytes().to_vec(),
            Value::Float(v) => v.to_bits().to_le_bytes().to_vec(),
            Value::LargeValue(bytes) => bytes.to_vec(),
            Value::Int64(v) => v.to_le_bytes().to_vec(),
            Value::Uint64(v) => v.to_le_bytes().to_vec(),
            Value::Double(v) => v.to_bits().to_le_bytes().to_vec(),
            Value::FieldHandle(t) | Value::TypeHandle(t) => t.to_le_bytes().to_vec(),
            Value::Address(_) => 0u32.to_le_bytes().to_vec(),
            Value::NativeHandle(v) => v.to_le_bytes().to_vec(),
        }
    }
}

impl From<i32> for Variable {
    fn from(v: i32) -> Self {
        Self::new(Value::Int32(v))
    }
}

impl From<u32> for Variable {
    fn from(v: u32) -> Self {
        Self::new(Value::Uint32(v))
    }
}

impl From<bool> for Variable {
    fn from(v: bool) -> Self {
        Self::new(Value::Boolean(v))
    }
}

impl From<i64> for Variable {
    fn from(v: i64) -> Self {
        Self::new(Value::Int64(v))
    }
}

impl From<u64> for Variable {
    fn from(v: u64) -> Self {
        Self::new(Value::Uint64(v))
    }
}

impl From<f32> for Variable {
    fn from(v: f32) -> Self {
        Self::new(Value::Float(v))
    }
}

impl From<f64> for Variable {
    fn from(v: f64) -> Self {
        Self::new(Value::Double(v))
    }
}

impl From<ObjRef> for Variable {
    fn from(r: ObjRef) -> Self {
        Self::new(Value::Object(Some(r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_kinds_are_pointer_sized() {
        assert_eq!(Variable::null().field_size() as usize, POINTER_SIZE);
        let addr = Variable::new(Value::Address(SlotAddress::Static(1)));
        assert_eq!(addr.field_size() as usize, POINTER_SIZE);
    }

    #[test]
    fn wide_kinds_are_eight_bytes() {
        assert_eq!(Variable::from(1i64).field_size(), 8);
        assert_eq!(Variable::from(1u64).field_size(), 8);
        assert_eq!(Variable::from(1f64).field_size(), 8);
        assert_eq!(Variable::from(1i32).field_size(), 4);
        assert_eq!(Variable::from(1f32).field_size(), 4);
    }

    #[test]
    fn large_value_size_tracks_tail_buffer() {
        let desc = VariableDescription::sized(VariableKind::LargeValueType, 24);
        let v = Variable::zero_of(&desc);
        assert_eq!(v.field_size(), 24);
        assert_eq!(v.payload_bytes().len(), 24);
    }

    #[test]
    fn mismatched_large_assignment_is_rejected() {
        let mut a = Variable::zero_of(&VariableDescription::sized(VariableKind::LargeValueType, 16));
        let b = Variable::zero_of(&VariableDescription::sized(VariableKind::LargeValueType, 24));
        assert!(a.assign(b).is_err());
    }

    #[test]
    fn truthiness() {
        assert!(Variable::from(1i32).is_true());
        assert!(!Variable::from(0i32).is_true());
        assert!(!Variable::null().is_true());
    }
}
