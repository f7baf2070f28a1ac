use core::fmt;

/// Kind tag of a variable slot. The numeric values travel on the wire inside
/// method signatures and field declarations; bit 4 marks 8-byte-wide kinds
/// and bit 7 is reserved for the static-member flag (see
/// [`VariableKind::STATIC_FLAG`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum VariableKind {
    /// The slot contains no data.
    Void = 0,
    /// Unsigned 32-bit integer.
    Uint32 = 1,
    /// Signed 32-bit integer.
    Int32 = 2,
    /// True or false.
    Boolean = 3,
    /// Reference to a managed object.
    Object = 4,
    /// A method handle.
    Method = 5,
    /// Reference to an array of value types stored inline.
    ValueArray = 6,
    /// Reference to an array of reference types.
    ReferenceArray = 7,
    /// 32-bit IEEE float.
    Float = 8,
    /// A value type larger than 8 bytes, stored in the slot's tail buffer.
    LargeValueType = 9,
    /// Signed 64-bit integer.
    Int64 = 17,
    /// Unsigned 64-bit integer.
    Uint64 = 18,
    /// 64-bit IEEE float.
    Double = 20,
    /// A pointer to a constant initializer.
    RuntimeFieldHandle = 33,
    /// A type handle; the value is a type token.
    RuntimeTypeHandle = 34,
    /// Address of a slot on some frame's stack, locals or argument list,
    /// or of a field or array element (obtained by `ldloca`, `ldarga`,
    /// `ldflda`, `ldelema` or `ldsflda`).
    AddressOfVariable = 35,
    /// A function pointer (obtained by `ldftn`/`ldvirtftn`).
    FunctionPointer = 36,
    /// An opaque handle owned by a native method.
    NativeHandle = 37,
}

impl VariableKind {
    /// Bit or'ed onto the kind byte of field declarations to mark static
    /// members.
    pub const STATIC_FLAG: u8 = 0x80;

    /// Decode a wire kind byte, separating the static-member flag.
    /// Returns `None` for bytes that map to no kind.
    pub fn from_wire(byte: u8) -> Option<(Self, bool)> {
        use strum::IntoEnumIterator;
        let is_static = byte & Self::STATIC_FLAG != 0;
        let raw = byte & !Self::STATIC_FLAG;
        Self::iter().find(|k| *k as u8 == raw).map(|k| (k, is_static))
    }

    /// True for kinds whose payload is a managed reference. These always
    /// occupy exactly one pointer.
    pub const fn is_reference(&self) -> bool {
        matches!(
            self,
            Self::Object | Self::ValueArray | Self::ReferenceArray | Self::AddressOfVariable
        )
    }

    /// Default payload width in bytes when the declaration carries no
    /// explicit size: pointer-sized for references, 8 for kinds with bit 4
    /// set, 4 otherwise.
    pub const fn default_size(&self) -> u16 {
        if self.is_reference() {
            return core::mem::size_of::<u32>() as u16;
        }
        if (*self as u8) & 16 != 0 {
            8
        } else {
            4
        }
    }
}

impl fmt::Display for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn wire_round_trip() {
        for kind in VariableKind::iter() {
            assert_eq!(VariableKind::from_wire(kind as u8), Some((kind, false)));
            let flagged = kind as u8 | VariableKind::STATIC_FLAG;
            assert_eq!(VariableKind::from_wire(flagged), Some((kind, true)));
        }
        assert_eq!(VariableKind::from_wire(99), None);
    }

    #[test]
    fn wide_kinds_have_bit_four() {
        assert_eq!(VariableKind::Int64.default_size(), 8);
        assert_eq!(VariableKind::Uint64.default_size(), 8);
        assert_eq!(VariableKind::Double.default_size(), 8);
        assert_eq!(VariableKind::Int32.default_size(), 4);
        assert_eq!(VariableKind::Object.default_size(), 4);
    }
}
