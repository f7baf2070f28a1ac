//! Metadata tokens as assigned by the host compiler.

/// A 32-bit metadata token. The top byte names the kind of member the token
/// refers to, the lower three bytes are the row id.
pub type Token = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Token kind, taken from the top byte of a [`Token`].
pub enum TokenKind {
    /// `0x01`: a type reference into another assembly.
    TypeRef,
    /// `0x02`: a type defined in the loaded image.
    TypeDef,
    /// `0x04`: a field definition.
    FieldDef,
    /// `0x06`: a method defined in the loaded image.
    MethodDef,
    /// `0x0A`: a member reference that must be remapped before use.
    MemberRef,
    /// `0x70`: an entry in the user-string heap.
    UserString,
    /// Any other top byte.
    Other(u8),
}

/// Classify a token by its top byte.
pub const fn token_kind(token: Token) -> TokenKind {
    match (token >> 24) as u8 {
        0x01 => TokenKind::TypeRef,
        0x02 => TokenKind::TypeDef,
        0x04 => TokenKind::FieldDef,
        0x06 => TokenKind::MethodDef,
        0x0a => TokenKind::MemberRef,
        0x70 => TokenKind::UserString,
        b => TokenKind::Other(b),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
/// Well-known slots in the special-token registry. The host assigns concrete
/// metadata tokens to these slots with the `SpecialTokenList` request so the
/// engine can reason about built-in types without hardcoded token values.
pub enum KnownTypeToken {
    /// Unassigned slot.
    None = 0,
    /// `System.Object`.
    Object = 1,
    /// `System.Type`.
    Type = 2,
    /// `System.ValueType`.
    ValueType = 3,
    /// `System.String`.
    String = 4,
    /// `System.Nullable<T>`.
    Nullable = 7,
    /// `System.Enum`.
    Enum = 8,
    /// `System.Array`. As an array element-type token this means the
    /// elements are themselves reference arrays.
    Array = 9,
    /// `System.Delegate`.
    Delegate = 11,
    /// `System.MulticastDelegate`.
    MulticastDelegate = 12,

    /// `System.NullReferenceException`.
    NullReferenceException = 24,
    /// `System.InvalidCastException`.
    InvalidCastException = 25,
    /// `System.IndexOutOfRangeException`.
    IndexOutOfRangeException = 26,
    /// `System.OverflowException`.
    OverflowException = 27,
    /// `System.DivideByZeroException`.
    DivideByZeroException = 28,
    /// `System.ArrayTypeMismatchException`.
    ArrayTypeMismatchException = 29,
    /// `System.InvalidOperationException`.
    InvalidOperationException = 30,
    /// `System.MissingMethodException`.
    MissingMethodException = 31,
    /// `System.NotSupportedException`.
    NotSupportedException = 32,
    /// `System.OutOfMemoryException`.
    OutOfMemoryException = 33,
    /// `System.IO.IOException`.
    IoException = 34,
}

impl KnownTypeToken {
    /// Decode a registry slot index; unknown indices map to `None`.
    pub fn from_u32(value: u32) -> Self {
        use strum::IntoEnumIterator;
        Self::iter().find(|k| *k as u32 == value).unwrap_or(Self::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_kind_top_byte() {
        assert_eq!(token_kind(0x0600_0001), TokenKind::MethodDef);
        assert_eq!(token_kind(0x0a00_0930), TokenKind::MemberRef);
        assert_eq!(token_kind(0x7000_0001), TokenKind::UserString);
        assert_eq!(token_kind(0x0200_0044), TokenKind::TypeDef);
        assert_eq!(token_kind(0xff00_0000), TokenKind::Other(0xff));
    }

    #[test]
    fn known_type_token_round_trip() {
        use strum::IntoEnumIterator;
        for slot in KnownTypeToken::iter() {
            assert_eq!(KnownTypeToken::from_u32(slot as u32), slot);
        }
        assert_eq!(KnownTypeToken::from_u32(9999), KnownTypeToken::None);
    }
}
