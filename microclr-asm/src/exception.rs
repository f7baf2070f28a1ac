use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
#[non_exhaustive]
/// Managed exception kinds the engine can raise. All of these are catchable
/// by IL handlers; fatal engine faults are a separate taxonomy
/// (`EngineFault` in the engine crate).
pub enum SystemException {
    /// No exception.
    None = 0,
    /// The call stack exceeded its depth limit.
    StackOverflow = 1,
    /// A null reference was dereferenced.
    NullReference = 2,
    /// A called method was not found in the loaded image.
    MissingMethod = 3,
    /// Integer division by zero.
    DivideByZero = 5,
    /// An array was indexed outside its bounds.
    IndexOutOfRange = 6,
    /// The managed heap is exhausted, even after collection.
    OutOfMemory = 7,
    /// An array element was stored with an incompatible type.
    ArrayTypeMismatch = 8,
    /// The operation is invalid in the current state.
    InvalidOperation = 9,
    /// A class token could not be resolved.
    ClassNotFound = 10,
    /// A cast between incompatible classes.
    InvalidCast = 11,
    /// The operation is not supported by this engine.
    NotSupported = 12,
    /// Wraps a user-constructed managed exception object.
    CustomException = 13,
    /// A field was accessed outside its visibility.
    FieldAccess = 14,
    /// A checked arithmetic operation or conversion overflowed.
    Overflow = 15,
    /// A general arithmetic fault.
    Arithmetic = 16,
    /// An I/O operation failed inside a native method.
    Io = 17,
}

impl fmt::Display for SystemException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for SystemException {}

impl From<u8> for SystemException {
    fn from(b: u8) -> Self {
        use strum::IntoEnumIterator;
        Self::iter().find(|e| *e as u8 == b).unwrap_or(Self::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
/// Kind of an exception-handling clause, matching the ECMA-335 encoding.
pub enum ClauseKind {
    /// A typed catch clause; `filter_token` names the exception class.
    Clause = 0,
    /// A filter clause; `filter_token` is the IL offset of the filter code.
    Filter = 1,
    /// A finally clause, executed on any exit from the try range.
    Finally = 2,
    /// A fault clause, executed only when the try range exits by exception.
    Fault = 4,
}

impl ClauseKind {
    /// Decode a wire clause kind.
    pub const fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Clause),
            1 => Some(Self::Filter),
            2 => Some(Self::Finally),
            4 => Some(Self::Fault),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn exception_byte_round_trip() {
        for exc in SystemException::iter() {
            assert_eq!(SystemException::from(exc as u8), exc);
        }
        // 4 is deliberately unassigned (invalid opcodes are engine faults).
        assert_eq!(SystemException::from(4), SystemException::None);
    }
}
