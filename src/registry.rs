//! The special-token registry: which concrete metadata tokens denote the
//! built-in types (Object, Array, String, the system-exception classes).

use microclr_asm::{KnownTypeToken, SystemException, Token};

use crate::error::EngineFault;
use crate::flash::ImageReader;

/// Host-installed mapping from well-known slots to metadata tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    entries: Vec<(KnownTypeToken, Token)>,
}

impl SpecialTokens {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install one slot. A later entry for the same slot wins.
    pub fn insert(&mut self, slot: KnownTypeToken, token: Token) {
        self.entries.retain(|(s, _)| *s != slot);
        if slot != KnownTypeToken::None {
            self.entries.push((slot, token));
        }
    }

    /// The token assigned to `slot`, if any.
    pub fn get(&self, slot: KnownTypeToken) -> Option<Token> {
        self.entries.iter().find(|(s, _)| *s == slot).map(|(_, t)| *t)
    }

    /// The class token used to materialise an engine-raised exception.
    /// Unregistered kinds yield no managed class; such exceptions cannot be
    /// caught by typed clauses.
    pub fn exception_token(&self, kind: SystemException) -> Option<Token> {
        let slot = match kind {
            SystemException::NullReference => KnownTypeToken::NullReferenceException,
            SystemException::InvalidCast => KnownTypeToken::InvalidCastException,
            SystemException::IndexOutOfRange => KnownTypeToken::IndexOutOfRangeException,
            SystemException::Overflow => KnownTypeToken::OverflowException,
            SystemException::DivideByZero => KnownTypeToken::DivideByZeroException,
            SystemException::ArrayTypeMismatch => KnownTypeToken::ArrayTypeMismatchException,
            SystemException::InvalidOperation => KnownTypeToken::InvalidOperationException,
            SystemException::MissingMethod => KnownTypeToken::MissingMethodException,
            SystemException::NotSupported => KnownTypeToken::NotSupportedException,
            SystemException::OutOfMemory => KnownTypeToken::OutOfMemoryException,
            SystemException::Io => KnownTypeToken::IoException,
            _ => return None,
        };
        self.get(slot)
    }

    /// Drop every installed slot.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Serialize for the flash image: count, then `(slot, token)` pairs.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (slot, token) in &self.entries {
            out.extend_from_slice(&(*slot as u32).to_le_bytes());
            out.extend_from_slice(&token.to_le_bytes());
        }
    }

    /// Decode from the flash image.
    pub fn read_from(reader: &mut ImageReader<'_>) -> Result<Self, EngineFault> {
        let count = reader.read_u32()? as usize;
        let mut registry = Self::new();
        for _ in 0..count {
            let slot = KnownTypeToken::from_u32(reader.read_u32()?);
            let token = reader.read_u32()?;
            registry.insert(slot, token);
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_resolve_and_shadow() {
        let mut reg = SpecialTokens::new();
        reg.insert(KnownTypeToken::String, 0x0200_0004);
        reg.insert(KnownTypeToken::String, 0x0200_0014);
        assert_eq!(reg.get(KnownTypeToken::String), Some(0x0200_0014));
        assert_eq!(reg.get(KnownTypeToken::Array), None);
    }

    #[test]
    fn exception_kinds_map_to_registered_classes() {
        let mut reg = SpecialTokens::new();
        reg.insert(KnownTypeToken::DivideByZeroException, 0x0200_0040);
        assert_eq!(
            reg.exception_token(SystemException::DivideByZero),
            Some(0x0200_0040)
        );
        assert_eq!(reg.exception_token(SystemException::NullReference), None);
        assert_eq!(reg.exception_token(SystemException::CustomException), None);
    }
}
