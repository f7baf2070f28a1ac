//! Method bodies and exception clauses.

use microclr_asm::{ClauseKind, MethodFlags, NativeMethod, Token};

use crate::error::EngineFault;
use crate::flash::ImageReader;
use crate::table::TableEntry;
use crate::value::VariableDescription;

/// The executable part of a method: an IL stream, or a native-method tag
/// for built-ins dispatched through the hardware hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodCode {
    /// IL bytes, spliced together by the loader.
    Il(Vec<u8>),
    /// A built-in implementation.
    Native(NativeMethod),
}

/// A method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBody {
    /// The primary (MethodDef) token.
    pub token: Token,
    /// Short reference used by the host protocol while loading.
    pub code_reference: u32,
    /// Attribute bits.
    pub flags: MethodFlags,
    /// Operand-stack depth bound declared by the compiler.
    pub max_stack: u8,
    /// Argument count, including `this` for instance methods.
    pub num_args: u8,
    /// The body.
    pub code: MethodCode,
    /// Local-variable declarations.
    pub locals: Vec<VariableDescription>,
    /// Argument declarations.
    pub args: Vec<VariableDescription>,
    /// Call-site token rewrites: MemberRef tokens seen in this method's IL
    /// mapped to MethodDef tokens resolvable in this image.
    pub token_map: Vec<(Token, Token)>,
}

impl MethodBody {
    /// A stub created by `DeclareMethod`; signatures, IL and clauses are
    /// appended by later requests.
    pub fn stub(code_reference: u32, token: Token, flags: MethodFlags, max_stack: u8, num_args: u8) -> Self {
        Self {
            token,
            code_reference,
            flags,
            max_stack,
            num_args,
            code: MethodCode::Il(Vec::new()),
            locals: Vec::new(),
            args: Vec::new(),
            token_map: Vec::new(),
        }
    }

    /// The IL stream, when this is an IL method.
    pub fn il(&self) -> Option<&[u8]> {
        match &self.code {
            MethodCode::Il(il) => Some(il),
            MethodCode::Native(_) => None,
        }
    }

    /// The native tag, when this is a built-in.
    pub const fn native(&self) -> Option<NativeMethod> {
        match &self.code {
            MethodCode::Native(m) => Some(*m),
            MethodCode::Il(_) => None,
        }
    }

    /// True when the method returns no value.
    pub const fn is_void(&self) -> bool {
        self.flags.contains(MethodFlags::VOID)
    }

    /// True when the method has no `this` argument.
    pub const fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// Rewrite a call-site token through this method's remap table.
    pub fn resolve_call_token(&self, token: Token) -> Token {
        self.token_map
            .iter()
            .find(|(from, _)| *from == token)
            .map(|(_, to)| *to)
            .unwrap_or(token)
    }
}

impl TableEntry for MethodBody {
    fn key(&self) -> u32 {
        self.token
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.token.to_le_bytes());
        out.extend_from_slice(&self.code_reference.to_le_bytes());
        out.push(self.flags.bits());
        out.push(self.max_stack);
        out.push(self.num_args);
        match &self.code {
            MethodCode::Il(il) => {
                out.push(0);
                out.extend_from_slice(&(il.len() as u16).to_le_bytes());
            }
            MethodCode::Native(m) => {
                out.push(1);
                out.extend_from_slice(&(*m as u16).to_le_bytes());
            }
        }
        out.extend_from_slice(&(self.locals.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.args.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.token_map.len() as u16).to_le_bytes());
        for desc in self.locals.iter().chain(self.args.iter()) {
            out.push(desc.wire_kind());
            out.extend_from_slice(&desc.size.to_le_bytes());
        }
        for (from, to) in &self.token_map {
            out.extend_from_slice(&from.to_le_bytes());
            out.extend_from_slice(&to.to_le_bytes());
        }
        if let MethodCode::Il(il) = &self.code {
            out.extend_from_slice(il);
        }
    }

    fn read_from(reader: &mut ImageReader<'_>) -> Result<Self, EngineFault> {
        let token = reader.read_u32()?;
        let code_reference = reader.read_u32()?;
        let flags = MethodFlags::from_bits_truncate(reader.read_u8()?);
        let max_stack = reader.read_u8()?;
        let num_args = reader.read_u8()?;
        let code_tag = reader.read_u8()?;
        let code_word = reader.read_u16()?;
        let local_count = reader.read_u16()? as usize;
        let arg_count = reader.read_u16()? as usize;
        let map_count = reader.read_u16()? as usize;

        let mut read_desc = |reader: &mut ImageReader<'_>| -> Result<VariableDescription, EngineFault> {
            let kind_byte = reader.read_u8()?;
            let size = reader.read_u16()?;
            VariableDescription::from_wire(kind_byte, size)
                .ok_or(EngineFault::FlashCorruption("bad descriptor kind in image"))
        };

        let mut locals = Vec::with_capacity(local_count);
        for _ in 0..local_count {
            locals.push(read_desc(reader)?);
        }
        let mut args = Vec::with_capacity(arg_count);
        for _ in 0..arg_count {
            args.push(read_desc(reader)?);
        }
        let mut token_map = Vec::with_capacity(map_count);
        for _ in 0..map_count {
            token_map.push((reader.read_u32()?, reader.read_u32()?));
        }
        let code = if code_tag == 0 {
            MethodCode::Il(reader.read_bytes(code_word as usize)?.to_vec())
        } else {
            MethodCode::Native(NativeMethod::from(code_word))
        };

        Ok(Self {
            token,
            code_reference,
            flags,
            max_stack,
            num_args,
            code,
            locals,
            args,
            token_map,
        })
    }
}

/// One exception-handling clause. A method carries zero or more, ordered by
/// try offset ascending, innermost first on ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionClause {
    /// The owning method's token.
    pub method_token: Token,
    /// Clause kind.
    pub kind: ClauseKind,
    /// Start of the protected range.
    pub try_offset: u16,
    /// Length of the protected range.
    pub try_length: u16,
    /// Start of the handler region.
    pub handler_offset: u16,
    /// Length of the handler region.
    pub handler_length: u16,
    /// For catch clauses the exception class token; for filter clauses the
    /// IL offset of the filter code.
    pub filter_token: Token,
}

impl ExceptionClause {
    /// True when `pc` lies inside the protected range.
    pub const fn covers(&self, pc: u16) -> bool {
        pc >= self.try_offset && pc < self.try_offset + self.try_length
    }

    /// True when this clause's protected range nests inside `outer`'s.
    pub const fn nested_within(&self, outer: &ExceptionClause) -> bool {
        self.try_offset >= outer.try_offset
            && self.try_offset + self.try_length <= outer.try_offset + outer.try_length
            && !(self.try_offset == outer.try_offset && self.try_length == outer.try_length)
    }
}

impl TableEntry for ExceptionClause {
    const UNIQUE_KEYS: bool = false;

    fn key(&self) -> u32 {
        self.method_token
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.method_token.to_le_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.try_offset.to_le_bytes());
        out.extend_from_slice(&self.try_length.to_le_bytes());
        out.extend_from_slice(&self.handler_offset.to_le_bytes());
        out.extend_from_slice(&self.handler_length.to_le_bytes());
        out.extend_from_slice(&self.filter_token.to_le_bytes());
    }

    fn read_from(reader: &mut ImageReader<'_>) -> Result<Self, EngineFault> {
        let method_token = reader.read_u32()?;
        let kind = ClauseKind::from_u8(reader.read_u8()?)
            .ok_or(EngineFault::FlashCorruption("bad clause kind in image"))?;
        Ok(Self {
            method_token,
            kind,
            try_offset: reader.read_u16()?,
            try_length: reader.read_u16()?,
            handler_offset: reader.read_u16()?,
            handler_length: reader.read_u16()?,
            filter_token: reader.read_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FlashMemoryManager, SimFlashStorage};
    use crate::table::SortedTable;
    use microclr_asm::VariableKind;
    use std::sync::Arc;

    #[test]
    fn remap_table_rewrites_call_sites() {
        let mut m = MethodBody::stub(1, 0x0600_0001, MethodFlags::STATIC, 2, 0);
        m.token_map.push((0x0a00_0005, 0x0600_0009));
        assert_eq!(m.resolve_call_token(0x0a00_0005), 0x0600_0009);
        assert_eq!(m.resolve_call_token(0x0600_0002), 0x0600_0002);
    }

    #[test]
    fn clause_cover_and_nesting() {
        let outer = ExceptionClause {
            method_token: 1,
            kind: ClauseKind::Finally,
            try_offset: 0,
            try_length: 20,
            handler_offset: 20,
            handler_length: 4,
            filter_token: 0,
        };
        let inner = ExceptionClause {
            try_offset: 4,
            try_length: 8,
            ..outer
        };
        assert!(outer.covers(0) && outer.covers(19) && !outer.covers(20));
        assert!(inner.nested_within(&outer));
        assert!(!outer.nested_within(&inner));
        assert!(!outer.nested_within(&outer));
    }

    #[test]
    fn method_freeze_round_trip() {
        let mut m = MethodBody::stub(7, 0x0600_0003, MethodFlags::STATIC | MethodFlags::VOID, 4, 2);
        m.locals.push(VariableDescription::new(VariableKind::Int32));
        m.locals.push(VariableDescription::sized(VariableKind::LargeValueType, 16));
        m.args.push(VariableDescription::new(VariableKind::Int32));
        m.args.push(VariableDescription::new(VariableKind::Object));
        m.token_map.push((0x0a00_0001, 0x0600_0004));
        m.code = MethodCode::Il(vec![0x16, 0x2a]);

        let mut table = SortedTable::new();
        table.insert(Arc::new(m.clone()));
        let mut flash = FlashMemoryManager::new(SimFlashStorage::new(16 * 1024, 512));
        flash.clear().unwrap();
        let root = table.copy_to_flash(&mut flash, "methods").unwrap();

        let mut reloaded = SortedTable::<Arc<MethodBody>>::new();
        reloaded.load_from_flash(flash.reader_at(root)).unwrap();
        assert_eq!(reloaded.get_by_key(m.token).unwrap().as_ref(), &m);
    }

    #[test]
    fn native_method_freeze_round_trip() {
        let mut m = MethodBody::stub(2, 0x0600_0008, MethodFlags::SPECIAL | MethodFlags::STATIC, 0, 1);
        m.code = MethodCode::Native(NativeMethod::EnvironmentTickCount);

        let mut table = SortedTable::new();
        table.insert(m.clone());
        let mut flash = FlashMemoryManager::new(SimFlashStorage::new(16 * 1024, 512));
        flash.clear().unwrap();
        let root = table.copy_to_flash(&mut flash, "methods").unwrap();

        let mut reloaded = SortedTable::<MethodBody>::new();
        reloaded.load_from_flash(flash.reader_at(root)).unwrap();
        assert_eq!(reloaded.get_by_key(m.token).unwrap(), &m);
    }
}
