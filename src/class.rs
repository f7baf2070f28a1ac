//! Class descriptors: token, parent, instance/static sizes, field layout,
//! indirectly callable methods and implemented interfaces.

use microclr_asm::{Token, VariableKind};

use crate::error::EngineFault;
use crate::flash::ImageReader;
use crate::gc::ClassLookup;
use crate::table::{SortedTable, TableEntry};
use crate::value::VariableDescription;

use std::sync::Arc;

/// One field of a class: its token and layout declaration. The list order
/// fixes the instance layout; reordering invalidates previously written
/// instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// The field token.
    pub token: Token,
    /// Kind, size and static flag.
    pub desc: VariableDescription,
}

/// An indirectly callable method of a class: constructors, virtual methods
/// and interface implementations. `declaration_tokens` lists every token a
/// call site may use to mean this method (base declarations, interface
/// slots).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    /// The implementation's own token.
    pub token: Token,
    /// Alternate tokens resolving to this implementation.
    pub declaration_tokens: Vec<Token>,
}

impl MethodRef {
    /// True when a call site naming `token` dispatches to this method.
    pub fn matches(&self, token: Token) -> bool {
        self.token == token || self.declaration_tokens.contains(&token)
    }
}

/// A class descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDeclaration {
    /// The class token; unique across a loaded image.
    pub token: Token,
    /// Parent class token; 0 for `System.Object`.
    pub parent_token: Token,
    /// Instance size in bytes including inherited fields, excluding the
    /// object header.
    pub dynamic_size: u16,
    /// Total size of static members.
    pub static_size: u16,
    /// True for value types.
    pub is_value_type: bool,
    /// The flattened instance and static field layout, declaration order.
    pub fields: Vec<FieldDescriptor>,
    /// Indirectly callable methods.
    pub methods: Vec<MethodRef>,
    /// Implemented interface tokens; unordered.
    pub interfaces: Vec<Token>,
}

impl ClassDeclaration {
    /// A class with empty member lists, to be filled by the loader.
    pub fn new(
        token: Token,
        parent_token: Token,
        dynamic_size: u16,
        static_size: u16,
        is_value_type: bool,
    ) -> Self {
        Self {
            token,
            parent_token,
            dynamic_size,
            static_size,
            is_value_type,
            fields: Vec::new(),
            methods: Vec::new(),
            interfaces: Vec::new(),
        }
    }

    /// The field with the given declaration index.
    pub fn field_by_index(&self, index: usize) -> Option<&FieldDescriptor> {
        self.fields.get(index)
    }

    /// The method with the given declaration index.
    pub fn method_by_index(&self, index: usize) -> Option<&MethodRef> {
        self.methods.get(index)
    }

    /// True when this class declares `token` among its interfaces.
    pub fn implements_interface(&self, token: Token) -> bool {
        self.interfaces.contains(&token)
    }

    /// Instance fields with their byte offsets past the object header,
    /// skipping static members.
    pub fn instance_fields(&self) -> impl Iterator<Item = (u16, &FieldDescriptor)> {
        let mut offset = 0u16;
        self.fields.iter().filter(|f| !f.desc.is_static).map(move |f| {
            let this = offset;
            offset += f.desc.field_size();
            (this, f)
        })
    }

    /// Locate an instance field by token, returning its byte offset.
    pub fn field_offset(&self, token: Token) -> Option<(u16, &FieldDescriptor)> {
        self.instance_fields().find(|(_, f)| f.token == token)
    }

    /// The element width of a value of this class when stored inline.
    pub fn value_size(&self) -> u16 {
        self.dynamic_size
    }

    /// The kind a slot holding one instance of this class carries.
    pub fn value_kind(&self) -> VariableKind {
        if !self.is_value_type {
            return VariableKind::Object;
        }
        match self.fields.iter().find(|f| !f.desc.is_static) {
            Some(single) if self.fields.iter().filter(|f| !f.desc.is_static).count() == 1 => {
                single.desc.kind
            }
            _ => VariableKind::LargeValueType,
        }
    }
}

impl TableEntry for ClassDeclaration {
    fn key(&self) -> u32 {
        self.token
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.token.to_le_bytes());
        out.extend_from_slice(&self.parent_token.to_le_bytes());
        out.extend_from_slice(&self.dynamic_size.to_le_bytes());
        out.extend_from_slice(&self.static_size.to_le_bytes());
        out.push(self.is_value_type as u8);
        out.extend_from_slice(&(self.fields.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.methods.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.interfaces.len() as u16).to_le_bytes());
        for field in &self.fields {
            out.extend_from_slice(&field.token.to_le_bytes());
            out.push(field.desc.wire_kind());
            out.extend_from_slice(&field.desc.size.to_le_bytes());
        }
        for method in &self.methods {
            out.extend_from_slice(&method.token.to_le_bytes());
            out.extend_from_slice(&(method.declaration_tokens.len() as u16).to_le_bytes());
            for decl in &method.declaration_tokens {
                out.extend_from_slice(&decl.to_le_bytes());
            }
        }
        for interface in &self.interfaces {
            out.extend_from_slice(&interface.to_le_bytes());
        }
    }

    fn read_from(reader: &mut ImageReader<'_>) -> Result<Self, EngineFault> {
        let token = reader.read_u32()?;
        let parent_token = reader.read_u32()?;
        let dynamic_size = reader.read_u16()?;
        let static_size = reader.read_u16()?;
        let is_value_type = reader.read_u8()? != 0;
        let field_count = reader.read_u16()? as usize;
        let method_count = reader.read_u16()? as usize;
        let interface_count = reader.read_u16()? as usize;

        let mut class = Self::new(token, parent_token, dynamic_size, static_size, is_value_type);
        for _ in 0..field_count {
            let field_token = reader.read_u32()?;
            let kind_byte = reader.read_u8()?;
            let size = reader.read_u16()?;
            let desc = VariableDescription::from_wire(kind_byte, size)
                .ok_or(EngineFault::FlashCorruption("bad field kind in image"))?;
            class.fields.push(FieldDescriptor { token: field_token, desc });
        }
        for _ in 0..method_count {
            let method_token = reader.read_u32()?;
            let decl_count = reader.read_u16()? as usize;
            let mut declaration_tokens = Vec::with_capacity(decl_count);
            for _ in 0..decl_count {
                declaration_tokens.push(reader.read_u32()?);
            }
            class.methods.push(MethodRef { token: method_token, declaration_tokens });
        }
        for _ in 0..interface_count {
            class.interfaces.push(reader.read_u32()?);
        }
        Ok(class)
    }
}

impl ClassLookup for SortedTable<Arc<ClassDeclaration>> {
    fn lookup_class(&self, token: Token) -> Option<Arc<ClassDeclaration>> {
        self.get_by_key(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FlashMemoryManager, SimFlashStorage};

    fn sample() -> ClassDeclaration {
        let mut class = ClassDeclaration::new(0x0200_0010, 0x0200_0001, 12, 4, false);
        class.fields.push(FieldDescriptor {
            token: 0x0400_0001,
            desc: VariableDescription::new(VariableKind::Int32),
        });
        class.fields.push(FieldDescriptor {
            token: 0x0400_0002,
            desc: VariableDescription::new(VariableKind::Object),
        });
        class.fields.push(FieldDescriptor {
            token: 0x0400_0003,
            desc: {
                let mut d = VariableDescription::new(VariableKind::Int32);
                d.is_static = true;
                d
            },
        });
        class.fields.push(FieldDescriptor {
            token: 0x0400_0004,
            desc: VariableDescription::new(VariableKind::Int64),
        });
        class.methods.push(MethodRef {
            token: 0x0600_0031,
            declaration_tokens: vec![0x0600_0007],
        });
        class.interfaces.push(0x0200_0005);
        class
    }

    #[test]
    fn instance_layout_skips_statics() {
        let class = sample();
        let layout: Vec<(u16, Token)> =
            class.instance_fields().map(|(o, f)| (o, f.token)).collect();
        assert_eq!(
            layout,
            vec![(0, 0x0400_0001), (4, 0x0400_0002), (8, 0x0400_0004)]
        );
        assert_eq!(class.field_offset(0x0400_0004).unwrap().0, 8);
        assert!(class.field_offset(0x0400_0003).is_none());
    }

    #[test]
    fn interface_query() {
        let class = sample();
        assert!(class.implements_interface(0x0200_0005));
        assert!(!class.implements_interface(0x0200_0006));
    }

    #[test]
    fn freeze_round_trip_is_field_exact() {
        let class = sample();
        let mut table = SortedTable::new();
        table.insert(Arc::new(class.clone()));

        let mut flash = FlashMemoryManager::new(SimFlashStorage::new(16 * 1024, 512));
        flash.clear().unwrap();
        let root = table.copy_to_flash(&mut flash, "classes").unwrap();

        let mut reloaded = SortedTable::<Arc<ClassDeclaration>>::new();
        reloaded.load_from_flash(flash.reader_at(root)).unwrap();
        assert_eq!(reloaded.get_by_key(class.token).unwrap().as_ref(), &class);
    }
}
