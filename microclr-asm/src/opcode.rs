use core::fmt;

/// Raw two-byte opcode value. Single-byte instructions occupy `0x00..=0xE0`;
/// the second page is encoded as `0xFE00 | low-byte`.
pub type RawInstruction = u16;

/// First byte of the extended opcode page.
const PREFIX_PAGE: u8 = 0xFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Inline operand carried by an instruction, decoded from the IL stream.
pub enum OperandKind {
    /// No inline operand.
    None,
    /// A signed 8-bit immediate (`ldc.i4.s`).
    ShortI,
    /// An unsigned 8-bit variable index (`ldloc.s`, `ldarg.s`, ...).
    ShortVar,
    /// An unsigned 16-bit variable index (`ldloc`, `ldarg`, ...).
    Var,
    /// A signed 8-bit branch displacement, relative to the next instruction.
    ShortTarget,
    /// A signed 32-bit branch displacement, relative to the next instruction.
    Target,
    /// A 32-bit immediate (`ldc.i4`).
    Int,
    /// A 64-bit immediate (`ldc.i8`).
    Long,
    /// A 32-bit IEEE float immediate (`ldc.r4`).
    Float,
    /// A 64-bit IEEE float immediate (`ldc.r8`).
    Double,
    /// A metadata token.
    Token,
    /// A jump table: `u32` count followed by that many 32-bit displacements.
    Switch,
}

impl OperandKind {
    /// Fixed byte length of the operand, or `None` for `Switch`.
    pub const fn len(&self) -> Option<usize> {
        match self {
            Self::None => Some(0),
            Self::ShortI | Self::ShortVar | Self::ShortTarget => Some(1),
            Self::Var => Some(2),
            Self::Target | Self::Int | Self::Float | Self::Token => Some(4),
            Self::Long | Self::Double => Some(8),
            Self::Switch => None,
        }
    }
}

macro_rules! cil_opcodes {
    ($($(#[doc = $doc:expr])* $name:ident = $value:literal => $operand:ident,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[allow(non_camel_case_types, missing_docs)] // mnemonic names are the documentation
        #[repr(u16)]
        /// The CIL opcode set understood by the interpreter. Discriminants
        /// are the ECMA-335 encodings; extended-page instructions carry the
        /// `0xFE` prefix in their high byte.
        pub enum OpCode {
            $($(#[doc = $doc])* $name = $value,)*
        }

        impl OpCode {
            /// Map a raw instruction value to an opcode.
            pub const fn from_raw(raw: RawInstruction) -> Option<Self> {
                match raw {
                    $($value => Some(Self::$name),)*
                    _ => None,
                }
            }

            /// Inline operand kind of this opcode.
            pub const fn operand(&self) -> OperandKind {
                match self {
                    $(Self::$name => OperandKind::$operand,)*
                }
            }
        }
    };
}

cil_opcodes! {
    /// Do nothing.
    NOP = 0x00 => None,
    /// Debugger trap; not expected in release code.
    BREAK = 0x01 => None,
    LDARG_0 = 0x02 => None,
    LDARG_1 = 0x03 => None,
    LDARG_2 = 0x04 => None,
    LDARG_3 = 0x05 => None,
    LDLOC_0 = 0x06 => None,
    LDLOC_1 = 0x07 => None,
    LDLOC_2 = 0x08 => None,
    LDLOC_3 = 0x09 => None,
    STLOC_0 = 0x0a => None,
    STLOC_1 = 0x0b => None,
    STLOC_2 = 0x0c => None,
    STLOC_3 = 0x0d => None,
    LDARG_S = 0x0e => ShortVar,
    LDARGA_S = 0x0f => ShortVar,
    STARG_S = 0x10 => ShortVar,
    LDLOC_S = 0x11 => ShortVar,
    LDLOCA_S = 0x12 => ShortVar,
    STLOC_S = 0x13 => ShortVar,
    /// Push a null object reference.
    LDNULL = 0x14 => None,
    LDC_I4_M1 = 0x15 => None,
    LDC_I4_0 = 0x16 => None,
    LDC_I4_1 = 0x17 => None,
    LDC_I4_2 = 0x18 => None,
    LDC_I4_3 = 0x19 => None,
    LDC_I4_4 = 0x1a => None,
    LDC_I4_5 = 0x1b => None,
    LDC_I4_6 = 0x1c => None,
    LDC_I4_7 = 0x1d => None,
    LDC_I4_8 = 0x1e => None,
    LDC_I4_S = 0x1f => ShortI,
    LDC_I4 = 0x20 => Int,
    LDC_I8 = 0x21 => Long,
    LDC_R4 = 0x22 => Float,
    LDC_R8 = 0x23 => Double,
    DUP = 0x25 => None,
    POP = 0x26 => None,
    CALL = 0x28 => Token,
    CALLI = 0x29 => Token,
    RET = 0x2a => None,
    BR_S = 0x2b => ShortTarget,
    BRFALSE_S = 0x2c => ShortTarget,
    BRTRUE_S = 0x2d => ShortTarget,
    BEQ_S = 0x2e => ShortTarget,
    BGE_S = 0x2f => ShortTarget,
    BGT_S = 0x30 => ShortTarget,
    BLE_S = 0x31 => ShortTarget,
    BLT_S = 0x32 => ShortTarget,
    BNE_UN_S = 0x33 => ShortTarget,
    BGE_UN_S = 0x34 => ShortTarget,
    BGT_UN_S = 0x35 => ShortTarget,
    BLE_UN_S = 0x36 => ShortTarget,
    BLT_UN_S = 0x37 => ShortTarget,
    BR = 0x38 => Target,
    BRFALSE = 0x39 => Target,
    BRTRUE = 0x3a => Target,
    BEQ = 0x3b => Target,
    BGE = 0x3c => Target,
    BGT = 0x3d => Target,
    BLE = 0x3e => Target,
    BLT = 0x3f => Target,
    BNE_UN = 0x40 => Target,
    BGE_UN = 0x41 => Target,
    BGT_UN = 0x42 => Target,
    BLE_UN = 0x43 => Target,
    BLT_UN = 0x44 => Target,
    SWITCH = 0x45 => Switch,
    LDIND_I1 = 0x46 => None,
    LDIND_U1 = 0x47 => None,
    LDIND_I2 = 0x48 => None,
    LDIND_U2 = 0x49 => None,
    LDIND_I4 = 0x4a => None,
    LDIND_U4 = 0x4b => None,
    LDIND_I8 = 0x4c => None,
    LDIND_I = 0x4d => None,
    LDIND_R4 = 0x4e => None,
    LDIND_R8 = 0x4f => None,
    LDIND_REF = 0x50 => None,
    STIND_REF = 0x51 => None,
    STIND_I1 = 0x52 => None,
    STIND_I2 = 0x53 => None,
    STIND_I4 = 0x54 => None,
    STIND_I8 = 0x55 => None,
    STIND_R4 = 0x56 => None,
    STIND_R8 = 0x57 => None,
    ADD = 0x58 => None,
    SUB = 0x59 => None,
    MUL = 0x5a => None,
    DIV = 0x5b => None,
    DIV_UN = 0x5c => None,
    REM = 0x5d => None,
    REM_UN = 0x5e => None,
    AND = 0x5f => None,
    OR = 0x60 => None,
    XOR = 0x61 => None,
    SHL = 0x62 => None,
    SHR = 0x63 => None,
    SHR_UN = 0x64 => None,
    NEG = 0x65 => None,
    NOT = 0x66 => None,
    CONV_I1 = 0x67 => None,
    CONV_I2 = 0x68 => None,
    CONV_I4 = 0x69 => None,
    CONV_I8 = 0x6a => None,
    CONV_R4 = 0x6b => None,
    CONV_R8 = 0x6c => None,
    CONV_U4 = 0x6d => None,
    CONV_U8 = 0x6e => None,
    CALLVIRT = 0x6f => Token,
    CPOBJ = 0x70 => Token,
    LDOBJ = 0x71 => Token,
    LDSTR = 0x72 => Token,
    NEWOBJ = 0x73 => Token,
    CASTCLASS = 0x74 => Token,
    ISINST = 0x75 => Token,
    CONV_R_UN = 0x76 => None,
    UNBOX = 0x79 => Token,
    THROW = 0x7a => None,
    LDFLD = 0x7b => Token,
    LDFLDA = 0x7c => Token,
    STFLD = 0x7d => Token,
    LDSFLD = 0x7e => Token,
    LDSFLDA = 0x7f => Token,
    STSFLD = 0x80 => Token,
    STOBJ = 0x81 => Token,
    CONV_OVF_I1_UN = 0x82 => None,
    CONV_OVF_I2_UN = 0x83 => None,
    CONV_OVF_I4_UN = 0x84 => None,
    CONV_OVF_I8_UN = 0x85 => None,
    CONV_OVF_U1_UN = 0x86 => None,
    CONV_OVF_U2_UN = 0x87 => None,
    CONV_OVF_U4_UN = 0x88 => None,
    CONV_OVF_U8_UN = 0x89 => None,
    CONV_OVF_I_UN = 0x8a => None,
    CONV_OVF_U_UN = 0x8b => None,
    BOX = 0x8c => Token,
    NEWARR = 0x8d => Token,
    LDLEN = 0x8e => None,
    LDELEMA = 0x8f => Token,
    LDELEM_I1 = 0x90 => None,
    LDELEM_U1 = 0x91 => None,
    LDELEM_I2 = 0x92 => None,
    LDELEM_U2 = 0x93 => None,
    LDELEM_I4 = 0x94 => None,
    LDELEM_U4 = 0x95 => None,
    LDELEM_I8 = 0x96 => None,
    LDELEM_I = 0x97 => None,
    LDELEM_R4 = 0x98 => None,
    LDELEM_R8 = 0x99 => None,
    LDELEM_REF = 0x9a => None,
    STELEM_I = 0x9b => None,
    STELEM_I1 = 0x9c => None,
    STELEM_I2 = 0x9d => None,
    STELEM_I4 = 0x9e => None,
    STELEM_I8 = 0x9f => None,
    STELEM_R4 = 0xa0 => None,
    STELEM_R8 = 0xa1 => None,
    STELEM_REF = 0xa2 => None,
    LDELEM = 0xa3 => Token,
    STELEM = 0xa4 => Token,
    UNBOX_ANY = 0xa5 => Token,
    CONV_OVF_I1 = 0xb3 => None,
    CONV_OVF_U1 = 0xb4 => None,
    CONV_OVF_I2 = 0xb5 => None,
    CONV_OVF_U2 = 0xb6 => None,
    CONV_OVF_I4 = 0xb7 => None,
    CONV_OVF_U4 = 0xb8 => None,
    CONV_OVF_I8 = 0xb9 => None,
    CONV_OVF_U8 = 0xba => None,
    /// Throw Arithmetic if the top of stack is NaN or infinite.
    CKFINITE = 0xc3 => None,
    LDTOKEN = 0xd0 => Token,
    CONV_U2 = 0xd1 => None,
    CONV_U1 = 0xd2 => None,
    CONV_I = 0xd3 => None,
    CONV_OVF_I = 0xd4 => None,
    CONV_OVF_U = 0xd5 => None,
    ADD_OVF = 0xd6 => None,
    ADD_OVF_UN = 0xd7 => None,
    MUL_OVF = 0xd8 => None,
    MUL_OVF_UN = 0xd9 => None,
    SUB_OVF = 0xda => None,
    SUB_OVF_UN = 0xdb => None,
    ENDFINALLY = 0xdc => None,
    LEAVE = 0xdd => Target,
    LEAVE_S = 0xde => ShortTarget,
    STIND_I = 0xdf => None,
    CONV_U = 0xe0 => None,

    CEQ = 0xfe01 => None,
    CGT = 0xfe02 => None,
    CGT_UN = 0xfe03 => None,
    CLT = 0xfe04 => None,
    CLT_UN = 0xfe05 => None,
    LDFTN = 0xfe06 => Token,
    LDVIRTFTN = 0xfe07 => Token,
    LDARG = 0xfe09 => Var,
    LDARGA = 0xfe0a => Var,
    STARG = 0xfe0b => Var,
    LDLOC = 0xfe0c => Var,
    LDLOCA = 0xfe0d => Var,
    STLOC = 0xfe0e => Var,
    ENDFILTER = 0xfe11 => None,
    /// Alignment prefix; semantically transparent here.
    UNALIGNED = 0xfe12 => ShortVar,
    /// Volatile prefix; semantically transparent here.
    VOLATILE = 0xfe13 => None,
    /// Tail-call prefix; semantically transparent here.
    TAIL = 0xfe14 => None,
    INITOBJ = 0xfe15 => Token,
    /// Dispatch-target selector for value-type `callvirt`.
    CONSTRAINED = 0xfe16 => Token,
    RETHROW = 0xfe1a => None,
    SIZEOF = 0xfe1c => Token,
    /// Read-only array-address prefix; semantically transparent here.
    READONLY = 0xfe1e => None,
}

impl OpCode {
    /// Decode the opcode at the start of `il`, returning it together with
    /// the number of bytes the opcode itself occupies (1 or 2). The inline
    /// operand follows those bytes. Fails with the raw value on unknown
    /// encodings and with `0xffff` on a truncated stream.
    pub fn decode(il: &[u8]) -> Result<(Self, usize), RawInstruction> {
        match il.first() {
            None => Err(0xffff),
            Some(&PREFIX_PAGE) => match il.get(1) {
                None => Err(0xffff),
                Some(&low) => {
                    let raw = u16::from_be_bytes([PREFIX_PAGE, low]);
                    Self::from_raw(raw).map(|op| (op, 2)).ok_or(raw)
                }
            },
            Some(&byte) => Self::from_raw(byte as u16).map(|op| (op, 1)).ok_or(byte as u16),
        }
    }

    /// True for the prefix opcodes that modify the following instruction.
    pub const fn is_prefix(&self) -> bool {
        matches!(
            self,
            Self::UNALIGNED | Self::VOLATILE | Self::TAIL | Self::CONSTRAINED | Self::READONLY
        )
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
