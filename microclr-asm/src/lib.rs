#![warn(missing_docs)]
//! Atomic types shared between the MicroCLR host compiler and the embedded
//! execution engine: the CIL opcode set, metadata-token helpers, variable
//! kind tags, flag sets, executor commands, exception and state
//! enumerations, the native-method table and the 7-bit sysex wire encoding.

mod command;
mod exception;
mod flags;
mod kind;
mod native;
mod opcode;
mod token;

pub mod wire;

pub use command::{ExecState, ExecutionError, ExecutorCommand};
pub use exception::{ClauseKind, SystemException};
pub use flags::{MethodFlags, StartupFlags};
pub use kind::VariableKind;
pub use native::NativeMethod;
pub use opcode::{OpCode, OperandKind, RawInstruction};
pub use token::{token_kind, KnownTypeToken, Token, TokenKind};
