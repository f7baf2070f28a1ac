//! Runtime engine error implementation

use microclr_asm::wire::WireError;
use microclr_asm::{SystemException, Token};

use crate::gc::ObjRef;

use core::fmt;
use thiserror::Error;

/// Fatal engine faults. A fault aborts the running task unconditionally;
/// IL handlers never observe it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineFault {
    /// The IL stream contained an unknown or unsupported encoding.
    #[error("invalid opcode {raw:#06x} at pc {pc:#06x}")]
    InvalidOpCode {
        /// Offset of the faulting instruction.
        pc: u16,
        /// The raw instruction value.
        raw: u16,
    },
    /// The GC block chain is inconsistent.
    #[error("memory corruption: {0}")]
    MemoryCorruption(&'static str),
    /// The flash image or a flash write is bad.
    #[error("flash corruption: {0}")]
    FlashCorruption(&'static str),
    /// A malformed or unexpected wire frame.
    #[error("protocol violation: {0}")]
    Protocol(WireError),
    /// The operand stack was popped while empty.
    #[error("operand stack underflow")]
    StackUnderflow,
}

impl From<WireError> for EngineFault {
    fn from(e: WireError) -> Self {
        Self::Protocol(e)
    }
}

/// A managed exception in flight. Catchable by IL clause/filter handlers.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} (token {token:#010x})")]
pub struct ClrException {
    /// What went wrong.
    pub kind: SystemException,
    /// The token the fault is attributed to (usually the executing method).
    pub token: Token,
    /// The managed exception object, once materialised.
    pub object: Option<ObjRef>,
}

impl ClrException {
    /// A new exception without a managed object.
    pub const fn new(kind: SystemException, token: Token) -> Self {
        Self {
            kind,
            token,
            object: None,
        }
    }

    /// Wrap a user-constructed managed exception object.
    pub const fn custom(token: Token, object: ObjRef) -> Self {
        Self {
            kind: SystemException::CustomException,
            token,
            object: Some(object),
        }
    }
}

/// Runtime error description that is either observable by managed handlers
/// or must halt the task.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// A managed exception with a well-formed unwind strategy.
    Recoverable(ClrException),
    /// An engine fault that must halt the task.
    Halt(EngineFault),
}

impl RuntimeError {
    /// Shorthand for a recoverable exception.
    pub const fn exception(kind: SystemException, token: Token) -> Self {
        Self::Recoverable(ClrException::new(kind, token))
    }

    /// Flag whether the error is recoverable.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }

    /// Flag whether the error must halt the task.
    pub const fn must_halt(&self) -> bool {
        matches!(self, Self::Halt(_))
    }
}

impl From<ClrException> for RuntimeError {
    fn from(e: ClrException) -> Self {
        Self::Recoverable(e)
    }
}

impl From<EngineFault> for RuntimeError {
    fn from(e: EngineFault) -> Self {
        Self::Halt(e)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recoverable(e) => e.fmt(f),
            Self::Halt(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Recoverable(e) => Some(e),
            Self::Halt(e) => Some(e),
        }
    }
}

/// Top-level engine error variants, as surfaced to the embedding host.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// A managed exception reached the root frame without a handler.
    #[error("unhandled exception: {0}")]
    UnhandledException(ClrException),
    /// A fatal engine fault.
    #[error(transparent)]
    Fault(#[from] EngineFault),
}

impl EngineError {
    /// The exception kind that ended the task, if applicable.
    pub const fn exception_kind(&self) -> Option<SystemException> {
        match self {
            Self::UnhandledException(e) => Some(e.kind),
            Self::Fault(_) => None,
        }
    }

    /// The token the failure is attributed to, if applicable.
    pub const fn token(&self) -> Option<Token> {
        match self {
            Self::UnhandledException(e) => Some(e.token),
            Self::Fault(_) => None,
        }
    }
}

impl From<ClrException> for EngineError {
    fn from(e: ClrException) -> Self {
        Self::UnhandledException(e)
    }
}
