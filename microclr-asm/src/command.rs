use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
/// Sub-commands of the scheduler sysex channel, sent by the host loader.
pub enum ExecutorCommand {
    /// Not a command; decodes of unknown bytes fall back to this.
    None = 0,
    /// Create or reset a method stub.
    DeclareMethod = 1,
    /// Install the per-method token remap table.
    SetMethodTokens = 2,
    /// Splice a chunk of IL bytes into a method stub.
    LoadIl = 3,
    /// Seed a root frame and start executing.
    StartTask = 4,
    /// Drop all loaded state.
    ResetExecutor = 5,
    /// Abort the running task.
    KillTask = 6,
    /// Append locals or argument descriptors to a method stub.
    MethodSignature = 7,
    /// Begin a class declaration (header and fields follow).
    ClassDeclaration = 8,
    /// Finish a class declaration.
    ClassDeclarationEnd = 9,
    /// Upload a chunk of the constant heap.
    ConstantData = 10,
    /// Attach implemented interface tokens to a class.
    Interfaces = 11,
    /// Freeze all tables into flash.
    CopyToFlash = 12,
    /// Stamp the flash header after a freeze.
    WriteFlashHeader = 13,
    /// Query whether the flash image matches a version/hash pair.
    CheckFlashVersion = 14,
    /// Erase the flash partition.
    EraseFlash = 15,
    /// Reserve the static variable vector.
    SetConstantMemorySize = 16,
    /// Install the well-known-type token registry.
    SpecialTokenList = 17,
    /// Attach exception clauses to a method.
    ExceptionClauses = 18,

    /// Response marker: the request failed.
    Nack = 0x7e,
    /// Response marker: the request succeeded.
    Ack = 0x7f,
}

impl From<u8> for ExecutorCommand {
    fn from(b: u8) -> Self {
        use strum::IntoEnumIterator;
        Self::iter().find(|c| *c as u8 == b).unwrap_or(Self::None)
    }
}

impl fmt::Display for ExecutorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
/// Error codes carried by Nack responses. These are recoverable: the engine
/// state is unchanged by a nacked request.
pub enum ExecutionError {
    /// No error (used in Ack frames).
    None = 0,
    /// A task is running; only KillTask/ResetExecutor are accepted.
    EngineBusy = 1,
    /// The request payload is malformed or inconsistent.
    InvalidArguments = 2,
    /// The request could not be satisfied for lack of memory.
    OutOfMemory = 3,
    /// A managed exception escaped while servicing the request.
    ClrException = 4,
    /// An internal fault; the engine should be reset.
    InternalError = 5,
}

impl From<u8> for ExecutionError {
    fn from(b: u8) -> Self {
        use strum::IntoEnumIterator;
        Self::iter().find(|e| *e as u8 == b).unwrap_or(Self::InternalError)
    }
}

impl From<crate::wire::WireError> for ExecutionError {
    fn from(_: crate::wire::WireError) -> Self {
        Self::InvalidArguments
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
/// Execution state of a task, reported in execution-result frames.
pub enum ExecState {
    /// The task ran to completion; the result slot follows.
    Stopped = 0,
    /// The task was torn down by an engine fault or unhandled exception.
    Aborted = 1,
    /// The task is still running (intermediate report).
    Running = 2,
    /// The task was killed by the host.
    Killed = 3,
    /// Reserved for a debugger build; never produced by this engine.
    Debugging = 4,
}

impl From<u8> for ExecState {
    fn from(b: u8) -> Self {
        use strum::IntoEnumIterator;
        Self::iter().find(|s| *s as u8 == b).unwrap_or(Self::Aborted)
    }
}
