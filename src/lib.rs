//! MicroCLR: an embedded-scale execution engine for CIL bytecode.
//!
//! A host tool compiles a managed program, serializes its classes, methods,
//! IL streams, constants and token tables over a wire link; this engine
//! loads, links and executes them on a microcontroller-class target, with
//! an optional freeze of all loaded tables into memory-mapped flash.

#![warn(missing_docs)]

pub mod class;
pub mod constants;
pub mod consts;
pub mod error;
pub mod flash;
pub mod gc;
pub mod hardware;
pub mod interpreter;
pub mod loader;
pub mod method;
pub mod registry;
pub mod stack;
pub mod state;
pub mod table;
pub mod util;
pub mod value;

pub mod prelude {
    //! Re-exports of the commonly used engine types.

    pub use microclr_asm::wire;
    pub use microclr_asm::{
        ClauseKind, ExecState, ExecutionError, ExecutorCommand, KnownTypeToken, MethodFlags,
        NativeMethod, OpCode, StartupFlags, SystemException, Token, VariableKind,
    };

    pub use crate::class::{ClassDeclaration, FieldDescriptor, MethodRef};
    pub use crate::constants::ConstantHeap;
    pub use crate::error::{ClrException, EngineError, EngineFault, RuntimeError};
    pub use crate::flash::{
        FlashError, FlashHeader, FlashMemoryManager, FlashStorage, ImageRoots, SimFlashStorage,
    };
    pub use crate::gc::{GarbageCollector, ObjRef};
    pub use crate::hardware::{HardwareAccess, NoHardware};
    pub use crate::interpreter::{Frame, Interpreter, Task};
    pub use crate::method::{ExceptionClause, MethodBody, MethodCode};
    pub use crate::registry::SpecialTokens;
    pub use crate::stack::VariableStack;
    pub use crate::state::{ExecuteState, ExecutionResult, TaskState};
    pub use crate::table::{SortedTable, TableEntry};
    pub use crate::value::{SlotAddress, Value, Variable, VariableDescription};
}
