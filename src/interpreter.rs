//! [`Interpreter`] implementation

use microclr_asm::{StartupFlags, Token};

use crate::class::ClassDeclaration;
use crate::constants::ConstantHeap;
use crate::error::ClrException;
use crate::flash::{FlashMemoryManager, FlashStorage, ImageRoots};
use crate::gc::GarbageCollector;
use crate::method::{ExceptionClause, MethodBody};
use crate::registry::SpecialTokens;
use crate::table::SortedTable;
use crate::value::Variable;

use std::collections::HashMap;
use std::sync::Arc;

mod alu;
mod constructors;
mod exception;
mod executors;
mod flow;
mod frame;
mod internal;
mod memory;
mod object;

pub use frame::Frame;

pub(crate) use exception::{Continuation, Unwind};

/// A running task: the frame chain plus the transient unwind state of the
/// exception machine. Only one task exists at a time.
#[derive(Debug)]
pub struct Task {
    pub(crate) code_reference: u32,
    pub(crate) frames: Vec<Frame>,
    pub(crate) unwind: Option<Unwind>,
    pub(crate) current_exception: Option<ClrException>,
}

impl Task {
    /// The root method's code reference.
    pub const fn code_reference(&self) -> u32 {
        self.code_reference
    }

    /// The live frame chain, root first.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

/// The execution engine: loader, interpreter, exception machine, managed
/// heap and flash persistence, owned together and mutated only from the
/// host's event loop.
///
/// `F` is the board's flash driver, `H` the native-method hook. The
/// internal state is not exposed; the host observes execution through
/// response and execution-result frames.
#[derive(Debug)]
pub struct Interpreter<F, H> {
    pub(crate) classes: SortedTable<Arc<ClassDeclaration>>,
    pub(crate) methods: SortedTable<Arc<MethodBody>>,
    pub(crate) clauses: SortedTable<ExceptionClause>,
    pub(crate) constants: ConstantHeap,
    pub(crate) special_tokens: SpecialTokens,
    pub(crate) statics: HashMap<Token, Variable>,
    pub(crate) static_reserve: u32,
    pub(crate) gc: GarbageCollector,
    pub(crate) flash: FlashMemoryManager<F>,
    pub(crate) hardware: H,
    pub(crate) task: Option<Task>,
    pub(crate) startup_token: Token,
    pub(crate) startup_flags: StartupFlags,
    // Loader state: a class being assembled and the root offsets of a
    // freeze awaiting its header.
    pub(crate) pending_class: Option<ClassDeclaration>,
    pub(crate) pending_roots: ImageRoots,
}

impl<F, H> Interpreter<F, H> {
    /// True while a task is running; the loader only accepts
    /// `KillTask`/`ResetExecutor` in that state.
    pub const fn is_executing(&self) -> bool {
        self.task.is_some()
    }

    /// The running task, if any.
    pub const fn task(&self) -> Option<&Task> {
        self.task.as_ref()
    }

    /// The garbage collector.
    pub const fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    /// The flash manager.
    pub const fn flash(&self) -> &FlashMemoryManager<F> {
        &self.flash
    }

    /// The startup method token published by the mounted flash image.
    pub const fn startup_token(&self) -> Token {
        self.startup_token
    }

    /// Number of loaded classes.
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Number of loaded methods.
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

impl<F, H> AsRef<H> for Interpreter<F, H> {
    fn as_ref(&self) -> &H {
        &self.hardware
    }
}

impl<F, H> AsMut<H> for Interpreter<F, H> {
    fn as_mut(&mut self) -> &mut H {
        &mut self.hardware
    }
}

impl<F: FlashStorage, H> From<Interpreter<F, H>> for FlashMemoryManager<F> {
    fn from(vm: Interpreter<F, H>) -> Self {
        vm.flash
    }
}
