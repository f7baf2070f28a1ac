use super::{Interpreter, Task};
use crate::class::ClassDeclaration;
use crate::error::{ClrException, EngineFault, RuntimeError};
use crate::gc::ObjRef;
use crate::interpreter::Frame;
use crate::method::{ExceptionClause, MethodBody};
use crate::value::Variable;

use microclr_asm::{KnownTypeToken, SystemException, Token};

use std::sync::Arc;

impl<F, H> Interpreter<F, H> {
    pub(crate) fn task_ref(&self) -> Result<&Task, EngineFault> {
        self.task
            .as_ref()
            .ok_or(EngineFault::MemoryCorruption("no task is active"))
    }

    pub(crate) fn task_mut(&mut self) -> Result<&mut Task, EngineFault> {
        self.task
            .as_mut()
            .ok_or(EngineFault::MemoryCorruption("no task is active"))
    }

    pub(crate) fn cur_frame(&self) -> Result<&Frame, EngineFault> {
        self.task_ref()?
            .frames
            .last()
            .ok_or(EngineFault::MemoryCorruption("task has no frames"))
    }

    pub(crate) fn cur_frame_mut(&mut self) -> Result<&mut Frame, EngineFault> {
        self.task_mut()?
            .frames
            .last_mut()
            .ok_or(EngineFault::MemoryCorruption("task has no frames"))
    }

    pub(crate) fn push(&mut self, value: Variable) -> Result<(), EngineFault> {
        self.cur_frame_mut()?.stack.push(value);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<Variable, EngineFault> {
        self.cur_frame_mut()?.stack.pop()
    }

    /// The class for `token`, or `ClassNotFound` attributed to the current
    /// method.
    pub(crate) fn resolve_class(&self, token: Token) -> Result<Arc<ClassDeclaration>, RuntimeError> {
        self.classes
            .get_by_key(token)
            .cloned()
            .ok_or_else(|| RuntimeError::exception(SystemException::ClassNotFound, token))
    }

    /// The method for `token`, or `MissingMethod`.
    pub(crate) fn resolve_method(&self, token: Token) -> Result<Arc<MethodBody>, RuntimeError> {
        self.methods
            .get_by_key(token)
            .cloned()
            .ok_or_else(|| RuntimeError::exception(SystemException::MissingMethod, token))
    }

    /// Exception clauses of `method_token` in load order.
    pub(crate) fn clauses_for(&self, method_token: Token) -> Vec<ExceptionClause> {
        self.clauses.entries_for_key(method_token).copied().collect()
    }

    /// Locate the class declaring a field token, together with the field's
    /// instance offset.
    pub(crate) fn find_field(
        &self,
        field_token: Token,
    ) -> Option<(Arc<ClassDeclaration>, u16, crate::value::VariableDescription)> {
        self.classes.iter().find_map(|class| {
            class
                .field_offset(field_token)
                .map(|(offset, f)| (class.clone(), offset, f.desc))
        })
    }

    /// The declaration of a static field, searched across every class.
    pub(crate) fn find_static_desc(&self, field_token: Token) -> Option<crate::value::VariableDescription> {
        self.classes.iter().find_map(|class| {
            class
                .fields
                .iter()
                .find(|f| f.token == field_token && f.desc.is_static)
                .map(|f| f.desc)
        })
    }

    /// Assignability for casts and catch clauses: walk `source`'s parent
    /// chain looking for `target`, checking implemented interfaces along
    /// the way. The root Object slot matches everything.
    pub(crate) fn is_assignable(&self, target: Token, source: Token) -> bool {
        if target == source {
            return true;
        }
        if Some(target) == self.special_tokens.get(KnownTypeToken::Object) {
            return true;
        }
        let mut current = source;
        let mut hops = 0;
        while current != 0 && hops < 64 {
            let Some(class) = self.classes.get_by_key(current) else {
                return false;
            };
            if class.token == target || class.implements_interface(target) {
                return true;
            }
            current = class.parent_token;
            hops += 1;
        }
        false
    }

    /// The class token of the object a slot references, when it is a
    /// non-null reference.
    pub(crate) fn class_token_of(&self, value: &Variable) -> Result<Option<Token>, EngineFault> {
        match value.heap_ref() {
            Some(r) => Ok(Some(self.gc.class_token(r)?)),
            None => Ok(None),
        }
    }

    /// Allocate managed storage. On exhaustion the collector runs once
    /// over every root (statics, all frame slots, in-flight exception
    /// objects) and the allocation is retried; a second failure raises
    /// `OutOfMemory` attributed to `token`.
    pub(crate) fn alloc_managed(&mut self, size: usize, token: Token) -> Result<ObjRef, RuntimeError> {
        if let Ok(r) = self.gc.allocate(size) {
            self.gc.zero_payload(r)?;
            return Ok(r);
        }

        let Self {
            gc,
            statics,
            task,
            classes,
            ..
        } = self;
        let exception_roots: Vec<Variable> = task
            .iter()
            .flat_map(|t| {
                t.current_exception
                    .iter()
                    .filter_map(|e| e.object)
                    .chain(t.unwind.iter().filter_map(|u| u.exception_object()))
            })
            .map(Variable::from)
            .collect();
        let roots = statics
            .values()
            .chain(task.iter().flat_map(|t| t.frames.iter().flat_map(Frame::gc_roots)))
            .chain(exception_roots.iter());
        gc.collect(roots, &*classes)?;

        let r = self
            .gc
            .allocate(size)
            .map_err(|_| ClrException::new(SystemException::OutOfMemory, token))?;
        self.gc.zero_payload(r)?;
        Ok(r)
    }

    /// Run a full collection outside of allocation pressure, e.g. on an
    /// explicit host trigger. Returns the number of bytes reclaimed.
    pub fn collect_garbage(&mut self) -> Result<usize, EngineFault> {
        let Self {
            gc,
            statics,
            task,
            classes,
            ..
        } = self;
        let exception_roots: Vec<Variable> = task
            .iter()
            .flat_map(|t| {
                t.current_exception
                    .iter()
                    .filter_map(|e| e.object)
                    .chain(t.unwind.iter().filter_map(|u| u.exception_object()))
            })
            .map(Variable::from)
            .collect();
        let roots = statics
            .values()
            .chain(task.iter().flat_map(|t| t.frames.iter().flat_map(Frame::gc_roots)))
            .chain(exception_roots.iter());
        gc.collect(roots, &*classes)
    }
}
