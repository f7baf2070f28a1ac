//! The loader and wire dispatcher: a request/response state machine driven
//! by framed messages from the host compiler.
//!
//! Every request is answered with an Ack or a Nack carrying an error code;
//! a nacked request leaves the engine state unchanged. While a task is
//! running only `KillTask` and `ResetExecutor` are accepted.

use crate::class::{ClassDeclaration, FieldDescriptor, MethodRef};
use crate::flash::{FlashError, FlashStorage};
use crate::hardware::HardwareAccess;
use crate::interpreter::Interpreter;
use crate::method::{ExceptionClause, MethodBody, MethodCode};
use crate::state::{ExecutionResult, TaskState};
use crate::table::FreezeError;
use crate::value::{Value, Variable, VariableDescription};

use microclr_asm::wire::{self, Decoder};
use microclr_asm::{
    ClauseKind, ExecutionError, ExecutorCommand, KnownTypeToken, MethodFlags, NativeMethod,
    StartupFlags, Token, VariableKind,
};

use std::sync::Arc;

use tracing::{debug, warn};

fn freeze_error(e: FreezeError) -> ExecutionError {
    match e {
        FreezeError::Flash(FlashError::OutOfSpace) => ExecutionError::OutOfMemory,
        FreezeError::OutOfOrder => ExecutionError::InvalidArguments,
        FreezeError::Flash(_) => ExecutionError::InternalError,
    }
}

impl<F: FlashStorage, H: HardwareAccess> Interpreter<F, H> {
    /// Dispatch one framed request, producing the response frames to send
    /// back (an Ack/Nack, possibly preceded by an execution result).
    pub fn handle_frame(&mut self, raw: &[u8]) -> Vec<Vec<u8>> {
        let (command, payload) = match wire::parse_request(raw) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(%error, "malformed frame");
                return vec![wire::response_frame(
                    false,
                    ExecutorCommand::None,
                    ExecutionError::InvalidArguments,
                )];
            }
        };

        if self.is_executing()
            && !matches!(command, ExecutorCommand::KillTask | ExecutorCommand::ResetExecutor)
        {
            debug!(%command, "engine busy, request rejected");
            return vec![wire::response_frame(false, command, ExecutionError::EngineBusy)];
        }

        let mut extra = Vec::new();
        let decoder = Decoder::new(payload);
        let outcome = match command {
            ExecutorCommand::DeclareMethod => self.on_declare_method(decoder),
            ExecutorCommand::MethodSignature => self.on_method_signature(decoder),
            ExecutorCommand::LoadIl => self.on_load_il(decoder),
            ExecutorCommand::SetMethodTokens => self.on_set_method_tokens(decoder),
            ExecutorCommand::ClassDeclaration => self.on_class_declaration(decoder),
            ExecutorCommand::ClassDeclarationEnd => self.on_class_declaration_end(decoder),
            ExecutorCommand::Interfaces => self.on_interfaces(decoder),
            ExecutorCommand::ConstantData => self.on_constant_data(decoder),
            ExecutorCommand::ExceptionClauses => self.on_exception_clauses(decoder),
            ExecutorCommand::SpecialTokenList => self.on_special_token_list(decoder),
            ExecutorCommand::SetConstantMemorySize => self.on_set_constant_memory_size(decoder),
            ExecutorCommand::CheckFlashVersion => self.on_check_flash_version(decoder),
            ExecutorCommand::CopyToFlash => self.on_copy_to_flash(),
            ExecutorCommand::WriteFlashHeader => self.on_write_flash_header(decoder),
            ExecutorCommand::EraseFlash => self.on_erase_flash(),
            ExecutorCommand::StartTask => self.on_start_task(decoder),
            ExecutorCommand::KillTask => {
                if let Some(code_reference) = self.kill_task() {
                    let result = ExecutionResult {
                        code_reference,
                        state: TaskState::Killed,
                    };
                    extra.push(result.to_frame());
                }
                Ok(())
            }
            ExecutorCommand::ResetExecutor => self.on_reset_executor(decoder),
            _ => Err(ExecutionError::InvalidArguments),
        };

        let response = match outcome {
            Ok(()) => wire::response_frame(true, command, ExecutionError::None),
            Err(error) => {
                warn!(%command, ?error, "request nacked");
                wire::response_frame(false, command, error)
            }
        };
        extra.push(response);
        extra
    }

    /// Drive the running task by one slice. Returns the execution-result
    /// frame once the task leaves the running state.
    pub fn run_step(&mut self) -> Option<Vec<u8>> {
        let code_reference = self.task.as_ref()?.code_reference();
        match self.run_slice()? {
            TaskState::Running => None,
            state => {
                let result = ExecutionResult {
                    code_reference,
                    state,
                };
                Some(result.to_frame())
            }
        }
    }

    /// Drop every piece of loaded RAM state. Frozen flash mirrors stay
    /// mounted; `EraseFlash` removes those.
    pub fn reset(&mut self) {
        self.kill_task();
        self.classes.clear(false);
        self.methods.clear(false);
        self.clauses.clear(false);
        self.constants.clear(false);
        self.statics.clear();
        self.static_reserve = 0;
        self.pending_class = None;
        self.gc.clear();
        debug!("executor reset");
    }

    fn method_token_by_code_ref(&self, code_reference: u32) -> Option<Token> {
        self.methods
            .iter()
            .find(|m| m.code_reference == code_reference)
            .map(|m| m.token)
    }

    fn ram_method_mut(&mut self, code_reference: u32) -> Result<&mut MethodBody, ExecutionError> {
        let token = self
            .method_token_by_code_ref(code_reference)
            .ok_or(ExecutionError::InvalidArguments)?;
        let arc = self
            .methods
            .get_mut_by_key(token)
            .ok_or(ExecutionError::InvalidArguments)?;
        Arc::get_mut(arc).ok_or(ExecutionError::InternalError)
    }

    fn on_declare_method(&mut self, mut dec: Decoder<'_>) -> Result<(), ExecutionError> {
        let code_reference = dec.read_u8()? as u32;
        let flags = MethodFlags::from_bits_truncate(dec.read_u8()?);
        let max_stack = dec.read_u8()?;
        let num_args = dec.read_u8()?;
        let native = dec.read_u16()?;
        let token = dec.read_u32()?;

        let mut method = MethodBody::stub(code_reference, token, flags, max_stack, num_args);
        if flags.contains(MethodFlags::SPECIAL) {
            method.code = MethodCode::Native(NativeMethod::from(native));
        }

        // Redeclaration clears the previous stub for reuse.
        if let Some(existing_token) = self.method_token_by_code_ref(code_reference) {
            if let Some(slot) = self.methods.get_mut_by_key(existing_token) {
                *slot = Arc::new(method);
                return Ok(());
            }
        }
        self.methods.insert(Arc::new(method));
        debug!(token, code_reference, "method declared");
        Ok(())
    }

    fn on_method_signature(&mut self, mut dec: Decoder<'_>) -> Result<(), ExecutionError> {
        let code_reference = dec.read_u8()? as u32;
        let signature_kind = dec.read_u8()?;
        let count = dec.read_u8()? as usize;
        let mut descs = Vec::with_capacity(count);
        for _ in 0..count {
            let kind_byte = dec.read_u8()?;
            let size = dec.read_u16()?;
            let desc = VariableDescription::from_wire(kind_byte, size)
                .ok_or(ExecutionError::InvalidArguments)?;
            descs.push(desc);
        }
        let method = self.ram_method_mut(code_reference)?;
        match signature_kind {
            0 => method.args.extend(descs),
            1 => method.locals.extend(descs),
            _ => return Err(ExecutionError::InvalidArguments),
        }
        Ok(())
    }

    fn on_load_il(&mut self, mut dec: Decoder<'_>) -> Result<(), ExecutionError> {
        let code_reference = dec.read_u8()? as u32;
        let total_len = dec.read_u16()? as usize;
        let offset = dec.read_u16()? as usize;
        let bytes = dec.read_to_end()?;

        let method = self.ram_method_mut(code_reference)?;
        let MethodCode::Il(il) = &mut method.code else {
            return Err(ExecutionError::InvalidArguments);
        };
        if offset == 0 {
            il.clear();
            il.reserve(total_len);
        }
        if il.len() != offset || offset + bytes.len() > total_len {
            return Err(ExecutionError::InvalidArguments);
        }
        il.extend_from_slice(&bytes);
        Ok(())
    }

    fn on_set_method_tokens(&mut self, mut dec: Decoder<'_>) -> Result<(), ExecutionError> {
        let code_reference = dec.read_u8()? as u32;
        let mut map = Vec::new();
        while !dec.is_empty() {
            let from = dec.read_u32()?;
            let to = dec.read_u32()?;
            map.push((from, to));
        }
        let method = self.ram_method_mut(code_reference)?;
        method.token_map = map;
        Ok(())
    }

    fn on_class_declaration(&mut self, mut dec: Decoder<'_>) -> Result<(), ExecutionError> {
        let token = dec.read_u32()?;
        let parent = dec.read_u32()?;
        let dynamic_size = dec.read_u16()?;
        let static_size = dec.read_u16()?;
        let flags = dec.read_u8()?;

        let replace = match &self.pending_class {
            Some(pending) => pending.token != token,
            None => true,
        };
        if replace {
            self.pending_class = Some(ClassDeclaration::new(
                token,
                parent,
                dynamic_size,
                static_size,
                flags & 0x01 != 0,
            ));
        }
        let class = self.pending_class.as_mut().ok_or(ExecutionError::InternalError)?;

        while !dec.is_empty() {
            match dec.read_u8()? {
                0 => {
                    let field_token = dec.read_u32()?;
                    let kind_byte = dec.read_u8()?;
                    let size = dec.read_u16()?;
                    let desc = VariableDescription::from_wire(kind_byte, size)
                        .ok_or(ExecutionError::InvalidArguments)?;
                    class.fields.push(FieldDescriptor {
                        token: field_token,
                        desc,
                    });
                }
                1 => {
                    let method_token = dec.read_u32()?;
                    let decl_count = dec.read_u8()? as usize;
                    let mut declaration_tokens = Vec::with_capacity(decl_count);
                    for _ in 0..decl_count {
                        declaration_tokens.push(dec.read_u32()?);
                    }
                    class.methods.push(MethodRef {
                        token: method_token,
                        declaration_tokens,
                    });
                }
                _ => return Err(ExecutionError::InvalidArguments),
            }
        }
        Ok(())
    }

    fn on_class_declaration_end(&mut self, mut dec: Decoder<'_>) -> Result<(), ExecutionError> {
        let token = dec.read_u32()?;
        let class = self.pending_class.take().ok_or(ExecutionError::InvalidArguments)?;
        if class.token != token {
            self.pending_class = Some(class);
            return Err(ExecutionError::InvalidArguments);
        }
        debug!(token, fields = class.fields.len(), "class sealed");
        self.classes.insert(Arc::new(class));
        Ok(())
    }

    fn on_interfaces(&mut self, mut dec: Decoder<'_>) -> Result<(), ExecutionError> {
        let token = dec.read_u32()?;
        let mut interfaces = Vec::new();
        while !dec.is_empty() {
            interfaces.push(dec.read_u32()?);
        }
        if let Some(pending) = self.pending_class.as_mut().filter(|c| c.token == token) {
            pending.interfaces.extend(interfaces);
            return Ok(());
        }
        let arc = self
            .classes
            .get_mut_by_key(token)
            .ok_or(ExecutionError::InvalidArguments)?;
        let class = Arc::get_mut(arc).ok_or(ExecutionError::InternalError)?;
        class.interfaces.extend(interfaces);
        Ok(())
    }

    fn on_constant_data(&mut self, mut dec: Decoder<'_>) -> Result<(), ExecutionError> {
        let token = dec.read_u32()?;
        let total_len = dec.read_u32()?;
        let offset = dec.read_u32()?;
        let bytes = dec.read_to_end()?;
        self.constants
            .insert_chunk(token, total_len, offset, &bytes)
            .map_err(|reason| {
                warn!(token, reason, "constant rejected");
                ExecutionError::InvalidArguments
            })
    }

    fn on_exception_clauses(&mut self, mut dec: Decoder<'_>) -> Result<(), ExecutionError> {
        let method_token = dec.read_u32()?;
        while !dec.is_empty() {
            let kind = ClauseKind::from_u8(dec.read_u8()?).ok_or(ExecutionError::InvalidArguments)?;
            let clause = ExceptionClause {
                method_token,
                kind,
                try_offset: dec.read_u16()?,
                try_length: dec.read_u16()?,
                handler_offset: dec.read_u16()?,
                handler_length: dec.read_u16()?,
                filter_token: dec.read_u32()?,
            };
            self.clauses.insert(clause);
        }
        Ok(())
    }

    fn on_special_token_list(&mut self, mut dec: Decoder<'_>) -> Result<(), ExecutionError> {
        while !dec.is_empty() {
            let slot = KnownTypeToken::from_u32(dec.read_u32()?);
            let token = dec.read_u32()?;
            self.special_tokens.insert(slot, token);
        }
        Ok(())
    }

    fn on_set_constant_memory_size(&mut self, mut dec: Decoder<'_>) -> Result<(), ExecutionError> {
        self.static_reserve = dec.read_u32()?;
        self.statics.reserve(self.static_reserve as usize / 8);
        Ok(())
    }

    fn on_check_flash_version(&mut self, mut dec: Decoder<'_>) -> Result<(), ExecutionError> {
        let data_version = dec.read_u32()?;
        let data_hash = dec.read_u32()?;
        if self.flash.contains_matching_data(data_version, data_hash) {
            Ok(())
        } else {
            Err(ExecutionError::InvalidArguments)
        }
    }

    fn on_copy_to_flash(&mut self) -> Result<(), ExecutionError> {
        self.pending_roots.classes = self
            .classes
            .copy_to_flash(&mut self.flash, "classes")
            .map_err(freeze_error)?;
        self.pending_roots.methods = self
            .methods
            .copy_to_flash(&mut self.flash, "methods")
            .map_err(freeze_error)?;
        self.pending_roots.clauses = self
            .clauses
            .copy_to_flash(&mut self.flash, "clauses")
            .map_err(freeze_error)?;
        let constants_root = self
            .constants
            .table()
            .copy_to_flash(&mut self.flash, "constants")
            .map_err(freeze_error)?;
        self.pending_roots.constants = constants_root;
        self.pending_roots.string_heap = constants_root;

        let mut staging = Vec::new();
        self.special_tokens.write_to(&mut staging);
        let tokens_root = self
            .flash
            .flash_alloc(staging.len())
            .map_err(|e| freeze_error(e.into()))?;
        self.flash
            .copy_to_flash(&staging, tokens_root, "special tokens")
            .map_err(|e| freeze_error(e.into()))?;
        self.pending_roots.special_tokens = tokens_root;
        debug!("tables frozen to flash");
        Ok(())
    }

    fn on_write_flash_header(&mut self, mut dec: Decoder<'_>) -> Result<(), ExecutionError> {
        let data_version = dec.read_u32()?;
        let data_hash = dec.read_u32()?;
        let startup_token = dec.read_u32()?;
        let startup_flags = StartupFlags::from_bits_truncate(dec.read_u32()?);

        self.flash
            .write_header(
                data_version,
                data_hash,
                self.pending_roots,
                startup_token,
                startup_flags,
                self.static_reserve,
            )
            .map_err(|error| {
                warn!(%error, "flash header write failed");
                ExecutionError::InternalError
            })?;
        self.startup_token = startup_token;
        self.startup_flags = startup_flags;
        Ok(())
    }

    fn on_erase_flash(&mut self) -> Result<(), ExecutionError> {
        self.flash.clear().map_err(|error| {
            warn!(%error, "flash erase failed");
            ExecutionError::InternalError
        })?;
        self.classes.clear_frozen();
        self.methods.clear_frozen();
        self.clauses.clear_frozen();
        self.constants.table().clear_frozen();
        self.startup_token = 0;
        self.startup_flags = StartupFlags::empty();
        Ok(())
    }

    fn on_start_task(&mut self, mut dec: Decoder<'_>) -> Result<(), ExecutionError> {
        let method_token = dec.read_u32()?;
        let mut args = Vec::new();
        while !dec.is_empty() {
            args.push(read_argument(&mut dec)?);
        }
        self.start_task(method_token, args).map_err(|error| {
            warn!(%error, "start task rejected");
            ExecutionError::InvalidArguments
        })
    }

    fn on_reset_executor(&mut self, mut dec: Decoder<'_>) -> Result<(), ExecutionError> {
        if dec.read_u8()? != 1 {
            return Err(ExecutionError::InvalidArguments);
        }
        self.reset();
        Ok(())
    }
}

/// Task arguments arrive as `(kind, 8-byte payload)` pairs.
fn read_argument(dec: &mut Decoder<'_>) -> Result<Variable, ExecutionError> {
    let kind_byte = dec.read_u8()?;
    let raw = dec.read_u64()?;
    let (kind, _) = VariableKind::from_wire(kind_byte).ok_or(ExecutionError::InvalidArguments)?;
    let value = match kind {
        VariableKind::Void => Value::Empty,
        VariableKind::Uint32 => Value::Uint32(raw as u32),
        VariableKind::Int32 => Value::Int32(raw as i32),
        VariableKind::Boolean => Value::Boolean(raw != 0),
        VariableKind::Int64 => Value::Int64(raw as i64),
        VariableKind::Uint64 => Value::Uint64(raw),
        VariableKind::Float => Value::Float(f32::from_bits(raw as u32)),
        VariableKind::Double => Value::Double(f64::from_bits(raw)),
        _ => return Err(ExecutionError::InvalidArguments),
    };
    Ok(Variable::new(value))
}
