//! Test helpers: an IL assembler and a host-side message builder that
//! exercise the engine through the same wire frames a real host sends.

#[allow(missing_docs)]
pub mod test_helpers {
    use crate::flash::SimFlashStorage;
    use crate::hardware::NoHardware;
    use crate::interpreter::Interpreter;
    use crate::state::TaskState;
    use crate::value::{Value, Variable};

    use microclr_asm::wire::{self, Encoder};
    use microclr_asm::{
        ClauseKind, ExecutorCommand, KnownTypeToken, MethodFlags, OpCode, Token, VariableKind,
    };

    /// A tiny IL assembler. Operands are emitted explicitly; branch
    /// displacements are relative to the next instruction, as in the real
    /// encoding.
    #[derive(Debug, Default, Clone)]
    pub struct IlAsm {
        bytes: Vec<u8>,
    }

    impl IlAsm {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn pos(&self) -> usize {
            self.bytes.len()
        }

        pub fn bytes(&self) -> &[u8] {
            &self.bytes
        }

        pub fn into_bytes(self) -> Vec<u8> {
            self.bytes
        }

        /// Emit an opcode without operand.
        pub fn op(&mut self, op: OpCode) -> &mut Self {
            let raw = op as u16;
            if raw > 0xff {
                self.bytes.push((raw >> 8) as u8);
            }
            self.bytes.push(raw as u8);
            self
        }

        pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
            self.bytes.extend_from_slice(bytes);
            self
        }

        /// Patch one already-emitted byte, e.g. a branch displacement that
        /// was unknown while emitting.
        pub fn patch_u8(&mut self, pos: usize, byte: u8) -> &mut Self {
            self.bytes[pos] = byte;
            self
        }

        /// Load a 32-bit constant using the shortest encoding.
        pub fn ldc_i4(&mut self, value: i32) -> &mut Self {
            match value {
                -1 => self.op(OpCode::LDC_I4_M1),
                0..=8 => {
                    let raw = OpCode::LDC_I4_0 as u16 as u8 + value as u8;
                    self.bytes.push(raw);
                    self
                }
                -128..=127 => {
                    self.op(OpCode::LDC_I4_S);
                    self.bytes.push(value as i8 as u8);
                    self
                }
                _ => {
                    self.op(OpCode::LDC_I4);
                    self.raw(&value.to_le_bytes())
                }
            }
        }

        pub fn ldc_i8(&mut self, value: i64) -> &mut Self {
            self.op(OpCode::LDC_I8);
            self.raw(&value.to_le_bytes())
        }

        pub fn ldc_r4(&mut self, value: f32) -> &mut Self {
            self.op(OpCode::LDC_R4);
            self.raw(&value.to_bits().to_le_bytes())
        }

        pub fn ldc_r8(&mut self, value: f64) -> &mut Self {
            self.op(OpCode::LDC_R8);
            self.raw(&value.to_bits().to_le_bytes())
        }

        /// Emit an opcode followed by a metadata token.
        pub fn with_token(&mut self, op: OpCode, token: Token) -> &mut Self {
            self.op(op);
            self.raw(&token.to_le_bytes())
        }

        pub fn call(&mut self, token: Token) -> &mut Self {
            self.with_token(OpCode::CALL, token)
        }

        pub fn callvirt(&mut self, token: Token) -> &mut Self {
            self.with_token(OpCode::CALLVIRT, token)
        }

        pub fn newobj(&mut self, token: Token) -> &mut Self {
            self.with_token(OpCode::NEWOBJ, token)
        }

        /// Emit a long-form branch with an explicit displacement.
        pub fn branch(&mut self, op: OpCode, delta: i32) -> &mut Self {
            self.op(op);
            self.raw(&delta.to_le_bytes())
        }

        /// Emit a short-form branch with an explicit displacement.
        pub fn branch_s(&mut self, op: OpCode, delta: i8) -> &mut Self {
            self.op(op);
            self.bytes.push(delta as u8);
            self
        }

        pub fn ldloc(&mut self, index: u8) -> &mut Self {
            match index {
                0..=3 => {
                    self.bytes.push(OpCode::LDLOC_0 as u16 as u8 + index);
                    self
                }
                _ => {
                    self.op(OpCode::LDLOC_S);
                    self.bytes.push(index);
                    self
                }
            }
        }

        pub fn stloc(&mut self, index: u8) -> &mut Self {
            match index {
                0..=3 => {
                    self.bytes.push(OpCode::STLOC_0 as u16 as u8 + index);
                    self
                }
                _ => {
                    self.op(OpCode::STLOC_S);
                    self.bytes.push(index);
                    self
                }
            }
        }

        pub fn ldarg(&mut self, index: u8) -> &mut Self {
            match index {
                0..=3 => {
                    self.bytes.push(OpCode::LDARG_0 as u16 as u8 + index);
                    self
                }
                _ => {
                    self.op(OpCode::LDARG_S);
                    self.bytes.push(index);
                    self
                }
            }
        }

        pub fn ret(&mut self) -> &mut Self {
            self.op(OpCode::RET)
        }
    }

    /// The `(kind, 8-byte payload)` encoding used by StartTask arguments.
    pub fn encode_argument(value: &Variable) -> (u8, u64) {
        let raw = match &value.value {
            Value::Empty => 0,
            Value::Uint32(v) => *v as u64,
            Value::Int32(v) => *v as u32 as u64,
            Value::Boolean(v) => *v as u64,
            Value::Int64(v) => *v as u64,
            Value::Uint64(v) => *v,
            Value::Float(v) => v.to_bits() as u64,
            Value::Double(v) => v.to_bits(),
            _ => 0,
        };
        (value.kind() as u8, raw)
    }

    // Host-side request builders.

    pub fn declare_method_frame(
        code_ref: u8,
        flags: MethodFlags,
        max_stack: u8,
        num_args: u8,
        native: u16,
        token: Token,
    ) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u8(code_ref)
            .write_u8(flags.bits())
            .write_u8(max_stack)
            .write_u8(num_args)
            .write_u16(native)
            .write_u32(token);
        wire::request_frame(ExecutorCommand::DeclareMethod, &enc)
    }

    pub fn method_signature_frame(code_ref: u8, locals: bool, descs: &[(VariableKind, u16)]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u8(code_ref)
            .write_u8(locals as u8)
            .write_u8(descs.len() as u8);
        for (kind, size) in descs {
            enc.write_u8(*kind as u8).write_u16(*size);
        }
        wire::request_frame(ExecutorCommand::MethodSignature, &enc)
    }

    pub fn load_il_frame(code_ref: u8, total_len: u16, offset: u16, bytes: &[u8]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u8(code_ref)
            .write_u16(total_len)
            .write_u16(offset)
            .write_bytes(bytes);
        wire::request_frame(ExecutorCommand::LoadIl, &enc)
    }

    pub fn set_method_tokens_frame(code_ref: u8, pairs: &[(Token, Token)]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u8(code_ref);
        for (from, to) in pairs {
            enc.write_u32(*from).write_u32(*to);
        }
        wire::request_frame(ExecutorCommand::SetMethodTokens, &enc)
    }

    /// One member entry of a `ClassDeclaration` message.
    #[derive(Debug, Clone)]
    pub enum ClassMember {
        Field {
            token: Token,
            kind: VariableKind,
            size: u16,
            is_static: bool,
        },
        Method {
            token: Token,
            declarations: Vec<Token>,
        },
    }

    pub fn class_declaration_frame(
        token: Token,
        parent: Token,
        dynamic_size: u16,
        static_size: u16,
        value_type: bool,
        members: &[ClassMember],
    ) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u32(token)
            .write_u32(parent)
            .write_u16(dynamic_size)
            .write_u16(static_size)
            .write_u8(value_type as u8);
        for member in members {
            match member {
                ClassMember::Field { token, kind, size, is_static } => {
                    let mut kind_byte = *kind as u8;
                    if *is_static {
                        kind_byte |= VariableKind::STATIC_FLAG;
                    }
                    enc.write_u8(0).write_u32(*token).write_u8(kind_byte).write_u16(*size);
                }
                ClassMember::Method { token, declarations } => {
                    enc.write_u8(1).write_u32(*token).write_u8(declarations.len() as u8);
                    for decl in declarations {
                        enc.write_u32(*decl);
                    }
                }
            }
        }
        wire::request_frame(ExecutorCommand::ClassDeclaration, &enc)
    }

    pub fn class_end_frame(token: Token) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u32(token);
        wire::request_frame(ExecutorCommand::ClassDeclarationEnd, &enc)
    }

    pub fn interfaces_frame(token: Token, interfaces: &[Token]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u32(token);
        for i in interfaces {
            enc.write_u32(*i);
        }
        wire::request_frame(ExecutorCommand::Interfaces, &enc)
    }

    pub fn constant_data_frame(token: Token, total_len: u32, offset: u32, bytes: &[u8]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u32(token)
            .write_u32(total_len)
            .write_u32(offset)
            .write_bytes(bytes);
        wire::request_frame(ExecutorCommand::ConstantData, &enc)
    }

    #[derive(Debug, Clone, Copy)]
    pub struct ClauseDef {
        pub kind: ClauseKind,
        pub try_offset: u16,
        pub try_length: u16,
        pub handler_offset: u16,
        pub handler_length: u16,
        pub filter_token: Token,
    }

    pub fn exception_clauses_frame(method_token: Token, clauses: &[ClauseDef]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u32(method_token);
        for c in clauses {
            enc.write_u8(c.kind as u8)
                .write_u16(c.try_offset)
                .write_u16(c.try_length)
                .write_u16(c.handler_offset)
                .write_u16(c.handler_length)
                .write_u32(c.filter_token);
        }
        wire::request_frame(ExecutorCommand::ExceptionClauses, &enc)
    }

    pub fn special_token_list_frame(entries: &[(KnownTypeToken, Token)]) -> Vec<u8> {
        let mut enc = Encoder::new();
        for (slot, token) in entries {
            enc.write_u32(*slot as u32).write_u32(*token);
        }
        wire::request_frame(ExecutorCommand::SpecialTokenList, &enc)
    }

    pub fn start_task_frame(token: Token, args: &[Variable]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u32(token);
        for arg in args {
            let (kind, raw) = encode_argument(arg);
            enc.write_u8(kind).write_u64(raw);
        }
        wire::request_frame(ExecutorCommand::StartTask, &enc)
    }

    pub fn kill_task_frame() -> Vec<u8> {
        wire::request_frame(ExecutorCommand::KillTask, &Encoder::new())
    }

    pub fn reset_executor_frame() -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u8(1);
        wire::request_frame(ExecutorCommand::ResetExecutor, &enc)
    }

    pub fn copy_to_flash_frame() -> Vec<u8> {
        wire::request_frame(ExecutorCommand::CopyToFlash, &Encoder::new())
    }

    pub fn erase_flash_frame() -> Vec<u8> {
        wire::request_frame(ExecutorCommand::EraseFlash, &Encoder::new())
    }

    pub fn write_flash_header_frame(
        data_version: u32,
        data_hash: u32,
        startup_token: Token,
        startup_flags: u32,
    ) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u32(data_version)
            .write_u32(data_hash)
            .write_u32(startup_token)
            .write_u32(startup_flags);
        wire::request_frame(ExecutorCommand::WriteFlashHeader, &enc)
    }

    pub fn check_flash_version_frame(data_version: u32, data_hash: u32) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u32(data_version).write_u32(data_hash);
        wire::request_frame(ExecutorCommand::CheckFlashVersion, &enc)
    }

    pub fn set_constant_memory_size_frame(size: u32) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u32(size);
        wire::request_frame(ExecutorCommand::SetConstantMemorySize, &enc)
    }

    /// True when `frame` is an Ack response.
    pub fn is_ack(frame: &[u8]) -> bool {
        frame.len() >= 5 && frame[2] == ExecutorCommand::Ack as u8
    }

    /// The error code of a Nack response.
    pub fn nack_error(frame: &[u8]) -> Option<microclr_asm::ExecutionError> {
        if frame.len() >= 6 && frame[2] == ExecutorCommand::Nack as u8 {
            Some(microclr_asm::ExecutionError::from(frame[4]))
        } else {
            None
        }
    }

    /// An engine wired to simulated flash plus host-side token allocation,
    /// used to assemble programs the way the real host loader does.
    pub struct TestRig {
        pub engine: Interpreter<SimFlashStorage, NoHardware>,
        next_code_ref: u8,
        next_method_token: Token,
        next_class_token: Token,
        next_field_token: Token,
        next_string_token: Token,
    }

    impl Default for TestRig {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestRig {
        pub fn new() -> Self {
            Self {
                engine: Interpreter::simulated(),
                next_code_ref: 1,
                next_method_token: 0x0600_0001,
                next_class_token: 0x0200_0100,
                next_field_token: 0x0400_0001,
                next_string_token: 0x7000_0001,
            }
        }

        /// Send one frame, asserting the engine acks it.
        pub fn send(&mut self, frame: Vec<u8>) {
            let responses = self.engine.handle_frame(&frame);
            let last = responses.last().expect("response expected");
            assert!(is_ack(last), "request nacked: {:?}", nack_error(last));
        }

        /// Send one frame that must be nacked; returns the error code.
        pub fn send_expect_nack(&mut self, frame: Vec<u8>) -> microclr_asm::ExecutionError {
            let responses = self.engine.handle_frame(&frame);
            let last = responses.last().expect("response expected");
            nack_error(last).expect("nack expected")
        }

        pub fn alloc_method_token(&mut self) -> Token {
            let token = self.next_method_token;
            self.next_method_token += 1;
            token
        }

        pub fn alloc_class_token(&mut self) -> Token {
            let token = self.next_class_token;
            self.next_class_token += 1;
            token
        }

        pub fn alloc_field_token(&mut self) -> Token {
            let token = self.next_field_token;
            self.next_field_token += 1;
            token
        }

        /// Begin declaring a method; finish with [`MethodAsm::il`].
        pub fn method_builder(&mut self, num_args: u8, max_stack: u8) -> MethodAsm<'_> {
            let token = self.alloc_method_token();
            self.method_builder_with_token(token, num_args, max_stack)
        }

        /// Declare a method under a pre-allocated token, e.g. so a body
        /// can refer to itself.
        pub fn method_builder_with_token(
            &mut self,
            token: Token,
            num_args: u8,
            max_stack: u8,
        ) -> MethodAsm<'_> {
            let code_ref = self.next_code_ref;
            self.next_code_ref += 1;
            MethodAsm {
                rig: self,
                token,
                code_ref,
                flags: MethodFlags::STATIC,
                num_args,
                max_stack,
                locals: Vec::new(),
                args: Vec::new(),
                token_map: Vec::new(),
            }
        }

        /// Intern a UTF-16 string constant; returns its token.
        pub fn string_constant(&mut self, text: &str) -> Token {
            let token = self.next_string_token;
            self.next_string_token += 1;
            let bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
            self.send(constant_data_frame(token, bytes.len() as u32, 0, &bytes));
            token
        }

        pub fn add_clause(&mut self, method_token: Token, clause: ClauseDef) {
            self.send(exception_clauses_frame(method_token, &[clause]));
        }

        /// Start a task and run it to completion.
        pub fn run_task(&mut self, token: Token, args: &[Variable]) -> TaskState {
            self.send(start_task_frame(token, args));
            self.engine.run().expect("task must be active")
        }

        /// Run a task that must stop with an Int32 result.
        pub fn run_i32(&mut self, token: Token, args: &[i32]) -> i32 {
            let args: Vec<Variable> = args.iter().map(|v| Variable::from(*v)).collect();
            match self.run_task(token, &args) {
                TaskState::Stopped(value) => match value.value {
                    Value::Int32(v) => v,
                    other => panic!("expected Int32 result, got {other:?}"),
                },
                other => panic!("expected Stopped, got {other:?}"),
            }
        }
    }

    /// In-flight method declaration.
    pub struct MethodAsm<'a> {
        rig: &'a mut TestRig,
        token: Token,
        code_ref: u8,
        flags: MethodFlags,
        num_args: u8,
        max_stack: u8,
        locals: Vec<(VariableKind, u16)>,
        args: Vec<(VariableKind, u16)>,
        token_map: Vec<(Token, Token)>,
    }

    impl<'a> MethodAsm<'a> {
        pub fn token(&self) -> Token {
            self.token
        }

        pub fn flags(mut self, flags: MethodFlags) -> Self {
            self.flags = flags;
            self
        }

        pub fn void(mut self) -> Self {
            self.flags |= MethodFlags::VOID;
            self
        }

        pub fn local(mut self, kind: VariableKind) -> Self {
            self.locals.push((kind, 0));
            self
        }

        pub fn arg(mut self, kind: VariableKind) -> Self {
            self.args.push((kind, 0));
            self
        }

        pub fn remap(mut self, from: Token, to: Token) -> Self {
            self.token_map.push((from, to));
            self
        }

        /// Assemble the body and load the method through the wire
        /// protocol. Returns the method token.
        pub fn il(self, body: impl FnOnce(&mut IlAsm)) -> Token {
            let mut asm = IlAsm::new();
            body(&mut asm);
            let il = asm.into_bytes();

            let rig = self.rig;
            rig.send(declare_method_frame(
                self.code_ref,
                self.flags,
                self.max_stack,
                self.num_args,
                0,
                self.token,
            ));
            if !self.args.is_empty() {
                rig.send(method_signature_frame(self.code_ref, false, &self.args));
            }
            if !self.locals.is_empty() {
                rig.send(method_signature_frame(self.code_ref, true, &self.locals));
            }
            if !self.token_map.is_empty() {
                rig.send(set_method_tokens_frame(self.code_ref, &self.token_map));
            }
            // Split the IL stream into two chunks when it is long enough,
            // exercising the splice path.
            let total = il.len() as u16;
            if il.len() > 8 {
                let mid = il.len() / 2;
                rig.send(load_il_frame(self.code_ref, total, 0, &il[..mid]));
                rig.send(load_il_frame(self.code_ref, total, mid as u16, &il[mid..]));
            } else {
                rig.send(load_il_frame(self.code_ref, total, 0, &il));
            }
            self.token
        }
    }
}
