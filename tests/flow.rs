use microclr::prelude::*;
use microclr::util::test_helpers::*;

fn expect_i32(state: TaskState) -> i32 {
    match state {
        TaskState::Stopped(value) => match value.value {
            Value::Int32(v) => v,
            other => panic!("expected Int32, got {other:?}"),
        },
        other => panic!("expected Stopped, got {other:?}"),
    }
}

fn expect_abort_kind(state: TaskState) -> SystemException {
    match state {
        TaskState::Aborted(EngineError::UnhandledException(e)) => e.kind,
        other => panic!("expected aborted task, got {other:?}"),
    }
}

#[test]
fn nested_calls_compose() {
    let mut rig = TestRig::new();
    let double = rig
        .method_builder(1, 2)
        .arg(VariableKind::Int32)
        .il(|il| {
            il.ldarg(0);
            il.ldc_i4(2);
            il.op(OpCode::MUL);
            il.ret();
        });
    let add_one = rig
        .method_builder(1, 2)
        .arg(VariableKind::Int32)
        .il(|il| {
            il.ldarg(0);
            il.ldc_i4(1);
            il.op(OpCode::ADD);
            il.ret();
        });
    let main = rig.method_builder(0, 2).il(|il| {
        il.ldc_i4(20);
        il.call(double);
        il.call(add_one);
        il.ret();
    });
    assert_eq!(rig.run_i32(main, &[]), 41);
}

#[test]
fn call_sites_resolve_through_remap_table() {
    let mut rig = TestRig::new();
    let callee = rig.method_builder(0, 1).il(|il| {
        il.ldc_i4(77);
        il.ret();
    });
    let member_ref: Token = 0x0a00_0042;
    let main = rig
        .method_builder(0, 1)
        .remap(member_ref, callee)
        .il(|il| {
            il.call(member_ref);
            il.ret();
        });
    assert_eq!(rig.run_i32(main, &[]), 77);
}

#[test]
fn missing_method_aborts() {
    let mut rig = TestRig::new();
    let main = rig.method_builder(0, 1).il(|il| {
        il.call(0x0600_7777);
        il.ret();
    });
    assert_eq!(expect_abort_kind(rig.run_task(main, &[])), SystemException::MissingMethod);
}

#[test]
fn unbounded_recursion_overflows_the_call_stack() {
    let mut rig = TestRig::new();
    let token = rig.alloc_method_token();
    // The method calls itself by its own (pre-allocated) token.
    let recurse = rig.method_builder_with_token(token, 0, 1).il(move |il| {
        il.call(token);
        il.ret();
    });
    assert_eq!(
        expect_abort_kind(rig.run_task(recurse, &[])),
        SystemException::StackOverflow
    );
}

#[test]
fn virtual_dispatch_selects_the_override() {
    let mut rig = TestRig::new();

    let ctor_a = rig
        .method_builder(1, 1)
        .flags(MethodFlags::CTOR | MethodFlags::VOID)
        .il(|il| {
            il.ret();
        });
    let f_a = rig
        .method_builder(1, 1)
        .flags(MethodFlags::VIRTUAL)
        .il(|il| {
            il.ldc_i4(1);
            il.ret();
        });
    let ctor_b = rig
        .method_builder(1, 1)
        .flags(MethodFlags::CTOR | MethodFlags::VOID)
        .il(|il| {
            il.ret();
        });
    let f_b = rig
        .method_builder(1, 1)
        .flags(MethodFlags::VIRTUAL)
        .il(|il| {
            il.ldc_i4(2);
            il.ret();
        });

    let class_a = rig.alloc_class_token();
    rig.send(class_declaration_frame(
        class_a,
        0,
        0,
        0,
        false,
        &[
            ClassMember::Method { token: ctor_a, declarations: vec![] },
            ClassMember::Method { token: f_a, declarations: vec![f_a] },
        ],
    ));
    rig.send(class_end_frame(class_a));

    let class_b = rig.alloc_class_token();
    rig.send(class_declaration_frame(
        class_b,
        class_a,
        0,
        0,
        false,
        &[
            ClassMember::Method { token: ctor_b, declarations: vec![] },
            ClassMember::Method { token: f_b, declarations: vec![f_a] },
        ],
    ));
    rig.send(class_end_frame(class_b));

    // ((A)new B()).F() == 2
    let main = rig.method_builder(0, 2).il(|il| {
        il.newobj(ctor_b);
        il.with_token(OpCode::CASTCLASS, class_a);
        il.callvirt(f_a);
        il.ret();
    });
    assert_eq!(rig.run_i32(main, &[]), 2);

    // Dispatch on an A instance still finds A's implementation.
    let base = rig.method_builder(0, 2).il(|il| {
        il.newobj(ctor_a);
        il.callvirt(f_a);
        il.ret();
    });
    assert_eq!(rig.run_i32(base, &[]), 1);
}

#[test]
fn callvirt_on_null_raises_null_reference() {
    let mut rig = TestRig::new();
    let f = rig
        .method_builder(1, 1)
        .flags(MethodFlags::VIRTUAL)
        .il(|il| {
            il.ldc_i4(1);
            il.ret();
        });
    let main = rig.method_builder(0, 1).il(|il| {
        il.op(OpCode::LDNULL);
        il.callvirt(f);
        il.ret();
    });
    assert_eq!(expect_abort_kind(rig.run_task(main, &[])), SystemException::NullReference);
}

/// Declare a throwable exception class; returns `(class, ctor)`.
fn exception_class(rig: &mut TestRig) -> (Token, Token) {
    let ctor = rig
        .method_builder(1, 1)
        .flags(MethodFlags::CTOR | MethodFlags::VOID)
        .il(|il| {
            il.ret();
        });
    let class = rig.alloc_class_token();
    rig.send(class_declaration_frame(
        class,
        0,
        4,
        0,
        false,
        &[ClassMember::Method { token: ctor, declarations: vec![] }],
    ));
    rig.send(class_end_frame(class));
    (class, ctor)
}

#[test]
fn typed_catch_handles_the_throw() {
    let mut rig = TestRig::new();
    let (exc_class, exc_ctor) = exception_class(&mut rig);

    let mut try_len = 0u16;
    let mut handler = 0u16;
    let mut handler_len = 0u16;
    let main = rig.method_builder(0, 2).il(|il| {
        il.newobj(exc_ctor);
        il.op(OpCode::THROW);
        try_len = il.pos() as u16;
        handler = il.pos() as u16;
        il.op(OpCode::POP); // discard the exception object
        il.ldc_i4(42);
        il.ret();
        handler_len = il.pos() as u16 - handler;
    });
    rig.add_clause(
        main,
        ClauseDef {
            kind: ClauseKind::Clause,
            try_offset: 0,
            try_length: try_len,
            handler_offset: handler,
            handler_length: handler_len,
            filter_token: exc_class,
        },
    );
    assert_eq!(expect_i32(rig.run_task(main, &[])), 42);
}

#[test]
fn mismatched_catch_type_does_not_handle() {
    let mut rig = TestRig::new();
    let (_exc_class, exc_ctor) = exception_class(&mut rig);
    let (other_class, _) = exception_class(&mut rig);

    let mut try_len = 0u16;
    let mut handler = 0u16;
    let main = rig.method_builder(0, 2).il(|il| {
        il.newobj(exc_ctor);
        il.op(OpCode::THROW);
        try_len = il.pos() as u16;
        handler = il.pos() as u16;
        il.op(OpCode::POP);
        il.ldc_i4(42);
        il.ret();
    });
    rig.add_clause(
        main,
        ClauseDef {
            kind: ClauseKind::Clause,
            try_offset: 0,
            try_length: try_len,
            handler_offset: handler,
            handler_length: 4,
            filter_token: other_class,
        },
    );
    assert_eq!(
        expect_abort_kind(rig.run_task(main, &[])),
        SystemException::CustomException
    );
}

/// Declare a class holding one static Int32 counter; returns the field
/// token.
fn static_counter(rig: &mut TestRig) -> Token {
    let field = rig.alloc_field_token();
    let class = rig.alloc_class_token();
    rig.send(class_declaration_frame(
        class,
        0,
        0,
        4,
        false,
        &[ClassMember::Field {
            token: field,
            kind: VariableKind::Int32,
            size: 0,
            is_static: true,
        }],
    ));
    rig.send(class_end_frame(class));
    field
}

#[test]
fn finally_runs_on_leave() {
    let mut rig = TestRig::new();
    let counter = static_counter(&mut rig);

    // try { local0 = 1; leave end; } finally { counter++; } return local0;
    let mut try_len = 0u16;
    let mut finally_start = 0u16;
    let mut finally_len = 0u16;
    let main = rig
        .method_builder(0, 2)
        .local(VariableKind::Int32)
        .il(|il| {
            il.ldc_i4(1);
            il.stloc(0);
            let leave_at = il.pos();
            il.branch_s(OpCode::LEAVE_S, 0); // patched below
            try_len = il.pos() as u16;
            finally_start = il.pos() as u16;
            il.with_token(OpCode::LDSFLD, counter);
            il.ldc_i4(1);
            il.op(OpCode::ADD);
            il.with_token(OpCode::STSFLD, counter);
            il.op(OpCode::ENDFINALLY);
            finally_len = il.pos() as u16 - finally_start;
            let end = il.pos();
            il.ldloc(0);
            il.ret();
            // Patch the leave displacement now that the target is known.
            let delta = end as i8 - (leave_at as i8 + 2);
            il.patch_u8(leave_at + 1, delta as u8);
        });
    rig.add_clause(
        main,
        ClauseDef {
            kind: ClauseKind::Finally,
            try_offset: 0,
            try_length: try_len,
            handler_offset: finally_start,
            handler_length: finally_len,
            filter_token: 0,
        },
    );
    assert_eq!(expect_i32(rig.run_task(main, &[])), 1);

    // The finally must have run exactly once.
    let read_counter = rig.method_builder(0, 1).il(|il| {
        il.with_token(OpCode::LDSFLD, counter);
        il.ret();
    });
    assert_eq!(rig.run_i32(read_counter, &[]), 1);
}

#[test]
fn callee_finally_runs_before_caller_catch() {
    let mut rig = TestRig::new();
    let (exc_class, exc_ctor) = exception_class(&mut rig);
    let counter = static_counter(&mut rig);

    // callee: try { throw } finally { counter++ }
    let mut try_len = 0u16;
    let mut finally_start = 0u16;
    let mut finally_len = 0u16;
    let callee = rig
        .method_builder(0, 2)
        .void()
        .il(|il| {
            il.newobj(exc_ctor);
            il.op(OpCode::THROW);
            try_len = il.pos() as u16;
            finally_start = il.pos() as u16;
            il.with_token(OpCode::LDSFLD, counter);
            il.ldc_i4(1);
            il.op(OpCode::ADD);
            il.with_token(OpCode::STSFLD, counter);
            il.op(OpCode::ENDFINALLY);
            finally_len = il.pos() as u16 - finally_start;
            il.ret();
        });
    rig.add_clause(
        callee,
        ClauseDef {
            kind: ClauseKind::Finally,
            try_offset: 0,
            try_length: try_len,
            handler_offset: finally_start,
            handler_length: finally_len,
            filter_token: 0,
        },
    );

    // caller: try { callee() } catch (Exc) { return 42 + counter }
    let mut caller_try = 0u16;
    let mut handler = 0u16;
    let caller = rig.method_builder(0, 3).il(|il| {
        il.call(callee);
        caller_try = il.pos() as u16;
        handler = il.pos() as u16;
        il.op(OpCode::POP);
        il.ldc_i4(42);
        il.with_token(OpCode::LDSFLD, counter);
        il.op(OpCode::ADD);
        il.ret();
    });
    rig.add_clause(
        caller,
        ClauseDef {
            kind: ClauseKind::Clause,
            try_offset: 0,
            try_length: caller_try,
            handler_offset: handler,
            handler_length: 10,
            filter_token: exc_class,
        },
    );
    // counter was incremented by the callee's finally before the handler
    // observed it.
    assert_eq!(expect_i32(rig.run_task(caller, &[])), 43);
}

#[test]
fn filter_clause_decides_the_match() {
    let mut rig = TestRig::new();
    let (_exc_class, exc_ctor) = exception_class(&mut rig);

    let mut try_len = 0u16;
    let mut filter_start = 0u16;
    let mut handler = 0u16;
    let main = rig.method_builder(0, 2).il(|il| {
        il.newobj(exc_ctor);
        il.op(OpCode::THROW);
        try_len = il.pos() as u16;
        filter_start = il.pos() as u16;
        // filter: take the handler whenever an exception object exists.
        il.op(OpCode::POP);
        il.ldc_i4(1);
        il.op(OpCode::ENDFILTER);
        handler = il.pos() as u16;
        il.op(OpCode::POP);
        il.ldc_i4(7);
        il.ret();
    });
    rig.add_clause(
        main,
        ClauseDef {
            kind: ClauseKind::Filter,
            try_offset: 0,
            try_length: try_len,
            handler_offset: handler,
            handler_length: 4,
            filter_token: filter_start as Token,
        },
    );
    assert_eq!(expect_i32(rig.run_task(main, &[])), 7);
}

#[test]
fn rejecting_filter_leaves_the_task_unhandled() {
    let mut rig = TestRig::new();
    let (_exc_class, exc_ctor) = exception_class(&mut rig);

    let mut try_len = 0u16;
    let mut filter_start = 0u16;
    let mut handler = 0u16;
    let main = rig.method_builder(0, 2).il(|il| {
        il.newobj(exc_ctor);
        il.op(OpCode::THROW);
        try_len = il.pos() as u16;
        filter_start = il.pos() as u16;
        il.op(OpCode::POP);
        il.ldc_i4(0);
        il.op(OpCode::ENDFILTER);
        handler = il.pos() as u16;
        il.op(OpCode::POP);
        il.ldc_i4(7);
        il.ret();
    });
    rig.add_clause(
        main,
        ClauseDef {
            kind: ClauseKind::Filter,
            try_offset: 0,
            try_length: try_len,
            handler_offset: handler,
            handler_length: 4,
            filter_token: filter_start as Token,
        },
    );
    assert_eq!(
        expect_abort_kind(rig.run_task(main, &[])),
        SystemException::CustomException
    );
}

#[test]
fn engine_raised_exceptions_are_catchable_when_registered() {
    let mut rig = TestRig::new();
    // Declare a managed DivideByZeroException class and register it.
    let (exc_class, _ctor) = exception_class(&mut rig);
    rig.send(special_token_list_frame(&[(
        KnownTypeToken::DivideByZeroException,
        exc_class,
    )]));

    let mut try_len = 0u16;
    let mut handler = 0u16;
    let main = rig.method_builder(0, 2).il(|il| {
        il.ldc_i4(1);
        il.ldc_i4(0);
        il.op(OpCode::DIV);
        il.op(OpCode::POP);
        try_len = il.pos() as u16;
        handler = il.pos() as u16;
        il.op(OpCode::POP);
        il.ldc_i4(42);
        il.ret();
    });
    rig.add_clause(
        main,
        ClauseDef {
            kind: ClauseKind::Clause,
            try_offset: 0,
            try_length: try_len,
            handler_offset: handler,
            handler_length: 4,
            filter_token: exc_class,
        },
    );
    assert_eq!(expect_i32(rig.run_task(main, &[])), 42);
}

#[test]
fn kill_task_is_a_hard_abort() {
    let mut rig = TestRig::new();
    let spin = rig.method_builder(0, 1).il(|il| {
        il.branch_s(OpCode::BR_S, -2);
    });

    rig.send(start_task_frame(spin, &[]));
    assert!(rig.engine.run_step().is_none(), "task should still be running");
    assert!(rig.engine.is_executing());

    let responses = rig.engine.handle_frame(&kill_task_frame());
    assert_eq!(responses.len(), 2);
    // First the execution result carrying Killed, then the ack.
    assert_eq!(responses[0][3], ExecState::Killed as u8);
    assert!(is_ack(&responses[1]));
    assert!(!rig.engine.is_executing());
}
