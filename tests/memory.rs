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

/// Declare a reference class `{ int a; long b; object next; }` with a
/// parameterless constructor; returns `(class, ctor, field_a, field_b,
/// field_next)`.
fn point_class(rig: &mut TestRig) -> (Token, Token, Token, Token, Token) {
    let ctor = rig
        .method_builder(1, 1)
        .flags(MethodFlags::CTOR | MethodFlags::VOID)
        .il(|il| {
            il.ret();
        });
    let class = rig.alloc_class_token();
    let field_a = rig.alloc_field_token();
    let field_b = rig.alloc_field_token();
    let field_next = rig.alloc_field_token();
    rig.send(class_declaration_frame(
        class,
        0,
        16, // int + long + pointer
        0,
        false,
        &[
            ClassMember::Field { token: field_a, kind: VariableKind::Int32, size: 0, is_static: false },
            ClassMember::Field { token: field_b, kind: VariableKind::Int64, size: 0, is_static: false },
            ClassMember::Field { token: field_next, kind: VariableKind::Object, size: 0, is_static: false },
            ClassMember::Method { token: ctor, declarations: vec![] },
        ],
    ));
    rig.send(class_end_frame(class));
    (class, ctor, field_a, field_b, field_next)
}

#[test]
fn instance_fields_store_and_load() {
    let mut rig = TestRig::new();
    let (_class, ctor, field_a, field_b, _next) = point_class(&mut rig);

    let main = rig
        .method_builder(0, 3)
        .local(VariableKind::Object)
        .il(|il| {
            il.newobj(ctor);
            il.stloc(0);
            // obj.a = 1000
            il.ldloc(0);
            il.ldc_i4(1000);
            il.with_token(OpCode::STFLD, field_a);
            // obj.b = 1 (as i64)
            il.ldloc(0);
            il.ldc_i8(1);
            il.with_token(OpCode::STFLD, field_b);
            // return obj.a + (int)obj.b
            il.ldloc(0);
            il.with_token(OpCode::LDFLD, field_a);
            il.ldloc(0);
            il.with_token(OpCode::LDFLD, field_b);
            il.op(OpCode::CONV_I4);
            il.op(OpCode::ADD);
            il.ret();
        });
    assert_eq!(rig.run_i32(main, &[]), 1001);
}

#[test]
fn field_access_through_null_throws() {
    let mut rig = TestRig::new();
    let (_class, _ctor, field_a, ..) = point_class(&mut rig);
    let main = rig.method_builder(0, 2).il(|il| {
        il.op(OpCode::LDNULL);
        il.with_token(OpCode::LDFLD, field_a);
        il.ret();
    });
    match rig.run_task(main, &[]) {
        TaskState::Aborted(EngineError::UnhandledException(e)) => {
            assert_eq!(e.kind, SystemException::NullReference);
        }
        other => panic!("expected abort, got {other:?}"),
    }
}

#[test]
fn objects_link_through_reference_fields() {
    let mut rig = TestRig::new();
    let (_class, ctor, field_a, _b, field_next) = point_class(&mut rig);

    let main = rig
        .method_builder(0, 3)
        .local(VariableKind::Object)
        .local(VariableKind::Object)
        .il(|il| {
            il.newobj(ctor);
            il.stloc(0);
            il.newobj(ctor);
            il.stloc(1);
            // second.a = 55; first.next = second
            il.ldloc(1);
            il.ldc_i4(55);
            il.with_token(OpCode::STFLD, field_a);
            il.ldloc(0);
            il.ldloc(1);
            il.with_token(OpCode::STFLD, field_next);
            // return first.next.a
            il.ldloc(0);
            il.with_token(OpCode::LDFLD, field_next);
            il.with_token(OpCode::LDFLD, field_a);
            il.ret();
        });
    assert_eq!(rig.run_i32(main, &[]), 55);
}

/// Declare a primitive Int32 value class usable as an array element.
fn int32_class(rig: &mut TestRig) -> Token {
    let class = rig.alloc_class_token();
    let field = rig.alloc_field_token();
    rig.send(class_declaration_frame(
        class,
        0,
        4,
        0,
        true,
        &[ClassMember::Field { token: field, kind: VariableKind::Int32, size: 0, is_static: false }],
    ));
    rig.send(class_end_frame(class));
    class
}

#[test]
fn value_arrays_round_trip_elements() {
    let mut rig = TestRig::new();
    let int32 = int32_class(&mut rig);

    let main = rig
        .method_builder(0, 4)
        .local(VariableKind::ValueArray)
        .il(|il| {
            il.ldc_i4(5);
            il.with_token(OpCode::NEWARR, int32);
            il.stloc(0);
            // a[3] = 70
            il.ldloc(0);
            il.ldc_i4(3);
            il.ldc_i4(70);
            il.op(OpCode::STELEM_I4);
            // return a[3] + a.Length
            il.ldloc(0);
            il.ldc_i4(3);
            il.op(OpCode::LDELEM_I4);
            il.ldloc(0);
            il.op(OpCode::LDLEN);
            il.op(OpCode::ADD);
            il.ret();
        });
    assert_eq!(rig.run_i32(main, &[]), 75);
}

#[test]
fn array_index_out_of_range_throws() {
    let mut rig = TestRig::new();
    let int32 = int32_class(&mut rig);
    let main = rig
        .method_builder(0, 3)
        .local(VariableKind::ValueArray)
        .il(|il| {
            il.ldc_i4(2);
            il.with_token(OpCode::NEWARR, int32);
            il.stloc(0);
            il.ldloc(0);
            il.ldc_i4(2);
            il.op(OpCode::LDELEM_I4);
            il.ret();
        });
    match rig.run_task(main, &[]) {
        TaskState::Aborted(EngineError::UnhandledException(e)) => {
            assert_eq!(e.kind, SystemException::IndexOutOfRange);
        }
        other => panic!("expected abort, got {other:?}"),
    }
}

#[test]
fn addresses_of_locals_work_with_indirection() {
    let mut rig = TestRig::new();
    let main = rig
        .method_builder(0, 3)
        .local(VariableKind::Int32)
        .il(|il| {
            // *&local0 = 123; return local0
            il.op(OpCode::LDLOCA_S);
            il.raw(&[0]);
            il.ldc_i4(123);
            il.op(OpCode::STIND_I4);
            il.ldloc(0);
            il.ret();
        });
    assert_eq!(rig.run_i32(main, &[]), 123);
}

#[test]
fn byref_argument_writes_back_to_caller_local() {
    let mut rig = TestRig::new();
    // void set_to_9(ref int x) { *x = 9; }
    let setter = rig
        .method_builder(1, 2)
        .void()
        .arg(VariableKind::AddressOfVariable)
        .il(|il| {
            il.ldarg(0);
            il.ldc_i4(9);
            il.op(OpCode::STIND_I4);
            il.ret();
        });
    let main = rig
        .method_builder(0, 2)
        .local(VariableKind::Int32)
        .il(|il| {
            il.op(OpCode::LDLOCA_S);
            il.raw(&[0]);
            il.call(setter);
            il.ldloc(0);
            il.ret();
        });
    assert_eq!(rig.run_i32(main, &[]), 9);
}

#[test]
fn box_and_unbox_round_trip() {
    let mut rig = TestRig::new();
    let int32 = int32_class(&mut rig);
    let main = rig
        .method_builder(0, 2)
        .local(VariableKind::Object)
        .il(|il| {
            il.ldc_i4(31);
            il.with_token(OpCode::BOX, int32);
            il.stloc(0);
            il.ldloc(0);
            il.with_token(OpCode::UNBOX_ANY, int32);
            il.ldc_i4(11);
            il.op(OpCode::ADD);
            il.ret();
        });
    assert_eq!(rig.run_i32(main, &[]), 42);
}

#[test]
fn isinst_distinguishes_classes() {
    let mut rig = TestRig::new();
    let (class_a, ctor_a, ..) = point_class(&mut rig);
    let int32 = int32_class(&mut rig);

    let main = rig
        .method_builder(0, 2)
        .local(VariableKind::Object)
        .il(|il| {
            il.newobj(ctor_a);
            il.with_token(OpCode::ISINST, class_a);
            // non-null: 1
            il.op(OpCode::LDNULL);
            il.op(OpCode::CGT_UN);
            il.ret();
        });
    assert_eq!(rig.run_i32(main, &[]), 1);

    let main = rig
        .method_builder(0, 2)
        .il(|il| {
            il.newobj(ctor_a);
            il.with_token(OpCode::ISINST, int32);
            il.op(OpCode::LDNULL);
            il.op(OpCode::CGT_UN);
            il.ret();
        });
    assert_eq!(rig.run_i32(main, &[]), 0);
}

#[test]
fn strings_materialise_from_the_constant_heap() {
    let mut rig = TestRig::new();
    let hello = rig.string_constant("hello μclr");
    let main = rig.method_builder(0, 1).il(|il| {
        il.with_token(OpCode::LDSTR, hello);
        il.op(OpCode::LDLEN);
        il.ret();
    });
    assert_eq!(rig.run_i32(main, &[]), "hello μclr".encode_utf16().count() as i32);
}

#[test]
fn sizeof_value_types() {
    let mut rig = TestRig::new();
    let int32 = int32_class(&mut rig);
    let main = rig.method_builder(0, 1).il(|il| {
        il.with_token(OpCode::SIZEOF, int32);
        il.ret();
    });
    assert_eq!(rig.run_i32(main, &[]), 4);
}

#[test]
fn allocation_pressure_triggers_collection() {
    let mut rig = TestRig::new();
    // Cap the heap low enough that the loop cannot finish without the
    // collector reclaiming the garbage arrays of previous iterations.
    rig.engine = microclr::interpreter::Interpreter::simulated().with_memory_limit(32 * 1024);
    let int32 = int32_class(&mut rig);

    let main = rig
        .method_builder(0, 3)
        .local(VariableKind::Int32)
        .local(VariableKind::ValueArray)
        .il(|il| {
            let loop_start = il.pos();
            // local1 = new int[200]; drop it next iteration
            il.ldc_i4(200);
            il.with_token(OpCode::NEWARR, int32);
            il.stloc(1);
            il.ldloc(0);
            il.ldc_i4(1);
            il.op(OpCode::ADD);
            il.stloc(0);
            il.ldloc(0);
            il.ldc_i4(100);
            let here = il.pos() + 2;
            il.branch_s(OpCode::BLT_S, loop_start as i8 - here as i8);
            il.ldloc(0);
            il.ret();
        });
    // 100 iterations x ~800 bytes each is far beyond the 32 KB cap; only
    // collection makes this finish.
    assert_eq!(expect_i32(rig.run_task(main, &[])), 100);
    rig.engine.gc().validate_blocks().unwrap();
}
