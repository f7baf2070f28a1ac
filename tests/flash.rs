use microclr::flash::FlashMemoryManager;
use microclr::hardware::NoHardware;
use microclr::interpreter::Interpreter;
use microclr::prelude::*;
use microclr::util::test_helpers::*;

/// Build a program (a method returning 42), freeze it, and return the rig
/// plus the method token.
fn frozen_rig() -> (TestRig, Token) {
    let mut rig = TestRig::new();
    let method = rig.method_builder(0, 1).il(|il| {
        il.ldc_i4(42);
        il.ret();
    });
    rig.send(erase_flash_frame());
    rig.send(copy_to_flash_frame());
    rig.send(write_flash_header_frame(1, 0xbeef, method, 0));
    (rig, method)
}

#[test]
fn flash_version_check_after_freeze() {
    let (mut rig, _) = frozen_rig();
    rig.send(check_flash_version_frame(1, 0xbeef));
    assert_eq!(
        rig.send_expect_nack(check_flash_version_frame(1, 0xdead)),
        ExecutionError::InvalidArguments
    );
    assert_eq!(
        rig.send_expect_nack(check_flash_version_frame(2, 0xbeef)),
        ExecutionError::InvalidArguments
    );
}

#[test]
fn frozen_methods_still_execute() {
    let (mut rig, method) = frozen_rig();
    assert_eq!(rig.run_i32(method, &[]), 42);
}

#[test]
fn image_survives_a_reset() {
    let (rig, method) = frozen_rig();

    // Simulate a reboot: a fresh engine over the same flash contents.
    let storage = FlashMemoryManager::from(rig.engine).into_storage();
    let mut engine = Interpreter::with_storage(storage, NoHardware);
    engine.boot().unwrap();

    // The image matched, so the tables are served from flash again.
    assert!(engine.class_count() == 0);
    assert!(engine.method_count() > 0);

    let responses = engine.handle_frame(&check_flash_version_frame(1, 0xbeef));
    assert!(is_ack(responses.last().unwrap()));

    engine
        .start_task(method, Vec::new())
        .expect("frozen method must resolve");
    match engine.run().unwrap() {
        TaskState::Stopped(value) => assert_eq!(value, Variable::from(42i32)),
        other => panic!("expected Stopped, got {other:?}"),
    }
}

#[test]
fn auto_start_runs_the_startup_token() {
    let mut rig = TestRig::new();
    let method = rig.method_builder(0, 1).void().il(|il| {
        il.ldc_i4(1);
        il.op(OpCode::POP);
        il.ret();
    });
    rig.send(erase_flash_frame());
    rig.send(copy_to_flash_frame());
    rig.send(write_flash_header_frame(7, 1, method, StartupFlags::AUTO_START.bits()));

    let storage = FlashMemoryManager::from(rig.engine).into_storage();
    let mut engine = Interpreter::with_storage(storage, NoHardware);
    engine.boot().unwrap();
    assert!(engine.is_executing(), "auto-start must seed a task");
    assert!(matches!(engine.run(), Some(TaskState::Stopped(_))));
}

#[test]
fn stale_image_is_ignored_without_header() {
    // A brand-new engine over empty flash reports no image.
    let engine = Interpreter::simulated();
    assert!(engine.flash().header().is_none());

    let mut engine = engine;
    let responses = engine.handle_frame(&check_flash_version_frame(1, 1));
    assert!(!is_ack(responses.last().unwrap()));
}

#[test]
fn erase_flash_is_idempotent() {
    let (mut rig, _) = frozen_rig();
    rig.send(erase_flash_frame());
    rig.send(erase_flash_frame());
    assert_eq!(
        rig.send_expect_nack(check_flash_version_frame(1, 0xbeef)),
        ExecutionError::InvalidArguments
    );
}

#[test]
fn frozen_class_tables_round_trip() {
    let mut rig = TestRig::new();
    let ctor = rig
        .method_builder(1, 1)
        .flags(MethodFlags::CTOR | MethodFlags::VOID)
        .il(|il| {
            il.ret();
        });
    let class = rig.alloc_class_token();
    let field = rig.alloc_field_token();
    rig.send(class_declaration_frame(
        class,
        0,
        8,
        0,
        false,
        &[
            ClassMember::Field { token: field, kind: VariableKind::Int32, size: 0, is_static: false },
            ClassMember::Method { token: ctor, declarations: vec![] },
        ],
    ));
    rig.send(class_end_frame(class));

    let main = rig
        .method_builder(0, 3)
        .local(VariableKind::Object)
        .il(|il| {
            il.newobj(ctor);
            il.stloc(0);
            il.ldloc(0);
            il.ldc_i4(12);
            il.with_token(OpCode::STFLD, field);
            il.ldloc(0);
            il.with_token(OpCode::LDFLD, field);
            il.ret();
        });

    rig.send(erase_flash_frame());
    rig.send(copy_to_flash_frame());
    rig.send(write_flash_header_frame(3, 3, 0, 0));

    let storage = FlashMemoryManager::from(rig.engine).into_storage();
    let mut engine = Interpreter::with_storage(storage, NoHardware);
    engine.boot().unwrap();

    engine.start_task(main, Vec::new()).unwrap();
    match engine.run().unwrap() {
        TaskState::Stopped(value) => assert_eq!(value, Variable::from(12i32)),
        other => panic!("expected Stopped, got {other:?}"),
    }
}
