use microclr::prelude::*;
use microclr::util::test_helpers::*;

#[test]
fn malformed_frames_are_nacked_without_state_change() {
    let mut rig = TestRig::new();
    let before_methods = rig.engine.method_count();

    for garbage in [
        vec![],
        vec![0x01, 0x02],
        vec![0xf0, 0x7b, 0xff, 0x01], // missing end marker
        vec![0xf0, 0x00, 0xff, 0x01, 0xf7], // wrong channel
        vec![0xf0, 0x7b, 0xff, 0x55, 0xf7], // unknown sub-command
    ] {
        let responses = rig.engine.handle_frame(&garbage);
        assert_eq!(responses.len(), 1);
        assert!(nack_error(&responses[0]).is_some());
    }
    assert_eq!(rig.engine.method_count(), before_methods);
}

#[test]
fn il_for_unknown_code_reference_is_rejected() {
    let mut rig = TestRig::new();
    assert_eq!(
        rig.send_expect_nack(load_il_frame(9, 4, 0, &[0x2a])),
        ExecutionError::InvalidArguments
    );
}

#[test]
fn out_of_order_il_chunks_are_rejected() {
    let mut rig = TestRig::new();
    rig.send(declare_method_frame(1, MethodFlags::STATIC, 1, 0, 0, 0x0600_0001));
    rig.send(load_il_frame(1, 8, 0, &[0x00, 0x00, 0x00, 0x00]));
    assert_eq!(
        rig.send_expect_nack(load_il_frame(1, 8, 6, &[0x00, 0x2a])),
        ExecutionError::InvalidArguments
    );
}

#[test]
fn busy_engine_rejects_everything_but_kill_and_reset() {
    let mut rig = TestRig::new();
    let spin = rig.method_builder(0, 1).il(|il| {
        il.branch_s(OpCode::BR_S, -2);
    });
    rig.send(start_task_frame(spin, &[]));
    assert!(rig.engine.is_executing());

    assert_eq!(
        rig.send_expect_nack(declare_method_frame(9, MethodFlags::STATIC, 1, 0, 0, 0x0600_0099)),
        ExecutionError::EngineBusy
    );
    assert_eq!(
        rig.send_expect_nack(start_task_frame(spin, &[])),
        ExecutionError::EngineBusy
    );
    assert_eq!(
        rig.send_expect_nack(copy_to_flash_frame()),
        ExecutionError::EngineBusy
    );

    // KillTask goes through and idles the engine again.
    let responses = rig.engine.handle_frame(&kill_task_frame());
    assert!(is_ack(responses.last().unwrap()));
    assert!(!rig.engine.is_executing());
}

#[test]
fn reset_requires_confirmation() {
    let mut rig = TestRig::new();
    let mut enc = wire::Encoder::new();
    enc.write_u8(0);
    let unconfirmed = wire::request_frame(ExecutorCommand::ResetExecutor, &enc);
    assert_eq!(
        rig.send_expect_nack(unconfirmed),
        ExecutionError::InvalidArguments
    );
}

#[test]
fn reset_drops_loaded_state_and_kills_the_task() {
    let mut rig = TestRig::new();
    let spin = rig.method_builder(0, 1).il(|il| {
        il.branch_s(OpCode::BR_S, -2);
    });
    rig.send(start_task_frame(spin, &[]));
    assert!(rig.engine.is_executing());

    rig.send(reset_executor_frame());
    assert!(!rig.engine.is_executing());
    assert_eq!(rig.engine.method_count(), 0);
    assert_eq!(rig.engine.class_count(), 0);
}

#[test]
fn start_task_for_unknown_method_is_rejected() {
    let mut rig = TestRig::new();
    assert_eq!(
        rig.send_expect_nack(start_task_frame(0x0600_4444, &[])),
        ExecutionError::InvalidArguments
    );
}

#[test]
fn execution_result_frame_carries_the_stop_state() {
    let mut rig = TestRig::new();
    let method = rig.method_builder(0, 1).il(|il| {
        il.ldc_i4(5);
        il.ret();
    });
    rig.send(start_task_frame(method, &[]));

    let mut result = None;
    for _ in 0..100 {
        if let Some(frame) = rig.engine.run_step() {
            result = Some(frame);
            break;
        }
    }
    let frame = result.expect("task must stop");
    assert_eq!(frame[1], wire::SCHEDULER_DATA);
    assert_eq!(frame[3], ExecState::Stopped as u8);
    assert_eq!(frame[4], 1, "one result slot follows");
}

#[test]
fn class_declaration_must_be_sealed_in_order() {
    let mut rig = TestRig::new();
    let class = rig.alloc_class_token();
    rig.send(class_declaration_frame(class, 0, 4, 0, false, &[]));
    // Sealing a different token is rejected; the pending class survives.
    assert_eq!(
        rig.send_expect_nack(class_end_frame(class + 1)),
        ExecutionError::InvalidArguments
    );
    rig.send(class_end_frame(class));
    assert_eq!(rig.engine.class_count(), 1);
}

#[test]
fn interfaces_attach_to_declared_classes() {
    let mut rig = TestRig::new();
    let class = rig.alloc_class_token();
    let iface = rig.alloc_class_token();
    rig.send(class_declaration_frame(class, 0, 4, 0, false, &[]));
    rig.send(class_end_frame(class));
    rig.send(interfaces_frame(class, &[iface]));
    // Unknown class is rejected.
    assert_eq!(
        rig.send_expect_nack(interfaces_frame(0x0200_9999, &[iface])),
        ExecutionError::InvalidArguments
    );
}

#[test]
fn constants_upload_in_chunks() {
    let mut rig = TestRig::new();
    let token = 0x7000_0005;
    rig.send(constant_data_frame(token, 8, 0, &[1, 2, 3, 4]));
    rig.send(constant_data_frame(token, 8, 4, &[5, 6, 7, 8]));
    assert_eq!(
        rig.send_expect_nack(constant_data_frame(token, 8, 12, &[9])),
        ExecutionError::InvalidArguments
    );
}

#[test]
fn special_token_list_installs_slots() {
    let mut rig = TestRig::new();
    rig.send(special_token_list_frame(&[
        (KnownTypeToken::Object, 0x0200_0001),
        (KnownTypeToken::String, 0x0200_0004),
        (KnownTypeToken::Array, 0x0200_0009),
    ]));
    rig.send(set_constant_memory_size_frame(128));
}

#[test]
fn method_redeclaration_clears_the_stub() {
    let mut rig = TestRig::new();
    rig.send(declare_method_frame(1, MethodFlags::STATIC, 2, 0, 0, 0x0600_0050));
    rig.send(load_il_frame(1, 2, 0, &[0x16, 0x2a])); // ldc.i4.0; ret

    // Redeclare under the same code reference and load a new body.
    rig.send(declare_method_frame(1, MethodFlags::STATIC, 2, 0, 0, 0x0600_0050));
    rig.send(load_il_frame(1, 2, 0, &[0x17, 0x2a])); // ldc.i4.1; ret
    rig.send(start_task_frame(0x0600_0050, &[]));
    match rig.engine.run().unwrap() {
        TaskState::Stopped(value) => assert_eq!(value, Variable::from(1i32)),
        other => panic!("expected Stopped, got {other:?}"),
    }
}
