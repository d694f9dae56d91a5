#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod common;

use std::sync::{Arc, Mutex};

use common::{
    method, MockInferior, MockInsn, MockRuntime, CLASS_INIT, COMPILE_METHOD, GET_CURRENT_THREAD,
    GET_LMF_ADDR, INIT_SP, LOOKUP_CLASS, RUNTIME_INVOKE,
};
use sable_engine::{
    BacktraceMode, BreakpointLocation, DebugProcess, Error, FrameKind, InvokeRequest,
    TargetEventKind, ThreadFilter,
};
use sable_inferior::{Notification, Registers, TrampolineTarget};

#[test_log::test(tokio::test)]
async fn breakpoint_hit_reports_index_and_frame() {
    let (port, inferior) = MockInferior::new(0x100);
    inferior.nops(0x100, 16);

    let runtime = MockRuntime::new();
    runtime.add_method(method(
        1,
        "main",
        0x100,
        0x110,
        0x100,
        &[(1, 0x100), (2, 0x104), (3, 0x108)],
    ));

    let (process, _) = DebugProcess::new(runtime);
    let (engine, _) = process.spawn_engine(0, port);

    let index = engine
        .insert_breakpoint(BreakpointLocation::Address(0x108), ThreadFilter::Global)
        .await
        .unwrap();

    let event = engine.resume().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::HitBreakpoint(index));

    let frame = event.frame.unwrap();
    assert_eq!(frame.pc, 0x108);
    assert_eq!(frame.line.unwrap().line, 3);
    assert_eq!(frame.kind, FrameKind::Managed);
}

#[test_log::test(tokio::test)]
async fn commands_are_rejected_while_an_operation_runs() {
    let (port, inferior) = MockInferior::new(0x100);
    inferior.code(0x100, MockInsn::Park);

    let (process, _) = DebugProcess::new(MockRuntime::new());
    let (engine, mut events) = process.spawn_engine(0, port);

    let event = engine.resume_background().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::Running);

    let err = engine.step_line().await.unwrap_err();
    assert!(matches!(err, Error::NotStopped));

    // the eventual stop lands on the event stream
    engine.stop().unwrap();
    let stop = events.recv().await.unwrap();
    assert_eq!(stop.kind, TargetEventKind::Interrupted);
}

#[test_log::test(tokio::test)]
async fn stop_interrupts_a_foreground_resume() {
    let (port, inferior) = MockInferior::new(0x100);
    inferior.code(0x100, MockInsn::Park);

    let (process, _) = DebugProcess::new(MockRuntime::new());
    let (engine, _) = process.spawn_engine(0, port);

    let resumer = engine.clone();
    let pending = tokio::spawn(async move { resumer.resume().await });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    engine.stop().unwrap();

    let event = pending.await.unwrap().unwrap();
    assert_eq!(event.kind, TargetEventKind::Interrupted);
}

#[test_log::test(tokio::test)]
async fn source_step_skips_over_a_call_without_source() {
    let (port, inferior) = MockInferior::new(0x101);
    inferior.code(0x100, MockInsn::Nop);
    inferior.code(0x101, MockInsn::Call(0x200));
    inferior.code(0x102, MockInsn::Nop);
    inferior.code(0x200, MockInsn::Ret);

    let runtime = MockRuntime::new();
    runtime.add_method(method(
        1,
        "main",
        0x100,
        0x110,
        0x100,
        &[(1, 0x100), (2, 0x101), (3, 0x102)],
    ));

    let (process, _) = DebugProcess::new(runtime);
    let (engine, _) = process.spawn_engine(0, port);

    let event = engine.step_line().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::Stopped);

    let frame = event.frame.unwrap();
    assert_eq!(frame.pc, 0x102);
    assert_eq!(frame.line.unwrap().line, 3);

    // the return-address breakpoint did not leak
    assert_eq!(inferior.trap_count(), 0);
    assert!(inferior.removed() >= 1);
}

#[test_log::test(tokio::test)]
async fn notification_mid_step_keeps_stepping_over_the_next_call() {
    let (port, inferior) = MockInferior::new(0x101);
    inferior.code(0x100, MockInsn::Nop);
    inferior.code(
        0x101,
        MockInsn::Notify(Notification::ClassInitialized, 0x5000, 0),
    );
    inferior.code(0x102, MockInsn::Call(0x200));
    inferior.code(0x103, MockInsn::Nop);
    inferior.code(0x200, MockInsn::Ret);

    let runtime = MockRuntime::new();
    runtime.add_method(method(
        1,
        "main",
        0x100,
        0x110,
        0x100,
        &[(1, 0x100), (2, 0x101), (3, 0x103)],
    ));

    let (process, _) = DebugProcess::new(runtime);
    let (engine, _) = process.spawn_engine(0, port);

    // the notification interrupts the step right before a call; the step
    // must still go over the call, not into it
    let event = engine.next_line().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::Stopped);

    let frame = event.frame.unwrap();
    assert_eq!(frame.pc, 0x103);
    assert_eq!(frame.line.unwrap().line, 3);

    assert_eq!(inferior.trap_count(), 0);
}

#[test_log::test(tokio::test)]
async fn breakpoint_indices_are_stable_and_removal_is_checked() {
    let (port, _inferior) = MockInferior::new(0x100);

    let (process, _) = DebugProcess::new(MockRuntime::new());
    let (engine, _) = process.spawn_engine(0, port);

    let first = engine
        .insert_breakpoint(BreakpointLocation::Address(0x108), ThreadFilter::Global)
        .await
        .unwrap();
    let second = engine
        .insert_breakpoint(BreakpointLocation::Address(0x109), ThreadFilter::Global)
        .await
        .unwrap();
    assert_ne!(first, second);

    engine.remove_breakpoint(first).await.unwrap();

    // indices are never reused
    let third = engine
        .insert_breakpoint(BreakpointLocation::Address(0x10a), ThreadFilter::Global)
        .await
        .unwrap();
    assert_ne!(third, first);
    assert_ne!(third, second);

    let err = engine.remove_breakpoint(first).await.unwrap_err();
    assert!(matches!(err, Error::LocationInvalid(_)));
}

#[test_log::test(tokio::test)]
async fn temporary_breakpoint_is_retired_when_the_target_exits_mid_step() {
    let (port, inferior) = MockInferior::new(0x101);
    inferior.code(0x101, MockInsn::Call(0x200));
    inferior.code(0x200, MockInsn::Exit(7));

    let runtime = MockRuntime::new();
    runtime.add_method(method(1, "main", 0x100, 0x110, 0x100, &[(2, 0x101)]));

    let (process, _) = DebugProcess::new(runtime);
    let (engine, _) = process.spawn_engine(0, port);

    let event = engine.next_line().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::Exited(7));
    assert!(event.frame.is_none());

    assert_eq!(inferior.trap_count(), 0);
}

#[test_log::test(tokio::test)]
async fn function_breakpoint_resolves_when_the_method_is_compiled() {
    let (port, inferior) = MockInferior::new(0x100);
    inferior.code(
        0x100,
        MockInsn::Notify(Notification::MethodCompiled, 7, 0x300),
    );
    inferior.code(0x101, MockInsn::Call(0x300));
    inferior.nops(0x300, 4);

    let runtime = MockRuntime::new();
    runtime.add_pending_method(method(7, "Widget.Render", 0x300, 0x310, 0x300, &[(1, 0x300)]));

    let (process, _) = DebugProcess::new(runtime);
    let (engine, _) = process.spawn_engine(0, port);

    let loads = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&loads);
    let index = engine
        .insert_breakpoint_with_handler(
            BreakpointLocation::Function {
                function: sable_inferior::FunctionRef {
                    token: 7,
                    name: "Widget.Render".to_owned(),
                },
                line: None,
            },
            ThreadFilter::Global,
            Box::new(move |index, addr| recorded.lock().unwrap().push((index, addr))),
        )
        .await
        .unwrap();

    // nothing planted until the runtime compiles the method
    assert_eq!(inferior.inserted(), 0);

    let event = engine.resume().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::HitBreakpoint(index));
    assert_eq!(event.frame.unwrap().pc, 0x300);

    assert_eq!(inferior.inserted(), 1);
    assert_eq!(loads.lock().unwrap().as_slice(), &[(index, 0x300)]);
}

#[test_log::test(tokio::test)]
async fn resume_steps_over_the_breakpoint_under_the_pc() {
    let (port_a, inferior_a) = MockInferior::new(0x100);
    inferior_a.code(0x100, MockInsn::Nop);
    inferior_a.code(0x101, MockInsn::Jump(0x100));

    let (port_b, _inferior_b) = MockInferior::new(0x500);

    let (process, _) = DebugProcess::new(MockRuntime::new());
    let (engine_a, _) = process.spawn_engine(0, port_a);
    let (engine_b, _) = process.spawn_engine(1, port_b);

    let index = engine_a
        .insert_breakpoint(BreakpointLocation::Address(0x100), ThreadFilter::Global)
        .await
        .unwrap();

    // the engine must not report the breakpoint it is standing on; it steps
    // over it (freezing the sibling thread) and comes back around the loop
    let event = engine_a.resume().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::HitBreakpoint(index));
    assert_eq!(event.frame.unwrap().pc, 0x100);

    // the trap is re-planted and the sibling thread thawed
    assert!(inferior_a.has_trap_at(0x100));
    let regs = engine_b.registers().await.unwrap();
    assert_eq!(regs.pc, 0x500);
}

#[test_log::test(tokio::test)]
async fn frozen_thread_resumes_transparently_after_the_lock_window() {
    let (port_a, _inferior_a) = {
        let (port, inferior) = MockInferior::new(0x100);
        inferior.code(0x100, MockInsn::Nop);
        inferior.code(0x101, MockInsn::Exit(0));
        (port, inferior)
    };

    let (port_b, inferior_b) = MockInferior::new(0x500);
    inferior_b.code(0x500, MockInsn::Park);

    let (process, _) = DebugProcess::new(MockRuntime::new());
    let (engine_a, _) = process.spawn_engine(0, port_a);
    let (engine_b, mut events_b) = process.spawn_engine(1, port_b);

    let running = engine_b.resume_background().await.unwrap();
    assert_eq!(running.kind, TargetEventKind::Running);

    engine_a
        .insert_breakpoint(BreakpointLocation::Address(0x100), ThreadFilter::Global)
        .await
        .unwrap();

    // stepping over its own breakpoint makes thread 0 freeze thread 1
    // mid-run; thread 1 must be thawed without observing a stop
    let event = engine_a.resume().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::Exited(0));

    assert!(events_b.try_recv().is_err());

    engine_b.stop().unwrap();
    let stop = events_b.recv().await.unwrap();
    assert_eq!(stop.kind, TargetEventKind::Interrupted);
    assert_eq!(inferior_b.pc(), 0x500);
}

#[test_log::test(tokio::test)]
async fn finish_runs_to_the_caller() {
    let (port, _inferior) = {
        let (port, inferior) = MockInferior::new(0x100);
        inferior.code(0x100, MockInsn::Call(0x200));
        inferior.nops(0x101, 4);
        inferior.nops(0x200, 3);
        inferior.code(0x203, MockInsn::Ret);
        (port, inferior)
    };

    let runtime = MockRuntime::new();
    runtime.add_method(method(1, "main", 0x100, 0x110, 0x100, &[(1, 0x100)]));
    runtime.add_method(method(2, "callee", 0x200, 0x210, 0x200, &[(5, 0x200)]));

    let (process, _) = DebugProcess::new(runtime);
    let (engine, _) = process.spawn_engine(0, port);

    let event = engine.step_instruction().await.unwrap();
    assert_eq!(event.frame.unwrap().pc, 0x200);

    let event = engine.finish().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::Stopped);
    assert_eq!(event.frame.unwrap().pc, 0x101);
}

#[test_log::test(tokio::test)]
async fn return_from_frame_pops_without_running() {
    let (port, inferior) = MockInferior::new(0x100);
    inferior.code(0x100, MockInsn::Call(0x200));
    inferior.nops(0x101, 4);
    inferior.nops(0x200, 4);

    let (process, _) = DebugProcess::new(MockRuntime::new());
    let (engine, _) = process.spawn_engine(0, port);

    let event = engine.step_instruction().await.unwrap();
    assert_eq!(event.frame.unwrap().pc, 0x200);

    let event = engine.return_from_frame().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::FrameChanged);
    assert_eq!(event.frame.unwrap().pc, 0x101);

    let regs = engine.registers().await.unwrap();
    assert_eq!(regs.pc, 0x101);
    assert_eq!(inferior.pc(), 0x101);
}

#[test_log::test(tokio::test)]
async fn instruction_step_completes_on_a_jump_to_itself() {
    let (port, inferior) = MockInferior::new(0x100);
    inferior.code(0x100, MockInsn::Jump(0x100));

    let (process, _) = DebugProcess::new(MockRuntime::new());
    let (engine, _) = process.spawn_engine(0, port);

    // the jump lands back on itself; one executed instruction is enough
    let event = engine.step_instruction().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::Stopped);
    assert_eq!(event.frame.unwrap().pc, 0x100);

    let event = engine.next_instruction().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::Stopped);
    assert_eq!(event.frame.unwrap().pc, 0x100);
}

#[test_log::test(tokio::test)]
async fn trampoline_call_compiles_and_enters_the_method() {
    let (port, inferior) = MockInferior::new(0x100);
    inferior.code(0x100, MockInsn::Call(0x8000));
    inferior.code(0x101, MockInsn::Nop);
    inferior.code(0x8000, MockInsn::Jump(0x300));
    inferior.nops(0x300, 4);
    inferior.on_call(CLASS_INIT, |_, _| (0, 0));
    inferior.on_call(COMPILE_METHOD, |_, _| (0x300, 0));

    let runtime = MockRuntime::new();
    runtime.add_method(method(
        1,
        "main",
        0x100,
        0x110,
        0x100,
        &[(1, 0x100), (2, 0x101)],
    ));
    runtime.add_pending_method(method(7, "Widget.Render", 0x300, 0x310, 0x302, &[(10, 0x302)]));
    runtime.add_trampoline(
        0x8000,
        TrampolineTarget {
            method_token: 7,
            class_ptr: 0x5000,
        },
    );

    let (process, _) = DebugProcess::new(runtime);
    let (engine, _) = process.spawn_engine(0, port);

    // a source step through the trampoline initializes the class, compiles
    // the method, and stops past its prologue
    let event = engine.step_line().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::Stopped);

    let frame = event.frame.unwrap();
    assert_eq!(frame.pc, 0x302);
    assert_eq!(frame.line.unwrap().line, 10);
    assert_eq!(frame.method.unwrap().token, 7);

    assert_eq!(inferior.call_count(CLASS_INIT), 1);
    assert_eq!(inferior.call_count(COMPILE_METHOD), 1);
}

#[test_log::test(tokio::test)]
async fn runtime_invoke_marshals_the_result_and_restores_state() {
    let (port, inferior) = MockInferior::new(0x100);
    inferior.on_call(LOOKUP_CLASS, |class_ref, _| {
        assert_eq!(class_ref, 1);
        (0x5000, 0)
    });
    inferior.on_call(COMPILE_METHOD, |token, _| {
        assert_eq!(token, 7);
        (0x300, 0)
    });
    inferior.on_call(RUNTIME_INVOKE, |entry, args| {
        assert_eq!(entry, 0x300);
        assert_eq!(args, 0x7000);
        (0x42, 0)
    });

    let (process, _) = DebugProcess::new(MockRuntime::new());
    let (engine, _) = process.spawn_engine(0, port);

    let outcome = engine
        .runtime_invoke(InvokeRequest {
            class_ref: 1,
            method_token: 7,
            receiver: 0,
            args: 0x7000,
            box_receiver: false,
            virtual_dispatch: false,
        })
        .await
        .unwrap();

    assert_eq!(outcome.value, Some(0x42));
    assert_eq!(outcome.exception, None);

    // the thread is back exactly where it was
    let regs = engine.registers().await.unwrap();
    assert_eq!(regs.pc, 0x100);
    assert_eq!(inferior.pc(), 0x100);
}

#[test_log::test(tokio::test)]
async fn mismatched_callback_id_aborts_the_call() {
    let (port, inferior) = MockInferior::new(0x100);
    inferior.on_call(0x400, |_, _| (9, 9));
    inferior.corrupt_call_ids();

    let (process, _) = DebugProcess::new(MockRuntime::new());
    let (engine, _) = process.spawn_engine(0, port);

    let err = engine.call_method(0x400, 1, 2).await.unwrap_err();
    assert!(matches!(err, Error::UnknownError));

    // the saved state was restored on abort
    let regs = engine.registers().await.unwrap();
    assert_eq!(regs.pc, 0x100);
}

#[test_log::test(tokio::test)]
async fn attach_fetches_the_runtime_context() {
    let (port, inferior) = MockInferior::new(0x100);
    inferior.on_call(GET_CURRENT_THREAD, |_, _| (0xAAA, 0));
    inferior.on_call(GET_LMF_ADDR, |thread, _| {
        // looked up on the descriptor the first call returned
        assert_eq!(thread, 0xAAA);
        (0xBBB, 0)
    });

    let (process, _) = DebugProcess::new(MockRuntime::new());
    let (engine, _) = process.spawn_engine(0, port);

    let event = engine.attach().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::Stopped);
    assert_eq!(event.frame.unwrap().pc, 0x100);

    assert_eq!(inferior.call_count(GET_CURRENT_THREAD), 1);
    assert_eq!(inferior.call_count(GET_LMF_ADDR), 1);
}

#[test_log::test(tokio::test)]
async fn managed_backtrace_walks_nested_calls() {
    let (port, _inferior) = {
        let (port, inferior) = MockInferior::new(0x100);
        inferior.code(0x100, MockInsn::Call(0x200));
        inferior.code(0x200, MockInsn::Call(0x300));
        inferior.nops(0x300, 4);
        (port, inferior)
    };

    let runtime = MockRuntime::new();
    runtime.add_method(method(1, "main", 0x100, 0x110, 0x100, &[(1, 0x100)]));
    runtime.add_method(method(2, "outer", 0x200, 0x210, 0x200, &[(5, 0x200)]));
    runtime.add_method(method(3, "inner", 0x300, 0x310, 0x300, &[(9, 0x300)]));

    let (process, _) = DebugProcess::new(runtime);
    let (engine, _) = process.spawn_engine(0, port);

    engine.step_instruction().await.unwrap();
    engine.step_instruction().await.unwrap();

    let backtrace = engine
        .backtrace(BacktraceMode::Managed, None, 16)
        .await
        .unwrap();

    let pcs: Vec<u64> = backtrace.frames().iter().map(|f| f.pc).collect();
    assert_eq!(pcs, vec![0x300, 0x201, 0x101]);

    let names: Vec<String> = backtrace
        .frames()
        .iter()
        .map(|f| f.method.as_ref().unwrap().name.clone())
        .collect();
    assert_eq!(names, vec!["inner", "outer", "main"]);
}

#[test_log::test(tokio::test)]
async fn native_backtrace_falls_back_to_the_lmf_chain() {
    let (port, inferior) = MockInferior::new(0x100);
    inferior.on_call(GET_CURRENT_THREAD, |_, _| (0xAAA, 0));
    inferior.on_call(GET_LMF_ADDR, |_, _| (0xBBB, 0));

    // one last-managed-frame record pointing back into `main`
    inferior.write_word(0xBBB, 0xC00);
    inferior.write_word(0xC00, 0); // previous record
    inferior.write_word(0xC08, 0x105); // pc
    inferior.write_word(0xC10, INIT_SP + 16); // sp
    inferior.write_word(0xC18, INIT_SP + 16); // fp

    let runtime = MockRuntime::new();
    runtime.add_method(method(1, "main", 0x100, 0x110, 0x100, &[(1, 0x100)]));

    let (process, _) = DebugProcess::new(runtime);
    let (engine, _) = process.spawn_engine(0, port);

    engine.attach().await.unwrap();

    // park the thread in native code the unwind rule knows nothing about
    engine
        .set_registers(Registers {
            pc: 0x400,
            sp: INIT_SP,
            fp: INIT_SP,
            gpr: Vec::new(),
        })
        .await
        .unwrap();

    let backtrace = engine
        .backtrace(BacktraceMode::Native, None, 16)
        .await
        .unwrap();

    let frames = backtrace.frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].pc, 0x400);
    assert_eq!(frames[0].kind, FrameKind::Native);
    assert_eq!(frames[1].pc, 0x105);
    assert_eq!(frames[1].kind, FrameKind::Managed);
}

#[test_log::test(tokio::test)]
async fn commands_after_exit_report_no_target() {
    let (port, _inferior) = {
        let (port, inferior) = MockInferior::new(0x100);
        inferior.code(0x100, MockInsn::Exit(3));
        (port, inferior)
    };

    let (process, _) = DebugProcess::new(MockRuntime::new());
    let (engine, _) = process.spawn_engine(0, port);

    let event = engine.resume().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::Exited(3));

    let err = engine.step_line().await.unwrap_err();
    assert!(matches!(err, Error::NoTarget));

    let err = engine.read_memory(0x100, 4).await.unwrap_err();
    assert!(matches!(err, Error::NoTarget));
}

#[test_log::test(tokio::test)]
async fn detach_removes_every_planted_trap() {
    let (port, inferior) = MockInferior::new(0x100);

    let (process, _) = DebugProcess::new(MockRuntime::new());
    let (engine, _) = process.spawn_engine(0, port);

    engine
        .insert_breakpoint(BreakpointLocation::Address(0x108), ThreadFilter::Global)
        .await
        .unwrap();
    engine
        .insert_breakpoint(BreakpointLocation::Address(0x109), ThreadFilter::Global)
        .await
        .unwrap();
    assert_eq!(inferior.trap_count(), 2);

    engine.detach().await.unwrap();
    assert_eq!(inferior.trap_count(), 0);
    assert!(inferior.detached());
}

#[test_log::test(tokio::test)]
async fn filtered_breakpoint_does_not_stop_other_threads() {
    let (port, inferior) = MockInferior::new(0x100);
    inferior.nops(0x100, 8);
    inferior.code(0x108, MockInsn::Exit(0));

    let (process, _) = DebugProcess::new(MockRuntime::new());
    let (engine, _) = process.spawn_engine(0, port);

    // breaks thread 9 only; this engine drives thread 0
    engine
        .insert_breakpoint(
            BreakpointLocation::Address(0x104),
            ThreadFilter::Thread(9),
        )
        .await
        .unwrap();

    let event = engine.resume().await.unwrap();
    assert_eq!(event.kind, TargetEventKind::Exited(0));
}
