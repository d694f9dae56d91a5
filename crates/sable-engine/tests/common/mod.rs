//! Scripted inferior and runtime doubles driving the engine in tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use sable_inferior::{
    Event, Frame, InferiorPort, Instruction, InstructionKind, InvokeOutcome, MethodInfo,
    Notification, RawBreakpointId, Registers, RuntimeBackend, RuntimeInfo, TrampolineTarget,
};
use tokio::sync::Notify;

/// Entry points of the scripted runtime helpers.
pub const CLASS_INIT: u64 = 0x9000;
pub const COMPILE_METHOD: u64 = 0x9001;
pub const RUNTIME_INVOKE: u64 = 0x9002;
pub const LOOKUP_CLASS: u64 = 0x9003;
pub const BOX_OBJECT: u64 = 0x9004;
pub const GET_VIRTUAL_METHOD: u64 = 0x9005;
pub const GET_CURRENT_THREAD: u64 = 0x9006;
pub const GET_LMF_ADDR: u64 = 0x9007;

pub const INIT_SP: u64 = 0x8000_0000;

/// One scripted instruction; every instruction is one byte long.
#[derive(Debug, Clone, Copy)]
pub enum MockInsn {
    Nop,
    Call(u64),
    Jump(u64),
    Ret,
    /// Runs forever without producing an event.
    Park,
    Exit(i32),
    /// Emits a runtime notification, then stops.
    Notify(Notification, u64, u64),
}

type CallBehavior = Box<dyn FnMut(u64, u64) -> (u64, u64) + Send>;

struct MockState {
    regs: Registers,
    program: HashMap<u64, MockInsn>,
    memory: HashMap<u64, u8>,

    traps: HashMap<u64, RawBreakpointId>,
    next_raw: u64,
    inserted: usize,
    removed: usize,

    /// Return addresses of the active calls, outermost first.
    call_stack: Vec<u64>,

    events: VecDeque<Event>,
    calls: HashMap<u64, CallBehavior>,
    call_counts: HashMap<u64, usize>,
    corrupt_call_ids: bool,

    exited: bool,
    detached: bool,
}

enum Exec {
    Continue,
    Event(Event),
    Park,
}

fn execute_at(state: &mut MockState) -> Exec {
    let pc = state.regs.pc;
    let insn = state.program.get(&pc).copied().unwrap_or(MockInsn::Nop);

    match insn {
        MockInsn::Nop => {
            state.regs.pc += 1;
            Exec::Continue
        }
        MockInsn::Call(target) => {
            state.call_stack.push(pc + 1);
            state.regs.sp -= 16;
            state.regs.pc = target;
            Exec::Continue
        }
        MockInsn::Jump(target) => {
            state.regs.pc = target;
            Exec::Continue
        }
        MockInsn::Ret => match state.call_stack.pop() {
            Some(ret) => {
                state.regs.sp += 16;
                state.regs.pc = ret;
                Exec::Continue
            }
            None => {
                state.exited = true;
                Exec::Event(Event::Exited(0))
            }
        },
        MockInsn::Park => Exec::Park,
        MockInsn::Exit(code) => {
            state.exited = true;
            Exec::Event(Event::Exited(code))
        }
        MockInsn::Notify(kind, data, data2) => {
            state.regs.pc += 1;
            Exec::Event(Event::Notification { kind, data, data2 })
        }
    }
}

/// Scripted process-control port.
pub struct MockInferior {
    state: Arc<Mutex<MockState>>,
    notify: Arc<Notify>,
}

/// Shared view over a [MockInferior], kept by the test body.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
    notify: Arc<Notify>,
}

impl MockInferior {
    pub fn new(start_pc: u64) -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState {
            regs: Registers {
                pc: start_pc,
                sp: INIT_SP,
                fp: INIT_SP,
                gpr: Vec::new(),
            },
            program: HashMap::new(),
            memory: HashMap::new(),
            traps: HashMap::new(),
            next_raw: 1,
            inserted: 0,
            removed: 0,
            call_stack: Vec::new(),
            events: VecDeque::new(),
            calls: HashMap::new(),
            call_counts: HashMap::new(),
            corrupt_call_ids: false,
            exited: false,
            detached: false,
        }));
        let notify = Arc::new(Notify::new());

        let handle = MockHandle {
            state: Arc::clone(&state),
            notify: Arc::clone(&notify),
        };

        (Self { state, notify }, handle)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn queue(&self, state: &mut MockState, event: Event) {
        state.events.push_back(event);
        self.notify.notify_one();
    }
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Scripts one instruction.
    pub fn code(&self, addr: u64, insn: MockInsn) {
        self.lock().program.insert(addr, insn);
    }

    /// Scripts a run of no-ops.
    pub fn nops(&self, start: u64, count: u64) {
        let mut state = self.lock();
        for addr in start..start + count {
            state.program.insert(addr, MockInsn::Nop);
        }
    }

    /// Scripts a runtime helper entry point.
    pub fn on_call(&self, entry: u64, behavior: impl FnMut(u64, u64) -> (u64, u64) + Send + 'static) {
        self.lock().calls.insert(entry, Box::new(behavior));
    }

    /// Makes completion events carry wrong call ids.
    pub fn corrupt_call_ids(&self) {
        self.lock().corrupt_call_ids = true;
    }

    /// Writes one container word of inferior memory.
    pub fn write_word(&self, addr: u64, value: u64) {
        let mut state = self.lock();
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            state.memory.insert(addr + i as u64, *byte);
        }
    }

    /// Injects an out-of-band event.
    pub fn push_event(&self, event: Event) {
        self.lock().events.push_back(event);
        self.notify.notify_one();
    }

    pub fn pc(&self) -> u64 {
        self.lock().regs.pc
    }

    pub fn trap_count(&self) -> usize {
        self.lock().traps.len()
    }

    pub fn has_trap_at(&self, addr: u64) -> bool {
        self.lock().traps.contains_key(&addr)
    }

    pub fn inserted(&self) -> usize {
        self.lock().inserted
    }

    pub fn removed(&self) -> usize {
        self.lock().removed
    }

    pub fn call_count(&self, entry: u64) -> usize {
        self.lock().call_counts.get(&entry).copied().unwrap_or(0)
    }

    pub fn detached(&self) -> bool {
        self.lock().detached
    }
}

impl InferiorPort for MockInferior {
    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> sable_inferior::Result<()> {
        let state = self.lock();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = state.memory.get(&(addr + i as u64)).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> sable_inferior::Result<()> {
        let mut state = self.lock();
        for (i, byte) in data.iter().enumerate() {
            state.memory.insert(addr + i as u64, *byte);
        }
        Ok(())
    }

    fn get_registers(&mut self) -> sable_inferior::Result<Registers> {
        Ok(self.lock().regs.clone())
    }

    fn set_registers(&mut self, regs: &Registers) -> sable_inferior::Result<()> {
        self.lock().regs = regs.clone();
        Ok(())
    }

    fn current_frame(&mut self) -> sable_inferior::Result<Frame> {
        Ok(self.lock().regs.frame())
    }

    fn resume(&mut self) -> sable_inferior::Result<()> {
        let mut state = self.lock();
        if state.exited {
            return Ok(());
        }

        for _ in 0..10_000 {
            if let Some(&raw) = state.traps.get(&state.regs.pc) {
                self.queue(&mut state, Event::HitBreakpoint(raw));
                return Ok(());
            }

            match execute_at(&mut state) {
                Exec::Continue => {}
                Exec::Event(event) => {
                    self.queue(&mut state, event);
                    return Ok(());
                }
                Exec::Park => return Ok(()),
            }
        }

        // runaway script
        self.queue(&mut state, Event::Stopped);
        Ok(())
    }

    fn single_step(&mut self) -> sable_inferior::Result<()> {
        let mut state = self.lock();
        match execute_at(&mut state) {
            Exec::Continue | Exec::Park => self.queue(&mut state, Event::Stopped),
            Exec::Event(event) => self.queue(&mut state, event),
        }
        Ok(())
    }

    fn insert_breakpoint(&mut self, addr: u64) -> sable_inferior::Result<RawBreakpointId> {
        let mut state = self.lock();
        let raw = RawBreakpointId(state.next_raw);
        state.next_raw += 1;
        state.traps.insert(addr, raw);
        state.inserted += 1;
        Ok(raw)
    }

    fn remove_breakpoint(&mut self, raw: RawBreakpointId) -> sable_inferior::Result<()> {
        let mut state = self.lock();
        state.traps.retain(|_, r| *r != raw);
        state.removed += 1;
        Ok(())
    }

    fn call_method(
        &mut self,
        entry: u64,
        arg1: u64,
        arg2: u64,
        call_id: u64,
    ) -> sable_inferior::Result<()> {
        let mut state = self.lock();

        *state.call_counts.entry(entry).or_default() += 1;
        let (data, data2) = match state.calls.get_mut(&entry) {
            Some(behavior) => behavior(arg1, arg2),
            None => (0, 0),
        };

        let call_id = if state.corrupt_call_ids {
            call_id + 100
        } else {
            call_id
        };

        self.queue(
            &mut state,
            Event::CallbackCompleted {
                call_id,
                data,
                data2,
            },
        );
        Ok(())
    }

    fn interrupt(&mut self) -> sable_inferior::Result<()> {
        let mut state = self.lock();
        self.queue(&mut state, Event::Interrupted);
        Ok(())
    }

    fn decode_instruction(&mut self, addr: u64) -> sable_inferior::Result<Instruction> {
        let state = self.lock();
        let kind = match state.program.get(&addr).copied().unwrap_or(MockInsn::Nop) {
            MockInsn::Call(target) => InstructionKind::Call {
                target: Some(target),
            },
            MockInsn::Jump(target) => InstructionKind::Jump {
                target: Some(target),
            },
            MockInsn::Ret => InstructionKind::Ret,
            _ => InstructionKind::Other,
        };
        Ok(Instruction { kind, size: 1 })
    }

    fn unwind_caller_frame(
        &mut self,
        regs: &Registers,
    ) -> sable_inferior::Result<Option<Registers>> {
        let state = self.lock();

        if regs.sp >= INIT_SP {
            return Ok(None);
        }
        let depth = (INIT_SP - regs.sp) / 16;
        let Some(&ret) = state.call_stack.get(depth as usize - 1) else {
            return Ok(None);
        };

        Ok(Some(Registers {
            pc: ret,
            sp: regs.sp + 16,
            fp: regs.sp + 16,
            gpr: Vec::new(),
        }))
    }

    fn get_threads(&mut self) -> sable_inferior::Result<Vec<u64>> {
        Ok(vec![0])
    }

    fn detach(&mut self) -> sable_inferior::Result<()> {
        self.lock().detached = true;
        Ok(())
    }

    fn wait_event(&mut self) -> impl std::future::Future<Output = sable_inferior::Result<Event>> + Send {
        let state = Arc::clone(&self.state);
        let notify = Arc::clone(&self.notify);

        async move {
            loop {
                if let Some(event) = state.lock().unwrap().events.pop_front() {
                    return Ok(event);
                }
                notify.notified().await;
            }
        }
    }
}

struct RuntimeState {
    info: RuntimeInfo,
    compiled: Vec<MethodInfo>,
    pending: HashMap<u64, MethodInfo>,
    trampolines: HashMap<u64, TrampolineTarget>,
}

/// Scripted runtime collaborator; clones share state so the test body can
/// keep configuring it.
#[derive(Clone)]
pub struct MockRuntime {
    state: Arc<Mutex<RuntimeState>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RuntimeState {
                info: RuntimeInfo {
                    class_init: CLASS_INIT,
                    compile_method: COMPILE_METHOD,
                    runtime_invoke: RUNTIME_INVOKE,
                    lookup_class: LOOKUP_CLASS,
                    box_object: BOX_OBJECT,
                    get_virtual_method: GET_VIRTUAL_METHOD,
                    get_current_thread: GET_CURRENT_THREAD,
                    get_lmf_addr: GET_LMF_ADDR,
                },
                compiled: Vec::new(),
                pending: HashMap::new(),
                trampolines: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap()
    }

    /// Registers an already compiled method.
    pub fn add_method(&self, method: MethodInfo) {
        self.lock().compiled.push(method);
    }

    /// Registers a method that only becomes visible once the runtime
    /// compiles it.
    pub fn add_pending_method(&self, method: MethodInfo) {
        self.lock().pending.insert(method.token, method);
    }

    /// Registers a trampoline call target.
    pub fn add_trampoline(&self, addr: u64, target: TrampolineTarget) {
        self.lock().trampolines.insert(addr, target);
    }
}

impl RuntimeBackend for MockRuntime {
    fn runtime_info(&self) -> RuntimeInfo {
        self.lock().info
    }

    fn method_at(&self, addr: u64) -> Option<MethodInfo> {
        self.lock()
            .compiled
            .iter()
            .find(|m| m.contains(addr))
            .cloned()
    }

    fn method_by_token(&self, token: u64) -> Option<MethodInfo> {
        self.lock()
            .compiled
            .iter()
            .find(|m| m.token == token)
            .cloned()
    }

    fn trampoline_target(&self, call_target: u64) -> Option<TrampolineTarget> {
        self.lock().trampolines.get(&call_target).copied()
    }

    fn register_compiled_method(&mut self, token: u64, _addr: u64) {
        let mut state = self.lock();
        if let Some(method) = state.pending.remove(&token) {
            state.compiled.push(method);
        }
    }

    fn marshal_invoke_result(&self, data: u64, data2: u64) -> InvokeOutcome {
        InvokeOutcome {
            value: (data != 0).then_some(data),
            exception: (data2 != 0).then_some(data2),
        }
    }
}

/// Builds a [MethodInfo] from a compact description.
pub fn method(
    token: u64,
    name: &str,
    start: u64,
    end: u64,
    prologue_end: u64,
    lines: &[(u32, u64)],
) -> MethodInfo {
    MethodInfo {
        token,
        name: name.to_owned(),
        start,
        end,
        prologue_end,
        has_source: !lines.is_empty(),
        lines: lines
            .iter()
            .map(|&(line, address)| sable_inferior::LineEntry { line, address })
            .collect(),
    }
}
