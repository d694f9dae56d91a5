use std::collections::VecDeque;
use std::sync::Arc;

use sable_inferior::{
    Event, InferiorPort, Instruction, InvokeOutcome, MethodInfo, Notification, RawBreakpointId,
    Registers, RuntimeBackend, RuntimeInfo, TrampolineTarget,
};
use tokio::sync::{mpsc, oneshot};

use crate::breakpoint::{BreakpointIndex, BreakpointLocation, LoadHandler, ThreadFilter};
use crate::error::Error;
use crate::event::{TargetEvent, TargetEventKind};
use crate::frame::{Backtrace, BacktraceMode, FrameKind, StackFrame, StepFrame, StepMode};
use crate::operation::callback::{CallbackOperation, InvokeRequest, RuntimeInvokeOperation};
use crate::operation::step::{RunOperation, StepOperation, StepOverBreakpoint};
use crate::operation::{EventResult, Operation, OperationKind, ReplySlot};
use crate::process::{lock, ProcessShared, ThreadNotice, ThreadNoticeKind};
use crate::unwind::{compute_backtrace, PendingInvocation};

/// Classification of a raw breakpoint hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopClass {
    /// The engine's own temporary breakpoint.
    Temp,

    /// A user breakpoint that should break this thread.
    Ours(BreakpointIndex),

    /// A trap this thread must silently step over: another debugger client's
    /// breakpoint, or a user breakpoint whose thread filter rejects this
    /// thread.
    Foreign(Option<BreakpointIndex>),
}

/// Register snapshot saved around a debugger-issued native call.
pub(crate) struct SavedState {
    registers: Registers,
}

/// Low-level resume flavor last issued, replayed after a notification stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResumeMode {
    Continue,
    Step,
}

enum FreezeState {
    /// The thread runs normally.
    No,

    /// A freeze was requested while an operation was running; the
    /// acknowledgment is sent once the inferior thread reports stopped.
    Freezing(oneshot::Sender<()>),

    /// The thread is frozen by another engine holding the global thread
    /// lock; events and commands are deferred.
    Frozen,
}

/// Held global thread lock: the process-wide permit plus the threads frozen
/// on our behalf.
struct GlobalLockHold {
    _permit: tokio::sync::OwnedSemaphorePermit,
    frozen: Vec<u64>,
}

/// Command mailbox vocabulary of one engine task.
pub(crate) enum EngineCommand {
    Step {
        mode: StepMode,
        reply: oneshot::Sender<crate::Result<TargetEvent>>,
    },
    Continue {
        until: Option<u64>,
        background: bool,
        reply: oneshot::Sender<crate::Result<TargetEvent>>,
    },
    Attach {
        reply: oneshot::Sender<crate::Result<TargetEvent>>,
    },
    ReturnFromFrame {
        reply: oneshot::Sender<crate::Result<TargetEvent>>,
    },
    CallMethod {
        entry: u64,
        arg1: u64,
        arg2: u64,
        reply: oneshot::Sender<crate::Result<(u64, u64)>>,
    },
    RuntimeInvoke {
        request: InvokeRequest,
        reply: oneshot::Sender<crate::Result<InvokeOutcome>>,
    },
    AbortInvocation,
    Stop,
    Detach {
        reply: oneshot::Sender<crate::Result<()>>,
    },
    GetBacktrace {
        mode: BacktraceMode,
        stop_address: Option<u64>,
        limit: usize,
        reply: oneshot::Sender<crate::Result<Backtrace>>,
    },
    GetRegisters {
        reply: oneshot::Sender<crate::Result<Registers>>,
    },
    SetRegisters {
        regs: Registers,
        reply: oneshot::Sender<crate::Result<()>>,
    },
    ReadMemory {
        addr: u64,
        len: usize,
        reply: oneshot::Sender<crate::Result<Vec<u8>>>,
    },
    WriteMemory {
        addr: u64,
        data: Vec<u8>,
        reply: oneshot::Sender<crate::Result<()>>,
    },
    InsertBreakpoint {
        location: BreakpointLocation,
        filter: ThreadFilter,
        handler: Option<LoadHandler>,
        reply: oneshot::Sender<crate::Result<BreakpointIndex>>,
    },
    RemoveBreakpoint {
        index: BreakpointIndex,
        reply: oneshot::Sender<crate::Result<()>>,
    },
    EnableBreakpoint {
        index: BreakpointIndex,
        reply: oneshot::Sender<crate::Result<()>>,
    },
    DisableBreakpoint {
        index: BreakpointIndex,
        reply: oneshot::Sender<crate::Result<()>>,
    },
    Freeze {
        ack: oneshot::Sender<()>,
    },
    Unfreeze,
}

/// Per-thread driver of the operation state machine.
///
/// Owns the thread's process-control port and the current operation chain.
/// Runs as one task: commands arrive on a mailbox, events on the port; while
/// an operation is in flight the two are raced, commands first.
pub(crate) struct SteppingEngine<P: InferiorPort, R: RuntimeBackend> {
    port: P,
    thread_id: u64,
    shared: Arc<ProcessShared<R>>,
    info: RuntimeInfo,

    commands: mpsc::UnboundedReceiver<EngineCommand>,
    events: mpsc::UnboundedSender<TargetEvent>,

    current: Option<Box<Operation>>,

    temp_breakpoint: Option<(u64, RawBreakpointId)>,
    stepping_over: Option<BreakpointIndex>,
    lock: Option<GlobalLockHold>,

    resume_mode: ResumeMode,
    stop_requested: bool,
    last_event: Option<Event>,
    reported_breakpoint: Option<BreakpointIndex>,
    pending_invocations: Vec<PendingInvocation>,

    freeze: FreezeState,
    need_replay: bool,
    deferred_events: VecDeque<Event>,
    deferred_commands: VecDeque<EngineCommand>,

    dead: bool,
    next_call_id: u64,

    /// Address of this thread's last-managed-frame pointer, fetched during
    /// attach.
    lmf_addr: Option<u64>,
}

impl<P: InferiorPort, R: RuntimeBackend> SteppingEngine<P, R> {
    pub(crate) fn new(
        port: P,
        thread_id: u64,
        shared: Arc<ProcessShared<R>>,
        commands: mpsc::UnboundedReceiver<EngineCommand>,
        events: mpsc::UnboundedSender<TargetEvent>,
    ) -> Self {
        let info = lock(&shared.runtime).runtime_info();

        Self {
            port,
            thread_id,
            shared,
            info,
            commands,
            events,
            current: None,
            temp_breakpoint: None,
            stepping_over: None,
            lock: None,
            resume_mode: ResumeMode::Continue,
            stop_requested: false,
            last_event: None,
            reported_breakpoint: None,
            pending_invocations: Vec::new(),
            freeze: FreezeState::No,
            need_replay: false,
            deferred_events: VecDeque::new(),
            deferred_commands: VecDeque::new(),
            dead: false,
            next_call_id: 1,
            lmf_addr: None,
        }
    }

    /// Runs the engine until every handle is dropped or the thread detaches.
    #[tracing::instrument(name = "engine", skip_all, fields(thread = self.thread_id))]
    pub(crate) async fn run(mut self) {
        enum Next {
            Command(Option<EngineCommand>),
            Event(sable_inferior::Result<Event>),
        }

        loop {
            if matches!(self.freeze, FreezeState::No) {
                if let Some(event) = self.deferred_events.pop_front() {
                    self.handle_event(event).await;
                    continue;
                }
                if let Some(cmd) = self.deferred_commands.pop_front() {
                    if self.on_command(cmd).await {
                        break;
                    }
                    continue;
                }
            }

            let waiting_on_port = self.current.is_some()
                && matches!(self.freeze, FreezeState::No | FreezeState::Freezing(_));

            if waiting_on_port {
                let next = tokio::select! {
                    biased;
                    cmd = self.commands.recv() => Next::Command(cmd),
                    ev = self.port.wait_event() => Next::Event(ev),
                };

                match next {
                    Next::Command(None) => break,
                    Next::Command(Some(cmd)) => {
                        if self.on_command(cmd).await {
                            break;
                        }
                    }
                    Next::Event(Ok(event)) => self.handle_event(event).await,
                    Next::Event(Err(e)) => {
                        tracing::error!(error = %e, "event wait failed");
                        self.dead = true;
                        if let Some(root) = self.current.take() {
                            self.fail_operation(root, e.into());
                        }
                    }
                }
            } else {
                match self.commands.recv().await {
                    None => break,
                    Some(cmd) => {
                        if self.on_command(cmd).await {
                            break;
                        }
                    }
                }
            }
        }

        lock(&self.shared.engines).remove(&self.thread_id);
        tracing::debug!("engine exiting");
    }

    //
    // command handling
    //

    /// Returns `true` when the engine should exit.
    async fn on_command(&mut self, cmd: EngineCommand) -> bool {
        match cmd {
            EngineCommand::Freeze { ack } => {
                self.on_freeze(ack);
                return false;
            }
            EngineCommand::Unfreeze => {
                self.on_unfreeze();
                return false;
            }
            cmd => {
                if !matches!(self.freeze, FreezeState::No) {
                    // replayed once the thaw arrives
                    self.deferred_commands.push_back(cmd);
                    return false;
                }

                if self.current.is_some() {
                    self.on_command_running(cmd);
                    return false;
                }

                if self.dead && !matches!(cmd, EngineCommand::Detach { .. }) {
                    self.reject(cmd, Error::NoTarget);
                    return false;
                }

                self.on_command_stopped(cmd).await
            }
        }
    }

    fn on_command_running(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Stop | EngineCommand::AbortInvocation => {
                self.stop_requested = true;
                if let Err(e) = self.port.interrupt() {
                    tracing::warn!(error = %e, "interrupt request failed");
                }
            }
            EngineCommand::Detach { reply } => {
                let _ = reply.send(Err(Error::CannotDetach));
            }
            cmd => self.reject(cmd, Error::NotStopped),
        }
    }

    async fn on_command_stopped(&mut self, cmd: EngineCommand) -> bool {
        match cmd {
            EngineCommand::Step { mode, reply } => {
                let frame = match self.step_frame_for(mode) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return false;
                    }
                };

                let op = Operation::new(
                    StepOperation::new(frame).into(),
                    Some(ReplySlot::Target(reply)),
                );
                self.begin_operation(op).await;
            }
            EngineCommand::Continue {
                until,
                background,
                reply,
            } => {
                let reply = if background {
                    let _ = reply.send(Ok(TargetEvent {
                        kind: TargetEventKind::Running,
                        frame: None,
                    }));
                    None
                } else {
                    Some(ReplySlot::Target(reply))
                };

                let op = Operation::new(RunOperation::new(until).into(), reply);
                self.begin_operation(op).await;
            }
            EngineCommand::Attach { reply } => {
                let op = Operation::new(
                    CallbackOperation::attach().into(),
                    Some(ReplySlot::Target(reply)),
                );
                self.begin_operation(op).await;
            }
            EngineCommand::ReturnFromFrame { reply } => {
                let _ = reply.send(self.return_from_frame());
            }
            EngineCommand::CallMethod {
                entry,
                arg1,
                arg2,
                reply,
            } => {
                let op = Operation::new(
                    CallbackOperation::call(entry, arg1, arg2).into(),
                    Some(ReplySlot::Call(reply)),
                );
                self.begin_operation(op).await;
            }
            EngineCommand::RuntimeInvoke { request, reply } => {
                let op = Operation::new(
                    RuntimeInvokeOperation::new(request).into(),
                    Some(ReplySlot::Invoke(reply)),
                );
                self.begin_operation(op).await;
            }
            // nothing to stop
            EngineCommand::Stop | EngineCommand::AbortInvocation => {}
            EngineCommand::Detach { reply } => {
                let mut table = lock(&self.shared.breakpoints);
                table.remove_all_raw(&mut self.port);
                drop(table);

                let _ = reply.send(self.port.detach().map_err(Into::into));
                return true;
            }
            EngineCommand::GetBacktrace {
                mode,
                stop_address,
                limit,
                reply,
            } => {
                let runtime = lock(&self.shared.runtime);
                let result = compute_backtrace(
                    &mut self.port,
                    &*runtime,
                    mode,
                    stop_address,
                    limit,
                    self.lmf_addr,
                    &self.pending_invocations,
                );
                drop(runtime);
                let _ = reply.send(result);
            }
            EngineCommand::GetRegisters { reply } => {
                let _ = reply.send(self.port.get_registers().map_err(Into::into));
            }
            EngineCommand::SetRegisters { regs, reply } => {
                let _ = reply.send(self.port.set_registers(&regs).map_err(Into::into));
            }
            EngineCommand::ReadMemory { addr, len, reply } => {
                let mut buf = vec![0u8; len];
                let result = self.port.read_memory(addr, &mut buf).map(|()| buf);
                let _ = reply.send(result.map_err(Into::into));
            }
            EngineCommand::WriteMemory { addr, data, reply } => {
                let _ = reply.send(self.port.write_memory(addr, &data).map_err(Into::into));
            }
            EngineCommand::InsertBreakpoint {
                location,
                filter,
                handler,
                reply,
            } => {
                let _ = reply.send(self.insert_breakpoint(location, filter, handler));
            }
            EngineCommand::RemoveBreakpoint { index, reply } => {
                let mut table = lock(&self.shared.breakpoints);
                let _ = reply.send(table.remove(&mut self.port, index));
            }
            EngineCommand::EnableBreakpoint { index, reply } => {
                let mut table = lock(&self.shared.breakpoints);
                let _ = reply.send(table.enable(&mut self.port, index));
            }
            EngineCommand::DisableBreakpoint { index, reply } => {
                let mut table = lock(&self.shared.breakpoints);
                let _ = reply.send(table.disable(&mut self.port, index));
            }
            EngineCommand::Freeze { .. } | EngineCommand::Unfreeze => {
                unreachable!("freeze commands are handled upfront")
            }
        }

        false
    }

    /// Replies with an error to a command that cannot run right now.
    fn reject(&mut self, cmd: EngineCommand, err: Error) {
        match cmd {
            EngineCommand::Step { reply, .. }
            | EngineCommand::Continue { reply, .. }
            | EngineCommand::Attach { reply }
            | EngineCommand::ReturnFromFrame { reply } => {
                let _ = reply.send(Err(err));
            }
            EngineCommand::CallMethod { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            EngineCommand::RuntimeInvoke { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            EngineCommand::Detach { reply }
            | EngineCommand::SetRegisters { reply, .. }
            | EngineCommand::WriteMemory { reply, .. }
            | EngineCommand::RemoveBreakpoint { reply, .. }
            | EngineCommand::EnableBreakpoint { reply, .. }
            | EngineCommand::DisableBreakpoint { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            EngineCommand::GetBacktrace { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            EngineCommand::GetRegisters { reply } => {
                let _ = reply.send(Err(err));
            }
            EngineCommand::ReadMemory { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            EngineCommand::InsertBreakpoint { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            EngineCommand::Stop
            | EngineCommand::AbortInvocation
            | EngineCommand::Freeze { .. }
            | EngineCommand::Unfreeze => {}
        }
    }

    /// Computes the [StepFrame] a step command covers.
    fn step_frame_for(&mut self, mode: StepMode) -> crate::Result<StepFrame> {
        let regs = self.port.get_registers()?;
        let pc = regs.pc;

        match mode {
            StepMode::SingleInstruction | StepMode::NativeInstruction | StepMode::NextInstruction => {
                Ok(StepFrame {
                    start: pc,
                    end: pc + 1,
                    mode,
                    stack_pointer: None,
                })
            }
            StepMode::Finish => Ok(StepFrame {
                start: 0,
                end: 0,
                mode,
                stack_pointer: Some(regs.sp),
            }),
            StepMode::SourceLine | StepMode::NextLine | StepMode::StepFrameRange => {
                let range = self
                    .method_at(pc)
                    .filter(|m| m.has_source)
                    .and_then(|m| m.line_range(pc));

                match range {
                    Some((entry, end)) => Ok(StepFrame {
                        start: entry.address,
                        end,
                        mode,
                        stack_pointer: None,
                    }),
                    // no line information here; degrade to instruction
                    // stepping
                    None => Ok(StepFrame {
                        start: pc,
                        end: pc + 1,
                        mode: if mode.steps_over_calls() {
                            StepMode::NextInstruction
                        } else {
                            StepMode::SingleInstruction
                        },
                        stack_pointer: None,
                    }),
                }
            }
        }
    }

    /// Pops the current frame without running the target.
    fn return_from_frame(&mut self) -> crate::Result<TargetEvent> {
        let regs = self.port.get_registers()?;
        let Some(caller) = self.port.unwind_caller_frame(&regs)? else {
            return Err(Error::NoStack);
        };

        self.port.set_registers(&caller)?;

        Ok(TargetEvent {
            kind: TargetEventKind::FrameChanged,
            frame: self.compute_current_frame(),
        })
    }

    fn insert_breakpoint(
        &mut self,
        location: BreakpointLocation,
        filter: ThreadFilter,
        handler: Option<LoadHandler>,
    ) -> crate::Result<BreakpointIndex> {
        match &location {
            BreakpointLocation::Address(addr) => {
                let addr = *addr;
                let mut table = lock(&self.shared.breakpoints);
                table.insert_at(&mut self.port, location, filter, addr)
            }
            BreakpointLocation::Function { function, line } => {
                let token = function.token;
                let line = *line;

                match self.method_by_token(token) {
                    Some(method) => {
                        let addr = match line {
                            Some(line) => method.address_of_line(line).ok_or_else(|| {
                                Error::LocationInvalid(format!(
                                    "no line {line} in {}",
                                    method.name
                                ))
                            })?,
                            None => method.first_line_address(),
                        };

                        let mut table = lock(&self.shared.breakpoints);
                        let index = table.insert_at(&mut self.port, location, filter, addr)?;
                        drop(table);

                        if let Some(handler) = handler {
                            handler(index, addr);
                        }
                        Ok(index)
                    }
                    None => {
                        let mut table = lock(&self.shared.breakpoints);
                        let index = table.insert_deferred(location, filter, token);
                        if let Some(handler) = handler {
                            table.set_load_handler(index, handler);
                        }
                        Ok(index)
                    }
                }
            }
        }
    }

    //
    // event handling
    //

    async fn handle_event(&mut self, event: Event) {
        tracing::trace!(event = ?event, "event");

        if matches!(self.freeze, FreezeState::Freezing(_)) {
            // any event means the thread is stopped; acknowledge the freeze
            let FreezeState::Freezing(ack) =
                std::mem::replace(&mut self.freeze, FreezeState::Frozen)
            else {
                unreachable!()
            };

            match event {
                Event::Interrupted => self.need_replay = self.current.is_some(),
                other => {
                    self.deferred_events.push_back(other);
                    self.need_replay = false;
                }
            }

            let _ = ack.send(());
            return;
        }

        if matches!(self.freeze, FreezeState::Frozen) {
            self.deferred_events.push_back(event);
            return;
        }

        if let Event::Notification { kind, data, data2 } = event {
            if let Err(e) = self.handle_notification(kind, data, data2).await {
                if let Some(root) = self.current.take() {
                    self.fail_operation(root, e);
                }
            }
            return;
        }

        self.last_event = Some(event.clone());

        if self.current.is_some() {
            self.dispatch_event(event).await;
        } else {
            self.publish_unsolicited(event);
        }
    }

    async fn handle_notification(
        &mut self,
        kind: Notification,
        data: u64,
        data2: u64,
    ) -> crate::Result<()> {
        tracing::debug!(kind = ?kind, data, data2, "runtime notification");

        match kind {
            Notification::AcquireGlobalThreadLock => {
                self.acquire_global_lock().await?;
                self.replay_resume()
            }
            Notification::ReleaseGlobalThreadLock => {
                self.release_global_lock();
                self.replay_resume()
            }
            Notification::MethodCompiled => {
                self.register_compiled_method(data, data2);
                self.replay_resume()
            }
            Notification::ClassInitialized => self.replay_resume(),
            Notification::ReachedMain => self.complete_current(TargetEventKind::Stopped).await,
            Notification::ExceptionThrown => {
                self.complete_current(TargetEventKind::Exception { address: data })
                    .await
            }
            Notification::ExceptionHandled => self.replay_resume(),
            Notification::UnhandledException => {
                self.complete_current(TargetEventKind::UnhandledException { address: data })
                    .await
            }
            Notification::ThreadCreated => {
                let _ = self.shared.thread_notices.send(ThreadNotice {
                    thread: data,
                    kind: ThreadNoticeKind::Created,
                });
                self.replay_resume()
            }
            Notification::ThreadExited => {
                let _ = self.shared.thread_notices.send(ThreadNotice {
                    thread: data,
                    kind: ThreadNoticeKind::Exited,
                });
                self.replay_resume()
            }
            Notification::Other(code) => {
                lock(&self.shared.runtime).unknown_notification(code, data, data2);
                self.replay_resume()
            }
        }
    }

    /// Resumes the interrupted operation after a notification stop.
    fn replay_resume(&mut self) -> crate::Result<()> {
        if self.current.is_none() {
            return Ok(());
        }

        match self.resume_mode {
            ResumeMode::Continue => self.port.resume()?,
            // a raw re-step would execute the instruction at the new pc
            // without the operation re-deciding there (it may be a call that
            // must be stepped over); offer it a stop instead
            ResumeMode::Step => self.deferred_events.push_back(Event::Stopped),
        }
        Ok(())
    }

    /// Feeds one event through the operation chain, deepest node first.
    async fn dispatch_event(&mut self, event: Event) {
        let Some(chain) = self.current.take() else {
            unreachable!("no operation to dispatch to");
        };

        // unlink the chain into a flat stack
        let mut ops: Vec<Box<Operation>> = Vec::new();
        let mut node = chain;
        loop {
            let child = node.child.take();
            ops.push(node);
            match child {
                Some(child) => node = child,
                None => break,
            }
        }

        let mut idx = ops.len() - 1;
        let mut step = ops[idx].process_event(self, &event).await;

        loop {
            let result = match step {
                Ok(result) => result,
                Err(e) => {
                    let root = ops.swap_remove(0);
                    drop(ops);
                    self.fail_operation(root, e);
                    return;
                }
            };

            match result {
                EventResult::Running => {
                    // relink and keep waiting
                    let Some(mut node) = ops.pop() else {
                        unreachable!("operation chain is empty");
                    };
                    while let Some(mut parent) = ops.pop() {
                        parent.child = Some(node);
                        node = parent;
                    }
                    self.current = Some(node);
                    return;
                }
                EventResult::Completed | EventResult::CompletedViaCallback => {
                    let root = ops.swap_remove(0);
                    drop(ops);
                    self.finish_operation(root).await;
                    return;
                }
                EventResult::AskParent if idx > 0 => {
                    ops.truncate(idx);
                    idx -= 1;
                    step = if ops[idx].executed {
                        ops[idx].process_event(self, &event).await
                    } else {
                        ops[idx].resume(self).await
                    };
                }
                EventResult::ResumeOperation if idx > 0 => {
                    ops.truncate(idx);
                    idx -= 1;
                    step = ops[idx].resume(self).await;
                }
                EventResult::AskParent | EventResult::ResumeOperation => {
                    // the root has no parent; completion it is
                    let root = ops.swap_remove(0);
                    drop(ops);
                    self.finish_operation(root).await;
                    return;
                }
            }
        }
    }

    /// Starts a freshly constructed operation.
    ///
    /// When an enabled breakpoint sits under the program counter, a
    /// breakpoint step-over child runs first and the operation proper starts
    /// once the child hands control back.
    async fn begin_operation(&mut self, mut op: Operation) {
        let step = self.begin_operation_inner(&mut op).await;

        match step {
            Ok(EventResult::Running) => self.current = Some(Box::new(op)),
            Ok(_) => Box::pin(self.finish_operation(Box::new(op))).await,
            Err(e) => self.fail_operation(Box::new(op), e),
        }
    }

    async fn begin_operation_inner(&mut self, op: &mut Operation) -> crate::Result<EventResult> {
        let pc = self.current_pc()?;

        let under_pc = lock(&self.shared.breakpoints).at_address(pc);
        if let Some(index) = under_pc {
            tracing::debug!(index = %index, "stepping over the breakpoint under the pc first");

            let mut child = Operation::new(StepOverBreakpoint::new(Some(index)).into(), None);
            match Box::pin(child.execute(self)).await? {
                EventResult::Running => {
                    op.child = Some(Box::new(child));
                    return Ok(EventResult::Running);
                }
                // the child never completes synchronously, but if it ever
                // did the operation proper can start right away
                _ => {}
            }
        }

        op.execute(self).await
    }

    /// Forcibly completes the current operation chain with the given kind.
    async fn complete_current(&mut self, kind: TargetEventKind) -> crate::Result<()> {
        match self.current.take() {
            Some(root) => {
                self.finish_with_kind(root, Some(kind)).await;
                Ok(())
            }
            None => {
                let frame = self.compute_current_frame();
                let _ = self.events.send(TargetEvent { kind, frame });
                Ok(())
            }
        }
    }

    async fn finish_operation(&mut self, root: Box<Operation>) {
        self.finish_with_kind(root, None).await;
    }

    /// Tears down per-operation state and reports completion.
    async fn finish_with_kind(&mut self, mut root: Box<Operation>, forced: Option<TargetEventKind>) {
        self.current = None;
        let was_stop_requested = self.stop_requested;
        self.stop_requested = false;

        if let Err(e) = self.retire_temp_breakpoint() {
            tracing::warn!(error = %e, "temporary breakpoint removal failed");
        }
        if self.stepping_over.is_some() {
            if let Err(e) = self.end_step_over() {
                tracing::warn!(error = %e, "breakpoint re-enable failed");
            }
        }
        self.release_global_lock();

        let kind = forced.unwrap_or_else(|| self.completion_kind());
        self.reported_breakpoint = None;
        self.last_event = None;

        if kind.is_terminal() {
            self.dead = true;
        }

        let frame = if self.dead {
            None
        } else {
            self.compute_current_frame()
        };

        // a source-level step must not end inside a prologue or between two
        // lines; synthesize a continuation instead of reporting
        if kind == TargetEventKind::Stopped {
            if let Some(cont) = self.continuation_frame(&root, frame.as_ref()) {
                tracing::debug!(
                    start = format_args!("{:#x}", cont.start),
                    end = format_args!("{:#x}", cont.end),
                    "continuing to the next line boundary"
                );

                let reply = root.reply.take();
                drop(root);

                let op = Operation::new(StepOperation::new(cont).into(), reply);
                Box::pin(self.begin_operation(op)).await;
                return;
            }
        }

        tracing::debug!(kind = ?kind, "operation completed");

        let event = TargetEvent { kind, frame };
        match root.reply.take() {
            Some(ReplySlot::Target(tx)) => {
                let _ = tx.send(Ok(event));
            }
            Some(ReplySlot::Call(tx)) => {
                let result = match &mut root.kind {
                    OperationKind::Callback(op) => op.result.take(),
                    _ => None,
                };
                let _ = tx.send(result.ok_or(if was_stop_requested {
                    Error::Interrupted
                } else {
                    Error::UnknownError
                }));
            }
            Some(ReplySlot::Invoke(tx)) => {
                let result = match &mut root.kind {
                    OperationKind::RuntimeInvoke(op) => op.result.take(),
                    _ => None,
                };
                let _ = tx.send(result.ok_or(if was_stop_requested {
                    Error::Interrupted
                } else {
                    Error::UnknownError
                }));
            }
            None => {
                let _ = self.events.send(event);
            }
        }
    }

    /// Tears down per-operation state and reports a failure.
    fn fail_operation(&mut self, mut root: Box<Operation>, err: Error) {
        self.current = None;
        self.stop_requested = false;
        self.reported_breakpoint = None;
        self.last_event = None;

        if let Err(e) = self.retire_temp_breakpoint() {
            tracing::warn!(error = %e, "temporary breakpoint removal failed");
        }
        if self.stepping_over.is_some() {
            if let Err(e) = self.end_step_over() {
                tracing::warn!(error = %e, "breakpoint re-enable failed");
            }
        }
        self.release_global_lock();

        tracing::warn!(op = root.kind.label(), error = %err, "operation failed");

        match root.reply.take() {
            Some(ReplySlot::Target(tx)) => {
                let _ = tx.send(Err(err));
            }
            Some(ReplySlot::Call(tx)) => {
                let _ = tx.send(Err(err));
            }
            Some(ReplySlot::Invoke(tx)) => {
                let _ = tx.send(Err(err));
            }
            None => {}
        }
    }

    /// Maps the last raw event to the completion kind reported to callers.
    fn completion_kind(&mut self) -> TargetEventKind {
        match self.last_event.take() {
            Some(Event::Exited(code)) => TargetEventKind::Exited(code),
            Some(Event::Signaled(sig)) => TargetEventKind::Signaled(sig),
            Some(Event::Interrupted) => TargetEventKind::Interrupted,
            Some(Event::HitBreakpoint(_)) => match self.reported_breakpoint.take() {
                Some(index) => TargetEventKind::HitBreakpoint(index),
                None => TargetEventKind::Stopped,
            },
            _ => TargetEventKind::Stopped,
        }
    }

    /// Computes the step-frame continuation of a just-completed source-level
    /// step, if the landing point is not a line boundary.
    fn continuation_frame(
        &self,
        root: &Operation,
        frame: Option<&StackFrame>,
    ) -> Option<StepFrame> {
        let OperationKind::Step(step) = &root.kind else {
            return None;
        };
        if !step.mode().is_source_level() {
            return None;
        }

        let frame = frame?;
        let method = frame.method.as_ref().filter(|m| m.has_source)?;
        let pc = frame.pc;

        // inside the prologue: run to its end
        if pc >= method.start && pc < method.prologue_end {
            return Some(StepFrame {
                start: method.start,
                end: method.prologue_end,
                mode: StepMode::StepFrameRange,
                stack_pointer: None,
            });
        }

        // between two line entries: run to the next one
        let (entry, end) = method.line_range(pc)?;
        if entry.address != pc {
            return Some(StepFrame {
                start: entry.address,
                end,
                mode: StepMode::StepFrameRange,
                stack_pointer: None,
            });
        }

        None
    }

    /// Publishes an event that arrived with no operation waiting on it.
    fn publish_unsolicited(&mut self, event: Event) {
        let kind = match event {
            Event::Exited(code) => TargetEventKind::Exited(code),
            Event::Signaled(sig) => TargetEventKind::Signaled(sig),
            Event::Interrupted => TargetEventKind::Interrupted,
            Event::Stopped => TargetEventKind::Stopped,
            Event::HitBreakpoint(raw) => match self.classify(raw) {
                StopClass::Ours(index) => TargetEventKind::HitBreakpoint(index),
                _ => TargetEventKind::Stopped,
            },
            _ => return,
        };

        if kind.is_terminal() {
            self.dead = true;
        }

        let frame = if self.dead {
            None
        } else {
            self.compute_current_frame()
        };
        let _ = self.events.send(TargetEvent { kind, frame });
    }

    //
    // freeze protocol
    //

    fn on_freeze(&mut self, ack: oneshot::Sender<()>) {
        match self.freeze {
            FreezeState::No => {
                if self.current.is_some() {
                    // running; interrupt and acknowledge once stopped
                    match self.port.interrupt() {
                        Ok(()) => self.freeze = FreezeState::Freezing(ack),
                        Err(e) => {
                            tracing::warn!(error = %e, "interrupt for freeze failed");
                            self.freeze = FreezeState::Frozen;
                            let _ = ack.send(());
                        }
                    }
                } else {
                    self.freeze = FreezeState::Frozen;
                    let _ = ack.send(());
                }
            }
            FreezeState::Freezing(_) | FreezeState::Frozen => {
                // single lock holder; a second freeze cannot happen
                let _ = ack.send(());
            }
        }
    }

    fn on_unfreeze(&mut self) {
        if let FreezeState::Freezing(ack) =
            std::mem::replace(&mut self.freeze, FreezeState::No)
        {
            let _ = ack.send(());
        }

        if self.need_replay {
            self.need_replay = false;
            if let Err(e) = self.replay_resume() {
                if let Some(root) = self.current.take() {
                    self.fail_operation(root, e);
                }
            }
        }
    }

    /// Freezes every other thread of the inferior.
    ///
    /// Serialized process-wide by a semaphore; while waiting for the permit,
    /// incoming freezes are acknowledged immediately (this thread is already
    /// stopped) so two engines acquiring concurrently cannot deadlock.
    pub(crate) async fn acquire_global_lock(&mut self) -> crate::Result<()> {
        if self.lock.is_some() {
            return Ok(());
        }

        if let FreezeState::Freezing(ack) =
            std::mem::replace(&mut self.freeze, FreezeState::No)
        {
            let _ = ack.send(());
            self.freeze = FreezeState::Frozen;
        }

        let sem = Arc::clone(&self.shared.lock_sem);
        let mut acquire = std::pin::pin!(sem.acquire_owned());

        let permit = loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(EngineCommand::Freeze { ack }) => {
                        self.freeze = FreezeState::Frozen;
                        let _ = ack.send(());
                    }
                    Some(EngineCommand::Unfreeze) => self.freeze = FreezeState::No,
                    Some(cmd) => self.deferred_commands.push_back(cmd),
                    None => return Err(Error::EngineGone),
                },
                permit = &mut acquire => {
                    break permit.map_err(|_| Error::EngineGone)?;
                }
            }
        };
        self.freeze = FreezeState::No;

        let mut acks = Vec::new();
        let mut frozen = Vec::new();
        {
            let engines = lock(&self.shared.engines);
            for (&id, tx) in engines.iter() {
                if id == self.thread_id {
                    continue;
                }
                let (ack_tx, ack_rx) = oneshot::channel();
                if tx.send(EngineCommand::Freeze { ack: ack_tx }).is_ok() {
                    acks.push(ack_rx);
                    frozen.push(id);
                }
            }
        }

        for ack in acks {
            // a dropped ack means the engine exited; its thread is gone
            let _ = ack.await;
        }

        tracing::debug!(frozen = frozen.len(), "global thread lock acquired");
        self.lock = Some(GlobalLockHold {
            _permit: permit,
            frozen,
        });

        Ok(())
    }

    /// Thaws the threads frozen by [acquire_global_lock](Self::acquire_global_lock).
    ///
    /// No-op when the lock is not held.
    pub(crate) fn release_global_lock(&mut self) {
        let Some(hold) = self.lock.take() else {
            return;
        };

        let engines = lock(&self.shared.engines);
        for id in &hold.frozen {
            if let Some(tx) = engines.get(id) {
                let _ = tx.send(EngineCommand::Unfreeze);
            }
        }
        drop(engines);

        tracing::debug!("global thread lock released");
    }

    //
    // operation support surface
    //

    pub(crate) fn current_pc(&mut self) -> crate::Result<u64> {
        Ok(self.port.get_registers()?.pc)
    }

    pub(crate) fn registers(&mut self) -> crate::Result<Registers> {
        Ok(self.port.get_registers()?)
    }

    pub(crate) fn do_step(&mut self) -> crate::Result<()> {
        self.resume_mode = ResumeMode::Step;
        Ok(self.port.single_step()?)
    }

    pub(crate) fn do_continue(&mut self) -> crate::Result<()> {
        self.resume_mode = ResumeMode::Continue;
        Ok(self.port.resume()?)
    }

    /// Plants (or moves) the engine's single temporary breakpoint.
    pub(crate) fn insert_temp_breakpoint(&mut self, addr: u64) -> crate::Result<()> {
        if let Some((cur, raw)) = self.temp_breakpoint {
            if cur == addr {
                return Ok(());
            }
            self.temp_breakpoint = None;
            self.port.remove_breakpoint(raw)?;
        }

        let raw = self.port.insert_breakpoint(addr)?;
        self.temp_breakpoint = Some((addr, raw));
        Ok(())
    }

    pub(crate) fn retire_temp_breakpoint(&mut self) -> crate::Result<()> {
        if let Some((_, raw)) = self.temp_breakpoint.take() {
            self.port.remove_breakpoint(raw)?;
        }
        Ok(())
    }

    pub(crate) fn classify(&self, raw: RawBreakpointId) -> StopClass {
        if let Some((_, temp_raw)) = self.temp_breakpoint {
            if temp_raw == raw {
                return StopClass::Temp;
            }
        }

        match lock(&self.shared.breakpoints).lookup_raw(raw, self.thread_id) {
            Some((index, enabled, accepts)) if enabled && accepts => StopClass::Ours(index),
            Some((index, _, _)) => StopClass::Foreign(Some(index)),
            None => StopClass::Foreign(None),
        }
    }

    /// Records the breakpoint a completing operation should report.
    pub(crate) fn note_breakpoint_hit(&mut self, index: BreakpointIndex) {
        self.reported_breakpoint = Some(index);
    }

    pub(crate) fn decode_instruction(&mut self, addr: u64) -> crate::Result<Instruction> {
        Ok(self.port.decode_instruction(addr)?)
    }

    pub(crate) fn unwind_caller(&mut self) -> crate::Result<Option<Registers>> {
        let regs = self.port.get_registers()?;
        Ok(self.port.unwind_caller_frame(&regs)?)
    }

    pub(crate) fn method_at(&self, addr: u64) -> Option<MethodInfo> {
        lock(&self.shared.runtime).method_at(addr)
    }

    pub(crate) fn method_by_token(&self, token: u64) -> Option<MethodInfo> {
        lock(&self.shared.runtime).method_by_token(token)
    }

    pub(crate) fn trampoline_target(&self, addr: u64) -> Option<TrampolineTarget> {
        lock(&self.shared.runtime).trampoline_target(addr)
    }

    /// Records a compiled method and resolves breakpoints deferred on it.
    pub(crate) fn register_compiled_method(&mut self, token: u64, addr: u64) {
        let mut runtime = lock(&self.shared.runtime);
        runtime.register_compiled_method(token, addr);
        let method = runtime.method_by_token(token);
        drop(runtime);

        if let Some(method) = method {
            let mut table = lock(&self.shared.breakpoints);
            table.resolve_compiled(&mut self.port, token, &method);
        }
    }

    /// Disables a breakpoint for the duration of a step-over.
    pub(crate) fn begin_step_over(&mut self, index: BreakpointIndex) -> crate::Result<()> {
        let mut table = lock(&self.shared.breakpoints);
        table.disable(&mut self.port, index)?;
        drop(table);

        self.stepping_over = Some(index);
        Ok(())
    }

    /// Re-enables the breakpoint a step-over disabled.
    pub(crate) fn end_step_over(&mut self) -> crate::Result<()> {
        let Some(index) = self.stepping_over.take() else {
            return Ok(());
        };

        let mut table = lock(&self.shared.breakpoints);
        table.enable(&mut self.port, index)
    }

    /// Forgets the step-over marker without touching the inferior.
    pub(crate) fn clear_step_over(&mut self) {
        self.stepping_over = None;
    }

    pub(crate) fn runtime_info(&self) -> RuntimeInfo {
        self.info
    }

    pub(crate) fn marshal_invoke_result(&self, data: u64, data2: u64) -> InvokeOutcome {
        lock(&self.shared.runtime).marshal_invoke_result(data, data2)
    }

    pub(crate) fn save_inferior_state(&mut self) -> crate::Result<SavedState> {
        Ok(SavedState {
            registers: self.port.get_registers()?,
        })
    }

    pub(crate) fn restore_inferior_state(&mut self, saved: SavedState) -> crate::Result<()> {
        Ok(self.port.set_registers(&saved.registers)?)
    }

    pub(crate) fn push_pending_invocation(&mut self) -> crate::Result<()> {
        let frame = self.port.current_frame()?;
        self.pending_invocations.push(PendingInvocation { frame });
        Ok(())
    }

    pub(crate) fn pop_pending_invocation(&mut self) {
        self.pending_invocations.pop();
    }

    /// Starts a native call in the inferior, returning its call id.
    pub(crate) fn issue_call(&mut self, entry: u64, arg1: u64, arg2: u64) -> crate::Result<u64> {
        let call_id = self.next_call_id;
        self.next_call_id += 1;

        self.resume_mode = ResumeMode::Continue;
        self.port.call_method(entry, arg1, arg2, call_id)?;

        tracing::debug!(
            entry = format_args!("{entry:#x}"),
            call_id,
            "native call issued"
        );
        Ok(call_id)
    }

    pub(crate) fn set_lmf_addr(&mut self, addr: u64) {
        self.lmf_addr = Some(addr);
    }

    fn compute_current_frame(&mut self) -> Option<StackFrame> {
        let regs = match self.port.get_registers() {
            Ok(regs) => regs,
            Err(e) => {
                tracing::warn!(error = %e, "register read failed after stop");
                return None;
            }
        };

        let method = self.method_at(regs.pc);
        let line = method.as_ref().and_then(|m| m.line_at(regs.pc));
        let kind = if method.is_some() {
            FrameKind::Managed
        } else {
            FrameKind::Native
        };

        Some(StackFrame {
            pc: regs.pc,
            sp: regs.sp,
            fp: regs.fp,
            registers: regs,
            method,
            line,
            kind,
        })
    }
}

/// Cloneable handle over one engine task.
///
/// Every method marshals onto the engine's task and awaits the result; run
/// control methods block until the target stops again (or, for
/// [resume_background](Self::resume_background), return immediately).
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<EngineCommand>) -> Self {
        Self { commands }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<crate::Result<T>>) -> EngineCommand,
    ) -> crate::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| Error::EngineGone)?;
        rx.await.map_err(|_| Error::EngineGone)?
    }

    /// Runs the attach bootstrap, fetching the thread's runtime context.
    pub async fn attach(&self) -> crate::Result<TargetEvent> {
        self.request(|reply| EngineCommand::Attach { reply }).await
    }

    /// Steps with an explicit [StepMode].
    pub async fn step(&self, mode: StepMode) -> crate::Result<TargetEvent> {
        self.request(|reply| EngineCommand::Step { mode, reply })
            .await
    }

    /// Executes one machine instruction, following trampolines.
    pub async fn step_instruction(&self) -> crate::Result<TargetEvent> {
        self.step(StepMode::SingleInstruction).await
    }

    /// Executes one machine instruction, stepping over calls.
    pub async fn next_instruction(&self) -> crate::Result<TargetEvent> {
        self.step(StepMode::NextInstruction).await
    }

    /// Steps to the next source line, entering methods with source
    /// information.
    pub async fn step_line(&self) -> crate::Result<TargetEvent> {
        self.step(StepMode::SourceLine).await
    }

    /// Steps to the next source line of the current frame.
    pub async fn next_line(&self) -> crate::Result<TargetEvent> {
        self.step(StepMode::NextLine).await
    }

    /// Runs until the current frame returns.
    pub async fn finish(&self) -> crate::Result<TargetEvent> {
        self.step(StepMode::Finish).await
    }

    /// Resumes the thread until the next stop.
    pub async fn resume(&self) -> crate::Result<TargetEvent> {
        self.request(|reply| EngineCommand::Continue {
            until: None,
            background: false,
            reply,
        })
        .await
    }

    /// Resumes the thread until the given address.
    pub async fn resume_until(&self, addr: u64) -> crate::Result<TargetEvent> {
        self.request(|reply| EngineCommand::Continue {
            until: Some(addr),
            background: false,
            reply,
        })
        .await
    }

    /// Resumes the thread without waiting for the stop; the eventual stop is
    /// published on the engine's event stream.
    pub async fn resume_background(&self) -> crate::Result<TargetEvent> {
        self.request(|reply| EngineCommand::Continue {
            until: None,
            background: true,
            reply,
        })
        .await
    }

    /// Calls a compiled entry point inside the inferior, returning the two
    /// raw result words.
    pub async fn call_method(&self, entry: u64, arg1: u64, arg2: u64) -> crate::Result<(u64, u64)> {
        self.request(|reply| EngineCommand::CallMethod {
            entry,
            arg1,
            arg2,
            reply,
        })
        .await
    }

    /// Invokes a managed method on the user's behalf.
    pub async fn runtime_invoke(&self, request: InvokeRequest) -> crate::Result<InvokeOutcome> {
        self.request(|reply| EngineCommand::RuntimeInvoke { request, reply })
            .await
    }

    /// Requests an asynchronous abort of a pending invocation.
    pub fn abort_invocation(&self) -> crate::Result<()> {
        self.commands
            .send(EngineCommand::AbortInvocation)
            .map_err(|_| Error::EngineGone)
    }

    /// Requests an asynchronous interrupt of the running operation.
    pub fn stop(&self) -> crate::Result<()> {
        self.commands
            .send(EngineCommand::Stop)
            .map_err(|_| Error::EngineGone)
    }

    /// Detaches the thread, removing every planted breakpoint.
    pub async fn detach(&self) -> crate::Result<()> {
        self.request(|reply| EngineCommand::Detach { reply }).await
    }

    /// Computes a backtrace of at most `limit` frames.
    pub async fn backtrace(
        &self,
        mode: BacktraceMode,
        stop_address: Option<u64>,
        limit: usize,
    ) -> crate::Result<Backtrace> {
        self.request(|reply| EngineCommand::GetBacktrace {
            mode,
            stop_address,
            limit,
            reply,
        })
        .await
    }

    /// Reads the stopped thread's registers.
    pub async fn registers(&self) -> crate::Result<Registers> {
        self.request(|reply| EngineCommand::GetRegisters { reply })
            .await
    }

    /// Overwrites the stopped thread's registers.
    pub async fn set_registers(&self, regs: Registers) -> crate::Result<()> {
        self.request(|reply| EngineCommand::SetRegisters { regs, reply })
            .await
    }

    /// Reads inferior memory.
    pub async fn read_memory(&self, addr: u64, len: usize) -> crate::Result<Vec<u8>> {
        self.request(|reply| EngineCommand::ReadMemory { addr, len, reply })
            .await
    }

    /// Writes inferior memory.
    pub async fn write_memory(&self, addr: u64, data: Vec<u8>) -> crate::Result<()> {
        self.request(|reply| EngineCommand::WriteMemory { addr, data, reply })
            .await
    }

    /// Inserts a breakpoint.
    pub async fn insert_breakpoint(
        &self,
        location: BreakpointLocation,
        filter: ThreadFilter,
    ) -> crate::Result<BreakpointIndex> {
        self.request(|reply| EngineCommand::InsertBreakpoint {
            location,
            filter,
            handler: None,
            reply,
        })
        .await
    }

    /// Inserts a breakpoint with a handler invoked once the location
    /// resolves to an address.
    ///
    /// For an already resolved location the handler runs before this method
    /// returns.
    pub async fn insert_breakpoint_with_handler(
        &self,
        location: BreakpointLocation,
        filter: ThreadFilter,
        handler: LoadHandler,
    ) -> crate::Result<BreakpointIndex> {
        self.request(|reply| EngineCommand::InsertBreakpoint {
            location,
            filter,
            handler: Some(handler),
            reply,
        })
        .await
    }

    /// Removes a breakpoint.
    pub async fn remove_breakpoint(&self, index: BreakpointIndex) -> crate::Result<()> {
        self.request(|reply| EngineCommand::RemoveBreakpoint { index, reply })
            .await
    }

    /// Re-enables a disabled breakpoint.
    pub async fn enable_breakpoint(&self, index: BreakpointIndex) -> crate::Result<()> {
        self.request(|reply| EngineCommand::EnableBreakpoint { index, reply })
            .await
    }

    /// Disables a breakpoint without forgetting it.
    pub async fn disable_breakpoint(&self, index: BreakpointIndex) -> crate::Result<()> {
        self.request(|reply| EngineCommand::DisableBreakpoint { index, reply })
            .await
    }

    /// Pops the current frame without running the target.
    pub async fn return_from_frame(&self) -> crate::Result<TargetEvent> {
        self.request(|reply| EngineCommand::ReturnFromFrame { reply })
            .await
    }
}
