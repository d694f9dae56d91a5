use sable_inferior::{Event, InferiorPort, InvokeOutcome, RuntimeBackend};

use super::Flow;
use crate::engine::SteppingEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttachPhase {
    /// Fetching the runtime's descriptor of the current thread.
    Thread,

    /// Fetching the address of the thread's last-managed-frame pointer.
    Lmf,
}

enum CallbackKind {
    /// Direct call of a compiled method on behalf of a caller.
    CallMethod { entry: u64, arg1: u64, arg2: u64 },

    /// JIT compilation of a method.
    CompileMethod { token: u64 },

    /// Class initializer of a managed class.
    ClassInit { class_ptr: u64 },

    /// Two-phase runtime bootstrap run when the engine attaches to a
    /// thread.
    Attach(AttachPhase),
}

/// Debugger-issued native call into the inferior.
///
/// Saves the thread's register state, issues the call with a unique call id,
/// and waits for the matching completion event; the saved state is restored
/// so the target ends up exactly where it was. A completion with the wrong
/// id, or any other stop, aborts the callback.
pub(crate) struct CallbackOperation {
    kind: CallbackKind,
    call_id: u64,
    saved: Option<crate::engine::SavedState>,

    /// Whether completion is handed to the parent operation instead of
    /// finishing the chain.
    notify_parent: bool,

    /// Raw result words of the completed call.
    pub(crate) result: Option<(u64, u64)>,
}

impl CallbackOperation {
    /// Callback running the class initializer of `class_ptr`, reporting to
    /// its parent operation.
    pub(crate) fn class_init(class_ptr: u64) -> Self {
        Self::helper(CallbackKind::ClassInit { class_ptr })
    }

    /// Callback compiling the method behind `token`, reporting to its parent
    /// operation.
    pub(crate) fn compile_method(token: u64) -> Self {
        Self::helper(CallbackKind::CompileMethod { token })
    }

    /// Root callback calling an arbitrary compiled entry point.
    pub(crate) fn call(entry: u64, arg1: u64, arg2: u64) -> Self {
        Self {
            kind: CallbackKind::CallMethod { entry, arg1, arg2 },
            call_id: 0,
            saved: None,
            notify_parent: false,
            result: None,
        }
    }

    /// Root callback bootstrapping the engine's runtime context.
    pub(crate) fn attach() -> Self {
        Self {
            kind: CallbackKind::Attach(AttachPhase::Thread),
            call_id: 0,
            saved: None,
            notify_parent: false,
            result: None,
        }
    }

    fn helper(kind: CallbackKind) -> Self {
        Self {
            kind,
            call_id: 0,
            saved: None,
            notify_parent: true,
            result: None,
        }
    }

    pub(crate) fn execute<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
    ) -> crate::Result<Flow> {
        self.saved = Some(engine.save_inferior_state()?);
        engine.push_pending_invocation()?;

        let info = engine.runtime_info();
        let (entry, arg1, arg2) = match &self.kind {
            CallbackKind::CallMethod { entry, arg1, arg2 } => (*entry, *arg1, *arg2),
            CallbackKind::CompileMethod { token } => (info.compile_method, *token, 0),
            CallbackKind::ClassInit { class_ptr } => (info.class_init, *class_ptr, 0),
            CallbackKind::Attach(_) => (info.get_current_thread, 0, 0),
        };

        self.call_id = engine.issue_call(entry, arg1, arg2)?;
        Ok(Flow::Wait)
    }

    pub(crate) fn process_event<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
        event: &Event,
    ) -> crate::Result<Flow> {
        match event {
            Event::CallbackCompleted {
                call_id,
                data,
                data2,
            } if *call_id == self.call_id => self.completed(engine, *data, *data2),
            Event::CallbackCompleted { call_id, .. } => {
                tracing::warn!(
                    expected = self.call_id,
                    got = call_id,
                    "callback completed with a mismatched call id"
                );
                self.abort(engine, true)
            }
            Event::Signaled(_) | Event::Exited(_) => self.abort(engine, false),
            Event::Stopped | Event::HitBreakpoint(_) | Event::Interrupted => {
                tracing::warn!("inferior stopped in the middle of a callback");
                self.abort(engine, true)
            }
            _ => Ok(Flow::Wait),
        }
    }

    fn completed<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
        data: u64,
        data2: u64,
    ) -> crate::Result<Flow> {
        if let CallbackKind::Attach(phase) = &mut self.kind {
            match phase {
                AttachPhase::Thread => {
                    *phase = AttachPhase::Lmf;

                    // the lmf pointer is looked up on the thread descriptor
                    // the first call returned
                    let entry = engine.runtime_info().get_lmf_addr;
                    self.call_id = engine.issue_call(entry, data, 0)?;
                    return Ok(Flow::Wait);
                }
                AttachPhase::Lmf => engine.set_lmf_addr(data),
            }
        }

        engine.pop_pending_invocation();
        if let Some(saved) = self.saved.take() {
            engine.restore_inferior_state(saved)?;
        }
        self.result = Some((data, data2));

        if self.notify_parent {
            Ok(Flow::Parent)
        } else {
            Ok(Flow::DoneViaCallback)
        }
    }

    fn abort<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
        restore: bool,
    ) -> crate::Result<Flow> {
        engine.pop_pending_invocation();

        match self.saved.take() {
            Some(saved) if restore => engine.restore_inferior_state(saved)?,
            _ => {}
        }

        Ok(Flow::Done)
    }
}

/// Request of a [runtime_invoke](crate::engine::EngineHandle::runtime_invoke)
/// command.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Runtime reference of the class the method belongs to, resolved to a
    /// class pointer before the call.
    pub class_ref: u64,

    /// Token of the method to invoke.
    pub method_token: u64,

    /// Receiver object pointer; zero for static methods.
    pub receiver: u64,

    /// Pointer to the packed argument block in the inferior.
    pub args: u64,

    /// Whether the receiver must be boxed before the call (value-type
    /// receiver).
    pub box_receiver: bool,

    /// Whether virtual dispatch must be resolved on the receiver.
    pub virtual_dispatch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvokeStage {
    ResolveClass,
    BoxReceiver,
    ResolveVirtual,
    Compile,
    Invoke,
}

/// Multi-stage callback invoking a managed method on behalf of the user.
///
/// Resolves the class, optionally boxes the receiver and resolves virtual
/// dispatch, compiles the target, then calls the runtime's invoke wrapper.
/// The global thread lock is held while runtime metadata is manipulated and
/// released before the actual invocation, so the invoked code can take
/// runtime-internal locks itself.
pub(crate) struct RuntimeInvokeOperation {
    request: InvokeRequest,
    stage: InvokeStage,
    call_id: u64,
    saved: Option<crate::engine::SavedState>,

    class_ptr: u64,
    receiver: u64,
    token: u64,

    /// Marshalled outcome of the completed invocation.
    pub(crate) result: Option<InvokeOutcome>,
}

impl RuntimeInvokeOperation {
    pub(crate) fn new(request: InvokeRequest) -> Self {
        let receiver = request.receiver;
        let token = request.method_token;
        Self {
            request,
            stage: InvokeStage::ResolveClass,
            call_id: 0,
            saved: None,
            class_ptr: 0,
            receiver,
            token,
            result: None,
        }
    }

    pub(crate) async fn execute<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
    ) -> crate::Result<Flow> {
        self.saved = Some(engine.save_inferior_state()?);
        engine.push_pending_invocation()?;
        engine.acquire_global_lock().await?;

        let entry = engine.runtime_info().lookup_class;
        self.call_id = engine.issue_call(entry, self.request.class_ref, 0)?;

        Ok(Flow::Wait)
    }

    pub(crate) fn process_event<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
        event: &Event,
    ) -> crate::Result<Flow> {
        match event {
            Event::CallbackCompleted {
                call_id,
                data,
                data2,
            } if *call_id == self.call_id => self.advance(engine, *data, *data2),
            Event::CallbackCompleted { call_id, .. } => {
                tracing::warn!(
                    expected = self.call_id,
                    got = call_id,
                    "invoke stage completed with a mismatched call id"
                );
                self.abort(engine, true)
            }
            Event::Signaled(_) | Event::Exited(_) => self.abort(engine, false),
            Event::Stopped | Event::HitBreakpoint(_) | Event::Interrupted => {
                tracing::warn!(stage = ?self.stage, "inferior stopped in the middle of an invoke");
                self.abort(engine, true)
            }
            _ => Ok(Flow::Wait),
        }
    }

    /// Consumes one stage result and issues the next stage's call.
    fn advance<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
        data: u64,
        data2: u64,
    ) -> crate::Result<Flow> {
        let info = engine.runtime_info();

        match self.stage {
            InvokeStage::ResolveClass => {
                if data == 0 {
                    tracing::warn!(class_ref = self.request.class_ref, "class resolution failed");
                    return self.abort(engine, true);
                }
                self.class_ptr = data;

                if self.request.box_receiver {
                    self.stage = InvokeStage::BoxReceiver;
                    self.call_id = engine.issue_call(info.box_object, self.class_ptr, self.receiver)?;
                } else {
                    self.dispatch_or_compile(engine)?;
                }
            }
            InvokeStage::BoxReceiver => {
                self.receiver = data;
                self.dispatch_or_compile(engine)?;
            }
            InvokeStage::ResolveVirtual => {
                self.token = data;
                self.stage = InvokeStage::Compile;
                self.call_id = engine.issue_call(info.compile_method, self.token, 0)?;
            }
            InvokeStage::Compile => {
                if data == 0 {
                    tracing::warn!(token = self.token, "method compilation failed");
                    return self.abort(engine, true);
                }
                engine.register_compiled_method(self.token, data);

                // metadata work is over; the invoked code may need other
                // threads to make progress
                engine.release_global_lock();

                self.stage = InvokeStage::Invoke;
                self.call_id = engine.issue_call(info.runtime_invoke, data, self.request.args)?;
            }
            InvokeStage::Invoke => {
                engine.pop_pending_invocation();
                if let Some(saved) = self.saved.take() {
                    engine.restore_inferior_state(saved)?;
                }
                self.result = Some(engine.marshal_invoke_result(data, data2));
                return Ok(Flow::DoneViaCallback);
            }
        }

        Ok(Flow::Wait)
    }

    fn dispatch_or_compile<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
    ) -> crate::Result<()> {
        let info = engine.runtime_info();

        if self.request.virtual_dispatch {
            self.stage = InvokeStage::ResolveVirtual;
            self.call_id = engine.issue_call(info.get_virtual_method, self.receiver, self.token)?;
        } else {
            self.stage = InvokeStage::Compile;
            self.call_id = engine.issue_call(info.compile_method, self.token, 0)?;
        }

        Ok(())
    }

    fn abort<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
        restore: bool,
    ) -> crate::Result<Flow> {
        engine.release_global_lock();
        engine.pop_pending_invocation();

        match self.saved.take() {
            Some(saved) if restore => engine.restore_inferior_state(saved)?,
            _ => {}
        }

        Ok(Flow::Done)
    }
}
