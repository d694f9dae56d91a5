pub(crate) mod callback;
pub(crate) mod step;
pub(crate) mod trampoline;

use sable_inferior::{Event, InferiorPort, InvokeOutcome, RuntimeBackend};
use tokio::sync::oneshot;

use self::callback::{CallbackOperation, RuntimeInvokeOperation};
use self::step::{RunOperation, StepOperation, StepOverBreakpoint};
use self::trampoline::TrampolineOperation;
use crate::engine::SteppingEngine;
use crate::event::TargetEvent;

/// Verdict of an operation after consuming one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventResult {
    /// The operation keeps running on the inferior.
    Running,

    /// The operation is done; the engine reports completion.
    Completed,

    /// The operation completed through a native-call callback; the saved
    /// caller state has already been restored.
    CompletedViaCallback,

    /// The operation is done and the event must be re-offered to its parent.
    AskParent,

    /// The operation is done and its parent should resume where it was
    /// interrupted, without re-dispatching the event.
    ResumeOperation,
}

/// Directive returned by an operation variant to its [Operation] wrapper.
///
/// Same vocabulary as [EventResult], plus child spawning.
pub(crate) enum Flow {
    Wait,
    Done,
    DoneViaCallback,
    Parent,
    ResumeParent,
    Spawn(OperationKind),
}

/// Completion slot of the caller blocked on a command.
///
/// Consumed exactly once, with either a value or a captured error.
pub(crate) enum ReplySlot {
    /// Run-control command awaiting a target event.
    Target(oneshot::Sender<crate::Result<TargetEvent>>),

    /// Native-call command awaiting the two raw result words.
    Call(oneshot::Sender<crate::Result<(u64, u64)>>),

    /// Runtime invocation awaiting a marshalled outcome.
    Invoke(oneshot::Sender<crate::Result<InvokeOutcome>>),
}

/// Stepping intent variants.
pub(crate) enum OperationKind {
    Step(StepOperation),
    Run(RunOperation),
    StepOverBreakpoint(StepOverBreakpoint),
    Trampoline(TrampolineOperation),
    Callback(CallbackOperation),
    RuntimeInvoke(RuntimeInvokeOperation),
}

impl From<StepOperation> for OperationKind {
    fn from(op: StepOperation) -> Self {
        Self::Step(op)
    }
}

impl From<RunOperation> for OperationKind {
    fn from(op: RunOperation) -> Self {
        Self::Run(op)
    }
}

impl From<StepOverBreakpoint> for OperationKind {
    fn from(op: StepOverBreakpoint) -> Self {
        Self::StepOverBreakpoint(op)
    }
}

impl From<TrampolineOperation> for OperationKind {
    fn from(op: TrampolineOperation) -> Self {
        Self::Trampoline(op)
    }
}

impl From<CallbackOperation> for OperationKind {
    fn from(op: CallbackOperation) -> Self {
        Self::Callback(op)
    }
}

impl From<RuntimeInvokeOperation> for OperationKind {
    fn from(op: RuntimeInvokeOperation) -> Self {
        Self::RuntimeInvoke(op)
    }
}

impl OperationKind {
    pub(crate) const fn label(&self) -> &'static str {
        match self {
            Self::Step(_) => "step",
            Self::Run(_) => "run",
            Self::StepOverBreakpoint(_) => "step-over-breakpoint",
            Self::Trampoline(_) => "trampoline",
            Self::Callback(_) => "callback",
            Self::RuntimeInvoke(_) => "runtime-invoke",
        }
    }
}

/// One node of the operation chain.
///
/// Operations form a singly-linked stack: at most one chain is current per
/// engine, and each node owns at most one child. A node is destroyed when it
/// reports completion to its parent or to the engine.
pub(crate) struct Operation {
    pub(crate) kind: OperationKind,

    /// Completion slot of the caller, when the operation was started by a
    /// command (helper children carry `None`).
    pub(crate) reply: Option<ReplySlot>,

    /// Active child operation.
    pub(crate) child: Option<Box<Operation>>,

    /// Program counter captured when execution started.
    pub(crate) start_frame: u64,

    /// Whether `execute` ran (a prepended child may delay it).
    pub(crate) executed: bool,
}

impl Operation {
    pub(crate) fn new(kind: OperationKind, reply: Option<ReplySlot>) -> Self {
        Self {
            kind,
            reply,
            child: None,
            start_frame: 0,
            executed: false,
        }
    }

    /// Starts the operation on the inferior.
    ///
    /// Called once; issues the first low-level continue/step/call through the
    /// engine.
    pub(crate) async fn execute<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
    ) -> crate::Result<EventResult> {
        self.executed = true;
        self.start_frame = engine.current_pc()?;

        tracing::debug!(
            op = self.kind.label(),
            pc = format_args!("{:#x}", self.start_frame),
            "operation starting"
        );

        let flow = match &mut self.kind {
            OperationKind::Step(op) => op.execute(engine).await?,
            OperationKind::Run(op) => op.execute(engine)?,
            OperationKind::StepOverBreakpoint(op) => op.execute(engine).await?,
            OperationKind::Trampoline(op) => op.execute(engine).await?,
            OperationKind::Callback(op) => op.execute(engine)?,
            OperationKind::RuntimeInvoke(op) => op.execute(engine).await?,
        };

        self.apply(engine, flow).await
    }

    /// Consumes one event while this operation is the deepest active node.
    pub(crate) async fn process_event<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
        event: &Event,
    ) -> crate::Result<EventResult> {
        let flow = match &mut self.kind {
            OperationKind::Step(op) => op.process_event(engine, event).await?,
            OperationKind::Run(op) => op.process_event(engine, event)?,
            OperationKind::StepOverBreakpoint(op) => op.process_event(engine, event)?,
            OperationKind::Trampoline(op) => op.process_event(engine, event).await?,
            OperationKind::Callback(op) => op.process_event(engine, event)?,
            OperationKind::RuntimeInvoke(op) => op.process_event(engine, event)?,
        };

        self.apply(engine, flow).await
    }

    /// Resumes this operation after a child returned
    /// [ResumeOperation](EventResult::ResumeOperation).
    ///
    /// The operation may veto completion and keep running without the event
    /// being re-dispatched.
    pub(crate) async fn resume<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
    ) -> crate::Result<EventResult> {
        if !self.executed {
            // the child ran before this operation ever started (e.g. a
            // step-over of the breakpoint under the initial pc)
            return self.execute(engine).await;
        }

        let flow = match &mut self.kind {
            OperationKind::Step(op) => op.resume(engine).await?,
            OperationKind::Run(op) => op.resume(engine)?,
            OperationKind::Trampoline(op) => op.resume(engine)?,
            _ => unreachable!("operation cannot be resumed"),
        };

        self.apply(engine, flow).await
    }

    async fn apply<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
        flow: Flow,
    ) -> crate::Result<EventResult> {
        match flow {
            Flow::Wait => Ok(EventResult::Running),
            Flow::Done => Ok(EventResult::Completed),
            Flow::DoneViaCallback => Ok(EventResult::CompletedViaCallback),
            Flow::Parent => Ok(EventResult::AskParent),
            Flow::ResumeParent => Ok(EventResult::ResumeOperation),
            Flow::Spawn(kind) => {
                let mut child = Operation::new(kind, None);

                match Box::pin(child.execute(engine)).await? {
                    EventResult::Running => {
                        self.child = Some(Box::new(child));
                        Ok(EventResult::Running)
                    }
                    // a child completing during its own execute completes
                    // this operation as well
                    result => Ok(result),
                }
            }
        }
    }
}
