use crate::breakpoint::BreakpointIndex;
use crate::frame::StackFrame;

/// Result of a run-control command, observed by the issuing caller (or
/// published on the engine's event stream for stops nobody is waiting on).
#[derive(Debug, Clone)]
pub struct TargetEvent {
    /// What happened to the target.
    pub kind: TargetEventKind,

    /// The stack frame recomputed after the stop, when the target still has
    /// one.
    pub frame: Option<StackFrame>,
}

/// Kind of a [TargetEvent].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEventKind {
    /// The target was resumed in the background.
    Running,

    /// The target stopped without a more specific reason.
    Stopped,

    /// A running operation was interrupted by
    /// [stop](crate::engine::EngineHandle::stop).
    Interrupted,

    /// The target stopped on a user breakpoint.
    HitBreakpoint(BreakpointIndex),

    /// The target stopped after receiving a signal.
    Signaled(i32),

    /// The inferior exited with the given code.
    Exited(i32),

    /// The current frame changed without the target running (e.g. a frame
    /// pop).
    FrameChanged,

    /// A managed exception was thrown.
    Exception {
        /// Address of the exception object.
        address: u64,
    },

    /// A managed exception reached the top of the stack unhandled.
    UnhandledException {
        /// Address of the exception object.
        address: u64,
    },
}

impl TargetEventKind {
    /// Returns whether this event means the inferior is gone.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Signaled(_))
    }
}
