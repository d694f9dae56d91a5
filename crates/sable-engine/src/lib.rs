//! Stepping and operation engine of an out-of-process debugger for a
//! managed-code runtime.
//!
//! Three main components are provided:
//! - A per-thread [stepping engine](self::EngineHandle), driving an
//!   operation state machine over the thread's process-control port:
//!   source-line and instruction stepping, free runs, debugger-issued native
//!   calls and runtime invocations, each command blocking its caller until
//!   the target stops again.
//! - A process-wide [breakpoint surface](self::BreakpointLocation), keyed by
//!   dense indices, with function breakpoints deferred until the runtime
//!   compiles their method.
//! - A [stack unwinder](self::EngineHandle::backtrace) combining the
//!   architecture unwind rule of the port with the runtime's
//!   last-managed-frame chain.
//!
//! The engine is generic over two collaborator traits of the
//! [`sable_inferior`] crate: [InferiorPort](sable_inferior::InferiorPort)
//! (thread control, memory, raw breakpoints) and
//! [RuntimeBackend](sable_inferior::RuntimeBackend) (method metadata, line
//! tables, trampoline recognition). A [DebugProcess](self::DebugProcess)
//! owns the state shared by all threads of one inferior and spawns one
//! engine task per attached thread.

mod breakpoint;
mod engine;
mod error;
mod event;
mod frame;
mod operation;
mod process;
mod unwind;

pub use self::breakpoint::{BreakpointIndex, BreakpointLocation, LoadHandler, ThreadFilter};
pub use self::engine::EngineHandle;
pub use self::error::{Error, Result};
pub use self::event::{TargetEvent, TargetEventKind};
pub use self::frame::{
    Backtrace, BacktraceMode, FrameKind, StackFrame, StepFrame, StepMode,
};
pub use self::operation::callback::InvokeRequest;
pub use self::process::{DebugProcess, ThreadNotice, ThreadNoticeKind};
