use crate::port::RawBreakpointId;

/// Low-level event observed on the inferior.
///
/// One event is produced per [wait_event](crate::port::InferiorPort::wait_event)
/// call; events are immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A thread stopped with no signal (single-step completion, or a stop
    /// requested by the transport itself).
    Stopped,

    /// A thread stopped after receiving the given signal.
    Signaled(i32),

    /// The inferior exited with the given code.
    Exited(i32),

    /// A thread stopped on a raw breakpoint inserted through the port.
    ///
    /// The id is the one returned by
    /// [insert_breakpoint](crate::port::InferiorPort::insert_breakpoint);
    /// `RawBreakpointId(0)` denotes a trap the port cannot attribute to any
    /// inserted breakpoint.
    HitBreakpoint(RawBreakpointId),

    /// The managed runtime delivered a notification over its channel.
    Notification {
        /// Notification code.
        kind: Notification,
        /// First payload word (meaning depends on `kind`).
        data: u64,
        /// Second payload word (meaning depends on `kind`).
        data2: u64,
    },

    /// An asynchronous native call issued through
    /// [call_method](crate::port::InferiorPort::call_method) completed.
    CallbackCompleted {
        /// Call id the completion belongs to.
        call_id: u64,
        /// First result word.
        data: u64,
        /// Second result word.
        data2: u64,
    },

    /// A stop caused by [interrupt](crate::port::InferiorPort::interrupt).
    Interrupted,
}

/// Notification codes delivered by the managed runtime.
///
/// Codes not part of the fixed vocabulary are passed through as
/// [Other](Self::Other) and handed to the
/// [RuntimeBackend](crate::runtime::RuntimeBackend) untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The inferior reached its managed entry point.
    ReachedMain,

    /// A managed thread was created (`data` = thread id).
    ThreadCreated,

    /// A managed thread exited (`data` = thread id).
    ThreadExited,

    /// The runtime requests the global thread lock.
    AcquireGlobalThreadLock,

    /// The runtime releases the global thread lock.
    ReleaseGlobalThreadLock,

    /// A method was JIT-compiled (`data` = method token, `data2` = entry
    /// address).
    MethodCompiled,

    /// A class finished its initializer (`data` = class pointer).
    ClassInitialized,

    /// An exception was thrown (`data` = exception object, `data2` = throw
    /// site address).
    ExceptionThrown,

    /// A thrown exception found a handler.
    ExceptionHandled,

    /// A thrown exception reached the top of the stack unhandled.
    UnhandledException,

    /// A code outside the fixed vocabulary.
    Other(u64),
}
