use sable_inferior::PortError;

/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A command was issued while an operation is already running.
    #[error("Target is not stopped")]
    NotStopped,

    /// The command requires a live inferior thread.
    #[error("No target")]
    NoTarget,

    /// The thread has no stack frame to operate on.
    #[error("Thread has no stack")]
    NoStack,

    /// Detaching is not possible in the current state.
    #[error("Cannot detach")]
    CannotDetach,

    /// A breakpoint target cannot be resolved.
    #[error("Invalid breakpoint location: {0}")]
    LocationInvalid(String),

    /// A running operation was interrupted before completing.
    #[error("Operation interrupted")]
    Interrupted,

    /// A native call inside the inferior produced no usable result.
    #[error("Unknown error in native call")]
    UnknownError,

    /// The engine task is no longer running.
    #[error("Stepping engine is gone")]
    EngineGone,

    /// An error occurred in the process-control port.
    #[error(transparent)]
    Port(#[from] PortError),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
