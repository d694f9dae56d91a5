//! Interface layer between a debugger core and the process it debugs.
//!
//! This crate defines the capability traits and value types a stepping engine
//! consumes, without committing to any particular transport or runtime:
//!
//! - [InferiorPort](self::port::InferiorPort) is the process-control
//!   capability: reading and writing memory and registers, continuing or
//!   single-stepping one machine instruction, inserting raw breakpoints,
//!   invoking functions inside the inferior, and waiting for the next
//!   low-level [Event](self::event::Event).
//! - [RuntimeBackend](self::runtime::RuntimeBackend) is the managed-runtime
//!   collaborator: it decodes method metadata and line tables, recognizes
//!   JIT trampolines, and marshals the results of runtime invocations.
//!
//! Implementations of these traits exist per transport (ptrace-based,
//! core-file based) and per runtime; the stepping engine is generic over
//! both.

mod error;

/// Module containing the low-level event vocabulary.
pub mod event;

/// Module containing the process-control capability trait.
pub mod port;

/// Module containing register and instruction value types.
pub mod regs;

/// Module containing the managed-runtime collaborator trait.
pub mod runtime;

pub use self::error::{PortError, Result};
pub use self::event::{Event, Notification};
pub use self::port::{InferiorPort, RawBreakpointId};
pub use self::regs::{Frame, Instruction, InstructionKind, Registers};
pub use self::runtime::{
    FunctionRef, InvokeOutcome, LineEntry, MethodInfo, RuntimeBackend, RuntimeInfo,
    TrampolineTarget,
};
