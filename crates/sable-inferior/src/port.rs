use std::future::Future;

use crate::event::Event;
use crate::regs::{Frame, Instruction, Registers};

/// Identifier of a raw breakpoint inserted through an [InferiorPort].
///
/// The value `0` is reserved: it denotes a trap the port cannot attribute to
/// any breakpoint it inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawBreakpointId(pub u64);

/// Process-control capability over one inferior thread.
///
/// A port instance is owned and driven by exactly one stepping engine; all
/// methods except [wait_event](Self::wait_event) are synchronous with respect
/// to the engine's task.
///
/// # Cancel safety
///
/// [wait_event](Self::wait_event) is the only suspension point of the engine
/// loop and is raced against the engine's command channel. Implementations
/// must be cancel-safe: dropping the returned future must not lose an event.
pub trait InferiorPort: Send + 'static {
    /// Reads data from the inferior's address space.
    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> crate::Result<()>;

    /// Writes data to the inferior's address space.
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> crate::Result<()>;

    /// Retrieves the registers of the stopped thread.
    fn get_registers(&mut self) -> crate::Result<Registers>;

    /// Overwrites the registers of the stopped thread.
    fn set_registers(&mut self, regs: &Registers) -> crate::Result<()>;

    /// Returns the current frame triple of the stopped thread.
    fn current_frame(&mut self) -> crate::Result<Frame>;

    /// Resumes the thread until the next event.
    fn resume(&mut self) -> crate::Result<()>;

    /// Executes a single machine instruction.
    fn single_step(&mut self) -> crate::Result<()>;

    /// Inserts a raw breakpoint at the given address.
    fn insert_breakpoint(&mut self, addr: u64) -> crate::Result<RawBreakpointId>;

    /// Removes a previously inserted raw breakpoint.
    fn remove_breakpoint(&mut self, raw: RawBreakpointId) -> crate::Result<()>;

    /// Starts an asynchronous native call inside the inferior.
    ///
    /// The call starts executing on the stopped thread right away; its
    /// completion is reported as [Event::CallbackCompleted] carrying
    /// `call_id`.
    fn call_method(&mut self, entry: u64, arg1: u64, arg2: u64, call_id: u64) -> crate::Result<()>;

    /// Requests an asynchronous stop of a running thread.
    ///
    /// The stop surfaces as [Event::Interrupted] on a subsequent
    /// [wait_event](Self::wait_event).
    fn interrupt(&mut self) -> crate::Result<()>;

    /// Decodes the instruction at the given address.
    fn decode_instruction(&mut self, addr: u64) -> crate::Result<Instruction>;

    /// Applies the architecture's unwind rule once, producing the caller's
    /// register snapshot.
    ///
    /// Returns `None` when the rule cannot unwind past `regs` (bottom of the
    /// stack, or a frame outside any known unwind region).
    fn unwind_caller_frame(&mut self, regs: &Registers) -> crate::Result<Option<Registers>>;

    /// Returns the ids of all threads of the inferior.
    fn get_threads(&mut self) -> crate::Result<Vec<u64>>;

    /// Detaches from the inferior, leaving it running.
    fn detach(&mut self) -> crate::Result<()>;

    /// Blocks until the next event on this thread.
    fn wait_event(&mut self) -> impl Future<Output = crate::Result<Event>> + Send;
}
