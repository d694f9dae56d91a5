use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sable_inferior::{InferiorPort, RuntimeBackend};
use tokio::sync::{mpsc, Semaphore};

use crate::breakpoint::BreakpointTable;
use crate::engine::{EngineCommand, EngineHandle, SteppingEngine};
use crate::event::TargetEvent;

/// Locks a mutex, recovering from poisoning.
///
/// Table and runtime mutations are small and panic-free; a poisoned guard
/// still holds consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread lifecycle change reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadNotice {
    /// Id of the thread the notice is about.
    pub thread: u64,

    /// What happened.
    pub kind: ThreadNoticeKind,
}

/// Kind of a [ThreadNotice].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadNoticeKind {
    /// The runtime created a thread; the caller may spawn an engine for it.
    Created,

    /// A thread exited.
    Exited,
}

/// State shared by every engine of one inferior.
pub(crate) struct ProcessShared<R> {
    pub(crate) breakpoints: Mutex<BreakpointTable>,
    pub(crate) runtime: Mutex<R>,

    /// Command mailboxes of the live engines, keyed by thread id.
    pub(crate) engines: Mutex<HashMap<u64, mpsc::UnboundedSender<EngineCommand>>>,

    /// Serializes global-thread-lock acquisition process-wide.
    pub(crate) lock_sem: Arc<Semaphore>,

    pub(crate) thread_notices: mpsc::UnboundedSender<ThreadNotice>,
}

/// One debugged inferior: the shared breakpoint table, the runtime
/// collaborator, and a stepping engine per attached thread.
pub struct DebugProcess<R: RuntimeBackend> {
    shared: Arc<ProcessShared<R>>,
}

impl<R: RuntimeBackend> Clone for DebugProcess<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: RuntimeBackend> DebugProcess<R> {
    /// Creates a process around a runtime collaborator.
    ///
    /// The returned receiver carries thread lifecycle notices; spawn an
    /// engine for each created thread to drive it.
    pub fn new(runtime: R) -> (Self, mpsc::UnboundedReceiver<ThreadNotice>) {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ProcessShared {
            breakpoints: Mutex::new(BreakpointTable::new()),
            runtime: Mutex::new(runtime),
            engines: Mutex::new(HashMap::new()),
            lock_sem: Arc::new(Semaphore::new(1)),
            thread_notices: notice_tx,
        });

        (Self { shared }, notice_rx)
    }

    /// Spawns the stepping engine of one inferior thread.
    ///
    /// The returned receiver carries the stops nobody was waiting on
    /// (background resumes, forced completions).
    pub fn spawn_engine<P: InferiorPort>(
        &self,
        thread_id: u64,
        port: P,
    ) -> (EngineHandle, mpsc::UnboundedReceiver<TargetEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        lock(&self.shared.engines).insert(thread_id, cmd_tx.clone());

        let engine = SteppingEngine::new(
            port,
            thread_id,
            Arc::clone(&self.shared),
            cmd_rx,
            event_tx,
        );
        tokio::spawn(engine.run());

        tracing::info!(thread = thread_id, "engine spawned");

        (EngineHandle::new(cmd_tx), event_rx)
    }
}
