use sable_inferior::{Event, InferiorPort, RuntimeBackend, TrampolineTarget};

use super::callback::CallbackOperation;
use super::step::StepOverBreakpoint;
use super::Flow;
use crate::engine::{SteppingEngine, StopClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the target class initializer to run.
    ClassInit,

    /// Waiting for the target method to be compiled.
    Compile,

    /// Running until the freshly compiled code is entered.
    Enter,

    /// Running until the call returns, because the compiled method was
    /// rejected as a step target.
    SkipOver,
}

/// Follows a call into a runtime trampoline.
///
/// Instead of single-stepping through the trampoline's native code, the
/// target class is initialized and the target method compiled through
/// debugger-issued calls (under the global thread lock), then the thread
/// runs to the compiled entry point. A method without source information is
/// rejected when the step is source-level, and the call is skipped over
/// instead.
pub(crate) struct TrampolineOperation {
    tramp: TrampolineTarget,
    return_addr: u64,
    require_source: bool,
    phase: Phase,
    compiled: u64,
}

impl TrampolineOperation {
    pub(crate) fn new(tramp: TrampolineTarget, return_addr: u64, require_source: bool) -> Self {
        Self {
            tramp,
            return_addr,
            require_source,
            phase: Phase::ClassInit,
            compiled: 0,
        }
    }

    pub(crate) async fn execute<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
    ) -> crate::Result<Flow> {
        engine.acquire_global_lock().await?;

        if self.tramp.class_ptr != 0 {
            self.phase = Phase::ClassInit;
            Ok(Flow::Spawn(
                CallbackOperation::class_init(self.tramp.class_ptr).into(),
            ))
        } else {
            self.phase = Phase::Compile;
            Ok(Flow::Spawn(
                CallbackOperation::compile_method(self.tramp.method_token).into(),
            ))
        }
    }

    pub(crate) async fn process_event<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
        event: &Event,
    ) -> crate::Result<Flow> {
        match event {
            Event::CallbackCompleted { data, .. } => match self.phase {
                Phase::ClassInit => {
                    self.phase = Phase::Compile;
                    Ok(Flow::Spawn(
                        CallbackOperation::compile_method(self.tramp.method_token).into(),
                    ))
                }
                Phase::Compile => self.method_compiled(engine, *data),
                Phase::Enter | Phase::SkipOver => {
                    unreachable!("unexpected callback during trampoline run")
                }
            },
            Event::Stopped => {
                engine.do_continue()?;
                Ok(Flow::Wait)
            }
            Event::HitBreakpoint(raw) => match engine.classify(*raw) {
                StopClass::Temp => {
                    engine.retire_temp_breakpoint()?;
                    match self.phase {
                        Phase::Enter => Ok(Flow::Done),
                        Phase::SkipOver => Ok(Flow::ResumeParent),
                        Phase::ClassInit | Phase::Compile => {
                            unreachable!("no temp breakpoint during trampoline compilation")
                        }
                    }
                }
                StopClass::Ours(index) => {
                    engine.note_breakpoint_hit(index);
                    Ok(Flow::Done)
                }
                StopClass::Foreign(index) => {
                    Ok(Flow::Spawn(StepOverBreakpoint::new(index).into()))
                }
            },
            Event::Signaled(_) | Event::Exited(_) | Event::Interrupted => {
                engine.release_global_lock();
                Ok(Flow::Done)
            }
            _ => Ok(Flow::Wait),
        }
    }

    pub(crate) fn resume<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
    ) -> crate::Result<Flow> {
        engine.do_continue()?;
        Ok(Flow::Wait)
    }

    /// Handles the compiled-method address returned by the compile callback.
    fn method_compiled<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
        addr: u64,
    ) -> crate::Result<Flow> {
        self.compiled = addr;

        if addr != 0 {
            engine.register_compiled_method(self.tramp.method_token, addr);
        }

        let has_source = engine
            .method_by_token(self.tramp.method_token)
            .map(|m| m.has_source)
            .unwrap_or(false);
        let accept = addr != 0 && (!self.require_source || has_source);

        // compilation is over; other threads may run again
        engine.release_global_lock();

        if accept {
            tracing::debug!(
                addr = format_args!("{addr:#x}"),
                "entering freshly compiled method"
            );
            self.phase = Phase::Enter;
            engine.insert_temp_breakpoint(addr)?;
        } else {
            tracing::debug!(
                token = self.tramp.method_token,
                "skipping over compiled method without source"
            );
            self.phase = Phase::SkipOver;
            engine.insert_temp_breakpoint(self.return_addr)?;
        }

        engine.do_continue()?;
        Ok(Flow::Wait)
    }
}
