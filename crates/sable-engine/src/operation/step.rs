use sable_inferior::{Event, InferiorPort, InstructionKind, RuntimeBackend};

use super::Flow;
use crate::breakpoint::BreakpointIndex;
use crate::engine::{SteppingEngine, StopClass};
use crate::frame::{StepFrame, StepMode};

/// Single-thread stepping over a [StepFrame].
///
/// Keeps single-stepping while the program counter stays inside the frame's
/// range, stepping over or into calls according to the mode, and completes
/// once the program counter leaves the range (or, for
/// [Finish](StepMode::Finish), once the frame returned to its caller).
pub(crate) struct StepOperation {
    frame: StepFrame,

    /// Return address the finish temp-breakpoint waits on.
    until: Option<u64>,

    /// Whether at least one instruction was executed (or stepped over).
    stepped: bool,
}

impl StepOperation {
    pub(crate) fn new(frame: StepFrame) -> Self {
        Self {
            frame,
            until: None,
            stepped: false,
        }
    }

    pub(crate) fn mode(&self) -> StepMode {
        self.frame.mode
    }

    pub(crate) async fn execute<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
    ) -> crate::Result<Flow> {
        if self.frame.mode == StepMode::Finish {
            let Some(caller) = engine.unwind_caller()? else {
                return Err(crate::Error::NoStack);
            };

            self.until = Some(caller.pc);
            engine.insert_temp_breakpoint(caller.pc)?;
            engine.do_continue()?;
            return Ok(Flow::Wait);
        }

        // the range starts on the current instruction; it may already be a
        // call that needs special handling
        self.check(engine)
    }

    pub(crate) async fn process_event<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
        event: &Event,
    ) -> crate::Result<Flow> {
        match event {
            Event::Stopped => self.check(engine),
            Event::HitBreakpoint(raw) => match engine.classify(*raw) {
                StopClass::Temp => {
                    engine.retire_temp_breakpoint()?;
                    self.check(engine)
                }
                StopClass::Ours(index) => {
                    engine.note_breakpoint_hit(index);
                    Ok(Flow::Done)
                }
                StopClass::Foreign(index) => {
                    Ok(Flow::Spawn(StepOverBreakpoint::new(index).into()))
                }
            },
            Event::Signaled(_) | Event::Exited(_) | Event::Interrupted => Ok(Flow::Done),
            _ => Ok(Flow::Wait),
        }
    }

    /// Re-examines the program counter after a child operation got the
    /// thread past an obstacle.
    pub(crate) async fn resume<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
    ) -> crate::Result<Flow> {
        // a child operation got the thread past the instruction
        self.stepped = true;
        self.check(engine)
    }

    /// Decides what to do at the current program counter.
    fn check<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
    ) -> crate::Result<Flow> {
        if self.frame.mode == StepMode::Finish {
            let regs = engine.registers()?;

            let returned = match self.frame.stack_pointer {
                Some(saved_sp) => regs.sp > saved_sp,
                None => false,
            };
            if returned {
                return Ok(Flow::Done);
            }

            // stopped inside the frame (or a callee); keep waiting on the
            // return address
            let Some(until) = self.until else {
                unreachable!("finish step has no return address");
            };
            engine.insert_temp_breakpoint(until)?;
            engine.do_continue()?;
            return Ok(Flow::Wait);
        }

        let pc = engine.current_pc()?;

        if !self.frame.contains(pc) {
            return Ok(Flow::Done);
        }

        // the instruction modes complete after one executed step even if the
        // program counter lands back in the range (a jump to itself)
        if self.stepped && !self.frame.mode.is_source_level() {
            return Ok(Flow::Done);
        }

        let insn = engine.decode_instruction(pc)?;

        if matches!(insn.kind, InstructionKind::Call { .. }) {
            return self.check_call(engine, pc, insn.size, insn.call_target());
        }

        engine.do_step()?;
        self.stepped = true;
        Ok(Flow::Wait)
    }

    /// Decides how to handle a call instruction at `pc`.
    fn check_call<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
        pc: u64,
        size: u64,
        target: Option<u64>,
    ) -> crate::Result<Flow> {
        if self.frame.mode.steps_over_calls() {
            return self.step_over_call(engine, pc + size);
        }

        let Some(target) = target else {
            // indirect call with an unresolvable target; step into it and
            // decide at the landing point
            engine.do_step()?;
            self.stepped = true;
            return Ok(Flow::Wait);
        };

        if let Some(tramp) = engine.trampoline_target(target) {
            if self.frame.mode == StepMode::NativeInstruction {
                engine.do_step()?;
                self.stepped = true;
                return Ok(Flow::Wait);
            }

            let op = super::trampoline::TrampolineOperation::new(
                tramp,
                pc + size,
                self.frame.mode.is_source_level(),
            );
            return Ok(Flow::Spawn(op.into()));
        }

        if self.frame.contains(target) {
            // recursion into the stepped range
            engine.do_step()?;
            self.stepped = true;
            return Ok(Flow::Wait);
        }

        let has_source = engine
            .method_at(target)
            .map(|m| m.has_source)
            .unwrap_or(false);

        if has_source || !self.frame.mode.is_source_level() {
            engine.do_step()?;
            self.stepped = true;
            return Ok(Flow::Wait);
        }

        // source-level step into a method without source information: skip
        // over it
        self.step_over_call(engine, pc + size)
    }

    fn step_over_call<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
        return_addr: u64,
    ) -> crate::Result<Flow> {
        engine.insert_temp_breakpoint(return_addr)?;
        engine.do_continue()?;
        self.stepped = true;
        Ok(Flow::Wait)
    }
}

/// Free-running resume, optionally until a one-shot address.
pub(crate) struct RunOperation {
    until: Option<u64>,
}

impl RunOperation {
    pub(crate) fn new(until: Option<u64>) -> Self {
        Self { until }
    }

    pub(crate) fn execute<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
    ) -> crate::Result<Flow> {
        if let Some(addr) = self.until {
            engine.insert_temp_breakpoint(addr)?;
        }

        engine.do_continue()?;
        Ok(Flow::Wait)
    }

    pub(crate) fn process_event<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
        event: &Event,
    ) -> crate::Result<Flow> {
        match event {
            // spurious stop; keep going
            Event::Stopped => {
                engine.do_continue()?;
                Ok(Flow::Wait)
            }
            Event::HitBreakpoint(raw) => match engine.classify(*raw) {
                StopClass::Temp => {
                    engine.retire_temp_breakpoint()?;
                    Ok(Flow::Done)
                }
                StopClass::Ours(index) => {
                    engine.note_breakpoint_hit(index);
                    Ok(Flow::Done)
                }
                StopClass::Foreign(index) => {
                    Ok(Flow::Spawn(StepOverBreakpoint::new(index).into()))
                }
            },
            Event::Signaled(_) | Event::Exited(_) | Event::Interrupted => Ok(Flow::Done),
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
}

/// Gets the thread past a breakpoint it must not break on.
///
/// Disables the breakpoint, freezes every other thread of the inferior so
/// none of them can run through the unprotected address, single-steps, then
/// restores everything and hands control back to the parent.
pub(crate) struct StepOverBreakpoint {
    index: Option<BreakpointIndex>,
}

impl StepOverBreakpoint {
    pub(crate) fn new(index: Option<BreakpointIndex>) -> Self {
        Self { index }
    }

    pub(crate) async fn execute<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
    ) -> crate::Result<Flow> {
        if let Some(index) = self.index {
            engine.begin_step_over(index)?;
        }

        engine.acquire_global_lock().await?;
        engine.do_step()?;

        Ok(Flow::Wait)
    }

    pub(crate) fn process_event<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
        event: &Event,
    ) -> crate::Result<Flow> {
        match event {
            Event::Stopped => {
                self.finish(engine)?;
                Ok(Flow::ResumeParent)
            }
            // the stepped instruction landed on another trap; restore our
            // state first, then let the parent see the hit
            Event::HitBreakpoint(_) => {
                self.finish(engine)?;
                Ok(Flow::Parent)
            }
            Event::Signaled(_) | Event::Exited(_) => {
                engine.clear_step_over();
                engine.release_global_lock();
                Ok(Flow::Done)
            }
            Event::Interrupted => {
                self.finish(engine)?;
                Ok(Flow::Done)
            }
            _ => Ok(Flow::Wait),
        }
    }

    fn finish<P: InferiorPort, R: RuntimeBackend>(
        &mut self,
        engine: &mut SteppingEngine<P, R>,
    ) -> crate::Result<()> {
        engine.end_step_over()?;
        engine.release_global_lock();
        Ok(())
    }
}
