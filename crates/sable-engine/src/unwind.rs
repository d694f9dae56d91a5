use sable_inferior::{Frame, InferiorPort, Registers, RuntimeBackend};

use crate::frame::{Backtrace, BacktraceMode, FrameKind, StackFrame};

/// Saved frame of a debugger-issued native call still in flight.
///
/// Spliced into backtraces as a synthetic marker so that runtime-invoke
/// boundaries stay visible.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingInvocation {
    pub frame: Frame,
}

/// Produces a backtrace frame by frame.
///
/// Each step asks the port's architecture-specific unwind rule for the
/// caller; when the rule cannot unwind and `mode` allows native frames, the
/// last-managed-frame chain maintained by the runtime is used as a fallback.
/// Unwinding terminates when the rule returns nothing, when the stack
/// pointer stops increasing, or when `stop_address` is reached.
pub(crate) fn compute_backtrace<P: InferiorPort, R: RuntimeBackend>(
    port: &mut P,
    runtime: &R,
    mode: BacktraceMode,
    stop_address: Option<u64>,
    limit: usize,
    lmf_addr: Option<u64>,
    pending: &[PendingInvocation],
) -> crate::Result<Backtrace> {
    let regs = port.get_registers()?;

    let mut backtrace = Backtrace::default();
    backtrace.push(resolve_frame(runtime, regs.clone()));

    // chain cursor of the runtime's last-managed-frame list
    let mut lmf_cursor: Option<u64> = None;

    let mut cur = regs;

    while backtrace.len() < limit {
        if backtrace.last().map(|f| f.pc) == stop_address {
            break;
        }

        let next = match port.unwind_caller_frame(&cur)? {
            Some(next) => next,
            None => match mode {
                BacktraceMode::Managed => break,
                BacktraceMode::Native => {
                    match pop_lmf(port, lmf_addr, &mut lmf_cursor)? {
                        Some(next) => next,
                        None => break,
                    }
                }
            },
        };

        // the stack pointer must keep increasing, otherwise the unwind rule
        // is looping
        if next.sp <= cur.sp {
            break;
        }

        for invocation in pending {
            if invocation.frame.sp > cur.sp && invocation.frame.sp <= next.sp {
                backtrace.push(StackFrame {
                    pc: invocation.frame.pc,
                    sp: invocation.frame.sp,
                    fp: invocation.frame.fp,
                    registers: Registers::default(),
                    method: None,
                    line: None,
                    kind: FrameKind::RuntimeInvocation,
                });
            }
        }

        let frame = resolve_frame(runtime, next.clone());

        if frame.method.is_none() && matches!(mode, BacktraceMode::Managed) {
            break;
        }

        backtrace.push(frame);
        cur = next;
    }

    Ok(backtrace)
}

/// Resolves method and line information of one unwound register snapshot.
fn resolve_frame<R: RuntimeBackend>(runtime: &R, regs: Registers) -> StackFrame {
    let method = runtime.method_at(regs.pc);
    let line = method.as_ref().and_then(|m| m.line_at(regs.pc));
    let kind = if method.is_some() {
        FrameKind::Managed
    } else {
        FrameKind::Native
    };

    StackFrame {
        pc: regs.pc,
        sp: regs.sp,
        fp: regs.fp,
        registers: regs,
        method,
        line,
        kind,
    }
}

/// Pops one record off the last-managed-frame chain.
///
/// The chain head lives at `lmf_addr`; each record is four container words:
/// previous record, program counter, stack pointer, frame pointer.
fn pop_lmf<P: InferiorPort>(
    port: &mut P,
    lmf_addr: Option<u64>,
    cursor: &mut Option<u64>,
) -> crate::Result<Option<Registers>> {
    let Some(lmf_addr) = lmf_addr else {
        return Ok(None);
    };

    let record = match *cursor {
        Some(record) => record,
        None => read_word(port, lmf_addr)?,
    };

    if record == 0 {
        return Ok(None);
    }

    let prev = read_word(port, record)?;
    let pc = read_word(port, record + 8)?;
    let sp = read_word(port, record + 16)?;
    let fp = read_word(port, record + 24)?;

    *cursor = Some(prev);

    Ok(Some(Registers {
        pc,
        sp,
        fp,
        gpr: Vec::new(),
    }))
}

fn read_word<P: InferiorPort>(port: &mut P, addr: u64) -> crate::Result<u64> {
    let mut buf = [0u8; 8];
    port.read_memory(addr, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
