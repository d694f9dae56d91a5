/// Register snapshot of a stopped inferior thread.
///
/// The layout is architecture-neutral: the three registers the stepping
/// engine reasons about are broken out, the rest travel as an opaque block
/// so that a snapshot can be restored losslessly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registers {
    /// Program counter.
    pub pc: u64,

    /// Stack pointer.
    pub sp: u64,

    /// Frame pointer.
    pub fp: u64,

    /// Remaining general-purpose registers, in transport-defined order.
    pub gpr: Vec<u64>,
}

impl Registers {
    /// Returns the frame described by this snapshot.
    pub const fn frame(&self) -> Frame {
        Frame {
            pc: self.pc,
            sp: self.sp,
            fp: self.fp,
        }
    }
}

/// Minimal frame triple of a stopped thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frame {
    /// Program counter.
    pub pc: u64,

    /// Stack pointer.
    pub sp: u64,

    /// Frame pointer.
    pub fp: u64,
}

/// Decoded summary of one machine instruction.
///
/// Produced by the port's architecture-specific decoder; the stepping engine
/// only needs to know whether the instruction transfers control and how long
/// it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Instruction kind.
    pub kind: InstructionKind,

    /// Instruction length in bytes.
    pub size: u64,
}

impl Instruction {
    /// Returns the call target, if this is a call with a statically known
    /// destination.
    pub const fn call_target(&self) -> Option<u64> {
        match self.kind {
            InstructionKind::Call { target } => target,
            _ => None,
        }
    }
}

/// Instruction kind (arch-independent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    /// Function call.
    Call {
        /// Call target address, when statically decodable.
        target: Option<u64>,
    },

    /// Function return.
    Ret,

    /// Unconditional jump.
    Jump {
        /// Jump target address, when statically decodable.
        target: Option<u64>,
    },

    /// Any other instruction.
    Other,
}
