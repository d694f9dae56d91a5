use sable_inferior::{LineEntry, MethodInfo, Registers};

/// Stepping intent of a [StepFrame].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Execute one machine instruction, following trampolines into the
    /// method they compile.
    SingleInstruction,

    /// Execute one machine instruction, treating trampolines like any other
    /// code.
    NativeInstruction,

    /// Execute one machine instruction, stepping over calls.
    NextInstruction,

    /// Step until the next source line, entering called methods that have
    /// source information.
    SourceLine,

    /// Step until the next source line of the current frame, stepping over
    /// all calls.
    NextLine,

    /// Step while the program counter stays inside an explicit address
    /// range.
    StepFrameRange,

    /// Run until the current frame returns to its caller.
    Finish,
}

impl StepMode {
    /// Returns whether completion should land on a source-line boundary.
    pub(crate) const fn is_source_level(self) -> bool {
        matches!(self, Self::SourceLine | Self::NextLine | Self::StepFrameRange)
    }

    /// Returns whether every call is stepped over, regardless of debug
    /// information.
    pub(crate) const fn steps_over_calls(self) -> bool {
        matches!(self, Self::NextInstruction | Self::NextLine)
    }
}

/// Address range within which native single-stepping continues before the
/// engine decides to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepFrame {
    /// First address of the range.
    pub start: u64,

    /// One-past-the-end address of the range.
    pub end: u64,

    /// Stepping intent.
    pub mode: StepMode,

    /// Stack pointer of the enclosing frame, for [StepMode::Finish].
    pub stack_pointer: Option<u64>,
}

impl StepFrame {
    /// Returns whether the given program counter lies inside `[start, end)`.
    pub const fn contains(&self, pc: u64) -> bool {
        pc >= self.start && pc < self.end
    }
}

/// How a [StackFrame] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A frame inside managed code.
    Managed,

    /// A frame outside the managed runtime.
    Native,

    /// Synthetic marker for a pending debugger-issued native call.
    RuntimeInvocation,
}

/// One frame of a [Backtrace].
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// Program counter.
    pub pc: u64,

    /// Stack pointer.
    pub sp: u64,

    /// Frame pointer.
    pub fp: u64,

    /// Register snapshot the frame was derived from.
    pub registers: Registers,

    /// Method covering `pc`, when known.
    pub method: Option<MethodInfo>,

    /// Source line covering `pc`, when known.
    pub line: Option<LineEntry>,

    /// How the frame was produced.
    pub kind: FrameKind,
}

/// Unwinding policy of a backtrace request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacktraceMode {
    /// Stop at the first frame without managed debug information.
    Managed,

    /// Include native frames, using the last-managed-frame fallback where
    /// the architecture rule cannot unwind.
    Native,
}

/// Ordered, append-only sequence of stack frames, outermost last.
#[derive(Debug, Clone, Default)]
pub struct Backtrace {
    frames: Vec<StackFrame>,
}

impl Backtrace {
    /// Returns the frames, innermost first.
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    /// Returns the number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns whether the backtrace holds no frame.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn push(&mut self, frame: StackFrame) {
        self.frames.push(frame);
    }

    pub(crate) fn last(&self) -> Option<&StackFrame> {
        self.frames.last()
    }
}
