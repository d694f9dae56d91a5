/// Reference to a managed function that may not be compiled yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    /// Runtime-assigned method token.
    pub token: u64,

    /// Human-readable method name.
    pub name: String,
}

/// Entry points of the runtime helper functions the debugger invokes inside
/// the inferior.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeInfo {
    /// Runs a class initializer (`arg1` = class pointer).
    pub class_init: u64,

    /// JIT-compiles a method (`arg1` = method token), returning its entry
    /// address.
    pub compile_method: u64,

    /// Invokes a compiled method (`arg1` = entry address, `arg2` = argument
    /// block), returning the boxed result and thrown-exception addresses.
    pub runtime_invoke: u64,

    /// Resolves a class by token (`arg1` = class token).
    pub lookup_class: u64,

    /// Boxes a value-type receiver (`arg1` = class pointer, `arg2` = value
    /// address).
    pub box_object: u64,

    /// Resolves virtual dispatch (`arg1` = receiver, `arg2` = method token).
    pub get_virtual_method: u64,

    /// Returns the runtime's descriptor of the current thread.
    pub get_current_thread: u64,

    /// Returns the address of a thread's last-managed-frame pointer
    /// (`arg1` = thread descriptor).
    pub get_lmf_addr: u64,
}

/// One line-table entry of a compiled method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    /// Source line number.
    pub line: u32,

    /// Address of the first instruction of the line.
    pub address: u64,
}

/// Metadata of one compiled managed method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// Runtime-assigned method token.
    pub token: u64,

    /// Method name.
    pub name: String,

    /// Entry address of the compiled code.
    pub start: u64,

    /// One-past-the-end address of the compiled code.
    pub end: u64,

    /// First address after the method prologue.
    pub prologue_end: u64,

    /// Whether source line information is available.
    pub has_source: bool,

    /// Line table, sorted by address.
    pub lines: Vec<LineEntry>,
}

impl MethodInfo {
    /// Returns whether the given address falls within this method's code.
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Returns the line covering the given address, if any.
    pub fn line_at(&self, addr: u64) -> Option<LineEntry> {
        self.lines
            .iter()
            .rev()
            .find(|entry| entry.address <= addr)
            .copied()
    }

    /// Returns the address range `[start, end)` of the line covering `addr`.
    ///
    /// The range ends at the next line's first address, or at the method end
    /// for the last line.
    pub fn line_range(&self, addr: u64) -> Option<(LineEntry, u64)> {
        let entry = self.line_at(addr)?;
        let end = self
            .lines
            .iter()
            .find(|next| next.address > entry.address)
            .map_or(self.end, |next| next.address);
        Some((entry, end))
    }

    /// Returns the address of the first instruction of the given line.
    pub fn address_of_line(&self, line: u32) -> Option<u64> {
        self.lines
            .iter()
            .find(|entry| entry.line == line)
            .map(|entry| entry.address)
    }

    /// Returns the address of the first source line, falling back to the end
    /// of the prologue.
    pub fn first_line_address(&self) -> u64 {
        self.lines
            .first()
            .map_or(self.prologue_end, |entry| entry.address)
    }
}

/// Target of a recognized JIT trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrampolineTarget {
    /// Token of the method the trampoline compiles.
    pub method_token: u64,

    /// Pointer to the method's declaring class, for the class-init phase.
    pub class_ptr: u64,
}

/// Marshalled result of a runtime invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokeOutcome {
    /// Address of the boxed return value, if the call returned one.
    pub value: Option<u64>,

    /// Address of the thrown exception object, if the call threw.
    pub exception: Option<u64>,
}

/// Managed-runtime symbol and type collaborator.
///
/// The stepping engine consults this trait to reconstruct source-level
/// semantics from raw addresses; the implementation decodes the runtime's
/// metadata (out of scope for the engine itself).
pub trait RuntimeBackend: Send + 'static {
    /// Returns the runtime helper entry points.
    fn runtime_info(&self) -> RuntimeInfo;

    /// Looks up the compiled method covering the given address.
    fn method_at(&self, addr: u64) -> Option<MethodInfo>;

    /// Looks up a compiled method by token.
    fn method_by_token(&self, token: u64) -> Option<MethodInfo>;

    /// Recognizes a call target as a JIT trampoline.
    fn trampoline_target(&self, call_target: u64) -> Option<TrampolineTarget>;

    /// Records that the runtime compiled a method at the given entry address.
    fn register_compiled_method(&mut self, token: u64, addr: u64);

    /// Marshals the two result words of a completed runtime invocation.
    fn marshal_invoke_result(&self, data: u64, data2: u64) -> InvokeOutcome;

    /// Receives a notification code outside the fixed vocabulary.
    fn unknown_notification(&mut self, code: u64, data: u64, data2: u64) {
        let _ = (code, data, data2);
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::{LineEntry, MethodInfo};

    fn method() -> MethodInfo {
        MethodInfo {
            token: 1,
            name: "Widget.Render".to_owned(),
            start: 0x100,
            end: 0x140,
            prologue_end: 0x108,
            has_source: true,
            lines: vec![
                LineEntry {
                    line: 10,
                    address: 0x108,
                },
                LineEntry {
                    line: 11,
                    address: 0x120,
                },
                LineEntry {
                    line: 14,
                    address: 0x130,
                },
            ],
        }
    }

    #[test]
    fn line_at_picks_the_covering_entry() {
        let method = method();

        assert_eq!(method.line_at(0x108).map(|e| e.line), Some(10));
        assert_eq!(method.line_at(0x11f).map(|e| e.line), Some(10));
        assert_eq!(method.line_at(0x120).map(|e| e.line), Some(11));
        assert_eq!(method.line_at(0x13f).map(|e| e.line), Some(14));

        // inside the prologue, before the first line
        assert_eq!(method.line_at(0x100), None);
    }

    #[test]
    fn line_range_ends_at_the_next_line_or_the_method_end() {
        let method = method();

        let (entry, end) = method.line_range(0x110).expect("line range");
        assert_eq!(entry.line, 10);
        assert_eq!(end, 0x120);

        let (entry, end) = method.line_range(0x135).expect("line range");
        assert_eq!(entry.line, 14);
        assert_eq!(end, 0x140);
    }

    #[test]
    fn first_line_address_falls_back_to_the_prologue_end() {
        let method = method();
        assert_eq!(method.first_line_address(), 0x108);
        assert_eq!(method.address_of_line(11), Some(0x120));
        assert_eq!(method.address_of_line(12), None);

        let bare = MethodInfo {
            has_source: false,
            lines: Vec::new(),
            ..method
        };
        assert_eq!(bare.first_line_address(), 0x108);
    }
}
