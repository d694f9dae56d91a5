use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use sable_inferior::{FunctionRef, InferiorPort, MethodInfo, RawBreakpointId};

use crate::error::Error;

/// Index of a breakpoint in the [BreakpointTable].
///
/// Indices are non-zero and never reused while the owning inferior lives;
/// `0` is reserved to mean "unknown/foreign breakpoint, not ours".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointIndex(u32);

impl BreakpointIndex {
    /// Returns the numeric index.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BreakpointIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Location a breakpoint is set on.
#[derive(Debug, Clone)]
pub enum BreakpointLocation {
    /// A raw code address, insertable immediately.
    Address(u64),

    /// A managed function, resolved lazily when its method is JIT-compiled.
    Function {
        /// The target function.
        function: FunctionRef,

        /// Optional source line within the function; defaults to the first
        /// line.
        line: Option<u32>,
    },
}

/// Thread-group filter of a breakpoint.
///
/// A breakpoint "breaks" only threads its filter accepts; hits from other
/// threads are silently stepped over.
#[derive(Debug, Clone)]
pub enum ThreadFilter {
    /// Break every thread.
    Global,

    /// Break a single thread.
    Thread(u64),

    /// Break any thread of the group.
    Group(Vec<u64>),
}

impl ThreadFilter {
    /// Returns whether the given thread should break on the breakpoint.
    pub fn accepts(&self, thread_id: u64) -> bool {
        match self {
            Self::Global => true,
            Self::Thread(id) => *id == thread_id,
            Self::Group(ids) => ids.contains(&thread_id),
        }
    }
}

/// Callback invoked exactly once when a deferred function breakpoint
/// resolves to an address.
pub type LoadHandler = Box<dyn FnOnce(BreakpointIndex, u64) + Send>;

struct BreakpointRecord {
    location: BreakpointLocation,
    filter: ThreadFilter,
    enabled: bool,

    /// Resolved address; `None` while a function breakpoint is deferred.
    addr: Option<u64>,

    /// Raw id of the low-level insertion; `None` while deferred or disabled.
    raw: Option<RawBreakpointId>,
}

/// Arena of breakpoint records, shared by all engines of one inferior.
///
/// Keyed by a dense, monotonically increasing index; low-level insertions go
/// through the port of whichever engine performs the mutation.
pub struct BreakpointTable {
    next_index: u32,
    records: IndexMap<u32, BreakpointRecord>,
    by_raw: HashMap<RawBreakpointId, u32>,

    /// Deferred function breakpoints, keyed by method token.
    pending: HashMap<u64, Vec<u32>>,

    load_handlers: HashMap<u32, LoadHandler>,
}

impl Default for BreakpointTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            next_index: 1,
            records: IndexMap::new(),
            by_raw: HashMap::new(),
            pending: HashMap::new(),
            load_handlers: HashMap::new(),
        }
    }

    fn allocate(&mut self, record: BreakpointRecord) -> BreakpointIndex {
        let index = self.next_index;
        self.next_index += 1;
        self.records.insert(index, record);
        BreakpointIndex(index)
    }

    /// Inserts a breakpoint at a resolved address.
    pub(crate) fn insert_at<P: InferiorPort>(
        &mut self,
        port: &mut P,
        location: BreakpointLocation,
        filter: ThreadFilter,
        addr: u64,
    ) -> crate::Result<BreakpointIndex> {
        let raw = port.insert_breakpoint(addr)?;

        let index = self.allocate(BreakpointRecord {
            location,
            filter,
            enabled: true,
            addr: Some(addr),
            raw: Some(raw),
        });

        self.by_raw.insert(raw, index.get());

        tracing::info!(index = %index, addr = format_args!("{addr:#x}"), "breakpoint inserted");

        Ok(index)
    }

    /// Registers a function breakpoint whose method is not compiled yet.
    ///
    /// No low-level insertion happens until
    /// [resolve_compiled](Self::resolve_compiled) is called for the method's
    /// token.
    pub(crate) fn insert_deferred(
        &mut self,
        location: BreakpointLocation,
        filter: ThreadFilter,
        token: u64,
    ) -> BreakpointIndex {
        let index = self.allocate(BreakpointRecord {
            location,
            filter,
            enabled: true,
            addr: None,
            raw: None,
        });

        self.pending.entry(token).or_default().push(index.get());

        tracing::info!(index = %index, token, "breakpoint deferred until method is compiled");

        index
    }

    /// Registers a load handler for a deferred breakpoint.
    pub(crate) fn set_load_handler(&mut self, index: BreakpointIndex, handler: LoadHandler) {
        self.load_handlers.insert(index.get(), handler);
    }

    /// Resolves every breakpoint deferred on the given method token.
    ///
    /// Performs the real insertions and invokes (then discards) the load
    /// handlers. Resolution failures are logged and skipped; they never abort
    /// the run that triggered the compilation.
    pub(crate) fn resolve_compiled<P: InferiorPort>(
        &mut self,
        port: &mut P,
        token: u64,
        method: &MethodInfo,
    ) {
        let Some(indices) = self.pending.remove(&token) else {
            return;
        };

        for index in indices {
            let Some(record) = self.records.get_mut(&index) else {
                continue;
            };

            let line = match &record.location {
                BreakpointLocation::Function { line, .. } => *line,
                BreakpointLocation::Address(_) => None,
            };

            let addr = match line {
                Some(line) => method.address_of_line(line),
                None => Some(method.first_line_address()),
            };

            let Some(addr) = addr else {
                tracing::warn!(index, token, "deferred breakpoint has no address for its line");
                continue;
            };

            match port.insert_breakpoint(addr) {
                Ok(raw) => {
                    record.addr = Some(addr);
                    record.raw = Some(raw);
                    self.by_raw.insert(raw, index);

                    tracing::info!(
                        index,
                        addr = format_args!("{addr:#x}"),
                        "deferred breakpoint resolved"
                    );

                    if let Some(handler) = self.load_handlers.remove(&index) {
                        handler(BreakpointIndex(index), addr);
                    }
                }
                Err(e) => tracing::warn!(index, error = %e, "deferred breakpoint insertion failed"),
            }
        }
    }

    /// Removes a breakpoint.
    ///
    /// Removing an unknown (or already removed) index is an error, never a
    /// double-free.
    pub(crate) fn remove<P: InferiorPort>(
        &mut self,
        port: &mut P,
        index: BreakpointIndex,
    ) -> crate::Result<()> {
        let Some(record) = self.records.swap_remove(&index.get()) else {
            return Err(Error::LocationInvalid(format!("no breakpoint {index}")));
        };

        if let Some(raw) = record.raw {
            self.by_raw.remove(&raw);
            port.remove_breakpoint(raw)?;
        }

        for indices in self.pending.values_mut() {
            indices.retain(|i| *i != index.get());
        }
        self.load_handlers.remove(&index.get());

        tracing::info!(index = %index, "breakpoint removed");

        Ok(())
    }

    /// Disables a breakpoint, removing its low-level trap but keeping the
    /// record.
    pub(crate) fn disable<P: InferiorPort>(
        &mut self,
        port: &mut P,
        index: BreakpointIndex,
    ) -> crate::Result<()> {
        let Some(record) = self.records.get_mut(&index.get()) else {
            return Err(Error::LocationInvalid(format!("no breakpoint {index}")));
        };

        if let Some(raw) = record.raw.take() {
            self.by_raw.remove(&raw);
            port.remove_breakpoint(raw)?;
        }
        record.enabled = false;

        Ok(())
    }

    /// Re-enables a disabled breakpoint.
    pub(crate) fn enable<P: InferiorPort>(
        &mut self,
        port: &mut P,
        index: BreakpointIndex,
    ) -> crate::Result<()> {
        let Some(record) = self.records.get_mut(&index.get()) else {
            return Err(Error::LocationInvalid(format!("no breakpoint {index}")));
        };

        if record.raw.is_none() {
            if let Some(addr) = record.addr {
                let raw = port.insert_breakpoint(addr)?;
                record.raw = Some(raw);
                self.by_raw.insert(raw, index.get());
            }
        }
        record.enabled = true;

        Ok(())
    }

    /// Looks up the breakpoint behind a raw id.
    ///
    /// Returns the index, whether it is enabled, and whether its filter
    /// accepts the given thread.
    pub(crate) fn lookup_raw(
        &self,
        raw: RawBreakpointId,
        thread_id: u64,
    ) -> Option<(BreakpointIndex, bool, bool)> {
        let index = *self.by_raw.get(&raw)?;
        let record = self.records.get(&index)?;
        Some((
            BreakpointIndex(index),
            record.enabled,
            record.filter.accepts(thread_id),
        ))
    }

    /// Looks up an enabled breakpoint by resolved address.
    pub(crate) fn at_address(&self, addr: u64) -> Option<BreakpointIndex> {
        self.records
            .iter()
            .find(|(_, record)| record.enabled && record.addr == Some(addr))
            .map(|(index, _)| BreakpointIndex(*index))
    }

    /// Removes every low-level insertion, keeping the records (detach path).
    pub(crate) fn remove_all_raw<P: InferiorPort>(&mut self, port: &mut P) {
        for (index, record) in self.records.iter_mut() {
            if let Some(raw) = record.raw.take() {
                self.by_raw.remove(&raw);
                if let Err(e) = port.remove_breakpoint(raw) {
                    tracing::warn!(index, error = %e, "breakpoint removal failed on detach");
                }
            }
        }
    }
}
