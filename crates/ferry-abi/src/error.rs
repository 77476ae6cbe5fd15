//! Error types for the marshaling core.
//!
//! Translation, arena and callback errors are recoverable. A
//! [`ProtocolError`] never is: it is logged and raised as a panic.

use crate::record::{ModuleId, OpTag};
use thiserror::Error;

/// An address or argument that cannot be carried across the boundary.
///
/// Handlers turn these into the operation's own "invalid pointer" result
/// rather than calling into the wrapped API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("guest address {addr:#x} (+{len} bytes) is not mapped")]
    Unmapped { addr: u64, len: usize },

    #[error("host address {0:#x} is not reachable from the guest")]
    Unreachable(u64),

    #[error("null guest pointer used for {0} bytes")]
    Null(usize),

    #[error("array of {0} elements passed with a null pointer")]
    NullArray(u64),

    #[error("array of {count} elements exceeds the limit of {limit}")]
    TooLarge { count: u64, limit: u64 },

    #[error("string at {0:#x} has no terminator within the length limit")]
    Unterminated(u64),

    #[error("value {0:#x} does not fit in a 32-bit guest word")]
    WordOverflow(u64),

    #[error("handle {0:#x} cannot be represented in the guest")]
    HandleOverflow(u64),

    #[error("guest struct truncated: needed {needed} bytes, {available} available")]
    ShortRead { needed: usize, available: usize },

    #[error("guest region at {0:#x} overlaps an existing mapping")]
    Overlap(u64),

    #[error("no address translator attached to this codec")]
    Detached,
}

/// Failure inside the guest-reachable arena.
#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("arena exhausted: {requested} bytes requested")]
    Exhausted { requested: usize },

    #[error("invalid arena size {0}")]
    InvalidSize(usize),

    #[error("guest range {addr:#x}+{len} lies outside the arena")]
    OutOfBounds { addr: u64, len: usize },

    #[error("guest address {0:#x} was not allocated from this arena")]
    NotAllocated(u64),

    #[error("failed to map arena memory: {0}")]
    Map(#[from] std::io::Error),

    #[error("wide string at {0:#x} has no terminator inside the arena")]
    Unterminated(u64),
}

/// Failure while bouncing a host callback into guest code.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error(transparent)]
    Arena(#[from] ArenaError),
}

/// A broken agreement between guest stubs and host tables.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("no module registered as {0}")]
    UnknownModule(ModuleId),

    #[error("no handler for {tag:?} in module {module}")]
    UnknownOperation { tag: OpTag, module: &'static str },

    #[error("operation {name} belongs to module {found}, not {expected}")]
    ForeignOperation {
        name: &'static str,
        found: ModuleId,
        expected: ModuleId,
    },

    #[error("operation {name} index {local} out of range for {module} ({len} entries)")]
    OutOfRange {
        name: &'static str,
        local: u32,
        module: &'static str,
        len: usize,
    },

    #[error("operation {name} registered twice in module {module}")]
    DuplicateOperation { name: &'static str, module: ModuleId },

    #[error("module {module} registered twice ({existing} and {name})")]
    DuplicateModule {
        module: ModuleId,
        existing: &'static str,
        name: &'static str,
    },

    #[error("module {name} uses number {module}, limit is {limit}")]
    ModuleOutOfRange {
        module: ModuleId,
        name: &'static str,
        limit: u32,
    },

    #[error("record for {module}.{name} carries {actual} fields, descriptor says {expected}")]
    FieldCount {
        module: &'static str,
        name: &'static str,
        actual: usize,
        expected: usize,
    },

    #[error("no guest routine at {0:#x}")]
    UnknownEntry(u64),
}

impl ProtocolError {
    /// Log and panic. There is no way to continue with unwritten out-fields.
    pub fn raise(self) -> ! {
        log::error!("{}", self);
        panic!("{}", self)
    }
}
