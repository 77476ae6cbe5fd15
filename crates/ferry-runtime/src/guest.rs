//! Guest code simulator.
//!
//! There is no CPU emulation here. Guest routines are Rust closures
//! registered at synthetic guest code addresses; [`GuestCode`] implements the
//! host-to-guest execute primitive by looking the entry point up and handing
//! the routine the callback record the trampoline placed in guest memory.

use ferry_abi::{
    CallbackRecord, GuestAddr, GuestArena, GuestExecutor, GuestHandle, ProtocolError,
};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// First synthetic guest code address.
pub const CODE_BASE: u64 = 0x7f00_0000;

const ENTRY_STRIDE: u64 = 0x10;

type Routine = Arc<dyn Fn(&GuestFrame<'_>) -> u64 + Send + Sync>;

/// Arguments of one guest routine invocation.
pub struct GuestFrame<'a> {
    record: CallbackRecord,
    memory: &'a Arc<GuestArena>,
}

impl GuestFrame<'_> {
    pub fn argc(&self) -> usize {
        self.record.args().len()
    }

    /// Raw argument word; zero past the end.
    pub fn arg(&self, index: usize) -> u64 {
        self.record.args().get(index).copied().unwrap_or(0)
    }

    pub fn addr(&self, index: usize) -> GuestAddr {
        GuestAddr(self.arg(index))
    }

    pub fn handle(&self, index: usize) -> GuestHandle {
        GuestHandle(self.arg(index))
    }

    /// Guest memory the routine can read its pointer arguments from.
    pub fn memory(&self) -> &Arc<GuestArena> {
        self.memory
    }
}

/// Registry of guest routines and the execute primitive over them.
pub struct GuestCode {
    routines: RwLock<FxHashMap<u64, Routine>>,
    next_entry: AtomicU64,
    invocations: AtomicU64,
    memory: Arc<GuestArena>,
}

impl GuestCode {
    /// Routines read their frames from `memory`, which must be the bridge's
    /// scratch arena.
    pub fn new(memory: Arc<GuestArena>) -> Self {
        Self {
            routines: RwLock::new(FxHashMap::default()),
            next_entry: AtomicU64::new(CODE_BASE),
            invocations: AtomicU64::new(0),
            memory,
        }
    }

    /// Register a routine and return its guest entry point.
    pub fn define<F>(&self, routine: F) -> GuestAddr
    where
        F: Fn(&GuestFrame<'_>) -> u64 + Send + Sync + 'static,
    {
        let entry = self.next_entry.fetch_add(ENTRY_STRIDE, Ordering::Relaxed);
        self.routines.write().insert(entry, Arc::new(routine));
        GuestAddr(entry)
    }

    pub fn is_defined(&self, entry: GuestAddr) -> bool {
        self.routines.read().contains_key(&entry.raw())
    }

    /// Routine executions so far.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn memory(&self) -> &Arc<GuestArena> {
        &self.memory
    }
}

impl GuestExecutor for GuestCode {
    fn execute(&self, entry: GuestAddr, frame: GuestAddr) -> u64 {
        // released before running: routines may call back into the host
        let routine = self.routines.read().get(&entry.raw()).cloned();
        let Some(routine) = routine else {
            ProtocolError::UnknownEntry(entry.raw()).raise()
        };
        let record: CallbackRecord = match self.memory.read(frame) {
            Ok(record) => record,
            Err(err) => {
                log::error!("callback frame at {:#x} unreadable: {}", frame.raw(), err);
                panic!("callback frame at {:#x} unreadable: {}", frame.raw(), err);
            }
        };
        self.invocations.fetch_add(1, Ordering::Relaxed);
        log::trace!("guest {:#x} ({} args)", entry.raw(), record.args().len());
        routine(&GuestFrame {
            record,
            memory: &self.memory,
        })
    }
}

impl fmt::Debug for GuestCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestCode")
            .field("routines", &self.routines.read().len())
            .field("invocations", &self.invocations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_abi::MAX_CALLBACK_ARGS;

    fn code() -> GuestCode {
        GuestCode::new(Arc::new(GuestArena::windowed(4096, 0x2000_0000).unwrap()))
    }

    fn frame(code: &GuestCode, args: &[u64]) -> GuestAddr {
        let mut record = CallbackRecord {
            argc: args.len() as u64,
            args: [0; MAX_CALLBACK_ARGS],
        };
        record.args[..args.len()].copy_from_slice(args);
        code.memory().alloc_value(&record).unwrap()
    }

    #[test]
    fn test_entries_are_distinct() {
        let code = code();
        let a = code.define(|_| 1);
        let b = code.define(|_| 2);
        assert_eq!(a, GuestAddr(CODE_BASE));
        assert_ne!(a, b);
        assert!(code.is_defined(b));
        assert!(!code.is_defined(GuestAddr(0x1234)));
    }

    #[test]
    fn test_execute_passes_arguments() {
        let code = code();
        let entry = code.define(|frame| frame.arg(0) * 10 + frame.arg(1) + frame.arg(5));
        let at = frame(&code, &[4, 2]);
        assert_eq!(code.execute(entry, at), 42);
        assert_eq!(code.invocations(), 1);
    }

    #[test]
    fn test_frame_accessors() {
        let code = code();
        let entry = code.define(|frame| {
            assert_eq!(frame.argc(), 2);
            assert_eq!(frame.handle(0), GuestHandle(0xffff_ffff));
            assert_eq!(frame.addr(1), GuestAddr(0x2000_0010));
            0
        });
        let at = frame(&code, &[0xffff_ffff, 0x2000_0010]);
        code.execute(entry, at);
    }

    #[test]
    #[should_panic(expected = "no guest routine")]
    fn test_unknown_entry_panics() {
        let code = code();
        let at = frame(&code, &[]);
        code.execute(GuestAddr(0xdead), at);
    }
}
