//! Fixtures shared by the unit tests.

use crate::arena::GuestArena;
use crate::callback::{CallbackRecord, GuestExecutor};
use crate::dispatch::CallContext;
use crate::translate::{Bitness, GuestAddr, WindowTranslator};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) const GUEST_BASE: u64 = 0x1000_0000;

/// Records every callback and answers with the sum of its arguments.
pub(crate) struct EchoExecutor {
    arena: Arc<GuestArena>,
    calls: Mutex<Vec<(GuestAddr, Vec<u64>)>>,
    strings: Mutex<Vec<String>>,
    capture_wide: AtomicBool,
}

impl EchoExecutor {
    pub(crate) fn calls(&self) -> Vec<(GuestAddr, Vec<u64>)> {
        self.calls.lock().clone()
    }

    pub(crate) fn strings(&self) -> Vec<String> {
        self.strings.lock().clone()
    }

    /// Also read the first argument as a guest wide string.
    pub(crate) fn capture_wide(&self, on: bool) {
        self.capture_wide.store(on, Ordering::Relaxed);
    }
}

impl GuestExecutor for EchoExecutor {
    fn execute(&self, entry: GuestAddr, frame: GuestAddr) -> u64 {
        let record: CallbackRecord = self.arena.read(frame).expect("frame in arena");
        let args = record.args().to_vec();
        if self.capture_wide.load(Ordering::Relaxed) {
            let text = self.arena.read_wide(GuestAddr(args[0])).expect("wide string");
            self.strings.lock().push(text);
        }
        let sum = args.iter().fold(0u64, |acc, v| acc.wrapping_add(*v));
        self.calls.lock().push((entry, args));
        sum
    }
}

pub(crate) fn context_with_executor() -> (CallContext, Arc<EchoExecutor>) {
    let arena = Arc::new(GuestArena::windowed(64 * 1024, GUEST_BASE).expect("arena"));
    let translator =
        Arc::new(WindowTranslator::new(Arc::clone(&arena), Bitness::B32).expect("translator"));
    let executor = Arc::new(EchoExecutor {
        arena: Arc::clone(&arena),
        calls: Mutex::new(Vec::new()),
        strings: Mutex::new(Vec::new()),
        capture_wide: AtomicBool::new(false),
    });
    let cx = CallContext::new(translator, executor.clone(), arena);
    (cx, executor)
}

pub(crate) fn context() -> CallContext {
    context_with_executor().0
}
