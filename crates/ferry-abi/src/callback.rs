//! Host-to-guest callbacks.
//!
//! When a wrapped API calls back into a function pointer the guest supplied,
//! a host trampoline packages the arguments into a [`CallbackRecord`] placed
//! in guest-reachable memory, translates pointer arguments guest-ward and
//! runs the guest function through the [`GuestExecutor`].
//!
//! APIs that take a closure capture the [`GuestCallback`] directly. APIs that
//! take a bare function pointer need somewhere for the trampoline to find it;
//! [`CallbackSlot`] is a per-thread slot saved and restored around each call
//! so nested and recursive calls see their own registration.

use crate::dispatch::CallContext;
use crate::error::CallbackError;
use crate::thunk::Plain;
use crate::translate::{GuestAddr, HostAddr, HostHandle};
use std::cell::RefCell;
use std::thread::LocalKey;

/// Most arguments one callback can receive.
pub const MAX_CALLBACK_ARGS: usize = 8;

/// The host-to-guest execute primitive.
pub trait GuestExecutor: Send + Sync {
    /// Run guest code at `entry` with the callback record at `frame`, return
    /// its result word. Blocks until the guest function returns.
    fn execute(&self, entry: GuestAddr, frame: GuestAddr) -> u64;
}

/// Argument block handed to guest code.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackRecord {
    pub argc: u64,
    pub args: [u64; MAX_CALLBACK_ARGS],
}

unsafe impl Plain for CallbackRecord {}

impl CallbackRecord {
    pub fn args(&self) -> &[u64] {
        let argc = (self.argc as usize).min(MAX_CALLBACK_ARGS);
        &self.args[..argc]
    }
}

/// One callback argument as the native API produced it.
#[derive(Debug, Clone, Copy)]
pub enum CallbackArg<'a> {
    Scalar(u64),
    Handle(HostHandle),
    /// Host memory that is already guest-reachable.
    Pointer(HostAddr),
    /// Host data copied into guest scratch memory for the duration of the
    /// call; the guest receives its address.
    Data(&'a [u8]),
}

/// A guest function pointer bound to the bridge it arrived through.
#[derive(Clone)]
pub struct GuestCallback {
    entry: GuestAddr,
    cx: CallContext,
}

impl GuestCallback {
    pub fn new(entry: GuestAddr, cx: &CallContext) -> Self {
        Self {
            entry,
            cx: cx.clone(),
        }
    }

    pub fn entry(&self) -> GuestAddr {
        self.entry
    }

    /// Run the guest function with `args`.
    pub fn invoke(&self, args: &[CallbackArg<'_>]) -> Result<u64, CallbackError> {
        assert!(
            args.len() <= MAX_CALLBACK_ARGS,
            "callback with {} arguments, limit is {}",
            args.len(),
            MAX_CALLBACK_ARGS
        );
        let translator = self.cx.translator();
        let scratch = self.cx.scratch();

        let mut record = CallbackRecord {
            argc: args.len() as u64,
            args: [0; MAX_CALLBACK_ARGS],
        };
        let mut blocks = Vec::new();
        for (slot, arg) in record.args.iter_mut().zip(args) {
            *slot = match *arg {
                CallbackArg::Scalar(value) => value,
                CallbackArg::Handle(handle) => translator.handle_to_guest(handle)?.raw(),
                CallbackArg::Pointer(addr) => translator.to_guest(addr)?.raw(),
                CallbackArg::Data(bytes) => {
                    let block = scratch.scratch_bytes(bytes, 16)?;
                    let addr = block.addr().raw();
                    blocks.push(block);
                    addr
                }
            };
        }

        let frame = scratch.scratch_value(&record)?;
        log::trace!(
            "callback -> guest {:#x} ({} args)",
            self.entry.raw(),
            args.len()
        );
        let result = self.cx.executor().execute(self.entry, frame.addr());
        log::trace!("callback <- guest {:#x} = {:#x}", self.entry.raw(), result);
        Ok(result)
    }
}

impl std::fmt::Debug for GuestCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GuestCallback").field(&self.entry).finish()
    }
}

/// Per-thread registration slot for bare function-pointer callbacks.
///
/// ```ignore
/// thread_local! {
///     static ENUM_PROC: RefCell<Option<GuestCallback>> = const { RefCell::new(None) };
/// }
/// static ENUM_SLOT: CallbackSlot = CallbackSlot::new(&ENUM_PROC);
/// ```
pub struct CallbackSlot {
    key: &'static LocalKey<RefCell<Option<GuestCallback>>>,
}

impl CallbackSlot {
    pub const fn new(key: &'static LocalKey<RefCell<Option<GuestCallback>>>) -> Self {
        Self { key }
    }

    /// The registration visible to a trampoline running on this thread.
    pub fn current(&self) -> Option<GuestCallback> {
        self.key.with(|slot| slot.borrow().clone())
    }

    /// Install `callback` for the duration of `f`, then restore whatever was
    /// registered before, also when `f` unwinds.
    pub fn scope<R>(&self, callback: Option<GuestCallback>, f: impl FnOnce() -> R) -> R {
        let previous = self.key.with(|slot| slot.replace(callback));
        let _restore = Restore {
            key: self.key,
            previous: Some(previous),
        };
        f()
    }
}

struct Restore {
    key: &'static LocalKey<RefCell<Option<GuestCallback>>>,
    previous: Option<Option<GuestCallback>>,
}

impl Drop for Restore {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            // thread teardown: nothing left to restore
            let _ = self.key.try_with(|slot| *slot.borrow_mut() = previous);
        }
    }
}
