//! Ferry ABI: the guest/host call-marshaling protocol.
//!
//! Guest code calls a wrapped API through generated stubs. A stub packs its
//! arguments into a [`CallRecord`], crosses the boundary once through a
//! [`SyscallTrap`] and unpacks the result. On the host side the record is
//! routed through a [`ModuleRegistry`] to a handler that translates every
//! pointer with the [`AddressTranslator`] chosen at start-up, calls the real
//! implementation and writes results back.
//!
//! Operations are declared once, as a trait:
//!
//! ```ignore
//! #[ferry_abi::api(module = 1, name = "user")]
//! pub trait UserApi: Send + Sync {
//!     fn offset_rect(&self, rect: Ptr<Rect, InOut>, dx: i32, dy: i32) -> Bool;
//! }
//! ```
//!
//! The attribute generates the `UserApiOp` enum with one static
//! [`OpDescriptor`] per operation, guest stubs (`UserApiStubs`) and the host
//! dispatch table (`UserApiOp::dispatch_table`).

pub mod arena;
pub mod callback;
pub mod dispatch;
pub mod error;
pub mod record;
pub mod shape;
pub mod status;
pub mod thunk;
pub mod translate;
pub mod trap;

#[cfg(test)]
mod testing;

pub use arena::{GuestArena, Scratch};
pub use callback::{
    CallbackArg, CallbackRecord, CallbackSlot, GuestCallback, GuestExecutor, MAX_CALLBACK_ARGS,
};
pub use dispatch::{
    CallContext, DispatchTable, Handler, ModuleRegistry, OpDescriptor, ParamInfo, MAX_MODULES,
};
pub use error::{ArenaError, CallbackError, ProtocolError, TranslateError};
pub use record::{CallRecord, ModuleId, OpTag, MAX_CALL_FIELDS};
pub use shape::{
    Array, Callback, Dir, Direction, GuestSlice, Handle, In, InOut, InOutArray, InOutPtrArray,
    InOutRef, Out, OutArray, OutPtrArray, OutRef, Ptr, PtrArray, Shape, ShapeKind, Text,
};
pub use status::{Bool, HResult, Iid, NewObject, NtStatus, ObjectHandle, ReturnValue};
pub use thunk::{GuestLayout, GuestReader, GuestWriter, Plain, Thunk};
pub use translate::{
    AddressTranslator, Bitness, FlatTranslator, GuestAddr, GuestHandle, HostAddr, HostHandle,
    TableTranslator, Translated, WindowTranslator, Wow64Translator,
};
pub use trap::SyscallTrap;

pub use ferry_macros::{api, Thunk};

/// Paths used by macro-generated code.
#[doc(hidden)]
pub mod __private {
    pub use log;
    pub use std::sync::Arc;
}
