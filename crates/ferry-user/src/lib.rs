//! Sample surfaces wrapped over the ferry bridge.
//!
//! - [`user`]: rectangle helpers, drawing, window text and `DrawState`, a
//!   call that takes a guest callback through a bare function pointer
//! - [`canvas`]: a two-role object family served from the object table
//! - [`native`]: the host library the `user` module forwards to, with an
//!   in-memory [`ReferenceUser`]
//! - [`types`]: structures both sides share

pub mod canvas;
pub mod native;
pub mod types;
pub mod user;

pub use canvas::{Canvas, CanvasClient, CanvasHost, LegacyCanvas, CANVAS_MODULE};
pub use native::{DrawOp, NativeUser, ReferenceUser};
pub use user::{trampoline_calls, UserApi, UserApiOp, UserApiStubs, UserHost, USER_MODULE};

use ferry_runtime::BridgeBuilder;
use std::sync::Arc;

/// Add the `user` and `canvas` modules to `builder`.
///
/// Canvases live in the builder's object table; the returned handler
/// exposes their drop counter.
pub fn install<N: NativeUser + 'static>(
    builder: BridgeBuilder,
    native: Arc<N>,
) -> (BridgeBuilder, Arc<CanvasHost>) {
    let (canvas, host) = canvas::register(Arc::clone(builder.objects()));
    let builder = builder.module(user::register(native)).module(canvas);
    (builder, host)
}
