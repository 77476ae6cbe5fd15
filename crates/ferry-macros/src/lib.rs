// ferry-macros: descriptor macros for the ferry call-marshaling protocol
//
// Provides:
// - #[api(module = N, name = "...")] - turns a trait of operations into
//   static descriptors, guest stubs and a host dispatch table
// - #[derive(Thunk)] - guest layout and pointer translation for structs
//   with nested pointers
//
// Example:
// ```
// #[ferry_abi::api(module = 1, name = "user")]
// pub trait UserApi: Send + Sync {
//     fn is_rect_empty(&self, rect: Ptr<Rect>) -> Bool;
// }
// ```

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput, ItemTrait};

mod api;
mod thunk;

/// Declares a wrapped module.
///
/// Every method of the trait is one operation; its position is the local
/// operation index. Parameter types are shapes (`Ptr<Rect, InOut>`,
/// `Array<Point>`, `Handle`, ...) and the return type implements
/// `ReturnValue`. The trait is rewritten so implementations receive the
/// host form of each shape.
///
/// Generated alongside the trait `Foo`:
/// - `FooOp`: one variant per operation with `tag()`, `name()` and a static
///   `descriptor()`, plus `FooOp::dispatch_table(backend)`
/// - `FooStubs<T>`: guest-side stubs that pack a call record and trap
///   through `T: SyscallTrap`
///
/// # Example
///
/// ```ignore
/// #[api(module = 2, name = "canvas")]
/// pub trait CanvasApi: Send + Sync {
///     fn get_marker(&self, canvas: ObjectHandle, out: Ptr<Point, Out>) -> HResult;
/// }
///
/// let stubs = CanvasApiStubs::new(bridge);
/// let hr = stubs.get_marker(handle, point_addr);
/// ```
#[proc_macro_attribute]
pub fn api(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemTrait);
    api::expand_api(attr.into(), input)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}

/// Derives `Thunk` for a struct with named fields.
///
/// Fields are laid out in declaration order with C alignment rules, using
/// each field type's guest layout. A `<Name>Guest` companion struct with the
/// untranslated guest field types is generated next to it.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Thunk)]
/// pub struct TextRun {
///     pub text: HostAddr,
///     pub len: u32,
/// }
/// // TextRunGuest { text: GuestAddr, len: u32 }
/// ```
#[proc_macro_derive(Thunk)]
pub fn derive_thunk(item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);
    thunk::expand_thunk(input)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}
