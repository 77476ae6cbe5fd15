//! Ferry runtime: the host side of the bridge, simulated in-process.
//!
//! - [`Bridge`]: module registry, call context and object table behind the
//!   syscall trap
//! - [`ObjectTable`] and the built-in `object` module (add-ref, release,
//!   query-interface)
//! - [`ProxyTable`] / [`Proxy`]: guest-side views of polymorphic host objects
//! - [`GuestCode`]: guest routines and the host-to-guest execute primitive
//! - [`BridgeConfig`]: `ferry.toml` and translator selection

pub mod bridge;
pub mod config;
pub mod guest;
pub mod object;
pub mod proxy;

pub use bridge::{Bridge, BridgeBuilder, BridgeError, DEFAULT_WINDOW_BASE};
pub use config::{log_level, BridgeConfig, ConfigError, GuestConfig, LogConfig, TranslationMode};
pub use guest::{GuestCode, GuestFrame, CODE_BASE};
pub use object::{ObjectApi, ObjectApiOp, ObjectApiStubs, ObjectTable, OBJECT_MODULE};
pub use proxy::{InterfaceFamily, Proxy, ProxyTable, RoleTable, MAX_ROLES};
