//! The `canvas` module: a COM-style object family with two roles.
//!
//! `Canvas` is the current interface and `LegacyCanvas` an older version
//! layered over the same host object. The host side keeps canvases in the
//! bridge's object table ([`host`]); the guest side wraps the handles it
//! receives in proxies ([`client`]).

pub mod client;
pub mod host;

pub use client::{Canvas, CanvasClient, CanvasMethods, LegacyCanvas, LegacyCanvasMethods};
pub use host::{register, CanvasHost, ReferenceCanvas};

use crate::types::{Point, Size};
use ferry_abi::{api, Callback, HResult, Iid, NewObject, ObjectHandle, Out, Ptr, Text};

/// Module number of the canvas surface.
pub const CANVAS_MODULE: u32 = 2;

pub const IID_CANVAS: Iid = Iid(0x6361_6e76_0002);
pub const IID_LEGACY_CANVAS: Iid = Iid(0x6361_6e76_0001);

/// Interfaces every canvas object supports.
pub const CANVAS_INTERFACES: &[Iid] = &[IID_CANVAS, IID_LEGACY_CANVAS];

#[api(module = 2, name = "canvas")]
pub trait CanvasApi: Send + Sync {
    /// Create a canvas and grant it as `role`.
    fn create_canvas(&self, width: u32, height: u32, role: Iid) -> NewObject;
    fn set_marker(&self, canvas: ObjectHandle, x: i32, y: i32) -> HResult;
    fn get_marker(&self, canvas: ObjectHandle, marker: Ptr<Point, Out>) -> HResult;
    fn get_size(&self, canvas: ObjectHandle, size: Ptr<Size, Out>) -> HResult;
    fn add_layer(&self, canvas: ObjectHandle, name: Text) -> HResult;
    /// Calls `callback(name, index, context)` per layer until it returns 0.
    fn enum_layers(&self, canvas: ObjectHandle, callback: Callback, context: u64) -> HResult;
}

/// The roles a canvas can be viewed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanvasRole {
    Canvas,
    Legacy,
}

impl CanvasRole {
    pub const fn iid(self) -> Iid {
        match self {
            Self::Canvas => IID_CANVAS,
            Self::Legacy => IID_LEGACY_CANVAS,
        }
    }

    pub fn from_iid(iid: Iid) -> Option<Self> {
        match iid {
            IID_CANVAS => Some(Self::Canvas),
            IID_LEGACY_CANVAS => Some(Self::Legacy),
            _ => None,
        }
    }
}

/// NUL-terminated UTF-16LE bytes of `text`.
pub(crate) fn encode_wide(text: &str) -> Vec<u8> {
    text.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_iids() {
        for role in [CanvasRole::Canvas, CanvasRole::Legacy] {
            assert_eq!(CanvasRole::from_iid(role.iid()), Some(role));
            assert!(CANVAS_INTERFACES.contains(&role.iid()));
        }
        assert_eq!(CanvasRole::from_iid(Iid(1)), None);
    }

    #[test]
    fn test_wide_names_are_terminated() {
        assert_eq!(encode_wide("hi"), vec![b'h', 0, b'i', 0, 0, 0]);
        assert_eq!(encode_wide(""), vec![0, 0]);
    }

    #[test]
    fn test_descriptors() {
        assert_eq!(CanvasApiOp::MODULE.0, CANVAS_MODULE);
        assert_eq!(CanvasApiOp::COUNT, 6);
        // width, height, role, then the granted handle and iid
        assert_eq!(CanvasApiOp::CreateCanvas.descriptor().fields, 5);
        assert_eq!(CanvasApiOp::EnumLayers.descriptor().fields, 3);
    }
}
