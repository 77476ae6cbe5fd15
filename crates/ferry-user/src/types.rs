//! Structures shared by the user and canvas surfaces.

use ferry_abi::{HostAddr, Plain, Thunk};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

// SAFETY: four i32 fields, no padding, same layout for every guest.
unsafe impl Plain for Rect {}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    pub const fn width(&self) -> i32 {
        self.right - self.left
    }

    pub const fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

// SAFETY: two i32 fields.
unsafe impl Plain for Point {}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub cx: i32,
    pub cy: i32,
}

// SAFETY: two i32 fields.
unsafe impl Plain for Size {}

/// A run of UTF-16 text to be measured.
///
/// `text` is a pointer, so the guest layout differs between 32-bit and
/// 64-bit guests: 28 and 32 bytes.
#[derive(Debug, Clone, PartialEq, Thunk)]
pub struct TextRun {
    pub text: HostAddr,
    /// Length of `text` in UTF-16 units.
    pub len: u32,
    /// In: the origin. Out: the extent the text covers.
    pub bounds: Rect,
    pub format: u32,
}

/// `format` bit: newlines do not start a new line.
pub const DT_SINGLELINE: u32 = 0x0020;

// DrawEdge
pub const BDR_RAISEDOUTER: u32 = 0x0001;
pub const BDR_SUNKENOUTER: u32 = 0x0002;
pub const BDR_RAISEDINNER: u32 = 0x0004;
pub const BDR_SUNKENINNER: u32 = 0x0008;
pub const EDGE_RAISED: u32 = BDR_RAISEDOUTER | BDR_RAISEDINNER;
pub const EDGE_SUNKEN: u32 = BDR_SUNKENOUTER | BDR_SUNKENINNER;

pub const BF_LEFT: u32 = 0x0001;
pub const BF_TOP: u32 = 0x0002;
pub const BF_RIGHT: u32 = 0x0004;
pub const BF_BOTTOM: u32 = 0x0008;
pub const BF_RECT: u32 = BF_LEFT | BF_TOP | BF_RIGHT | BF_BOTTOM;
pub const BF_ADJUST: u32 = 0x2000;

// DrawState
pub const DST_COMPLEX: u32 = 0x0000;
pub const DST_TEXT: u32 = 0x0001;
pub const DSS_DISABLED: u32 = 0x0020;
