//! The native side of the user surface.
//!
//! [`NativeUser`] is the wrapped API as the host would link it: plain Rust
//! signatures over host pointers and host handles. [`ReferenceUser`] is an
//! in-process implementation with the rectangle semantics of the real API,
//! a window-text store and a log of drawing requests in place of a screen.

use crate::types::*;
use ferry_abi::{HostAddr, HostHandle};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bare function-pointer callback of `draw_state`:
/// `(dc, ldata, wdata, cx, cy) -> BOOL`.
pub type DrawStateProc = extern "C" fn(u64, u64, u64, i32, i32) -> i32;

/// Host character width and line height used by `measure_text`.
pub const CHAR_WIDTH: i32 = 8;
pub const LINE_HEIGHT: i32 = 16;

pub trait NativeUser: Send + Sync {
    fn set_rect(
        &self,
        rect: Option<&mut Rect>,
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
    ) -> bool;
    fn set_rect_empty(&self, rect: Option<&mut Rect>) -> bool;
    fn copy_rect(&self, dest: Option<&mut Rect>, src: Option<&Rect>) -> bool;
    fn is_rect_empty(&self, rect: Option<&Rect>) -> bool;
    fn offset_rect(&self, rect: Option<&mut Rect>, dx: i32, dy: i32) -> bool;
    fn inflate_rect(&self, rect: Option<&mut Rect>, dx: i32, dy: i32) -> bool;
    fn intersect_rect(&self, dest: Option<&mut Rect>, a: Option<&Rect>, b: Option<&Rect>) -> bool;
    fn union_rect(&self, dest: Option<&mut Rect>, a: Option<&Rect>, b: Option<&Rect>) -> bool;
    fn subtract_rect(&self, dest: Option<&mut Rect>, a: Option<&Rect>, b: Option<&Rect>) -> bool;
    fn pt_in_rect(&self, rect: Option<&Rect>, pt: Point) -> bool;
    fn equal_rect(&self, a: Option<&Rect>, b: Option<&Rect>) -> bool;

    fn fill_rect(&self, dc: HostHandle, rect: Option<&Rect>, brush: HostHandle) -> i32;
    fn draw_focus_rect(&self, dc: HostHandle, rect: Option<&Rect>) -> bool;
    fn draw_edge(&self, dc: HostHandle, rect: Option<&mut Rect>, edge: u32, flags: u32) -> bool;

    fn to_upper(&self, c: u32) -> u32;
    fn is_alpha(&self, c: u32) -> bool;

    #[allow(clippy::too_many_arguments)]
    fn draw_state(
        &self,
        dc: HostHandle,
        brush: HostHandle,
        func: Option<DrawStateProc>,
        ldata: u64,
        wdata: u64,
        x: i32,
        y: i32,
        cx: i32,
        cy: i32,
        flags: u32,
    ) -> bool;

    /// Copy the window text into `buffer`, NUL-terminated and truncated to
    /// fit; returns the units copied without the terminator.
    fn get_window_text(&self, window: HostHandle, buffer: &mut [u16]) -> usize;
    fn set_window_text(&self, window: HostHandle, text: Option<&str>) -> bool;

    fn polyline(&self, dc: HostHandle, points: &[Point]) -> bool;

    /// Compute the extent of `run` into `run.bounds`.
    ///
    /// # Safety
    /// `run.text` must point at `run.len` readable UTF-16 units, or be null
    /// with a zero length.
    unsafe fn measure_text(&self, dc: HostHandle, run: &mut TextRun) -> bool;

    /// Address of the first unit of every line in `run`.
    ///
    /// # Safety
    /// As for [`NativeUser::measure_text`].
    unsafe fn line_starts(&self, run: &TextRun) -> Vec<HostAddr>;
}

/// One drawing request seen by [`ReferenceUser`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrawOp {
    Fill {
        dc: HostHandle,
        rect: Rect,
        brush: HostHandle,
    },
    Focus {
        dc: HostHandle,
        rect: Rect,
    },
    Edge {
        dc: HostHandle,
        rect: Rect,
        edge: u32,
        flags: u32,
    },
    State {
        dc: HostHandle,
        x: i32,
        y: i32,
        flags: u32,
        passes: u32,
    },
    Polyline {
        dc: HostHandle,
        points: Vec<Point>,
    },
}

/// First window handle handed out by [`ReferenceUser::create_window`].
const FIRST_WINDOW: u64 = 0x1_0020;

pub struct ReferenceUser {
    windows: Mutex<FxHashMap<u64, Vec<u16>>>,
    next_window: AtomicU64,
    draws: Mutex<Vec<DrawOp>>,
}

impl ReferenceUser {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(FxHashMap::default()),
            next_window: AtomicU64::new(FIRST_WINDOW),
            draws: Mutex::new(Vec::new()),
        }
    }

    pub fn create_window(&self, text: &str) -> HostHandle {
        let id = self.next_window.fetch_add(4, Ordering::Relaxed);
        self.windows.lock().insert(id, text.encode_utf16().collect());
        HostHandle(id)
    }

    pub fn window_text(&self, window: HostHandle) -> Option<String> {
        self.windows
            .lock()
            .get(&window.raw())
            .map(|units| String::from_utf16_lossy(units))
    }

    /// Drawing requests so far, oldest first.
    pub fn draws(&self) -> Vec<DrawOp> {
        self.draws.lock().clone()
    }

    fn record(&self, op: DrawOp) {
        log::trace!("draw {:?}", op);
        self.draws.lock().push(op);
    }
}

impl Default for ReferenceUser {
    fn default() -> Self {
        Self::new()
    }
}

fn is_empty(rect: Option<&Rect>) -> bool {
    rect.map_or(true, Rect::is_empty)
}

fn intersect(a: &Rect, b: &Rect) -> Option<Rect> {
    if a.is_empty()
        || b.is_empty()
        || a.left >= b.right
        || b.left >= a.right
        || a.top >= b.bottom
        || b.top >= a.bottom
    {
        return None;
    }
    Some(Rect::new(
        a.left.max(b.left),
        a.top.max(b.top),
        a.right.min(b.right),
        a.bottom.min(b.bottom),
    ))
}

/// Pixels one side of an edge takes: one per border line present.
fn edge_width(edge: u32) -> i32 {
    let outer = edge & (BDR_RAISEDOUTER | BDR_SUNKENOUTER) != 0;
    let inner = edge & (BDR_RAISEDINNER | BDR_SUNKENINNER) != 0;
    outer as i32 + inner as i32
}

impl NativeUser for ReferenceUser {
    fn set_rect(
        &self,
        rect: Option<&mut Rect>,
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
    ) -> bool {
        let Some(rect) = rect else {
            return false;
        };
        *rect = Rect::new(left, top, right, bottom);
        true
    }

    fn set_rect_empty(&self, rect: Option<&mut Rect>) -> bool {
        self.set_rect(rect, 0, 0, 0, 0)
    }

    fn copy_rect(&self, dest: Option<&mut Rect>, src: Option<&Rect>) -> bool {
        match (dest, src) {
            (Some(dest), Some(src)) => {
                *dest = *src;
                true
            }
            _ => false,
        }
    }

    fn is_rect_empty(&self, rect: Option<&Rect>) -> bool {
        is_empty(rect)
    }

    fn offset_rect(&self, rect: Option<&mut Rect>, dx: i32, dy: i32) -> bool {
        let Some(rect) = rect else {
            return false;
        };
        rect.left = rect.left.wrapping_add(dx);
        rect.right = rect.right.wrapping_add(dx);
        rect.top = rect.top.wrapping_add(dy);
        rect.bottom = rect.bottom.wrapping_add(dy);
        true
    }

    fn inflate_rect(&self, rect: Option<&mut Rect>, dx: i32, dy: i32) -> bool {
        let Some(rect) = rect else {
            return false;
        };
        rect.left = rect.left.wrapping_sub(dx);
        rect.top = rect.top.wrapping_sub(dy);
        rect.right = rect.right.wrapping_add(dx);
        rect.bottom = rect.bottom.wrapping_add(dy);
        true
    }

    fn intersect_rect(&self, dest: Option<&mut Rect>, a: Option<&Rect>, b: Option<&Rect>) -> bool {
        let (Some(dest), Some(a), Some(b)) = (dest, a, b) else {
            return false;
        };
        match intersect(a, b) {
            Some(rect) => {
                *dest = rect;
                true
            }
            None => {
                *dest = Rect::default();
                false
            }
        }
    }

    fn union_rect(&self, dest: Option<&mut Rect>, a: Option<&Rect>, b: Option<&Rect>) -> bool {
        let Some(dest) = dest else {
            return false;
        };
        match (a.filter(|r| !r.is_empty()), b.filter(|r| !r.is_empty())) {
            (None, None) => {
                *dest = Rect::default();
                false
            }
            (Some(only), None) | (None, Some(only)) => {
                *dest = *only;
                true
            }
            (Some(a), Some(b)) => {
                *dest = Rect::new(
                    a.left.min(b.left),
                    a.top.min(b.top),
                    a.right.max(b.right),
                    a.bottom.max(b.bottom),
                );
                true
            }
        }
    }

    fn subtract_rect(&self, dest: Option<&mut Rect>, a: Option<&Rect>, b: Option<&Rect>) -> bool {
        let Some(dest) = dest else {
            return false;
        };
        let Some(a) = a.filter(|r| !r.is_empty()) else {
            *dest = Rect::default();
            return false;
        };
        *dest = *a;
        let Some(cut) = b.and_then(|b| intersect(a, b)) else {
            return true;
        };
        if cut == *dest {
            *dest = Rect::default();
            return false;
        }
        // only a cut spanning a full side shrinks the result
        if cut.top == dest.top && cut.bottom == dest.bottom {
            if cut.left == dest.left {
                dest.left = cut.right;
            } else if cut.right == dest.right {
                dest.right = cut.left;
            }
        } else if cut.left == dest.left && cut.right == dest.right {
            if cut.top == dest.top {
                dest.top = cut.bottom;
            } else if cut.bottom == dest.bottom {
                dest.bottom = cut.top;
            }
        }
        true
    }

    fn pt_in_rect(&self, rect: Option<&Rect>, pt: Point) -> bool {
        rect.is_some_and(|r| pt.x >= r.left && pt.x < r.right && pt.y >= r.top && pt.y < r.bottom)
    }

    fn equal_rect(&self, a: Option<&Rect>, b: Option<&Rect>) -> bool {
        matches!((a, b), (Some(a), Some(b)) if a == b)
    }

    fn fill_rect(&self, dc: HostHandle, rect: Option<&Rect>, brush: HostHandle) -> i32 {
        let Some(rect) = rect else {
            return 0;
        };
        self.record(DrawOp::Fill {
            dc,
            rect: *rect,
            brush,
        });
        1
    }

    fn draw_focus_rect(&self, dc: HostHandle, rect: Option<&Rect>) -> bool {
        let Some(rect) = rect else {
            return false;
        };
        self.record(DrawOp::Focus { dc, rect: *rect });
        true
    }

    fn draw_edge(&self, dc: HostHandle, rect: Option<&mut Rect>, edge: u32, flags: u32) -> bool {
        let Some(rect) = rect else {
            return false;
        };
        self.record(DrawOp::Edge {
            dc,
            rect: *rect,
            edge,
            flags,
        });
        if flags & BF_ADJUST != 0 {
            let width = edge_width(edge);
            if flags & BF_LEFT != 0 {
                rect.left += width;
            }
            if flags & BF_TOP != 0 {
                rect.top += width;
            }
            if flags & BF_RIGHT != 0 {
                rect.right -= width;
            }
            if flags & BF_BOTTOM != 0 {
                rect.bottom -= width;
            }
        }
        true
    }

    fn to_upper(&self, c: u32) -> u32 {
        let Some(ch) = char::from_u32(c) else {
            return c;
        };
        let mut upper = ch.to_uppercase();
        match (upper.next(), upper.next()) {
            (Some(single), None) => single as u32,
            // expands to several characters: left alone
            _ => c,
        }
    }

    fn is_alpha(&self, c: u32) -> bool {
        char::from_u32(c).is_some_and(char::is_alphabetic)
    }

    fn draw_state(
        &self,
        dc: HostHandle,
        _brush: HostHandle,
        func: Option<DrawStateProc>,
        ldata: u64,
        wdata: u64,
        x: i32,
        y: i32,
        cx: i32,
        cy: i32,
        flags: u32,
    ) -> bool {
        let mut passes = 0;
        if flags & 0x000f == DST_COMPLEX {
            let Some(func) = func else {
                return false;
            };
            // a disabled image is drawn twice: highlight, then shadow
            let wanted = if flags & DSS_DISABLED != 0 { 2 } else { 1 };
            for _ in 0..wanted {
                passes += 1;
                if func(dc.raw(), ldata, wdata, cx, cy) == 0 {
                    return false;
                }
            }
        }
        self.record(DrawOp::State {
            dc,
            x,
            y,
            flags,
            passes,
        });
        true
    }

    fn get_window_text(&self, window: HostHandle, buffer: &mut [u16]) -> usize {
        let Some(last) = buffer.len().checked_sub(1) else {
            return 0;
        };
        let windows = self.windows.lock();
        let text = windows.get(&window.raw()).map_or(&[][..], Vec::as_slice);
        let copied = text.len().min(last);
        buffer[..copied].copy_from_slice(&text[..copied]);
        buffer[copied] = 0;
        copied
    }

    fn set_window_text(&self, window: HostHandle, text: Option<&str>) -> bool {
        let mut windows = self.windows.lock();
        let Some(current) = windows.get_mut(&window.raw()) else {
            return false;
        };
        *current = text.unwrap_or_default().encode_utf16().collect();
        true
    }

    fn polyline(&self, dc: HostHandle, points: &[Point]) -> bool {
        if points.len() < 2 {
            return false;
        }
        self.record(DrawOp::Polyline {
            dc,
            points: points.to_vec(),
        });
        true
    }

    unsafe fn measure_text(&self, _dc: HostHandle, run: &mut TextRun) -> bool {
        let len = run.len as usize;
        if run.text.is_null() && len > 0 {
            return false;
        }
        let text = run_text(run);

        let (mut widest, mut lines, mut current) = (0usize, 1i32, 0usize);
        for &unit in text {
            if unit == u16::from(b'\n') && run.format & DT_SINGLELINE == 0 {
                widest = widest.max(current);
                lines += 1;
                current = 0;
            } else {
                current += 1;
            }
        }
        widest = widest.max(current);

        run.bounds.right = run.bounds.left + widest as i32 * CHAR_WIDTH;
        run.bounds.bottom = run.bounds.top + lines * LINE_HEIGHT;
        true
    }

    unsafe fn line_starts(&self, run: &TextRun) -> Vec<HostAddr> {
        if run.text.is_null() {
            return Vec::new();
        }
        let mut starts = vec![run.text];
        if run.format & DT_SINGLELINE != 0 {
            return starts;
        }
        for (index, &unit) in run_text(run).iter().enumerate() {
            if unit == u16::from(b'\n') {
                starts.push(run.text.offset((index as u64 + 1) * 2));
            }
        }
        starts
    }
}

/// # Safety
/// `run.text` must point at `run.len` readable units unless `len` is zero.
unsafe fn run_text(run: &TextRun) -> &[u16] {
    match run.len as usize {
        0 => &[],
        len => std::slice::from_raw_parts(run.text.as_ptr::<u16>(), len),
    }
}
