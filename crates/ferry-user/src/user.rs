//! The `user` module: rectangle helpers, simple drawing, window text and
//! text measurement.
//!
//! [`UserApi`] declares the wire surface. [`UserHost`] is the host handler
//! behind it: it turns translated arguments into the shapes the native API
//! takes, calls a [`NativeUser`] and lets the in/out wrappers copy results
//! back to the guest.

use crate::native::{DrawStateProc, NativeUser};
use crate::types::{Point, Rect, TextRun};
use ferry_abi::{
    api, AddressTranslator, Array, Bool, Callback, CallbackArg, CallbackSlot, DispatchTable,
    GuestCallback, Handle, HostHandle, InOut, InOutPtrArray, InOutRef, Out, OutArray,
    OutPtrArray, OutRef, Ptr, PtrArray, Text, TranslateError,
};
use std::cell::{Cell, RefCell};
use std::sync::Arc;

/// Module number of the user surface.
pub const USER_MODULE: u32 = 1;

#[api(module = 1, name = "user")]
pub trait UserApi: Send + Sync {
    fn set_rect(
        &self,
        rect: Ptr<Rect, Out>,
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
    ) -> Bool;
    fn set_rect_empty(&self, rect: Ptr<Rect, Out>) -> Bool;
    fn copy_rect(&self, dest: Ptr<Rect, InOut>, src: Ptr<Rect>) -> Bool;
    fn is_rect_empty(&self, rect: Ptr<Rect>) -> Bool;
    fn offset_rect(&self, rect: Ptr<Rect, InOut>, dx: i32, dy: i32) -> Bool;
    fn inflate_rect(&self, rect: Ptr<Rect, InOut>, dx: i32, dy: i32) -> Bool;
    fn intersect_rect(&self, dest: Ptr<Rect, InOut>, a: Ptr<Rect>, b: Ptr<Rect>) -> Bool;
    fn union_rect(&self, dest: Ptr<Rect, InOut>, a: Ptr<Rect>, b: Ptr<Rect>) -> Bool;
    fn subtract_rect(&self, dest: Ptr<Rect, InOut>, a: Ptr<Rect>, b: Ptr<Rect>) -> Bool;
    /// The point travels as two scalars.
    fn pt_in_rect(&self, rect: Ptr<Rect>, x: i32, y: i32) -> Bool;
    fn equal_rect(&self, a: Ptr<Rect>, b: Ptr<Rect>) -> Bool;

    fn fill_rect(&self, dc: Handle, rect: Ptr<Rect>, brush: Handle) -> i32;
    fn draw_focus_rect(&self, dc: Handle, rect: Ptr<Rect>) -> Bool;
    fn draw_edge(&self, dc: Handle, rect: Ptr<Rect, InOut>, edge: u32, flags: u32) -> Bool;

    fn to_upper(&self, c: u32) -> u32;
    fn is_alpha(&self, c: u32) -> Bool;

    /// `func` is a bare function pointer; the native API calls it back
    /// with `(dc, ldata, wdata, cx, cy)`.
    fn draw_state(
        &self,
        dc: Handle,
        brush: Handle,
        func: Callback,
        ldata: u64,
        wdata: u64,
        x: i32,
        y: i32,
        cx: i32,
        cy: i32,
        flags: u32,
    ) -> Bool;

    /// Copies at most `buffer.len - 1` units plus a terminator; returns the
    /// units copied.
    fn get_window_text(&self, window: Handle, buffer: Array<u16, Out>) -> i32;
    fn set_window_text(&self, window: Handle, text: Text) -> Bool;

    fn polyline(&self, dc: Handle, points: Array<Point>) -> Bool;

    fn measure_text(&self, dc: Handle, run: Ptr<TextRun, InOut>) -> Bool;
    /// Measures every non-null run; returns how many were measured.
    fn measure_text_runs(&self, dc: Handle, runs: PtrArray<TextRun, InOut>) -> u32;

    /// Fills `starts` with pointers to the first unit of each line of
    /// `run`'s text; returns how many were written.
    fn line_starts(&self, run: Ptr<TextRun>, starts: PtrArray<u16, Out>) -> u32;
}

thread_local! {
    static DRAW_STATE_PROC: RefCell<Option<GuestCallback>> = const { RefCell::new(None) };
    static TRAMPOLINE_CALLS: Cell<u64> = const { Cell::new(0) };
}

/// Guest `draw_state` callback of the call running on this thread.
static DRAW_STATE_SLOT: CallbackSlot = CallbackSlot::new(&DRAW_STATE_PROC);

/// Times the `draw_state` trampoline ran on the current thread.
pub fn trampoline_calls() -> u64 {
    TRAMPOLINE_CALLS.with(Cell::get)
}

/// What the native API calls in place of the guest's function pointer.
extern "C" fn draw_state_trampoline(dc: u64, ldata: u64, wdata: u64, cx: i32, cy: i32) -> i32 {
    TRAMPOLINE_CALLS.with(|calls| calls.set(calls.get() + 1));
    let Some(callback) = DRAW_STATE_SLOT.current() else {
        log::error!("draw_state trampoline ran with no guest callback registered");
        return 0;
    };
    let args = [
        CallbackArg::Handle(HostHandle(dc)),
        CallbackArg::Scalar(ldata),
        CallbackArg::Scalar(wdata),
        CallbackArg::Scalar(cx as u64),
        CallbackArg::Scalar(cy as u64),
    ];
    match callback.invoke(&args) {
        Ok(result) => result as i32,
        Err(err) => {
            log::warn!("draw_state callback {:?} failed: {}", callback.entry(), err);
            0
        }
    }
}

/// Run `f` on a host copy of an output pointer and write the copy back.
fn with_out<R>(out: &OutRef<Rect>, f: impl FnOnce(Option<&mut Rect>) -> R) -> R {
    if out.is_null() {
        return f(None);
    }
    let mut value = Rect::default();
    let result = f(Some(&mut value));
    if let Err(err) = out.write(&value) {
        log::warn!("rect write-back failed: {}", err);
    }
    result
}

/// The `len` units behind a translated `run.text` must be guest memory
/// before the native side may read them.
fn check_run_text(
    translator: &dyn AddressTranslator,
    run: &TextRun,
) -> Result<(), TranslateError> {
    let guest = translator.to_guest(run.text)?;
    let bytes = (run.len as usize).saturating_mul(2);
    translator.to_host_range(guest, bytes).map(|_| ())
}

/// Host handler of the user module.
pub struct UserHost<N> {
    native: Arc<N>,
}

impl<N: NativeUser> UserHost<N> {
    pub fn new(native: Arc<N>) -> Self {
        Self { native }
    }

    pub fn native(&self) -> &Arc<N> {
        &self.native
    }
}

impl<N: NativeUser> UserApi for UserHost<N> {
    fn set_rect(&self, rect: OutRef<Rect>, left: i32, top: i32, right: i32, bottom: i32) -> Bool {
        with_out(&rect, |rect| {
            Bool::from(self.native.set_rect(rect, left, top, right, bottom))
        })
    }

    fn set_rect_empty(&self, rect: OutRef<Rect>) -> Bool {
        with_out(&rect, |rect| Bool::from(self.native.set_rect_empty(rect)))
    }

    fn copy_rect(&self, mut dest: InOutRef<Rect>, src: Option<Rect>) -> Bool {
        self.native.copy_rect(dest.get_mut(), src.as_ref()).into()
    }

    fn is_rect_empty(&self, rect: Option<Rect>) -> Bool {
        self.native.is_rect_empty(rect.as_ref()).into()
    }

    fn offset_rect(&self, mut rect: InOutRef<Rect>, dx: i32, dy: i32) -> Bool {
        self.native.offset_rect(rect.get_mut(), dx, dy).into()
    }

    fn inflate_rect(&self, mut rect: InOutRef<Rect>, dx: i32, dy: i32) -> Bool {
        self.native.inflate_rect(rect.get_mut(), dx, dy).into()
    }

    fn intersect_rect(&self, mut dest: InOutRef<Rect>, a: Option<Rect>, b: Option<Rect>) -> Bool {
        self.native
            .intersect_rect(dest.get_mut(), a.as_ref(), b.as_ref())
            .into()
    }

    fn union_rect(&self, mut dest: InOutRef<Rect>, a: Option<Rect>, b: Option<Rect>) -> Bool {
        self.native
            .union_rect(dest.get_mut(), a.as_ref(), b.as_ref())
            .into()
    }

    fn subtract_rect(&self, mut dest: InOutRef<Rect>, a: Option<Rect>, b: Option<Rect>) -> Bool {
        self.native
            .subtract_rect(dest.get_mut(), a.as_ref(), b.as_ref())
            .into()
    }

    fn pt_in_rect(&self, rect: Option<Rect>, x: i32, y: i32) -> Bool {
        self.native
            .pt_in_rect(rect.as_ref(), Point::new(x, y))
            .into()
    }

    fn equal_rect(&self, a: Option<Rect>, b: Option<Rect>) -> Bool {
        self.native.equal_rect(a.as_ref(), b.as_ref()).into()
    }

    fn fill_rect(&self, dc: HostHandle, rect: Option<Rect>, brush: HostHandle) -> i32 {
        self.native.fill_rect(dc, rect.as_ref(), brush)
    }

    fn draw_focus_rect(&self, dc: HostHandle, rect: Option<Rect>) -> Bool {
        self.native.draw_focus_rect(dc, rect.as_ref()).into()
    }

    fn draw_edge(&self, dc: HostHandle, mut rect: InOutRef<Rect>, edge: u32, flags: u32) -> Bool {
        self.native.draw_edge(dc, rect.get_mut(), edge, flags).into()
    }

    fn to_upper(&self, c: u32) -> u32 {
        self.native.to_upper(c)
    }

    fn is_alpha(&self, c: u32) -> Bool {
        self.native.is_alpha(c).into()
    }

    fn draw_state(
        &self,
        dc: HostHandle,
        brush: HostHandle,
        func: Option<GuestCallback>,
        ldata: u64,
        wdata: u64,
        x: i32,
        y: i32,
        cx: i32,
        cy: i32,
        flags: u32,
    ) -> Bool {
        // a null guest pointer stays a null native pointer
        let proc: Option<DrawStateProc> =
            func.is_some().then_some(draw_state_trampoline as DrawStateProc);
        DRAW_STATE_SLOT
            .scope(func, || {
                self.native
                    .draw_state(dc, brush, proc, ldata, wdata, x, y, cx, cy, flags)
            })
            .into()
    }

    fn get_window_text(&self, window: HostHandle, buffer: OutArray<u16>) -> i32 {
        let capacity = buffer.capacity();
        let mut local = vec![0u16; capacity];
        let copied = self.native.get_window_text(window, &mut local);
        if capacity == 0 {
            return copied as i32;
        }
        let end = (copied + 1).min(capacity);
        match buffer.fill(&local[..end]) {
            Ok(_) => copied as i32,
            Err(err) => {
                log::warn!("window text write-back failed: {}", err);
                0
            }
        }
    }

    fn set_window_text(&self, window: HostHandle, text: Option<String>) -> Bool {
        self.native
            .set_window_text(window, text.as_deref())
            .into()
    }

    fn polyline(&self, dc: HostHandle, points: Vec<Point>) -> Bool {
        self.native.polyline(dc, &points).into()
    }

    fn measure_text(&self, dc: HostHandle, mut run: InOutRef<TextRun>) -> Bool {
        let translator = Arc::clone(run.translator());
        let Some(run) = run.get_mut() else {
            return Bool::FALSE;
        };
        if let Err(err) = check_run_text(&*translator, run) {
            log::debug!("measure_text: text rejected: {}", err);
            return Bool::FALSE;
        }
        // SAFETY: `check_run_text` found `len` units of guest memory at
        // `run.text`.
        unsafe { self.native.measure_text(dc, run) }.into()
    }

    fn measure_text_runs(&self, dc: HostHandle, mut runs: InOutPtrArray<TextRun>) -> u32 {
        let translator = Arc::clone(runs.translator());
        let mut measured = 0;
        for (index, run) in runs.iter_mut().enumerate() {
            let Some(run) = run else {
                continue;
            };
            if let Err(err) = check_run_text(&*translator, run) {
                log::debug!("measure_text_runs: run {} rejected: {}", index, err);
                continue;
            }
            // SAFETY: as in `measure_text`.
            if unsafe { self.native.measure_text(dc, run) } {
                measured += 1;
            }
        }
        measured
    }

    fn line_starts(&self, run: Option<TextRun>, starts: OutPtrArray<u16>) -> u32 {
        let Some(run) = run else {
            return 0;
        };
        if starts.target().is_none() {
            return 0;
        }
        if let Err(err) = check_run_text(&**starts.translator(), &run) {
            log::debug!("line_starts: text rejected: {}", err);
            return 0;
        }
        // SAFETY: `check_run_text` found `len` units of guest memory at
        // `run.text`.
        let lines = unsafe { self.native.line_starts(&run) };
        match starts.fill(&lines) {
            Ok(written) => written as u32,
            Err(err) => {
                log::warn!("line_starts write-back failed: {}", err);
                0
            }
        }
    }
}

/// Dispatch table of the user module over `native`.
pub fn register<N: NativeUser + 'static>(native: Arc<N>) -> DispatchTable {
    let table = UserApiOp::dispatch_table(Arc::new(UserHost::new(native)));
    log::debug!("user module ready: {} operations", table.len());
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::ReferenceUser;
    use crate::types::DST_COMPLEX;
    use ferry_abi::{GuestAddr, GuestHandle, GuestSlice, ModuleId};
    use ferry_runtime::Bridge;

    fn setup() -> (Arc<Bridge>, Arc<ReferenceUser>, UserApiStubs<Arc<Bridge>>) {
        let native = Arc::new(ReferenceUser::new());
        let bridge =
            Arc::new(Bridge::windowed_with(64 * 1024, [register(Arc::clone(&native))]).unwrap());
        let stubs = UserApiStubs::new(Arc::clone(&bridge));
        (bridge, native, stubs)
    }

    #[test]
    fn test_descriptors() {
        assert_eq!(UserApiOp::MODULE, ModuleId(USER_MODULE));
        assert_eq!(UserApiOp::COUNT, 23);
        let draw_state = UserApiOp::DrawState.descriptor();
        assert_eq!(draw_state.fields, 10);
        assert_eq!(UserApiOp::GetWindowText.descriptor().fields, 3);
        assert_eq!(UserApiOp::MeasureTextRuns.name(), "measure_text_runs");
        assert_eq!(UserApiOp::LineStarts.descriptor().fields, 3);
    }

    #[test]
    fn test_set_and_offset_rect() {
        let (bridge, _native, stubs) = setup();
        let memory = bridge.memory();
        let rect = memory.alloc_value(&Rect::new(9, 9, 9, 9)).unwrap();

        assert_eq!(stubs.set_rect(rect, 1, 2, 3, 4), Bool::TRUE);
        assert_eq!(memory.read::<Rect>(rect).unwrap(), Rect::new(1, 2, 3, 4));
        assert_eq!(stubs.offset_rect(rect, 10, -1), Bool::TRUE);
        assert_eq!(memory.read::<Rect>(rect).unwrap(), Rect::new(11, 1, 13, 3));
        assert_eq!(stubs.inflate_rect(rect, 1, 1), Bool::TRUE);
        assert_eq!(memory.read::<Rect>(rect).unwrap(), Rect::new(10, 0, 14, 4));
        assert_eq!(stubs.set_rect_empty(rect), Bool::TRUE);
        assert_eq!(stubs.is_rect_empty(rect), Bool::TRUE);

        assert_eq!(stubs.set_rect(GuestAddr::NULL, 1, 2, 3, 4), Bool::FALSE);
        assert_eq!(stubs.offset_rect(GuestAddr::NULL, 1, 1), Bool::FALSE);
    }

    #[test]
    fn test_copy_leaves_dest_alone_without_source() {
        let (bridge, _native, stubs) = setup();
        let memory = bridge.memory();
        let dest = memory.alloc_value(&Rect::new(1, 1, 2, 2)).unwrap();
        let src = memory.alloc_value(&Rect::new(5, 6, 7, 8)).unwrap();

        assert_eq!(stubs.copy_rect(dest, GuestAddr::NULL), Bool::FALSE);
        assert_eq!(memory.read::<Rect>(dest).unwrap(), Rect::new(1, 1, 2, 2));
        assert_eq!(stubs.copy_rect(dest, src), Bool::TRUE);
        assert_eq!(memory.read::<Rect>(dest).unwrap(), Rect::new(5, 6, 7, 8));
        assert_eq!(stubs.equal_rect(dest, src), Bool::TRUE);
    }

    #[test]
    fn test_rect_set_operations() {
        let (bridge, _native, stubs) = setup();
        let memory = bridge.memory();
        let a = memory.alloc_value(&Rect::new(0, 0, 10, 10)).unwrap();
        let b = memory.alloc_value(&Rect::new(5, 0, 20, 10)).unwrap();
        let dest = memory.alloc_value(&Rect::default()).unwrap();

        assert_eq!(stubs.intersect_rect(dest, a, b), Bool::TRUE);
        assert_eq!(memory.read::<Rect>(dest).unwrap(), Rect::new(5, 0, 10, 10));
        assert_eq!(stubs.union_rect(dest, a, b), Bool::TRUE);
        assert_eq!(memory.read::<Rect>(dest).unwrap(), Rect::new(0, 0, 20, 10));
        assert_eq!(stubs.subtract_rect(dest, a, b), Bool::TRUE);
        assert_eq!(memory.read::<Rect>(dest).unwrap(), Rect::new(0, 0, 5, 10));
        assert_eq!(stubs.pt_in_rect(a, 9, 9), Bool::TRUE);
        assert_eq!(stubs.pt_in_rect(a, 10, 9), Bool::FALSE);
    }

    #[test]
    fn test_unmapped_pointer_faults() {
        let (_bridge, native, stubs) = setup();
        let wild = GuestAddr(0x6000_0000);
        assert_eq!(stubs.is_rect_empty(wild), Bool::FALSE);
        assert_eq!(stubs.fill_rect(GuestHandle(1), wild, GuestHandle(2)), 0);
        assert!(native.draws().is_empty());
    }

    #[test]
    fn test_drawing_reaches_native() {
        let (bridge, native, stubs) = setup();
        let memory = bridge.memory();
        let rect = memory.alloc_value(&Rect::new(0, 0, 8, 8)).unwrap();
        assert_eq!(stubs.fill_rect(GuestHandle(0x40), rect, GuestHandle(0x44)), 1);
        assert_eq!(stubs.draw_focus_rect(GuestHandle(0x40), rect), Bool::TRUE);
        let points = memory
            .alloc_slice(&[Point::new(0, 0), Point::new(4, 4), Point::new(8, 0)])
            .unwrap();
        assert_eq!(stubs.polyline(GuestHandle(0x40), GuestSlice::new(points, 3)), Bool::TRUE);
        assert_eq!(stubs.polyline(GuestHandle(0x40), GuestSlice::new(points, 1)), Bool::FALSE);

        let draws = native.draws();
        assert_eq!(draws.len(), 3);
        assert_eq!(
            draws[0],
            crate::native::DrawOp::Fill {
                dc: HostHandle(0x40),
                rect: Rect::new(0, 0, 8, 8),
                brush: HostHandle(0x44),
            }
        );
    }

    #[test]
    fn test_characters() {
        let (_bridge, _native, stubs) = setup();
        assert_eq!(stubs.to_upper('q' as u32), 'Q' as u32);
        assert_eq!(stubs.is_alpha('7' as u32), Bool::FALSE);
    }

    #[test]
    fn test_draw_state_null_callback() {
        let (bridge, _native, stubs) = setup();
        let before = trampoline_calls();
        let ok = stubs.draw_state(
            GuestHandle(1),
            GuestHandle(0),
            GuestAddr::NULL,
            0,
            0,
            0,
            0,
            8,
            8,
            DST_COMPLEX,
        );
        assert_eq!(ok, Bool::FALSE);
        assert_eq!(trampoline_calls(), before);
        assert_eq!(bridge.guest().invocations(), 0);
    }

    #[test]
    fn test_draw_state_reaches_guest() {
        let (bridge, _native, stubs) = setup();
        let entry = bridge.guest().define(|frame| {
            // dc, ldata, wdata, cx, cy
            u64::from(frame.arg(1) == 0x55 && frame.arg(3) as i32 == -4)
        });
        let before = trampoline_calls();
        let ok = stubs.draw_state(
            GuestHandle(1),
            GuestHandle(0),
            entry,
            0x55,
            0,
            0,
            0,
            -4,
            8,
            DST_COMPLEX,
        );
        assert_eq!(ok, Bool::TRUE);
        assert_eq!(trampoline_calls(), before + 1);
        assert!(DRAW_STATE_SLOT.current().is_none());
    }

    #[test]
    fn test_measure_text_rejects_text_past_the_arena() {
        let (bridge, _native, stubs) = setup();
        let memory = bridge.memory();
        let bits = bridge.context().bits();
        let run = crate::types::TextRunGuest {
            text: memory.alloc_wide("x").unwrap(),
            len: 0x4000_0000,
            bounds: Rect::new(1, 2, 3, 4),
            format: 0,
        };
        let bytes = ferry_abi::thunk::encode_guest::<TextRun>(&run, bits).unwrap();
        let addr = memory.alloc_bytes(&bytes, 8).unwrap();

        assert_eq!(stubs.measure_text(GuestHandle(1), addr), Bool::FALSE);
        let after = memory.read_bytes(addr, bytes.len()).unwrap();
        assert_eq!(after, bytes);
    }

    #[test]
    fn test_trampoline_without_registration() {
        assert_eq!(draw_state_trampoline(0, 0, 0, 0, 0), 0);
    }
}
