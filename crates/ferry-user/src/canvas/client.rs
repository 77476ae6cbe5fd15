//! Guest side of the canvas module.
//!
//! Canvases reach the guest as proxies whose role tables forward each
//! method through the canvas stubs.

use super::{encode_wide, CanvasApiStubs, IID_CANVAS, IID_LEGACY_CANVAS};
use crate::types::{Point, Size};
use ferry_abi::{GuestAddr, GuestArena, HResult, ObjectHandle, Plain, SyscallTrap};
use ferry_runtime::{InterfaceFamily, Proxy, ProxyTable, RoleTable};
use std::fmt;
use std::sync::Arc;

/// Method table of the `Canvas` role.
#[derive(Debug)]
pub struct CanvasMethods {
    pub set_marker: fn(&Proxy, i32, i32) -> HResult,
    pub get_marker: fn(&Proxy) -> Result<Point, HResult>,
    pub get_size: fn(&Proxy) -> Result<Size, HResult>,
    pub add_layer: fn(&Proxy, &str) -> HResult,
    pub enum_layers: fn(&Proxy, GuestAddr, u64) -> HResult,
}

/// Method table of the `LegacyCanvas` role.
#[derive(Debug)]
pub struct LegacyCanvasMethods {
    pub set_marker: fn(&Proxy, i32, i32) -> HResult,
    pub get_marker: fn(&Proxy) -> Result<Point, HResult>,
}

static CANVAS_METHODS: CanvasMethods = CanvasMethods {
    set_marker,
    get_marker,
    get_size,
    add_layer,
    enum_layers,
};

static LEGACY_CANVAS_METHODS: LegacyCanvasMethods = LegacyCanvasMethods {
    set_marker,
    get_marker,
};

pub static CANVAS_FAMILY: InterfaceFamily = InterfaceFamily {
    name: "canvas",
    roles: &[
        RoleTable {
            iid: IID_CANVAS,
            name: "Canvas",
            methods: &CANVAS_METHODS,
        },
        RoleTable {
            iid: IID_LEGACY_CANVAS,
            name: "LegacyCanvas",
            methods: &LEGACY_CANVAS_METHODS,
        },
    ],
};

fn stubs(proxy: &Proxy) -> CanvasApiStubs<&Arc<dyn SyscallTrap>> {
    CanvasApiStubs::new(proxy.trap())
}

/// Run `call` with a scratch out slot and read the value back on success.
fn read_out<T: Plain + Default>(
    proxy: &Proxy,
    call: impl FnOnce(GuestAddr) -> HResult,
) -> Result<T, HResult> {
    let memory = proxy.memory();
    let slot = memory
        .scratch_value(&T::default())
        .map_err(|_| HResult::E_OUTOFMEMORY)?;
    let status = call(slot.addr());
    if status.failed() {
        return Err(status);
    }
    memory.read::<T>(slot.addr()).map_err(|_| HResult::E_FAIL)
}

fn set_marker(proxy: &Proxy, x: i32, y: i32) -> HResult {
    stubs(proxy).set_marker(proxy.handle(), x, y)
}

fn get_marker(proxy: &Proxy) -> Result<Point, HResult> {
    read_out(proxy, |out| stubs(proxy).get_marker(proxy.handle(), out))
}

fn get_size(proxy: &Proxy) -> Result<Size, HResult> {
    read_out(proxy, |out| stubs(proxy).get_size(proxy.handle(), out))
}

fn add_layer(proxy: &Proxy, name: &str) -> HResult {
    let name = match proxy.memory().scratch_bytes(&encode_wide(name), 2) {
        Ok(name) => name,
        Err(_) => return HResult::E_OUTOFMEMORY,
    };
    stubs(proxy).add_layer(proxy.handle(), name.addr())
}

fn enum_layers(proxy: &Proxy, callback: GuestAddr, context: u64) -> HResult {
    stubs(proxy).enum_layers(proxy.handle(), callback, context)
}

/// A canvas viewed through its current interface.
#[derive(Clone)]
pub struct Canvas {
    proxy: Proxy,
    methods: &'static CanvasMethods,
}

impl Canvas {
    /// Wrap `proxy` if it is a `Canvas` view; hands it back otherwise.
    pub fn from_proxy(proxy: Proxy) -> Result<Self, Proxy> {
        match proxy.methods::<CanvasMethods>() {
            Some(methods) => Ok(Self { proxy, methods }),
            None => Err(proxy),
        }
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn handle(&self) -> ObjectHandle {
        self.proxy.handle()
    }

    pub fn set_marker(&self, x: i32, y: i32) -> HResult {
        (self.methods.set_marker)(&self.proxy, x, y)
    }

    pub fn marker(&self) -> Result<Point, HResult> {
        (self.methods.get_marker)(&self.proxy)
    }

    pub fn size(&self) -> Result<Size, HResult> {
        (self.methods.get_size)(&self.proxy)
    }

    pub fn add_layer(&self, name: &str) -> HResult {
        (self.methods.add_layer)(&self.proxy, name)
    }

    /// Calls the guest routine at `callback` once per layer.
    pub fn enum_layers(&self, callback: GuestAddr, context: u64) -> HResult {
        (self.methods.enum_layers)(&self.proxy, callback, context)
    }

    /// The same canvas through `LegacyCanvas`.
    pub fn query_legacy(&self) -> Result<LegacyCanvas, HResult> {
        let proxy = self.proxy.query(IID_LEGACY_CANVAS)?;
        LegacyCanvas::from_proxy(proxy).map_err(|_| HResult::E_NOINTERFACE)
    }
}

impl PartialEq for Canvas {
    fn eq(&self, other: &Self) -> bool {
        self.proxy == other.proxy
    }
}

impl fmt::Debug for Canvas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Canvas").field(&self.proxy).finish()
    }
}

/// A canvas viewed through the older interface.
#[derive(Clone)]
pub struct LegacyCanvas {
    proxy: Proxy,
    methods: &'static LegacyCanvasMethods,
}

impl LegacyCanvas {
    pub fn from_proxy(proxy: Proxy) -> Result<Self, Proxy> {
        match proxy.methods::<LegacyCanvasMethods>() {
            Some(methods) => Ok(Self { proxy, methods }),
            None => Err(proxy),
        }
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn handle(&self) -> ObjectHandle {
        self.proxy.handle()
    }

    pub fn set_marker(&self, x: i32, y: i32) -> HResult {
        (self.methods.set_marker)(&self.proxy, x, y)
    }

    pub fn marker(&self) -> Result<Point, HResult> {
        (self.methods.get_marker)(&self.proxy)
    }

    pub fn upgrade(&self) -> Result<Canvas, HResult> {
        let proxy = self.proxy.query(IID_CANVAS)?;
        Canvas::from_proxy(proxy).map_err(|_| HResult::E_NOINTERFACE)
    }
}

impl PartialEq for LegacyCanvas {
    fn eq(&self, other: &Self) -> bool {
        self.proxy == other.proxy
    }
}

impl fmt::Debug for LegacyCanvas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LegacyCanvas").field(&self.proxy).finish()
    }
}

/// Guest entry point for creating canvases.
pub struct CanvasClient {
    stubs: CanvasApiStubs<Arc<dyn SyscallTrap>>,
    proxies: ProxyTable,
}

impl CanvasClient {
    pub fn new(trap: Arc<dyn SyscallTrap>, memory: Arc<GuestArena>) -> Self {
        Self {
            stubs: CanvasApiStubs::new(Arc::clone(&trap)),
            proxies: ProxyTable::new(trap, memory),
        }
    }

    pub fn create(&self, width: u32, height: u32) -> Result<Canvas, HResult> {
        let object = self.stubs.create_canvas(width, height, IID_CANVAS);
        let proxy = self.proxies.attach(object, &CANVAS_FAMILY)?;
        Canvas::from_proxy(proxy).map_err(|_| HResult::E_NOINTERFACE)
    }

    pub fn create_legacy(&self, width: u32, height: u32) -> Result<LegacyCanvas, HResult> {
        let object = self.stubs.create_canvas(width, height, IID_LEGACY_CANVAS);
        let proxy = self.proxies.attach(object, &CANVAS_FAMILY)?;
        LegacyCanvas::from_proxy(proxy).map_err(|_| HResult::E_NOINTERFACE)
    }

    pub fn proxies(&self) -> &ProxyTable {
        &self.proxies
    }
}
