//! Host side of the canvas module.

use super::{encode_wide, CanvasApi, CanvasApiOp, CanvasRole, CANVAS_INTERFACES};
use crate::types::{Point, Size};
use ferry_abi::{
    CallbackArg, DispatchTable, GuestCallback, HResult, Iid, NewObject, ObjectHandle, OutRef,
};
use ferry_runtime::ObjectTable;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The host object behind every canvas handle.
pub struct ReferenceCanvas {
    size: Size,
    marker: Mutex<Point>,
    layers: Mutex<Vec<String>>,
    dropped: Arc<AtomicU64>,
}

impl ReferenceCanvas {
    pub fn size(&self) -> Size {
        self.size
    }

    pub fn marker(&self) -> Point {
        *self.marker.lock()
    }

    pub fn layers(&self) -> Vec<String> {
        self.layers.lock().clone()
    }
}

impl Drop for ReferenceCanvas {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Host handler of the canvas module.
pub struct CanvasHost {
    objects: Arc<ObjectTable>,
    dropped: Arc<AtomicU64>,
}

impl CanvasHost {
    pub fn new(objects: Arc<ObjectTable>) -> Self {
        Self {
            objects,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Canvases destroyed so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    fn canvas(&self, handle: ObjectHandle) -> Result<Arc<ReferenceCanvas>, HResult> {
        self.objects.get::<ReferenceCanvas>(handle).ok_or_else(|| {
            log::debug!("object {} is not a canvas", handle.0);
            HResult::E_HANDLE
        })
    }
}

fn status(result: Result<(), HResult>) -> HResult {
    result.err().unwrap_or(HResult::S_OK)
}

impl CanvasApi for CanvasHost {
    fn create_canvas(&self, width: u32, height: u32, role: Iid) -> NewObject {
        if width == 0 || height == 0 || width > i32::MAX as u32 || height > i32::MAX as u32 {
            return NewObject::failed(HResult::E_INVALIDARG);
        }
        if CanvasRole::from_iid(role).is_none() {
            return NewObject::failed(HResult::E_NOINTERFACE);
        }
        let canvas = ReferenceCanvas {
            size: Size {
                cx: width as i32,
                cy: height as i32,
            },
            marker: Mutex::new(Point::default()),
            layers: Mutex::new(Vec::new()),
            dropped: Arc::clone(&self.dropped),
        };
        let handle = self.objects.insert(canvas, CANVAS_INTERFACES);
        log::trace!("canvas {} created ({}x{})", handle.0, width, height);
        NewObject::granted(handle, role)
    }

    fn set_marker(&self, canvas: ObjectHandle, x: i32, y: i32) -> HResult {
        status(self.canvas(canvas).and_then(|canvas| {
            let size = canvas.size;
            if x < 0 || y < 0 || x >= size.cx || y >= size.cy {
                return Err(HResult::E_INVALIDARG);
            }
            *canvas.marker.lock() = Point::new(x, y);
            Ok(())
        }))
    }

    fn get_marker(&self, canvas: ObjectHandle, marker: OutRef<Point>) -> HResult {
        if marker.is_null() {
            return HResult::E_POINTER;
        }
        status(self.canvas(canvas).and_then(|canvas| {
            marker
                .write(&canvas.marker())
                .map_err(|_| HResult::E_POINTER)
        }))
    }

    fn get_size(&self, canvas: ObjectHandle, size: OutRef<Size>) -> HResult {
        if size.is_null() {
            return HResult::E_POINTER;
        }
        status(
            self.canvas(canvas)
                .and_then(|canvas| size.write(&canvas.size).map_err(|_| HResult::E_POINTER)),
        )
    }

    fn add_layer(&self, canvas: ObjectHandle, name: Option<String>) -> HResult {
        let Some(name) = name else {
            return HResult::E_POINTER;
        };
        status(self.canvas(canvas).map(|canvas| canvas.layers.lock().push(name)))
    }

    fn enum_layers(
        &self,
        canvas: ObjectHandle,
        callback: Option<GuestCallback>,
        context: u64,
    ) -> HResult {
        let Some(callback) = callback else {
            return HResult::E_POINTER;
        };
        let canvas = match self.canvas(canvas) {
            Ok(canvas) => canvas,
            Err(status) => return status,
        };
        // the guest may add layers from inside the callback
        let layers = canvas.layers();
        for (index, name) in layers.iter().enumerate() {
            let name = encode_wide(name);
            let args = [
                CallbackArg::Data(&name),
                CallbackArg::Scalar(index as u64),
                CallbackArg::Scalar(context),
            ];
            match callback.invoke(&args) {
                Ok(0) => return HResult::S_FALSE,
                Ok(_) => {}
                Err(err) => {
                    log::warn!("enum_layers callback failed: {}", err);
                    return HResult::E_FAIL;
                }
            }
        }
        HResult::S_OK
    }
}

/// Dispatch table of the canvas module, keeping canvases in `objects`.
///
/// Returns the handler too, for its drop counter.
pub fn register(objects: Arc<ObjectTable>) -> (DispatchTable, Arc<CanvasHost>) {
    let host = Arc::new(CanvasHost::new(objects));
    let table = CanvasApiOp::dispatch_table(Arc::clone(&host));
    log::debug!("canvas module ready: {} operations", table.len());
    (table, host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{IID_CANVAS, IID_LEGACY_CANVAS};
    use ferry_runtime::ObjectApi;

    fn host() -> CanvasHost {
        CanvasHost::new(Arc::new(ObjectTable::new()))
    }

    #[test]
    fn test_create_validates() {
        let host = host();
        assert_eq!(host.create_canvas(0, 5, IID_CANVAS).status, HResult::E_INVALIDARG);
        assert_eq!(host.create_canvas(5, 5, Iid(9)).status, HResult::E_NOINTERFACE);
        let object = host.create_canvas(5, 5, IID_LEGACY_CANVAS);
        assert_eq!(object.status, HResult::S_OK);
        assert_eq!(object.iid, IID_LEGACY_CANVAS);
        assert_eq!(host.objects.refs(object.handle), Some(1));
    }

    #[test]
    fn test_marker_bounds() {
        let host = host();
        let handle = host.create_canvas(10, 10, IID_CANVAS).handle;
        assert_eq!(host.set_marker(handle, 3, 4), HResult::S_OK);
        assert_eq!(host.set_marker(handle, 10, 4), HResult::E_INVALIDARG);
        assert_eq!(host.set_marker(ObjectHandle(99), 1, 1), HResult::E_HANDLE);
        let canvas = host.objects.get::<ReferenceCanvas>(handle).unwrap();
        assert_eq!(canvas.marker(), Point::new(3, 4));
    }

    #[test]
    fn test_layers_and_drop_counter() {
        let host = host();
        let handle = host.create_canvas(10, 10, IID_CANVAS).handle;
        assert_eq!(host.add_layer(handle, Some("base".into())), HResult::S_OK);
        assert_eq!(host.add_layer(handle, None), HResult::E_POINTER);
        assert_eq!(host.enum_layers(handle, None, 0), HResult::E_POINTER);
        assert_eq!(
            host.objects
                .get::<ReferenceCanvas>(handle)
                .unwrap()
                .layers(),
            vec!["base".to_string()]
        );

        assert_eq!(host.objects.release(handle), 0);
        assert_eq!(host.dropped(), 1);
    }
}
