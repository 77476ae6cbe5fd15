//! Host object table and the built-in object module.
//!
//! Every polymorphic host object handed to the guest lives here under a
//! numeric handle. The table owns the object's lifetime: the reference
//! count moves only through the `object` module's `add_ref` / `release`
//! operations, and the object is dropped when the count reaches zero.

use dashmap::DashMap;
use ferry_abi::{api, HResult, Iid, NewObject, ObjectHandle};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Module number of the built-in object module.
pub const OBJECT_MODULE: u32 = 0;

/// Reference counting and interface negotiation shared by every object
/// family.
#[api(module = 0, name = "object")]
pub trait ObjectApi: Send + Sync {
    /// Add a reference; returns the new count, 0 for an unknown handle.
    fn add_ref(&self, object: ObjectHandle) -> u32;

    /// Drop a reference; returns the remaining count.
    fn release(&self, object: ObjectHandle) -> u32;

    /// Grant another role of the same object. Adds a reference on success.
    fn query_interface(&self, object: ObjectHandle, iid: Iid) -> NewObject;
}

struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    interfaces: &'static [Iid],
    refs: u32,
}

/// Thread-safe table mapping handles to host objects.
///
/// Handles are auto-incrementing and never reused within one table.
pub struct ObjectTable {
    map: DashMap<u64, Entry>,
    next_id: AtomicU64,
    destroyed: AtomicU64,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
            next_id: AtomicU64::new(1),
            destroyed: AtomicU64::new(0),
        }
    }

    /// Insert an object supporting `interfaces`, holding one reference.
    pub fn insert<T>(&self, value: T, interfaces: &'static [Iid]) -> ObjectHandle
    where
        T: Any + Send + Sync,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.map.insert(
            id,
            Entry {
                value: Arc::new(value),
                interfaces,
                refs: 1,
            },
        );
        log::trace!("object {} created", id);
        ObjectHandle(id)
    }

    /// The object behind `handle`, if it is live and of type `T`.
    pub fn get<T>(&self, handle: ObjectHandle) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = Arc::clone(&self.map.get(&handle.0)?.value);
        value.downcast::<T>().ok()
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.map.contains_key(&handle.0)
    }

    pub fn refs(&self, handle: ObjectHandle) -> Option<u32> {
        self.map.get(&handle.0).map(|entry| entry.refs)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Objects destroyed by a final release so far.
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    fn retain(&self, handle: ObjectHandle) -> Option<u32> {
        let mut entry = self.map.get_mut(&handle.0)?;
        entry.refs += 1;
        Some(entry.refs)
    }

    fn drop_ref(&self, handle: ObjectHandle) -> Option<u32> {
        let left = {
            let mut entry = self.map.get_mut(&handle.0)?;
            // a racing final release may already have reached zero
            entry.refs = entry.refs.saturating_sub(1);
            entry.refs
        };
        if left == 0 && self.map.remove_if(&handle.0, |_, entry| entry.refs == 0).is_some() {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            log::trace!("object {} destroyed", handle.0);
        }
        Some(left)
    }

    fn query(&self, handle: ObjectHandle, iid: Iid) -> NewObject {
        let Some(mut entry) = self.map.get_mut(&handle.0) else {
            return NewObject::failed(HResult::E_HANDLE);
        };
        if !entry.interfaces.contains(&iid) {
            return NewObject::failed(HResult::E_NOINTERFACE);
        }
        entry.refs += 1;
        NewObject::granted(handle, iid)
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectApi for ObjectTable {
    fn add_ref(&self, object: ObjectHandle) -> u32 {
        self.retain(object).unwrap_or_else(|| {
            log::warn!("add_ref on unknown object {}", object.0);
            0
        })
    }

    fn release(&self, object: ObjectHandle) -> u32 {
        self.drop_ref(object).unwrap_or_else(|| {
            log::warn!("release on unknown object {}", object.0);
            0
        })
    }

    fn query_interface(&self, object: ObjectHandle, iid: Iid) -> NewObject {
        self.query(object, iid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Iid = Iid(0xa);
    const B: Iid = Iid(0xb);

    struct Probe(Arc<AtomicU64>);

    impl Drop for Probe {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_handles_start_at_one_and_are_not_reused() {
        let table = ObjectTable::new();
        let first = table.insert(1u32, &[A]);
        assert_eq!(first, ObjectHandle(1));
        assert_eq!(table.release(first), 0);
        let second = table.insert(2u32, &[A]);
        assert_eq!(second, ObjectHandle(2));
    }

    #[test]
    fn test_get_downcasts() {
        let table = ObjectTable::new();
        let handle = table.insert(String::from("canvas"), &[A]);
        assert_eq!(table.get::<String>(handle).as_deref().map(String::as_str), Some("canvas"));
        assert!(table.get::<u32>(handle).is_none());
        assert!(table.get::<String>(ObjectHandle(99)).is_none());
    }

    #[test]
    fn test_destroyed_exactly_once() {
        let drops = Arc::new(AtomicU64::new(0));
        let table = ObjectTable::new();
        let handle = table.insert(Probe(Arc::clone(&drops)), &[A]);
        for n in 2..=4 {
            assert_eq!(table.add_ref(handle), n);
        }
        for n in (0..4).rev() {
            assert_eq!(table.release(handle), n);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(table.destroyed(), 1);
        assert!(table.is_empty());
        // a stray release is reported, not counted
        assert_eq!(table.release(handle), 0);
        assert_eq!(table.destroyed(), 1);
    }

    #[test]
    fn test_query_interface() {
        let table = ObjectTable::new();
        let handle = table.insert(0u8, &[A, B]);
        assert_eq!(table.query_interface(handle, B), NewObject::granted(handle, B));
        assert_eq!(table.refs(handle), Some(2));
        assert_eq!(
            table.query_interface(handle, Iid(0xc)).status,
            HResult::E_NOINTERFACE
        );
        assert_eq!(
            table.query_interface(ObjectHandle(42), A).status,
            HResult::E_HANDLE
        );
        assert_eq!(table.refs(handle), Some(2));
    }

    #[test]
    fn test_op_descriptors() {
        assert_eq!(ObjectApiOp::COUNT, 3);
        assert_eq!(ObjectApiOp::MODULE.0, OBJECT_MODULE);
        let query = ObjectApiOp::QueryInterface.descriptor();
        assert_eq!(query.name, "query_interface");
        // handle, iid, then the granted handle and iid
        assert_eq!(query.fields, 4);
        assert_eq!(query.params[1].offset, 1);
    }
}
