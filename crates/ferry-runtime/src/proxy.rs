//! Guest-side proxies for polymorphic host objects.
//!
//! A host object reaches the guest as a raw handle plus the interface id the
//! host granted. The proxy layer turns that into a [`Proxy`]: a view whose
//! capability table matches the granted role and whose calls forward through
//! guest stubs with the handle as the first field.
//!
//! All roles of one object share a single [`ProxyAnchor`]. The anchor holds
//! one view per role at a fixed offset, so the anchor is recovered from any
//! view with constant pointer arithmetic. Only the anchor is reference
//! counted; its count mirrors the add-ref/release calls forwarded to the host,
//! and the anchor is freed when the mirror reaches zero.

use crate::object::ObjectApiStubs;
use ferry_abi::{GuestArena, HResult, Iid, NewObject, ObjectHandle, SyscallTrap};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::fmt;
use std::mem::{offset_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Most roles one object family can expose.
pub const MAX_ROLES: usize = 4;

/// Static capability table of one role.
pub struct RoleTable {
    pub iid: Iid,
    pub name: &'static str,
    /// The role's method table, usually a struct of function pointers.
    pub methods: &'static (dyn Any + Send + Sync),
}

impl fmt::Debug for RoleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleTable")
            .field("iid", &self.iid)
            .field("name", &self.name)
            .finish()
    }
}

/// All roles an object family may be viewed through.
#[derive(Debug)]
pub struct InterfaceFamily {
    pub name: &'static str,
    pub roles: &'static [RoleTable],
}

impl InterfaceFamily {
    fn slot_of(&self, iid: Iid) -> Option<usize> {
        self.roles.iter().position(|role| role.iid == iid)
    }
}

/// One role's view inside an anchor. Slots past the family's roles stay
/// empty and are never handed out.
#[repr(C)]
pub struct ProxyView {
    table: Option<&'static RoleTable>,
    slot: usize,
}

/// Shared state of one host object on the guest side.
#[repr(C)]
pub struct ProxyAnchor {
    views: [ProxyView; MAX_ROLES],
    refs: AtomicU32,
    handle: ObjectHandle,
    family: &'static InterfaceFamily,
    shared: Arc<ProxyShared>,
}

const VIEWS_OFFSET: usize = offset_of!(ProxyAnchor, views);

impl ProxyAnchor {
    fn allocate(
        handle: ObjectHandle,
        family: &'static InterfaceFamily,
        shared: &Arc<ProxyShared>,
    ) -> NonNull<ProxyAnchor> {
        let anchor = Box::new(ProxyAnchor {
            views: std::array::from_fn(|slot| ProxyView {
                table: family.roles.get(slot),
                slot,
            }),
            refs: AtomicU32::new(1),
            handle,
            family,
            shared: Arc::clone(shared),
        });
        NonNull::from(Box::leak(anchor))
    }

    /// Pointer to one view, carrying the provenance of the whole anchor so
    /// [`from_view`](Self::from_view) may step back out of it.
    ///
    /// # Safety
    /// `anchor` must be live and `slot` below [`MAX_ROLES`].
    unsafe fn view(anchor: NonNull<ProxyAnchor>, slot: usize) -> NonNull<ProxyView> {
        NonNull::new_unchecked(ptr::addr_of_mut!((*anchor.as_ptr()).views[slot]))
    }

    /// Recover the anchor that contains `view`.
    ///
    /// # Safety
    /// `view` must come from [`view`](Self::view) on a live anchor.
    unsafe fn from_view(view: NonNull<ProxyView>) -> NonNull<ProxyAnchor> {
        let slot = view.as_ref().slot;
        let offset = VIEWS_OFFSET + slot * size_of::<ProxyView>();
        NonNull::new_unchecked(view.as_ptr().cast::<u8>().sub(offset).cast::<ProxyAnchor>())
    }

    /// Take a reference unless the anchor is already being retired.
    fn acquire(&self) -> bool {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .is_ok()
    }
}

struct AnchorPtr(NonNull<ProxyAnchor>);

// SAFETY: anchors are only mutated through atomics.
unsafe impl Send for AnchorPtr {}

struct ProxyShared {
    trap: Arc<dyn SyscallTrap>,
    objects: ObjectApiStubs<Arc<dyn SyscallTrap>>,
    memory: Arc<GuestArena>,
    /// host handle -> anchor; identity is decided here
    anchors: Mutex<FxHashMap<u64, AnchorPtr>>,
}

/// Guest-side identity map of proxied host objects.
#[derive(Clone)]
pub struct ProxyTable {
    shared: Arc<ProxyShared>,
}

impl ProxyTable {
    /// Proxies that trap through `trap` and build call arguments in `memory`.
    pub fn new(trap: Arc<dyn SyscallTrap>, memory: Arc<GuestArena>) -> Self {
        Self {
            shared: Arc::new(ProxyShared {
                objects: ObjectApiStubs::new(Arc::clone(&trap)),
                trap,
                memory,
                anchors: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Wrap an object the host just handed out.
    ///
    /// The host already counted one reference for `object`; the proxy owns
    /// it. A failed status is passed through unchanged.
    pub fn attach(
        &self,
        object: NewObject,
        family: &'static InterfaceFamily,
    ) -> Result<Proxy, HResult> {
        attach(&self.shared, object, family)
    }

    /// Objects with at least one live proxy.
    pub fn live(&self) -> usize {
        self.shared.anchors.lock().len()
    }
}

impl fmt::Debug for ProxyTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyTable")
            .field("live", &self.live())
            .finish()
    }
}

fn attach(
    shared: &Arc<ProxyShared>,
    object: NewObject,
    family: &'static InterfaceFamily,
) -> Result<Proxy, HResult> {
    if object.status.failed() {
        return Err(object.status);
    }
    assert!(
        !family.roles.is_empty() && family.roles.len() <= MAX_ROLES,
        "family {} has {} roles, expected 1 to {}",
        family.name,
        family.roles.len(),
        MAX_ROLES
    );

    let mut anchors = shared.anchors.lock();
    // SAFETY: anchors in the map are live; retiring removes them under this
    // lock before freeing.
    let existing = anchors
        .get(&object.handle.0)
        .map(|ptr| ptr.0)
        .filter(|ptr| unsafe { ptr.as_ref() }.acquire());
    let anchor = match existing {
        Some(anchor) => anchor,
        None => {
            let anchor = ProxyAnchor::allocate(object.handle, family, shared);
            anchors.insert(object.handle.0, AnchorPtr(anchor));
            anchor
        }
    };
    drop(anchors);

    // SAFETY: we hold a reference on the anchor.
    let anchor_ref = unsafe { anchor.as_ref() };
    let Some(slot) = anchor_ref.family.slot_of(object.iid) else {
        log::warn!(
            "host granted {:?} which family {} does not know",
            object.iid,
            anchor_ref.family.name
        );
        // hand the reference straight back
        // SAFETY: the family has at least one role.
        drop(Proxy {
            view: unsafe { ProxyAnchor::view(anchor, 0) },
        });
        return Err(HResult::E_NOINTERFACE);
    };
    // SAFETY: `slot_of` only returns slots of known roles.
    Ok(Proxy {
        view: unsafe { ProxyAnchor::view(anchor, slot) },
    })
}

/// Free an anchor whose mirror count reached zero.
///
/// # Safety
/// The caller must have moved the count from one to zero.
unsafe fn retire(anchor: NonNull<ProxyAnchor>) {
    let (handle, shared) = {
        let anchor = anchor.as_ref();
        (anchor.handle, Arc::clone(&anchor.shared))
    };
    {
        let mut anchors = shared.anchors.lock();
        if anchors.get(&handle.0).map(|ptr| ptr.0) == Some(anchor) {
            anchors.remove(&handle.0);
        }
    }
    drop(Box::from_raw(anchor.as_ptr()));
    log::trace!("proxy anchor for object {} freed", handle.0);
}

/// A guest reference to one role of a host object.
///
/// Cloning forwards an add-ref to the host, dropping forwards a release.
pub struct Proxy {
    view: NonNull<ProxyView>,
}

// SAFETY: everything reachable from a view is immutable, atomic or behind
// the shared mutex.
unsafe impl Send for Proxy {}
unsafe impl Sync for Proxy {}

impl Proxy {
    fn anchor(&self) -> &ProxyAnchor {
        // SAFETY: a live proxy holds a reference on its anchor.
        unsafe { ProxyAnchor::from_view(self.view).as_ref() }
    }

    fn role(&self) -> &'static RoleTable {
        // SAFETY: the view outlives `self`.
        let view = unsafe { self.view.as_ref() };
        match view.table {
            Some(table) => table,
            None => unreachable!("proxy over empty role slot {}", view.slot),
        }
    }

    /// Host handle; the identity of the object.
    pub fn handle(&self) -> ObjectHandle {
        self.anchor().handle
    }

    pub fn iid(&self) -> Iid {
        self.role().iid
    }

    pub fn role_name(&self) -> &'static str {
        self.role().name
    }

    pub fn family(&self) -> &'static InterfaceFamily {
        self.anchor().family
    }

    /// The role's capability table, if it is a `V`.
    pub fn methods<V: Any>(&self) -> Option<&'static V> {
        self.role().methods.downcast_ref::<V>()
    }

    /// Ask the host for another role of the same object.
    pub fn query(&self, iid: Iid) -> Result<Proxy, HResult> {
        let anchor = self.anchor();
        let object = anchor.shared.objects.query_interface(anchor.handle, iid);
        attach(&anchor.shared, object, anchor.family)
    }

    /// Same host object, whatever the role.
    pub fn same_object(&self, other: &Proxy) -> bool {
        self.handle() == other.handle()
    }

    /// Guest-side reference count of the whole object.
    pub fn refs(&self) -> u32 {
        self.anchor().refs.load(Ordering::Acquire)
    }

    pub fn trap(&self) -> &Arc<dyn SyscallTrap> {
        &self.anchor().shared.trap
    }

    /// Guest memory for building call arguments.
    pub fn memory(&self) -> &Arc<GuestArena> {
        &self.anchor().shared.memory
    }

    /// Address of this view, stable for the proxy's lifetime.
    pub fn view_addr(&self) -> usize {
        self.view.as_ptr() as usize
    }
}

impl Clone for Proxy {
    fn clone(&self) -> Self {
        let anchor = self.anchor();
        anchor.refs.fetch_add(1, Ordering::AcqRel);
        anchor.shared.objects.add_ref(anchor.handle);
        Self { view: self.view }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        let anchor = self.anchor();
        let handle = anchor.handle;
        let host_left = anchor.shared.objects.release(handle);
        if anchor.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            if host_left != 0 {
                log::warn!(
                    "object {} still has {} host references after its last proxy",
                    handle.0,
                    host_left
                );
            }
            // SAFETY: this drop moved the mirror count to zero.
            unsafe { retire(ProxyAnchor::from_view(self.view)) };
        }
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.same_object(other)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("handle", &self.handle())
            .field("role", &self.role_name())
            .field("refs", &self.refs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::object::ObjectApi;

    struct Methods {
        id: u32,
    }

    static FIRST: Methods = Methods { id: 1 };
    static SECOND: Methods = Methods { id: 2 };

    const FIRST_IID: Iid = Iid(0x100);
    const SECOND_IID: Iid = Iid(0x200);

    static FAMILY: InterfaceFamily = InterfaceFamily {
        name: "probe",
        roles: &[
            RoleTable {
                iid: FIRST_IID,
                name: "First",
                methods: &FIRST,
            },
            RoleTable {
                iid: SECOND_IID,
                name: "Second",
                methods: &SECOND,
            },
        ],
    };

    fn setup() -> (Arc<Bridge>, ProxyTable) {
        let bridge = Arc::new(Bridge::windowed(64 * 1024).unwrap());
        let proxies = ProxyTable::new(bridge.clone(), Arc::clone(bridge.memory()));
        (bridge, proxies)
    }

    fn create(bridge: &Bridge) -> NewObject {
        let handle = bridge.objects().insert(7u32, &[FIRST_IID, SECOND_IID]);
        NewObject::granted(handle, FIRST_IID)
    }

    #[test]
    fn test_view_recovers_anchor() {
        let (bridge, proxies) = setup();
        let proxy = proxies.attach(create(&bridge), &FAMILY).unwrap();
        let second = proxy.query(SECOND_IID).unwrap();
        assert_eq!(
            second.view_addr() - proxy.view_addr(),
            size_of::<ProxyView>()
        );
        assert_eq!(proxy.methods::<Methods>().unwrap().id, 1);
        assert_eq!(second.methods::<Methods>().unwrap().id, 2);
        assert_eq!(second.role_name(), "Second");
        assert!(proxy.same_object(&second));
        assert_eq!(proxy.refs(), 2);
        assert_eq!(proxies.live(), 1);
    }

    #[test]
    fn test_every_slot_recovers_the_same_anchor() {
        let (bridge, proxies) = setup();
        let handle = bridge.objects().insert(7u32, &[FIRST_IID, SECOND_IID]);
        let second = proxies
            .attach(NewObject::granted(handle, SECOND_IID), &FAMILY)
            .unwrap();
        assert_eq!(second.iid(), SECOND_IID);
        assert_eq!(second.handle(), handle);

        let first = second.query(FIRST_IID).unwrap();
        assert_eq!(first.role_name(), "First");
        assert_eq!(first.handle(), handle);
        assert_eq!(first.family().name, "probe");
        // both views count into one anchor
        assert_eq!((first.refs(), second.refs()), (2, 2));
        drop(second);
        assert_eq!(first.refs(), 1);
        assert_eq!(proxies.live(), 1);
    }

    #[test]
    #[should_panic(expected = "expected 1 to 4")]
    fn test_empty_family_is_rejected() {
        static EMPTY: InterfaceFamily = InterfaceFamily {
            name: "empty",
            roles: &[],
        };
        let (bridge, proxies) = setup();
        let _ = proxies.attach(create(&bridge), &EMPTY);
    }

    #[test]
    fn test_reference_counts_stay_in_step() {
        let (bridge, proxies) = setup();
        let object = create(&bridge);
        let handle = object.handle;
        let proxy = proxies.attach(object, &FAMILY).unwrap();

        let clones: Vec<Proxy> = (0..3).map(|_| proxy.clone()).collect();
        assert_eq!(bridge.objects().refs(handle), Some(4));
        assert_eq!(proxy.refs(), 4);

        drop(clones);
        assert_eq!(bridge.objects().refs(handle), Some(1));
        drop(proxy);
        assert!(!bridge.objects().contains(handle));
        assert_eq!(bridge.objects().destroyed(), 1);
        assert_eq!(proxies.live(), 0);
    }

    #[test]
    fn test_failed_status_passes_through() {
        let (_bridge, proxies) = setup();
        let err = proxies
            .attach(NewObject::failed(HResult::E_OUTOFMEMORY), &FAMILY)
            .unwrap_err();
        assert_eq!(err, HResult::E_OUTOFMEMORY);
    }

    #[test]
    fn test_unsupported_role() {
        let (bridge, proxies) = setup();
        let proxy = proxies.attach(create(&bridge), &FAMILY).unwrap();
        assert_eq!(proxy.query(Iid(0x999)).unwrap_err(), HResult::E_NOINTERFACE);
        assert_eq!(proxy.refs(), 1);
    }

    #[test]
    fn test_anchor_is_rebuilt_after_retire() {
        let (bridge, proxies) = setup();
        let object = create(&bridge);
        let handle = object.handle;
        bridge.objects().add_ref(handle);
        drop(proxies.attach(object, &FAMILY).unwrap());
        assert_eq!(proxies.live(), 0);

        // the host still holds one reference; a fresh grant gets a new anchor
        let again = proxies
            .attach(NewObject::granted(handle, SECOND_IID), &FAMILY)
            .unwrap();
        assert_eq!(again.handle(), handle);
        assert_eq!(again.refs(), 1);
        drop(again);
        assert!(!bridge.objects().contains(handle));
    }

    #[test]
    fn test_concurrent_clone_and_drop() {
        let (bridge, proxies) = setup();
        let object = create(&bridge);
        let handle = object.handle;
        let proxy = proxies.attach(object, &FAMILY).unwrap();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let proxy = &proxy;
                scope.spawn(move || {
                    for _ in 0..100 {
                        let copy = proxy.clone();
                        let other = copy.query(SECOND_IID).unwrap();
                        assert!(other.same_object(&copy));
                    }
                });
            }
        });
        assert_eq!(proxy.refs(), 1);
        assert_eq!(bridge.objects().refs(handle), Some(1));
        drop(proxy);
        assert_eq!(bridge.objects().destroyed(), 1);
    }
}
