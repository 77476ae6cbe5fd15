//! The in-process bridge: the host end of the syscall trap.
//!
//! A [`Bridge`] owns the module registry, the call context handed to every
//! handler and the host object table. Guest stubs hold it as their
//! [`SyscallTrap`]; trapping dispatches the record synchronously on the
//! calling thread.

use crate::guest::GuestCode;
use crate::object::{ObjectApiOp, ObjectTable};
use ferry_abi::{
    AddressTranslator, Bitness, CallContext, CallRecord, DispatchTable, GuestAddr, GuestArena,
    ModuleRegistry, SyscallTrap, TranslateError, WindowTranslator,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Guest base of arenas created by [`Bridge::windowed`].
pub const DEFAULT_WINDOW_BASE: u64 = 0x1000_0000;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge needs {0}")]
    Missing(&'static str),

    #[error("module {module} is missing handlers for operations {missing:?}")]
    Incomplete {
        module: &'static str,
        missing: Vec<u32>,
    },

    #[error("arena at guest {guest:#x} is not reachable through the {translator} translator")]
    Unreachable {
        guest: u64,
        translator: &'static str,
    },

    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error(transparent)]
    Arena(#[from] ferry_abi::ArenaError),
}

pub struct Bridge {
    registry: ModuleRegistry,
    cx: CallContext,
    objects: Arc<ObjectTable>,
    guest: Arc<GuestCode>,
    calls: AtomicU64,
}

impl Bridge {
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::default()
    }

    /// 32-bit guest over a fresh windowed arena, object module only.
    pub fn windowed(arena_size: usize) -> Result<Self, BridgeError> {
        Self::windowed_with(arena_size, std::iter::empty())
    }

    /// 32-bit guest over a fresh windowed arena with extra modules.
    pub fn windowed_with(
        arena_size: usize,
        modules: impl IntoIterator<Item = DispatchTable>,
    ) -> Result<Self, BridgeError> {
        let mut builder = Self::windowed_builder(arena_size)?;
        for table in modules {
            builder = builder.module(table);
        }
        builder.build()
    }

    /// A builder with the windowed translator and arena already chosen.
    pub fn windowed_builder(arena_size: usize) -> Result<BridgeBuilder, BridgeError> {
        let arena = Arc::new(GuestArena::windowed(arena_size, DEFAULT_WINDOW_BASE)?);
        let translator = WindowTranslator::new(Arc::clone(&arena), Bitness::B32)?;
        Ok(Self::builder().translator(Arc::new(translator)).arena(arena))
    }

    pub fn context(&self) -> &CallContext {
        &self.cx
    }

    pub fn translator(&self) -> &Arc<dyn AddressTranslator> {
        self.cx.translator()
    }

    /// Guest-reachable memory shared by stubs, handlers and guest routines.
    pub fn memory(&self) -> &Arc<GuestArena> {
        self.cx.scratch()
    }

    pub fn objects(&self) -> &Arc<ObjectTable> {
        &self.objects
    }

    pub fn guest(&self) -> &Arc<GuestCode> {
        &self.guest
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Records dispatched so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl SyscallTrap for Bridge {
    fn trap(&self, record: &mut CallRecord) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.registry.dispatch(&self.cx, record);
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("cx", &self.cx)
            .field("modules", &self.registry.tables().count())
            .field("objects", &self.objects.len())
            .field("calls", &self.calls())
            .finish()
    }
}

/// Assembles a [`Bridge`]; the object module is registered automatically.
#[derive(Default)]
pub struct BridgeBuilder {
    translator: Option<Arc<dyn AddressTranslator>>,
    arena: Option<Arc<GuestArena>>,
    objects: Arc<ObjectTable>,
    modules: Vec<DispatchTable>,
}

impl BridgeBuilder {
    pub fn translator(mut self, translator: Arc<dyn AddressTranslator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn arena(mut self, arena: Arc<GuestArena>) -> Self {
        self.arena = Some(arena);
        self
    }

    pub fn module(mut self, table: DispatchTable) -> Self {
        self.modules.push(table);
        self
    }

    /// The object table the bridge will own, for surfaces that hand out
    /// host objects.
    pub fn objects(&self) -> &Arc<ObjectTable> {
        &self.objects
    }

    pub fn build(self) -> Result<Bridge, BridgeError> {
        let translator = self.translator.ok_or(BridgeError::Missing("a translator"))?;
        let arena = self.arena.ok_or(BridgeError::Missing("an arena"))?;

        let guest = GuestAddr(arena.guest_base());
        if translator.to_host_range(guest, arena.size()).ok() != Some(arena.host_base()) {
            return Err(BridgeError::Unreachable {
                guest: guest.raw(),
                translator: translator.name(),
            });
        }

        let mut registry = ModuleRegistry::new();
        registry.insert(ObjectApiOp::dispatch_table(Arc::clone(&self.objects)));
        for table in self.modules {
            registry.insert(table);
        }
        if let Some(table) = registry.tables().find(|table| !table.is_complete()) {
            return Err(BridgeError::Incomplete {
                module: table.name(),
                missing: table.missing(),
            });
        }

        let guest_code = Arc::new(GuestCode::new(Arc::clone(&arena)));
        let cx = CallContext::new(translator, guest_code.clone(), arena);
        log::debug!(
            "bridge ready: {} translator, {} guest, {} modules",
            cx.translator().name(),
            cx.bits(),
            registry.tables().count()
        );
        Ok(Bridge {
            registry,
            cx,
            objects: self.objects,
            guest: guest_code,
            calls: AtomicU64::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectApiStubs;
    use ferry_abi::{Iid, ModuleId, NewObject, ObjectHandle};

    #[test]
    fn test_object_module_is_registered() {
        let bridge = Bridge::windowed(4096).unwrap();
        assert!(bridge.registry().get(ModuleId(0)).is_some());
        assert!(bridge.registry().is_complete());
        assert_eq!(bridge.context().bits(), Bitness::B32);
    }

    #[test]
    fn test_stubs_reach_object_table() {
        let bridge = Arc::new(Bridge::windowed(4096).unwrap());
        let handle = bridge.objects().insert(5u8, &[Iid(1)]);
        let stubs = ObjectApiStubs::new(Arc::clone(&bridge));
        assert_eq!(stubs.add_ref(handle), 2);
        assert_eq!(stubs.query_interface(handle, Iid(1)), NewObject::granted(handle, Iid(1)));
        assert_eq!(stubs.release(handle), 2);
        assert_eq!(stubs.release(handle), 1);
        assert_eq!(stubs.release(handle), 0);
        assert_eq!(stubs.add_ref(ObjectHandle(77)), 0);
        assert_eq!(bridge.calls(), 6);
    }

    #[test]
    fn test_incomplete_module_is_rejected() {
        let err = Bridge::windowed_with(
            4096,
            [DispatchTable::new(ModuleId(5), "partial", 2)],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Incomplete { module: "partial", ref missing } if missing == &vec![0, 1]
        ));
    }

    #[test]
    fn test_missing_parts() {
        assert!(matches!(
            Bridge::builder().build(),
            Err(BridgeError::Missing("a translator"))
        ));
    }

    #[test]
    fn test_unreachable_arena() {
        let arena = Arc::new(GuestArena::windowed(4096, 0x4000_0000).unwrap());
        let other = Arc::new(GuestArena::windowed(4096, 0x5000_0000).unwrap());
        let translator = WindowTranslator::new(other, Bitness::B32).unwrap();
        let err = Bridge::builder()
            .translator(Arc::new(translator))
            .arena(arena)
            .build()
            .unwrap_err();
        assert!(matches!(err, BridgeError::Unreachable { guest: 0x4000_0000, .. }));
    }
}
