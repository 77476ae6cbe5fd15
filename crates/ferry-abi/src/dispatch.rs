//! Host-side routing of call records.
//!
//! Each wrapped module builds one [`DispatchTable`] at start-up: a dense
//! vector indexed by local operation number. The [`ModuleRegistry`] is a
//! second dense vector indexed by module number. Both are immutable once the
//! bridge is running, so dispatch takes no locks.

use crate::arena::GuestArena;
use crate::callback::GuestExecutor;
use crate::error::ProtocolError;
use crate::record::{CallRecord, ModuleId, OpTag};
use crate::shape::{Direction, ShapeKind};
use crate::translate::{AddressTranslator, Bitness};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Everything a handler needs from the environment: the translator selected
/// at start-up, the execute primitive for callbacks and guest-reachable
/// scratch memory.
#[derive(Clone)]
pub struct CallContext {
    translator: Arc<dyn AddressTranslator>,
    executor: Arc<dyn GuestExecutor>,
    scratch: Arc<GuestArena>,
}

impl CallContext {
    pub fn new(
        translator: Arc<dyn AddressTranslator>,
        executor: Arc<dyn GuestExecutor>,
        scratch: Arc<GuestArena>,
    ) -> Self {
        Self {
            translator,
            executor,
            scratch,
        }
    }

    pub fn translator(&self) -> &Arc<dyn AddressTranslator> {
        &self.translator
    }

    pub fn executor(&self) -> &Arc<dyn GuestExecutor> {
        &self.executor
    }

    pub fn scratch(&self) -> &Arc<GuestArena> {
        &self.scratch
    }

    pub fn bits(&self) -> Bitness {
        self.translator.bitness()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("translator", &self.translator.name())
            .field("bits", &self.bits())
            .field("scratch", &self.scratch)
            .finish()
    }
}

/// Host handler for one operation.
pub type Handler = Arc<dyn Fn(&CallContext, &mut CallRecord) + Send + Sync>;

/// Static description of one parameter.
#[derive(Debug, Serialize)]
pub struct ParamInfo {
    pub name: &'static str,
    pub shape: &'static str,
    pub kind: ShapeKind,
    pub direction: Direction,
    /// First payload field.
    pub offset: usize,
    pub fields: usize,
}

/// Static description of one operation, generated by `#[ferry::api]`.
#[derive(Debug, Serialize)]
pub struct OpDescriptor {
    pub module: ModuleId,
    pub local: u32,
    pub name: &'static str,
    pub params: &'static [ParamInfo],
    pub returns: &'static str,
    /// Payload fields including trailing result fields.
    pub fields: usize,
}

impl OpDescriptor {
    pub fn tag(&self) -> OpTag {
        OpTag::new(self.module, self.local)
    }
}

#[derive(Clone)]
struct Entry {
    descriptor: &'static OpDescriptor,
    handler: Handler,
}

/// Dense operation table of one module.
pub struct DispatchTable {
    module: ModuleId,
    name: &'static str,
    entries: Vec<Option<Entry>>,
}

impl DispatchTable {
    /// Table with room for `len` operations.
    pub fn new(module: ModuleId, name: &'static str, len: usize) -> Self {
        Self {
            module,
            name,
            entries: vec![None; len],
        }
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Install the handler for `descriptor`'s operation.
    ///
    /// Panics on a foreign module, an index past the end or a second
    /// registration of the same index.
    pub fn register(&mut self, descriptor: &'static OpDescriptor, handler: Handler) {
        if descriptor.module != self.module {
            ProtocolError::ForeignOperation {
                name: descriptor.name,
                found: descriptor.module,
                expected: self.module,
            }
            .raise();
        }
        let len = self.entries.len();
        let Some(slot) = self.entries.get_mut(descriptor.local as usize) else {
            ProtocolError::OutOfRange {
                name: descriptor.name,
                local: descriptor.local,
                module: self.name,
                len,
            }
            .raise()
        };
        if slot.is_some() {
            ProtocolError::DuplicateOperation {
                name: descriptor.name,
                module: descriptor.module,
            }
            .raise();
        }
        *slot = Some(Entry {
            descriptor,
            handler,
        });
    }

    /// Indices with no handler.
    pub fn missing(&self) -> Vec<u32> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_none())
            .map(|(index, _)| index as u32)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(Option::is_some)
    }

    pub fn descriptor(&self, local: u32) -> Option<&'static OpDescriptor> {
        self.entries
            .get(local as usize)
            .and_then(|entry| entry.as_ref())
            .map(|entry| entry.descriptor)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &'static OpDescriptor> + '_ {
        self.entries.iter().flatten().map(|entry| entry.descriptor)
    }

    /// Run the handler for `record`.
    ///
    /// An unknown operation or a record whose field count disagrees with the
    /// descriptor is a fatal protocol error.
    pub fn call(&self, cx: &CallContext, record: &mut CallRecord) {
        let tag = record.tag();
        let Some(Some(entry)) = self.entries.get(tag.local() as usize) else {
            ProtocolError::UnknownOperation {
                tag,
                module: self.name,
            }
            .raise()
        };
        if record.field_count() != entry.descriptor.fields {
            ProtocolError::FieldCount {
                module: self.name,
                name: entry.descriptor.name,
                actual: record.field_count(),
                expected: entry.descriptor.fields,
            }
            .raise();
        }
        log::trace!("{}.{}", self.name, entry.descriptor.name);
        (entry.handler)(cx, record);
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("len", &self.entries.len())
            .field("missing", &self.missing())
            .finish()
    }
}

/// Module numbers must stay below this.
pub const MAX_MODULES: u32 = 256;

/// All module tables, indexed by module number.
#[derive(Default)]
pub struct ModuleRegistry {
    tables: Vec<Option<DispatchTable>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module table. Panics if the module number is taken or not
    /// below [`MAX_MODULES`].
    pub fn insert(&mut self, table: DispatchTable) {
        if table.module().0 >= MAX_MODULES {
            ProtocolError::ModuleOutOfRange {
                module: table.module(),
                name: table.name(),
                limit: MAX_MODULES,
            }
            .raise();
        }
        let index = table.module().0 as usize;
        if self.tables.len() <= index {
            self.tables.resize_with(index + 1, || None);
        }
        if let Some(existing) = &self.tables[index] {
            ProtocolError::DuplicateModule {
                module: table.module(),
                existing: existing.name(),
                name: table.name(),
            }
            .raise();
        }
        self.tables[index] = Some(table);
    }

    pub fn get(&self, module: ModuleId) -> Option<&DispatchTable> {
        self.tables.get(module.0 as usize).and_then(Option::as_ref)
    }

    pub fn tables(&self) -> impl Iterator<Item = &DispatchTable> {
        self.tables.iter().flatten()
    }

    pub fn is_complete(&self) -> bool {
        self.tables().all(DispatchTable::is_complete)
    }

    /// Route `record` to its module. Unknown modules are fatal.
    pub fn dispatch(&self, cx: &CallContext, record: &mut CallRecord) {
        let module = record.tag().module();
        match self.get(module) {
            Some(table) => table.call(cx, record),
            None => ProtocolError::UnknownModule(module).raise(),
        }
    }
}
