//! The call record: the only thing that crosses the guest/host boundary.
//!
//! A record is a tag, a result word and a flat list of 64-bit fields. Every
//! field is 64 bits wide regardless of guest bitness, so the same bit pattern
//! means the same thing whichever side wrote it.

use serde::Serialize;
use std::fmt;

/// Upper bound on the payload of a single call record.
pub const MAX_CALL_FIELDS: usize = 16;

/// Number identifying a wrapped module (the high half of an operation tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Operation tag: `(module << 32) | local_operation`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpTag(u64);

impl OpTag {
    pub const fn new(module: ModuleId, local: u32) -> Self {
        Self(((module.0 as u64) << 32) | local as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn module(self) -> ModuleId {
        ModuleId((self.0 >> 32) as u32)
    }

    pub const fn local(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for OpTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpTag({}:{})", self.module().0, self.local())
    }
}

/// Fixed-layout record shared by a guest stub and its host handler.
///
/// Allocated on the stub's stack, mutated in place by the handler, gone when
/// the stub returns.
#[repr(C)]
#[derive(Clone, PartialEq, Eq)]
pub struct CallRecord {
    tag: u64,
    result: u64,
    field_count: u32,
    _reserved: u32,
    fields: [u64; MAX_CALL_FIELDS],
}

impl CallRecord {
    /// Create a zeroed record for `tag` carrying `field_count` fields.
    ///
    /// Panics if `field_count` exceeds [`MAX_CALL_FIELDS`]; descriptors are
    /// checked at compile time so this only fires on hand-built records.
    pub fn new(tag: OpTag, field_count: usize) -> Self {
        assert!(
            field_count <= MAX_CALL_FIELDS,
            "call record for {:?} needs {} fields, limit is {}",
            tag,
            field_count,
            MAX_CALL_FIELDS
        );
        Self {
            tag: tag.raw(),
            result: 0,
            field_count: field_count as u32,
            _reserved: 0,
            fields: [0; MAX_CALL_FIELDS],
        }
    }

    pub fn tag(&self) -> OpTag {
        OpTag::from_raw(self.tag)
    }

    pub fn result(&self) -> u64 {
        self.result
    }

    pub fn set_result(&mut self, value: u64) {
        self.result = value;
    }

    pub fn field_count(&self) -> usize {
        self.field_count as usize
    }

    /// The live payload.
    pub fn fields(&self) -> &[u64] {
        &self.fields[..self.field_count()]
    }

    pub fn fields_mut(&mut self) -> &mut [u64] {
        let count = self.field_count();
        &mut self.fields[..count]
    }

    /// `len` payload fields starting at `at`.
    pub fn slots(&self, at: usize, len: usize) -> &[u64] {
        &self.fields()[at..at + len]
    }

    pub fn slots_mut(&mut self, at: usize, len: usize) -> &mut [u64] {
        &mut self.fields_mut()[at..at + len]
    }
}

impl fmt::Debug for CallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRecord")
            .field("tag", &self.tag())
            .field("result", &format_args!("{:#x}", self.result))
            .field("fields", &self.fields())
            .finish()
    }
}
