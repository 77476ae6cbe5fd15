//! Result conventions of the wrapped API and how they travel in a record.

use crate::dispatch::CallContext;
use crate::error::TranslateError;
use crate::record::CallRecord;
use serde::Serialize;
use std::fmt;

/// COM-style status code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct HResult(pub i32);

impl HResult {
    pub const S_OK: Self = Self(0);
    pub const S_FALSE: Self = Self(1);
    pub const E_NOTIMPL: Self = Self(0x8000_4001_u32 as i32);
    pub const E_NOINTERFACE: Self = Self(0x8000_4002_u32 as i32);
    pub const E_POINTER: Self = Self(0x8000_4003_u32 as i32);
    pub const E_FAIL: Self = Self(0x8000_4005_u32 as i32);
    pub const E_HANDLE: Self = Self(0x8007_0006_u32 as i32);
    pub const E_OUTOFMEMORY: Self = Self(0x8007_000E_u32 as i32);
    pub const E_INVALIDARG: Self = Self(0x8007_0057_u32 as i32);

    pub const fn succeeded(self) -> bool {
        self.0 >= 0
    }

    pub const fn failed(self) -> bool {
        self.0 < 0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::S_OK => "S_OK",
            Self::S_FALSE => "S_FALSE",
            Self::E_NOTIMPL => "E_NOTIMPL",
            Self::E_NOINTERFACE => "E_NOINTERFACE",
            Self::E_POINTER => "E_POINTER",
            Self::E_FAIL => "E_FAIL",
            Self::E_HANDLE => "E_HANDLE",
            Self::E_OUTOFMEMORY => "E_OUTOFMEMORY",
            Self::E_INVALIDARG => "E_INVALIDARG",
            _ => return None,
        })
    }
}

impl fmt::Debug for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "HResult({:#010x})", self.0 as u32),
        }
    }
}

impl fmt::Display for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Kernel-style status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct NtStatus(pub u32);

impl NtStatus {
    pub const SUCCESS: Self = Self(0);
    pub const ACCESS_VIOLATION: Self = Self(0xC000_0005);
    pub const INVALID_HANDLE: Self = Self(0xC000_0008);
    pub const INVALID_PARAMETER: Self = Self(0xC000_000D);

    pub const fn is_success(self) -> bool {
        (self.0 as i32) >= 0
    }
}

/// 32-bit boolean as the wrapped API returns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Bool(pub i32);

impl Bool {
    pub const FALSE: Self = Self(0);
    pub const TRUE: Self = Self(1);

    pub const fn is_true(self) -> bool {
        self.0 != 0
    }
}

impl From<bool> for Bool {
    fn from(value: bool) -> Self {
        if value {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }
}

/// Key of an object in the host object table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct ObjectHandle(pub u64);

impl ObjectHandle {
    pub const NULL: Self = Self(0);

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Interface identifier of an object role.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Iid(pub u64);

impl fmt::Debug for Iid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iid({:#x})", self.0)
    }
}

/// Result of an operation that hands out a polymorphic object: the status,
/// the raw host handle and the interface actually granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewObject {
    pub status: HResult,
    pub handle: ObjectHandle,
    pub iid: Iid,
}

impl NewObject {
    pub fn granted(handle: ObjectHandle, iid: Iid) -> Self {
        Self {
            status: HResult::S_OK,
            handle,
            iid,
        }
    }

    pub fn failed(status: HResult) -> Self {
        Self {
            status,
            handle: ObjectHandle::NULL,
            iid: Iid::default(),
        }
    }
}

/// How a handler's return value is written into the record and read back by
/// the stub.
///
/// `FIELDS` extra payload fields follow the parameters; most results only
/// use the record's result word.
pub trait ReturnValue: Sized {
    /// What the guest caller receives.
    type Guest;

    const FIELDS: usize = 0;

    fn store(self, cx: &CallContext, record: &mut CallRecord, at: usize);

    fn load(record: &CallRecord, at: usize) -> Self::Guest;

    /// The operation's own answer to an argument that could not be
    /// translated.
    fn fault(err: &TranslateError) -> Self;
}

impl ReturnValue for () {
    type Guest = ();

    fn store(self, _cx: &CallContext, _record: &mut CallRecord, _at: usize) {}

    fn load(_record: &CallRecord, _at: usize) {}

    fn fault(_err: &TranslateError) {}
}

macro_rules! integer_return {
    ($($ty:ty),*) => {$(
        impl ReturnValue for $ty {
            type Guest = $ty;

            fn store(self, _cx: &CallContext, record: &mut CallRecord, _at: usize) {
                record.set_result(self as u64);
            }

            fn load(record: &CallRecord, _at: usize) -> $ty {
                record.result() as $ty
            }

            fn fault(_err: &TranslateError) -> $ty {
                0
            }
        }
    )*};
}

integer_return!(i32, u32, i64, u64);

macro_rules! status_return {
    ($ty:ident, $inner:ty, $fault:expr) => {
        impl ReturnValue for $ty {
            type Guest = $ty;

            fn store(self, _cx: &CallContext, record: &mut CallRecord, _at: usize) {
                record.set_result(self.0 as u64);
            }

            fn load(record: &CallRecord, _at: usize) -> $ty {
                $ty(record.result() as $inner)
            }

            fn fault(_err: &TranslateError) -> $ty {
                $fault
            }
        }
    };
}

status_return!(Bool, i32, Bool::FALSE);
status_return!(HResult, i32, HResult::E_POINTER);
status_return!(NtStatus, u32, NtStatus::ACCESS_VIOLATION);

impl ReturnValue for NewObject {
    type Guest = NewObject;

    const FIELDS: usize = 2;

    fn store(self, _cx: &CallContext, record: &mut CallRecord, at: usize) {
        record.set_result(self.status.0 as u64);
        record
            .slots_mut(at, 2)
            .copy_from_slice(&[self.handle.0, self.iid.0]);
    }

    fn load(record: &CallRecord, at: usize) -> NewObject {
        let slots = record.slots(at, 2);
        NewObject {
            status: HResult(record.result() as i32),
            handle: ObjectHandle(slots[0]),
            iid: Iid(slots[1]),
        }
    }

    fn fault(_err: &TranslateError) -> NewObject {
        NewObject::failed(HResult::E_POINTER)
    }
}
