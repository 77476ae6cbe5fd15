//! Address translation between the guest and host address spaces.
//!
//! Guest and host addresses are distinct types so a value can only be
//! translated in the direction it is meant to go; handing a host address to
//! `to_host` does not compile. Null is a fixed point of every translator.

use crate::arena::GuestArena;
use crate::error::TranslateError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Pointer width of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bitness {
    B32,
    B64,
}

impl Bitness {
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            32 => Some(Self::B32),
            64 => Some(Self::B64),
            _ => None,
        }
    }

    pub const fn bits(self) -> u32 {
        match self {
            Self::B32 => 32,
            Self::B64 => 64,
        }
    }

    /// Size of a guest pointer or handle in bytes.
    pub const fn word_size(self) -> usize {
        match self {
            Self::B32 => 4,
            Self::B64 => 8,
        }
    }

    /// One past the highest guest address.
    pub const fn address_limit(self) -> u128 {
        1u128 << self.bits()
    }
}

impl fmt::Display for Bitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u64);

        impl $name {
            pub const NULL: Self = Self(0);

            pub const fn raw(self) -> u64 {
                self.0
            }

            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            pub const fn offset(self, bytes: u64) -> Self {
                Self(self.0.wrapping_add(bytes))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }
    };
}

address_type!(
    /// An address as the guest sees it, zero-extended to 64 bits.
    GuestAddr
);
address_type!(
    /// An address valid in the host process.
    HostAddr
);

impl HostAddr {
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    /// Copy `len` bytes out of host memory.
    ///
    /// # Safety
    /// `self..self + len` must be readable host memory.
    pub unsafe fn read_bytes(self, len: usize) -> Vec<u8> {
        if len == 0 {
            return Vec::new();
        }
        std::slice::from_raw_parts(self.as_ptr::<u8>() as *const u8, len).to_vec()
    }

    /// Copy `bytes` into host memory.
    ///
    /// # Safety
    /// `self..self + bytes.len()` must be writable host memory not aliased by
    /// a live Rust reference.
    pub unsafe fn write_bytes(self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.as_ptr::<u8>(), bytes.len());
    }
}

/// An opaque handle as the guest stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GuestHandle(pub u64);

/// An opaque handle as the host API expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct HostHandle(pub u64);

impl GuestHandle {
    pub const NULL: Self = Self(0);

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl HostHandle {
    pub const NULL: Self = Self(0);

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Both views of one piece of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translated {
    pub guest: GuestAddr,
    pub host: HostAddr,
}

/// Maps addresses between the guest and host views of memory.
///
/// One implementation exists per bitness pairing; the bridge selects one at
/// start-up and every handler goes through it.
///
/// # Safety
/// For any guest range `map_to_host` accepts, the returned host range must
/// be valid for reads and writes for as long as the translator lives. The
/// provided memory helpers rely on this.
pub unsafe trait AddressTranslator: Send + Sync {
    /// Short name used in logs and `ferry info`.
    fn name(&self) -> &'static str;

    fn bitness(&self) -> Bitness;

    /// Map a non-null guest range of `len` bytes.
    fn map_to_host(&self, addr: GuestAddr, len: usize) -> Result<HostAddr, TranslateError>;

    /// Map a non-null host address back into the guest.
    fn map_to_guest(&self, addr: HostAddr) -> Result<GuestAddr, TranslateError>;

    fn to_host(&self, addr: GuestAddr) -> Result<HostAddr, TranslateError> {
        if addr.is_null() {
            return Ok(HostAddr::NULL);
        }
        self.map_to_host(addr, 0)
    }

    fn to_guest(&self, addr: HostAddr) -> Result<GuestAddr, TranslateError> {
        if addr.is_null() {
            return Ok(GuestAddr::NULL);
        }
        self.map_to_guest(addr)
    }

    /// Translate and check that `len` bytes starting at `addr` are mapped.
    fn to_host_range(&self, addr: GuestAddr, len: usize) -> Result<HostAddr, TranslateError> {
        if addr.is_null() {
            return if len == 0 {
                Ok(HostAddr::NULL)
            } else {
                Err(TranslateError::Null(len))
            };
        }
        self.map_to_host(addr, len)
    }

    /// 32-bit handles are sign-extended so pseudo-handles like `-1` survive.
    fn handle_to_host(&self, handle: GuestHandle) -> HostHandle {
        match self.bitness() {
            Bitness::B32 => HostHandle(handle.0 as u32 as i32 as i64 as u64),
            Bitness::B64 => HostHandle(handle.0),
        }
    }

    fn handle_to_guest(&self, handle: HostHandle) -> Result<GuestHandle, TranslateError> {
        match self.bitness() {
            Bitness::B32 => {
                let value = handle.0 as i64;
                if value < i32::MIN as i64 || value > i32::MAX as i64 {
                    return Err(TranslateError::HandleOverflow(handle.0));
                }
                Ok(GuestHandle(value as u32 as u64))
            }
            Bitness::B64 => Ok(GuestHandle(handle.0)),
        }
    }

    fn read_bytes(&self, addr: GuestAddr, len: usize) -> Result<Vec<u8>, TranslateError> {
        let host = self.to_host_range(addr, len)?;
        // SAFETY: the range was accepted by `map_to_host`.
        Ok(unsafe { host.read_bytes(len) })
    }

    fn write_bytes(&self, addr: GuestAddr, bytes: &[u8]) -> Result<(), TranslateError> {
        let host = self.to_host_range(addr, bytes.len())?;
        // SAFETY: the range was accepted by `map_to_host`.
        unsafe { host.write_bytes(bytes) };
        Ok(())
    }

    /// Read `len` bytes at a host address that must also be guest-reachable.
    ///
    /// Used for pointers that arrived nested inside guest structs.
    fn read_host_bytes(&self, addr: HostAddr, len: usize) -> Result<Vec<u8>, TranslateError> {
        let guest = self.to_guest(addr)?;
        self.read_bytes(guest, len)
    }
}

fn checked_end(addr: u64, len: usize) -> Result<u64, TranslateError> {
    addr.checked_add(len as u64)
        .ok_or(TranslateError::Unmapped { addr, len })
}

/// Same bitness, shared flat address space: translation is the identity.
#[derive(Debug)]
pub struct FlatTranslator {
    _private: (),
}

impl FlatTranslator {
    /// # Safety
    /// Every non-null address the guest passes must be valid host memory.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

unsafe impl AddressTranslator for FlatTranslator {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn bitness(&self) -> Bitness {
        Bitness::B64
    }

    fn map_to_host(&self, addr: GuestAddr, len: usize) -> Result<HostAddr, TranslateError> {
        checked_end(addr.0, len)?;
        Ok(HostAddr(addr.0))
    }

    fn map_to_guest(&self, addr: HostAddr) -> Result<GuestAddr, TranslateError> {
        Ok(GuestAddr(addr.0))
    }
}

/// 32-bit guest living in the low 4 GiB of a 64-bit host.
///
/// Guest pointers are zero-extended; host pointers above 4 GiB have no guest
/// representation.
#[derive(Debug)]
pub struct Wow64Translator {
    _private: (),
}

impl Wow64Translator {
    /// # Safety
    /// Every non-null address the guest passes must be valid host memory
    /// below 4 GiB.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

unsafe impl AddressTranslator for Wow64Translator {
    fn name(&self) -> &'static str {
        "wow64"
    }

    fn bitness(&self) -> Bitness {
        Bitness::B32
    }

    fn map_to_host(&self, addr: GuestAddr, len: usize) -> Result<HostAddr, TranslateError> {
        let end = checked_end(addr.0, len)?;
        if end > 1u64 << 32 {
            return Err(TranslateError::Unmapped { addr: addr.0, len });
        }
        Ok(HostAddr(addr.0))
    }

    fn map_to_guest(&self, addr: HostAddr) -> Result<GuestAddr, TranslateError> {
        if addr.0 > u32::MAX as u64 {
            return Err(TranslateError::Unreachable(addr.0));
        }
        Ok(GuestAddr(addr.0))
    }
}

/// Guest window backed by a single host arena at a constant offset.
pub struct WindowTranslator {
    arena: Arc<GuestArena>,
    bits: Bitness,
}

impl WindowTranslator {
    pub fn new(arena: Arc<GuestArena>, bits: Bitness) -> Result<Self, TranslateError> {
        let end = arena.guest_base() as u128 + arena.size() as u128;
        if end > bits.address_limit() {
            return Err(TranslateError::Unmapped {
                addr: arena.guest_base(),
                len: arena.size(),
            });
        }
        Ok(Self { arena, bits })
    }

    pub fn arena(&self) -> &Arc<GuestArena> {
        &self.arena
    }
}

unsafe impl AddressTranslator for WindowTranslator {
    fn name(&self) -> &'static str {
        "window"
    }

    fn bitness(&self) -> Bitness {
        self.bits
    }

    fn map_to_host(&self, addr: GuestAddr, len: usize) -> Result<HostAddr, TranslateError> {
        self.arena
            .host_range(addr, len)
            .ok_or(TranslateError::Unmapped { addr: addr.0, len })
    }

    fn map_to_guest(&self, addr: HostAddr) -> Result<GuestAddr, TranslateError> {
        self.arena
            .guest_of(addr)
            .ok_or(TranslateError::Unreachable(addr.0))
    }
}

/// Several disjoint guest regions, each backed by its own arena.
///
/// The mapping is not linear: guest order need not match host order.
pub struct TableTranslator {
    bits: Bitness,
    by_guest: BTreeMap<u64, Arc<GuestArena>>,
    by_host: BTreeMap<u64, Arc<GuestArena>>,
}

impl TableTranslator {
    pub fn new(bits: Bitness) -> Self {
        Self {
            bits,
            by_guest: BTreeMap::new(),
            by_host: BTreeMap::new(),
        }
    }

    /// Map `arena` at its own guest base.
    pub fn map(&mut self, arena: Arc<GuestArena>) -> Result<(), TranslateError> {
        let base = arena.guest_base();
        let end = base as u128 + arena.size() as u128;
        if end > self.bits.address_limit() {
            return Err(TranslateError::Unmapped {
                addr: base,
                len: arena.size(),
            });
        }
        let overlaps = self.by_guest.values().any(|other| {
            let other_end = other.guest_base() as u128 + other.size() as u128;
            (base as u128) < other_end && (other.guest_base() as u128) < end
        });
        if overlaps {
            return Err(TranslateError::Overlap(base));
        }
        self.by_host.insert(arena.host_base().raw(), Arc::clone(&arena));
        self.by_guest.insert(base, arena);
        Ok(())
    }

    pub fn regions(&self) -> usize {
        self.by_guest.len()
    }
}

unsafe impl AddressTranslator for TableTranslator {
    fn name(&self) -> &'static str {
        "table"
    }

    fn bitness(&self) -> Bitness {
        self.bits
    }

    fn map_to_host(&self, addr: GuestAddr, len: usize) -> Result<HostAddr, TranslateError> {
        self.by_guest
            .range(..=addr.0)
            .next_back()
            .and_then(|(_, arena)| arena.host_range(addr, len))
            .ok_or(TranslateError::Unmapped { addr: addr.0, len })
    }

    fn map_to_guest(&self, addr: HostAddr) -> Result<GuestAddr, TranslateError> {
        self.by_host
            .range(..=addr.0)
            .next_back()
            .and_then(|(_, arena)| arena.guest_of(addr))
            .ok_or(TranslateError::Unreachable(addr.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(base: u64) -> Arc<GuestArena> {
        Arc::new(GuestArena::windowed(4096, base).unwrap())
    }

    #[test]
    fn test_null_is_fixed_point() {
        let flat = unsafe { FlatTranslator::new() };
        let wow = unsafe { Wow64Translator::new() };
        let win = WindowTranslator::new(window(0x1000_0000), Bitness::B32).unwrap();
        let mut table = TableTranslator::new(Bitness::B32);
        table.map(window(0x2000_0000)).unwrap();

        let all: [&dyn AddressTranslator; 4] = [&flat, &wow, &win, &table];
        for t in all {
            assert_eq!(t.to_host(GuestAddr::NULL).unwrap(), HostAddr::NULL, "{}", t.name());
            assert_eq!(t.to_guest(HostAddr::NULL).unwrap(), GuestAddr::NULL, "{}", t.name());
            assert_eq!(t.to_host_range(GuestAddr::NULL, 0).unwrap(), HostAddr::NULL);
            assert_eq!(t.to_host_range(GuestAddr::NULL, 4), Err(TranslateError::Null(4)));
        }
    }

    #[test]
    fn test_identity_translators_are_idempotent() {
        let flat = unsafe { FlatTranslator::new() };
        let wow = unsafe { Wow64Translator::new() };
        for addr in [0x10u64, 0x7fff_0000, 0xffff_fff0] {
            let once = flat.to_host(GuestAddr(addr)).unwrap();
            let twice = flat.to_host(GuestAddr(once.raw())).unwrap();
            assert_eq!(once, twice);

            let once = wow.to_host(GuestAddr(addr)).unwrap();
            let twice = wow.to_host(GuestAddr(once.raw())).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_wow64_rejects_high_addresses() {
        let wow = unsafe { Wow64Translator::new() };
        assert_eq!(
            wow.to_guest(HostAddr(0x1_0000_0000)),
            Err(TranslateError::Unreachable(0x1_0000_0000))
        );
        assert!(wow.to_host_range(GuestAddr(0xffff_fff0), 32).is_err());
        assert_eq!(wow.to_guest(HostAddr(0xffff_fff0)).unwrap(), GuestAddr(0xffff_fff0));
    }

    #[test]
    fn test_window_round_trip() {
        let arena = window(0x1000_0000);
        let win = WindowTranslator::new(Arc::clone(&arena), Bitness::B32).unwrap();
        let guest = GuestAddr(0x1000_0010);
        let host = win.to_host(guest).unwrap();
        assert_eq!(host, arena.host_base().offset(0x10));
        assert_eq!(win.to_guest(host).unwrap(), guest);
        assert!(win.to_host(GuestAddr(0x0fff_ffff)).is_err());
        assert!(win.to_host_range(GuestAddr(0x1000_0ffc), 8).is_err());
        assert!(win.to_host_range(GuestAddr(0x1000_0ff8), 8).is_ok());
    }

    #[test]
    fn test_window_rejects_unaddressable_arena() {
        let arena = window(0xffff_f800);
        assert!(WindowTranslator::new(arena, Bitness::B32).is_err());
    }

    #[test]
    fn test_table_is_non_linear() {
        let high = window(0x3000_0000);
        let low = window(0x1000_0000);
        let mut table = TableTranslator::new(Bitness::B32);
        table.map(Arc::clone(&high)).unwrap();
        table.map(Arc::clone(&low)).unwrap();
        assert_eq!(table.regions(), 2);

        for (arena, guest) in [(&high, 0x3000_0100u64), (&low, 0x1000_0100)] {
            let host = table.to_host(GuestAddr(guest)).unwrap();
            assert_eq!(host, arena.host_base().offset(0x100));
            assert_eq!(table.to_guest(host).unwrap(), GuestAddr(guest));
        }
        assert!(table.to_host(GuestAddr(0x2000_0000)).is_err());
        assert_eq!(
            table.map(window(0x3000_0800)),
            Err(TranslateError::Overlap(0x3000_0800))
        );
    }

    #[test]
    fn test_handle_sign_extension() {
        let wow = unsafe { Wow64Translator::new() };
        let pseudo = wow.handle_to_host(GuestHandle(0xffff_ffff));
        assert_eq!(pseudo, HostHandle(u64::MAX));
        assert_eq!(wow.handle_to_guest(pseudo).unwrap(), GuestHandle(0xffff_ffff));
        assert_eq!(wow.handle_to_host(GuestHandle(0x44)), HostHandle(0x44));
        assert!(wow.handle_to_guest(HostHandle(0x1_0000_0000)).is_err());

        let flat = unsafe { FlatTranslator::new() };
        assert_eq!(flat.handle_to_host(GuestHandle(0xffff_ffff)), HostHandle(0xffff_ffff));
    }

    #[test]
    fn test_guest_memory_helpers() {
        let arena = window(0x1000_0000);
        let win = WindowTranslator::new(Arc::clone(&arena), Bitness::B32).unwrap();
        win.write_bytes(GuestAddr(0x1000_0020), &[1, 2, 3]).unwrap();
        assert_eq!(win.read_bytes(GuestAddr(0x1000_0020), 3).unwrap(), vec![1, 2, 3]);
        let host = win.to_host(GuestAddr(0x1000_0020)).unwrap();
        assert_eq!(win.read_host_bytes(host, 2).unwrap(), vec![1, 2]);
        assert!(win.read_bytes(GuestAddr(0x2000_0000), 1).is_err());
    }
}
