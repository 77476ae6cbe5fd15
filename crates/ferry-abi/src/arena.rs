//! Guest-reachable memory.
//!
//! A 32-bit guest can only dereference addresses it can represent, so any
//! host memory the guest must see (callback records, strings handed to guest
//! code, the guest's own buffers in the simulation) comes from a
//! [`GuestArena`]. The arena owns one contiguous host block, exposes it at a
//! fixed guest base and hands out pieces with a first-fit allocator.

use crate::error::ArenaError;
use crate::thunk::Plain;
use crate::translate::{GuestAddr, HostAddr};
use parking_lot::Mutex;
use std::alloc::Layout;
use std::collections::BTreeMap;
use std::ptr::NonNull;

const MIN_ALIGN: usize = 16;

/// Longest wide string `read_wide` will scan, in code units.
pub const MAX_WIDE_LEN: usize = 32 * 1024;

enum Backing {
    Heap(Layout),
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    Mapped,
}

#[derive(Default)]
struct Allocator {
    /// offset -> length of each free run
    free: BTreeMap<usize, usize>,
    /// offset -> length of each live allocation
    used: BTreeMap<usize, usize>,
}

/// Contiguous host block visible to the guest at `guest_base`.
pub struct GuestArena {
    memory: NonNull<u8>,
    size: usize,
    guest_base: u64,
    backing: Backing,
    state: Mutex<Allocator>,
}

// SAFETY: the block is only touched through raw-pointer copies and the
// allocator state is behind a mutex.
unsafe impl Send for GuestArena {}
unsafe impl Sync for GuestArena {}

impl GuestArena {
    /// Heap-backed arena whose guest addresses equal its host addresses.
    pub fn heap(size: usize) -> Result<Self, ArenaError> {
        let (memory, layout) = Self::allocate(size)?;
        let guest_base = memory.as_ptr() as usize as u64;
        Ok(Self::from_parts(memory, layout.size(), guest_base, Backing::Heap(layout)))
    }

    /// Heap-backed arena exposed to the guest at `guest_base`.
    pub fn windowed(size: usize, guest_base: u64) -> Result<Self, ArenaError> {
        if guest_base == 0 || guest_base.checked_add(size as u64).is_none() {
            return Err(ArenaError::OutOfBounds {
                addr: guest_base,
                len: size,
            });
        }
        let (memory, layout) = Self::allocate(size)?;
        Ok(Self::from_parts(memory, layout.size(), guest_base, Backing::Heap(layout)))
    }

    /// Arena placed below 2 GiB so a 32-bit guest can use host addresses
    /// unchanged.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn low_memory(size: usize) -> Result<Self, ArenaError> {
        let size = round_up(size, MIN_ALIGN).ok_or(ArenaError::InvalidSize(size))?;
        if size == 0 {
            return Err(ArenaError::InvalidSize(size));
        }
        // SAFETY: anonymous private mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_32BIT,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ArenaError::Map(std::io::Error::last_os_error()));
        }
        let memory = NonNull::new(ptr as *mut u8).ok_or(ArenaError::InvalidSize(size))?;
        let guest_base = memory.as_ptr() as usize as u64;
        Ok(Self::from_parts(memory, size, guest_base, Backing::Mapped))
    }

    fn allocate(size: usize) -> Result<(NonNull<u8>, Layout), ArenaError> {
        let rounded = round_up(size, MIN_ALIGN).ok_or(ArenaError::InvalidSize(size))?;
        if rounded == 0 {
            return Err(ArenaError::InvalidSize(size));
        }
        let layout =
            Layout::from_size_align(rounded, MIN_ALIGN).map_err(|_| ArenaError::InvalidSize(size))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let memory = NonNull::new(ptr).ok_or(ArenaError::Exhausted { requested: rounded })?;
        Ok((memory, layout))
    }

    fn from_parts(memory: NonNull<u8>, size: usize, guest_base: u64, backing: Backing) -> Self {
        let mut state = Allocator::default();
        state.free.insert(0, size);
        Self {
            memory,
            size,
            guest_base,
            backing,
            state: Mutex::new(state),
        }
    }

    pub fn guest_base(&self) -> u64 {
        self.guest_base
    }

    pub fn host_base(&self) -> HostAddr {
        HostAddr::from_ptr(self.memory.as_ptr())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes currently handed out.
    pub fn in_use(&self) -> usize {
        self.state.lock().used.values().sum()
    }

    /// Host address of the guest range `addr..addr + len`, if it lies inside
    /// the arena. A zero-length range may sit exactly at the end.
    pub fn host_range(&self, addr: GuestAddr, len: usize) -> Option<HostAddr> {
        let offset = addr.raw().checked_sub(self.guest_base)?;
        let end = offset.checked_add(len as u64)?;
        if end > self.size as u64 {
            return None;
        }
        Some(self.host_base().offset(offset))
    }

    /// Guest view of a host address inside the arena. The one-past-end
    /// address is not inside.
    pub fn guest_of(&self, addr: HostAddr) -> Option<GuestAddr> {
        let offset = addr.raw().checked_sub(self.host_base().raw())?;
        if offset >= self.size as u64 {
            return None;
        }
        Some(GuestAddr(self.guest_base + offset))
    }

    fn checked(&self, addr: GuestAddr, len: usize) -> Result<HostAddr, ArenaError> {
        self.host_range(addr, len).ok_or(ArenaError::OutOfBounds {
            addr: addr.raw(),
            len,
        })
    }

    /// Allocate `len` bytes whose guest address is aligned to `align`.
    pub fn alloc(&self, len: usize, align: usize) -> Result<GuestAddr, ArenaError> {
        let align = align.max(MIN_ALIGN).next_power_of_two();
        let len = round_up(len.max(1), MIN_ALIGN).ok_or(ArenaError::InvalidSize(len))?;
        let mut state = self.state.lock();

        let mut found = None;
        for (&offset, &run) in state.free.iter() {
            let guest = self.guest_base + offset as u64;
            let aligned = match round_up(guest as usize, align) {
                Some(aligned) => aligned as u64,
                None => continue,
            };
            let pad = (aligned - guest) as usize;
            if pad + len <= run {
                found = Some((offset, run, pad));
                break;
            }
        }

        let (offset, run, pad) = found.ok_or(ArenaError::Exhausted { requested: len })?;
        state.free.remove(&offset);
        if pad > 0 {
            state.free.insert(offset, pad);
        }
        let start = offset + pad;
        let rest = run - pad - len;
        if rest > 0 {
            state.free.insert(start + len, rest);
        }
        state.used.insert(start, len);
        Ok(GuestAddr(self.guest_base + start as u64))
    }

    /// Return an allocation to the arena.
    pub fn free(&self, addr: GuestAddr) -> Result<(), ArenaError> {
        let offset = addr
            .raw()
            .checked_sub(self.guest_base)
            .ok_or(ArenaError::NotAllocated(addr.raw()))? as usize;
        let mut state = self.state.lock();
        let len = state
            .used
            .remove(&offset)
            .ok_or(ArenaError::NotAllocated(addr.raw()))?;

        let mut start = offset;
        let mut end = offset + len;
        let prev = state
            .free
            .range(..offset)
            .next_back()
            .map(|(&prev, &prev_len)| (prev, prev_len));
        if let Some((prev, prev_len)) = prev {
            if prev + prev_len == offset {
                state.free.remove(&prev);
                start = prev;
            }
        }
        if let Some(next_len) = state.free.remove(&end) {
            end += next_len;
        }
        state.free.insert(start, end - start);
        Ok(())
    }

    pub fn write_bytes(&self, addr: GuestAddr, bytes: &[u8]) -> Result<(), ArenaError> {
        let host = self.checked(addr, bytes.len())?;
        // SAFETY: range checked against the arena block.
        unsafe { host.write_bytes(bytes) };
        Ok(())
    }

    pub fn read_bytes(&self, addr: GuestAddr, len: usize) -> Result<Vec<u8>, ArenaError> {
        let host = self.checked(addr, len)?;
        // SAFETY: range checked against the arena block.
        Ok(unsafe { host.read_bytes(len) })
    }

    pub fn alloc_bytes(&self, bytes: &[u8], align: usize) -> Result<GuestAddr, ArenaError> {
        let addr = self.alloc(bytes.len(), align)?;
        self.write_bytes(addr, bytes)?;
        Ok(addr)
    }

    pub fn write<T: Plain>(&self, addr: GuestAddr, value: &T) -> Result<(), ArenaError> {
        let host = self.checked(addr, std::mem::size_of::<T>())?;
        // SAFETY: range checked; Plain types are valid for any byte pattern.
        unsafe { std::ptr::write_unaligned(host.as_ptr::<T>(), *value) };
        Ok(())
    }

    pub fn read<T: Plain>(&self, addr: GuestAddr) -> Result<T, ArenaError> {
        let host = self.checked(addr, std::mem::size_of::<T>())?;
        // SAFETY: range checked; Plain types are valid for any byte pattern.
        Ok(unsafe { std::ptr::read_unaligned(host.as_ptr::<T>() as *const T) })
    }

    pub fn alloc_value<T: Plain>(&self, value: &T) -> Result<GuestAddr, ArenaError> {
        let addr = self.alloc(std::mem::size_of::<T>(), std::mem::align_of::<T>())?;
        self.write(addr, value)?;
        Ok(addr)
    }

    pub fn alloc_slice<T: Plain>(&self, values: &[T]) -> Result<GuestAddr, ArenaError> {
        let addr = self.alloc(std::mem::size_of_val(values), std::mem::align_of::<T>())?;
        let stride = std::mem::size_of::<T>() as u64;
        for (i, value) in values.iter().enumerate() {
            self.write(addr.offset(i as u64 * stride), value)?;
        }
        Ok(addr)
    }

    pub fn read_slice<T: Plain>(&self, addr: GuestAddr, count: usize) -> Result<Vec<T>, ArenaError> {
        let stride = std::mem::size_of::<T>() as u64;
        (0..count)
            .map(|i| self.read(addr.offset(i as u64 * stride)))
            .collect()
    }

    /// Store `text` as a NUL-terminated UTF-16 string.
    pub fn alloc_wide(&self, text: &str) -> Result<GuestAddr, ArenaError> {
        let units: Vec<u16> = text.encode_utf16().chain(std::iter::once(0)).collect();
        self.alloc_slice(&units)
    }

    /// Read a NUL-terminated UTF-16 string.
    pub fn read_wide(&self, addr: GuestAddr) -> Result<String, ArenaError> {
        let mut units = Vec::new();
        for i in 0..MAX_WIDE_LEN as u64 {
            let unit: u16 = self.read(addr.offset(i * 2))?;
            if unit == 0 {
                return Ok(String::from_utf16_lossy(&units));
            }
            units.push(unit);
        }
        Err(ArenaError::Unterminated(addr.raw()))
    }

    /// Temporary allocation released when the guard drops.
    pub fn scratch(&self, len: usize, align: usize) -> Result<Scratch<'_>, ArenaError> {
        let addr = self.alloc(len, align)?;
        Ok(Scratch { arena: self, addr })
    }

    pub fn scratch_value<T: Plain>(&self, value: &T) -> Result<Scratch<'_>, ArenaError> {
        let addr = self.alloc_value(value)?;
        Ok(Scratch { arena: self, addr })
    }

    pub fn scratch_bytes(&self, bytes: &[u8], align: usize) -> Result<Scratch<'_>, ArenaError> {
        let addr = self.alloc_bytes(bytes, align)?;
        Ok(Scratch { arena: self, addr })
    }
}

fn round_up(value: usize, align: usize) -> Option<usize> {
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

impl Drop for GuestArena {
    fn drop(&mut self) {
        match self.backing {
            // SAFETY: allocated in `allocate` with this layout.
            Backing::Heap(layout) => unsafe { std::alloc::dealloc(self.memory.as_ptr(), layout) },
            #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
            Backing::Mapped => {
                // SAFETY: mapped in `low_memory` with this size.
                let rc = unsafe { libc::munmap(self.memory.as_ptr() as *mut libc::c_void, self.size) };
                if rc != 0 {
                    log::warn!("munmap of guest arena failed: {}", std::io::Error::last_os_error());
                }
            }
        }
    }
}

impl std::fmt::Debug for GuestArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestArena")
            .field("guest_base", &format_args!("{:#x}", self.guest_base))
            .field("size", &self.size)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// An arena allocation freed on drop.
pub struct Scratch<'a> {
    arena: &'a GuestArena,
    addr: GuestAddr,
}

impl Scratch<'_> {
    pub fn addr(&self) -> GuestAddr {
        self.addr
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.arena.free(self.addr) {
            log::warn!("releasing scratch block: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_free_coalesce() {
        let arena = GuestArena::windowed(256, 0x1000).unwrap();
        let a = arena.alloc(16, 16).unwrap();
        let b = arena.alloc(32, 16).unwrap();
        let c = arena.alloc(16, 16).unwrap();
        assert_eq!(a, GuestAddr(0x1000));
        assert_eq!(b, GuestAddr(0x1010));
        assert_eq!(c, GuestAddr(0x1030));
        assert_eq!(arena.in_use(), 64);

        arena.free(b).unwrap();
        arena.free(a).unwrap();
        arena.free(c).unwrap();
        assert_eq!(arena.in_use(), 0);

        // whole block is one run again
        let big = arena.alloc(256, 16).unwrap();
        assert_eq!(big, GuestAddr(0x1000));
    }

    #[test]
    fn test_alloc_exhaustion() {
        let arena = GuestArena::windowed(64, 0x1000).unwrap();
        arena.alloc(48, 16).unwrap();
        assert!(matches!(
            arena.alloc(32, 16),
            Err(ArenaError::Exhausted { requested: 32 })
        ));
    }

    #[test]
    fn test_alignment_is_in_guest_space() {
        let arena = GuestArena::windowed(1024, 0x1010).unwrap();
        let addr = arena.alloc(8, 64).unwrap();
        assert_eq!(addr.raw() % 64, 0);
        arena.free(addr).unwrap();
        assert_eq!(arena.in_use(), 0);
    }

    #[test]
    fn test_double_free_rejected() {
        let arena = GuestArena::windowed(64, 0x1000).unwrap();
        let a = arena.alloc(8, 8).unwrap();
        arena.free(a).unwrap();
        assert!(matches!(arena.free(a), Err(ArenaError::NotAllocated(0x1000))));
    }

    #[test]
    fn test_typed_access() {
        let arena = GuestArena::windowed(256, 0x2000).unwrap();
        let addr = arena.alloc_slice(&[1u32, 2, 3]).unwrap();
        assert_eq!(arena.read_slice::<u32>(addr, 3).unwrap(), vec![1, 2, 3]);
        arena.write(addr.offset(4), &9u32).unwrap();
        assert_eq!(arena.read::<u32>(addr.offset(4)).unwrap(), 9);
        assert!(arena.read::<u64>(GuestAddr(0x20fc)).is_err());
    }

    #[test]
    fn test_wide_strings() {
        let arena = GuestArena::windowed(256, 0x2000).unwrap();
        let addr = arena.alloc_wide("héllo").unwrap();
        assert_eq!(arena.read_wide(addr).unwrap(), "héllo");
    }

    #[test]
    fn test_scratch_released_on_drop() {
        let arena = GuestArena::windowed(256, 0x2000).unwrap();
        {
            let scratch = arena.scratch_value(&7u64).unwrap();
            assert_eq!(arena.read::<u64>(scratch.addr()).unwrap(), 7);
            assert_eq!(arena.in_use(), 16);
        }
        assert_eq!(arena.in_use(), 0);
    }

    #[test]
    fn test_heap_arena_is_identity_mapped() {
        let arena = GuestArena::heap(64).unwrap();
        assert_eq!(arena.guest_base(), arena.host_base().raw());
    }

    #[test]
    fn test_guest_of_excludes_end() {
        let arena = GuestArena::windowed(64, 0x3000).unwrap();
        let base = arena.host_base();
        assert_eq!(arena.guest_of(base), Some(GuestAddr(0x3000)));
        assert_eq!(arena.guest_of(base.offset(63)), Some(GuestAddr(0x303f)));
        assert_eq!(arena.guest_of(base.offset(64)), None);
        assert_eq!(arena.guest_of(HostAddr(base.raw() - 1)), None);
    }

    #[test]
    fn test_windowed_rejects_null_base() {
        assert!(GuestArena::windowed(64, 0).is_err());
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_low_memory_is_32bit() {
        let arena = GuestArena::low_memory(4096).unwrap();
        assert!(arena.guest_base() + arena.size() as u64 <= 1 << 32);
        let addr = arena.alloc_value(&5u32).unwrap();
        assert_eq!(arena.read::<u32>(addr).unwrap(), 5);
    }
}
