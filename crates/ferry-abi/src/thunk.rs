//! Guest struct layouts.
//!
//! A struct that contains pointers or handles has a different layout in a
//! 32-bit guest than on the 64-bit host. [`Thunk`] describes how such a type
//! is laid out in guest memory for a given [`Bitness`] and converts it field
//! by field, translating every nested pointer on the way.
//!
//! Types whose layout is identical on both sides implement [`Plain`] and get
//! a byte-copy `Thunk` for free. Structs with nested pointers use
//! `#[derive(Thunk)]`, which also generates a `<Name>Guest` companion holding
//! the untranslated guest view.

use crate::error::TranslateError;
use crate::translate::{
    AddressTranslator, Bitness, GuestAddr, GuestHandle, HostAddr, HostHandle,
};
use std::fmt::Debug;

/// Types with the same layout in guest and host and no pointer-width fields.
///
/// # Safety
/// Every byte pattern of `size_of::<Self>()` bytes must be a valid value, and
/// the layout must match the guest ABI for both bitnesses.
pub unsafe trait Plain: Copy + Debug + PartialEq + Send + Sync + 'static {}

macro_rules! plain {
    ($($ty:ty),*) => { $(unsafe impl Plain for $ty {})* };
}

plain!(u8, i8, u16, i16, u32, i32, u64, i64);

unsafe impl<T: Plain, const N: usize> Plain for [T; N] {}

/// Size and alignment of a type in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestLayout {
    pub size: usize,
    pub align: usize,
}

impl GuestLayout {
    pub const fn of<T>() -> Self {
        Self {
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
        }
    }

    pub const fn word(bits: Bitness) -> Self {
        Self {
            size: bits.word_size(),
            align: bits.word_size(),
        }
    }

    /// Layout of a C struct with the given fields, trailing padding included.
    pub fn record(fields: &[GuestLayout]) -> Self {
        let mut size = 0;
        let mut align = 1;
        for field in fields {
            size = align_to(size, field.align) + field.size;
            align = align.max(field.align);
        }
        Self {
            size: align_to(size, align),
            align,
        }
    }
}

fn align_to(offset: usize, align: usize) -> usize {
    offset.div_ceil(align) * align
}

/// Cursor over guest-layout bytes.
pub struct GuestReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    bits: Bitness,
    translator: Option<&'a dyn AddressTranslator>,
}

impl<'a> GuestReader<'a> {
    /// Reader that translates nested pointers to host addresses.
    pub fn host(bytes: &'a [u8], translator: &'a dyn AddressTranslator) -> Self {
        Self {
            bytes,
            pos: 0,
            bits: translator.bitness(),
            translator: Some(translator),
        }
    }

    /// Reader that yields the raw guest view.
    pub fn guest(bytes: &'a [u8], bits: Bitness) -> Self {
        Self {
            bytes,
            pos: 0,
            bits,
            translator: None,
        }
    }

    pub fn bits(&self) -> Bitness {
        self.bits
    }

    pub fn translator(&self) -> Result<&'a dyn AddressTranslator, TranslateError> {
        self.translator.ok_or(TranslateError::Detached)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn align(&mut self, align: usize) {
        self.pos = align_to(self.pos, align);
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], TranslateError> {
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(TranslateError::ShortRead {
                needed: end,
                available: self.bytes.len(),
            });
        }
        let bytes = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Read one pointer-sized word, zero-extended.
    pub fn word(&mut self) -> Result<u64, TranslateError> {
        let layout = GuestLayout::word(self.bits);
        self.align(layout.align);
        let bytes = self.take(layout.size)?;
        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }
}

/// Builder for guest-layout bytes.
pub struct GuestWriter<'a> {
    bytes: Vec<u8>,
    bits: Bitness,
    translator: Option<&'a dyn AddressTranslator>,
}

impl<'a> GuestWriter<'a> {
    pub fn host(translator: &'a dyn AddressTranslator) -> Self {
        Self {
            bytes: Vec::new(),
            bits: translator.bitness(),
            translator: Some(translator),
        }
    }

    pub fn guest(bits: Bitness) -> Self {
        Self {
            bytes: Vec::new(),
            bits,
            translator: None,
        }
    }

    pub fn bits(&self) -> Bitness {
        self.bits
    }

    pub fn translator(&self) -> Result<&'a dyn AddressTranslator, TranslateError> {
        self.translator.ok_or(TranslateError::Detached)
    }

    pub fn align(&mut self, align: usize) {
        let target = align_to(self.bytes.len(), align);
        self.bytes.resize(target, 0);
    }

    pub fn put(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Write one pointer-sized word; fails if it does not fit a 32-bit guest.
    pub fn word(&mut self, value: u64) -> Result<(), TranslateError> {
        let layout = GuestLayout::word(self.bits);
        if layout.size == 4 && value > u32::MAX as u64 {
            return Err(TranslateError::WordOverflow(value));
        }
        self.align(layout.align);
        self.put(&value.to_le_bytes()[..layout.size]);
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// A type that can be carried through guest memory.
pub trait Thunk: Sized {
    /// The untranslated view guest code works with.
    type Guest: Clone + Debug + PartialEq;

    /// Whether the guest layout contains pointers or handles.
    const NESTED: bool;

    fn layout(bits: Bitness) -> GuestLayout;

    /// Guest bytes to host value, translating nested pointers.
    fn read(r: &mut GuestReader<'_>) -> Result<Self, TranslateError>;

    /// Host value to guest bytes, translating nested pointers back.
    fn write(&self, w: &mut GuestWriter<'_>) -> Result<(), TranslateError>;

    fn read_guest(r: &mut GuestReader<'_>) -> Result<Self::Guest, TranslateError>;

    fn write_guest(value: &Self::Guest, w: &mut GuestWriter<'_>) -> Result<(), TranslateError>;
}

fn read_plain<T: Plain>(r: &mut GuestReader<'_>) -> Result<T, TranslateError> {
    r.align(std::mem::align_of::<T>());
    let bytes = r.take(std::mem::size_of::<T>())?;
    // SAFETY: `bytes` has exactly size_of::<T>() bytes and any pattern is a
    // valid Plain value.
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

fn write_plain<T: Plain>(value: &T, w: &mut GuestWriter<'_>) {
    w.align(std::mem::align_of::<T>());
    // SAFETY: Plain values are fully initialized plain data.
    let bytes = unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    };
    w.put(bytes);
}

impl<T: Plain> Thunk for T {
    type Guest = T;
    const NESTED: bool = false;

    fn layout(_bits: Bitness) -> GuestLayout {
        GuestLayout::of::<T>()
    }

    fn read(r: &mut GuestReader<'_>) -> Result<Self, TranslateError> {
        read_plain(r)
    }

    fn write(&self, w: &mut GuestWriter<'_>) -> Result<(), TranslateError> {
        write_plain(self, w);
        Ok(())
    }

    fn read_guest(r: &mut GuestReader<'_>) -> Result<T, TranslateError> {
        read_plain(r)
    }

    fn write_guest(value: &T, w: &mut GuestWriter<'_>) -> Result<(), TranslateError> {
        write_plain(value, w);
        Ok(())
    }
}

impl Thunk for HostAddr {
    type Guest = GuestAddr;
    const NESTED: bool = true;

    fn layout(bits: Bitness) -> GuestLayout {
        GuestLayout::word(bits)
    }

    fn read(r: &mut GuestReader<'_>) -> Result<Self, TranslateError> {
        let raw = r.word()?;
        r.translator()?.to_host(GuestAddr(raw))
    }

    fn write(&self, w: &mut GuestWriter<'_>) -> Result<(), TranslateError> {
        let guest = w.translator()?.to_guest(*self)?;
        w.word(guest.raw())
    }

    fn read_guest(r: &mut GuestReader<'_>) -> Result<GuestAddr, TranslateError> {
        Ok(GuestAddr(r.word()?))
    }

    fn write_guest(value: &GuestAddr, w: &mut GuestWriter<'_>) -> Result<(), TranslateError> {
        w.word(value.raw())
    }
}

impl Thunk for HostHandle {
    type Guest = GuestHandle;
    const NESTED: bool = true;

    fn layout(bits: Bitness) -> GuestLayout {
        GuestLayout::word(bits)
    }

    fn read(r: &mut GuestReader<'_>) -> Result<Self, TranslateError> {
        let raw = r.word()?;
        Ok(r.translator()?.handle_to_host(GuestHandle(raw)))
    }

    fn write(&self, w: &mut GuestWriter<'_>) -> Result<(), TranslateError> {
        let guest = w.translator()?.handle_to_guest(*self)?;
        w.word(guest.raw())
    }

    fn read_guest(r: &mut GuestReader<'_>) -> Result<GuestHandle, TranslateError> {
        Ok(GuestHandle(r.word()?))
    }

    fn write_guest(value: &GuestHandle, w: &mut GuestWriter<'_>) -> Result<(), TranslateError> {
        w.word(value.raw())
    }
}

/// Lay out a guest-side value for guest memory.
pub fn encode_guest<T: Thunk>(value: &T::Guest, bits: Bitness) -> Result<Vec<u8>, TranslateError> {
    let mut w = GuestWriter::guest(bits);
    T::write_guest(value, &mut w)?;
    w.align(T::layout(bits).align);
    Ok(w.into_bytes())
}

/// Read a guest-side value back out of guest-layout bytes.
pub fn decode_guest<T: Thunk>(bytes: &[u8], bits: Bitness) -> Result<T::Guest, TranslateError> {
    T::read_guest(&mut GuestReader::guest(bytes, bits))
}

/// Read one `T` from guest memory at `addr`, translating it for the host.
pub fn load<T: Thunk>(
    translator: &dyn AddressTranslator,
    addr: GuestAddr,
) -> Result<T, TranslateError> {
    let layout = T::layout(translator.bitness());
    let bytes = translator.read_bytes(addr, layout.size)?;
    T::read(&mut GuestReader::host(&bytes, translator))
}

/// Write one `T` into guest memory at `addr`, translating nested pointers.
pub fn store<T: Thunk>(
    translator: &dyn AddressTranslator,
    addr: GuestAddr,
    value: &T,
) -> Result<(), TranslateError> {
    let mut w = GuestWriter::host(translator);
    value.write(&mut w)?;
    w.align(T::layout(translator.bitness()).align);
    translator.write_bytes(addr, &w.into_bytes())
}
