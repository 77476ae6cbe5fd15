//! Field shapes: how one parameter of an operation is packed into record
//! fields by the guest stub and unpacked, translated, by the host handler.
//!
//! | shape | fields | host receives |
//! |---|---|---|
//! | scalars, [`ObjectHandle`], [`Iid`] | 1 | the value |
//! | [`Handle`] | 1 | [`HostHandle`], sign-extended for 32-bit guests |
//! | [`Ptr<T, In>`] | 1 | `Option<T>` read from guest memory |
//! | [`Ptr<T, Out>`] | 1 | [`OutRef<T>`] |
//! | [`Ptr<T, InOut>`] | 1 | [`InOutRef<T>`], written back on drop |
//! | [`Array<T, D>`] | 2 | `Vec<T>`, [`OutArray<T>`] or [`InOutArray<T>`] |
//! | [`PtrArray<T, D>`] | 2 | `Vec<Option<T>>`, [`OutPtrArray<T>`] or [`InOutPtrArray<T>`] |
//! | [`Callback`] | 1 | `Option<GuestCallback>`; null stays null |
//! | [`Text`] | 1 | `Option<String>` from a NUL-terminated UTF-16 string |

use crate::callback::GuestCallback;
use crate::dispatch::CallContext;
use crate::error::TranslateError;
use crate::status::{Iid, ObjectHandle};
use crate::thunk::{self, GuestReader, GuestWriter, Thunk};
use crate::translate::{
    AddressTranslator, GuestAddr, GuestHandle, HostAddr, HostHandle, Translated,
};
use serde::Serialize;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Longest array a single record may describe.
pub const MAX_ARRAY_LEN: u64 = 1 << 20;

/// Longest string a [`Text`] parameter may carry, in UTF-16 code units.
pub const MAX_TEXT_LEN: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShapeKind {
    Scalar,
    Handle,
    Struct,
    NestedStruct,
    Array,
    PointerArray,
    Callback,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    In,
    Out,
    InOut,
}

/// Direction marker for pointer shapes.
pub trait Dir {
    const DIRECTION: Direction;
}

/// Read by the host only.
pub struct In;
/// Written by the host only.
pub struct Out;
/// Read, then written back.
pub struct InOut;

impl Dir for In {
    const DIRECTION: Direction = Direction::In;
}
impl Dir for Out {
    const DIRECTION: Direction = Direction::Out;
}
impl Dir for InOut {
    const DIRECTION: Direction = Direction::InOut;
}

/// One parameter's encoding.
pub trait Shape {
    /// What the guest passes to the stub.
    type Guest;
    /// What the host implementation receives.
    type Host;

    const KIND: ShapeKind;
    const DIRECTION: Direction = Direction::In;
    const FIELDS: usize = 1;

    fn encode(value: Self::Guest, fields: &mut [u64]);

    fn decode(fields: &[u64], cx: &CallContext) -> Result<Self::Host, TranslateError>;
}

macro_rules! scalar_shape {
    ($($ty:ty),*) => {$(
        impl Shape for $ty {
            type Guest = $ty;
            type Host = $ty;
            const KIND: ShapeKind = ShapeKind::Scalar;

            fn encode(value: $ty, fields: &mut [u64]) {
                fields[0] = value as u64;
            }

            fn decode(fields: &[u64], _cx: &CallContext) -> Result<$ty, TranslateError> {
                Ok(fields[0] as $ty)
            }
        }
    )*};
}

scalar_shape!(u8, u16, i32, u32, i64, u64);

impl Shape for bool {
    type Guest = bool;
    type Host = bool;
    const KIND: ShapeKind = ShapeKind::Scalar;

    fn encode(value: bool, fields: &mut [u64]) {
        fields[0] = value as u64;
    }

    fn decode(fields: &[u64], _cx: &CallContext) -> Result<bool, TranslateError> {
        Ok(fields[0] != 0)
    }
}

impl Shape for ObjectHandle {
    type Guest = ObjectHandle;
    type Host = ObjectHandle;
    const KIND: ShapeKind = ShapeKind::Scalar;

    fn encode(value: ObjectHandle, fields: &mut [u64]) {
        fields[0] = value.0;
    }

    fn decode(fields: &[u64], _cx: &CallContext) -> Result<ObjectHandle, TranslateError> {
        Ok(ObjectHandle(fields[0]))
    }
}

impl Shape for Iid {
    type Guest = Iid;
    type Host = Iid;
    const KIND: ShapeKind = ShapeKind::Scalar;

    fn encode(value: Iid, fields: &mut [u64]) {
        fields[0] = value.0;
    }

    fn decode(fields: &[u64], _cx: &CallContext) -> Result<Iid, TranslateError> {
        Ok(Iid(fields[0]))
    }
}

/// Opaque API handle (window, device context, brush).
pub struct Handle;

impl Shape for Handle {
    type Guest = GuestHandle;
    type Host = HostHandle;
    const KIND: ShapeKind = ShapeKind::Handle;

    fn encode(value: GuestHandle, fields: &mut [u64]) {
        fields[0] = value.raw();
    }

    fn decode(fields: &[u64], cx: &CallContext) -> Result<HostHandle, TranslateError> {
        Ok(cx.translator().handle_to_host(GuestHandle(fields[0])))
    }
}

/// Pointer to a single `T`.
pub struct Ptr<T, D = In>(PhantomData<(T, D)>);

const fn struct_kind(nested: bool) -> ShapeKind {
    if nested {
        ShapeKind::NestedStruct
    } else {
        ShapeKind::Struct
    }
}

impl<T: Thunk> Shape for Ptr<T, In> {
    type Guest = GuestAddr;
    type Host = Option<T>;
    const KIND: ShapeKind = struct_kind(T::NESTED);

    fn encode(value: GuestAddr, fields: &mut [u64]) {
        fields[0] = value.raw();
    }

    fn decode(fields: &[u64], cx: &CallContext) -> Result<Option<T>, TranslateError> {
        let addr = GuestAddr(fields[0]);
        if addr.is_null() {
            return Ok(None);
        }
        thunk::load(&**cx.translator(), addr).map(Some)
    }
}

impl<T: Thunk> Shape for Ptr<T, Out> {
    type Guest = GuestAddr;
    type Host = OutRef<T>;
    const KIND: ShapeKind = struct_kind(T::NESTED);
    const DIRECTION: Direction = Direction::Out;

    fn encode(value: GuestAddr, fields: &mut [u64]) {
        fields[0] = value.raw();
    }

    fn decode(fields: &[u64], cx: &CallContext) -> Result<OutRef<T>, TranslateError> {
        OutRef::new(GuestAddr(fields[0]), cx)
    }
}

impl<T: Thunk> Shape for Ptr<T, InOut> {
    type Guest = GuestAddr;
    type Host = InOutRef<T>;
    const KIND: ShapeKind = struct_kind(T::NESTED);
    const DIRECTION: Direction = Direction::InOut;

    fn encode(value: GuestAddr, fields: &mut [u64]) {
        fields[0] = value.raw();
    }

    fn decode(fields: &[u64], cx: &CallContext) -> Result<InOutRef<T>, TranslateError> {
        let out = OutRef::new(GuestAddr(fields[0]), cx)?;
        let value = match out.target {
            Some(target) => Some(thunk::load(&*out.translator, target.guest)?),
            None => None,
        };
        Ok(InOutRef {
            value,
            out,
            committed: false,
        })
    }
}

/// Destination of an out-pointer, checked at decode time.
pub struct OutRef<T> {
    target: Option<Translated>,
    translator: Arc<dyn AddressTranslator>,
    _marker: PhantomData<T>,
}

impl<T: Thunk> OutRef<T> {
    fn new(addr: GuestAddr, cx: &CallContext) -> Result<Self, TranslateError> {
        let translator = Arc::clone(cx.translator());
        let target = if addr.is_null() {
            None
        } else {
            let size = T::layout(translator.bitness()).size;
            let host = translator.to_host_range(addr, size)?;
            Some(Translated { guest: addr, host })
        };
        Ok(Self {
            target,
            translator,
            _marker: PhantomData,
        })
    }

    pub fn is_null(&self) -> bool {
        self.target.is_none()
    }

    pub fn target(&self) -> Option<Translated> {
        self.target
    }

    pub fn write(&self, value: &T) -> Result<(), TranslateError> {
        let target = self
            .target
            .ok_or(TranslateError::Null(T::layout(self.translator.bitness()).size))?;
        thunk::store(&*self.translator, target.guest, value)
    }
}

/// An in/out struct: read before the call, written back when dropped or
/// committed.
pub struct InOutRef<T: Thunk> {
    value: Option<T>,
    out: OutRef<T>,
    committed: bool,
}

impl<T: Thunk> InOutRef<T> {
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.value.as_mut()
    }

    pub fn is_null(&self) -> bool {
        self.out.is_null()
    }

    /// The translator the value came through, for checking pointers nested
    /// inside it.
    pub fn translator(&self) -> &Arc<dyn AddressTranslator> {
        &self.out.translator
    }

    /// Write back now and report failure instead of logging it.
    pub fn commit(mut self) -> Result<(), TranslateError> {
        self.committed = true;
        self.flush()
    }

    fn flush(&self) -> Result<(), TranslateError> {
        match &self.value {
            Some(value) => self.out.write(value),
            None => Ok(()),
        }
    }
}

impl<T: Thunk> Drop for InOutRef<T> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = self.flush() {
            log::warn!("in/out parameter write-back failed: {}", err);
        }
    }
}

/// Guest-side description of an array argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestSlice {
    pub addr: GuestAddr,
    /// Element count for inputs, capacity for outputs.
    pub len: usize,
}

impl GuestSlice {
    pub const EMPTY: Self = Self {
        addr: GuestAddr::NULL,
        len: 0,
    };

    pub fn new(addr: GuestAddr, len: usize) -> Self {
        Self { addr, len }
    }
}

fn encode_slice(value: GuestSlice, fields: &mut [u64]) {
    fields[0] = value.len as u64;
    fields[1] = value.addr.raw();
}

/// Validate `[count, pointer]` fields. `None` for an empty array.
fn array_target(fields: &[u64]) -> Result<Option<(GuestAddr, usize)>, TranslateError> {
    let count = fields[0];
    let addr = GuestAddr(fields[1]);
    if count > MAX_ARRAY_LEN {
        return Err(TranslateError::TooLarge {
            count,
            limit: MAX_ARRAY_LEN,
        });
    }
    if count == 0 {
        return Ok(None);
    }
    if addr.is_null() {
        return Err(TranslateError::NullArray(count));
    }
    Ok(Some((addr, count as usize)))
}

fn read_elements<T: Thunk>(
    translator: &dyn AddressTranslator,
    addr: GuestAddr,
    count: usize,
) -> Result<Vec<T>, TranslateError> {
    let stride = T::layout(translator.bitness()).size;
    let bytes = translator.read_bytes(addr, stride * count)?;
    let mut reader = GuestReader::host(&bytes, translator);
    (0..count).map(|_| T::read(&mut reader)).collect()
}

fn write_elements<T: Thunk>(
    translator: &dyn AddressTranslator,
    addr: GuestAddr,
    items: &[T],
) -> Result<(), TranslateError> {
    let layout = T::layout(translator.bitness());
    let mut writer = GuestWriter::host(translator);
    for item in items {
        item.write(&mut writer)?;
        writer.align(layout.align);
    }
    translator.write_bytes(addr, &writer.into_bytes())
}

/// Pointer plus element count.
///
/// Outputs use the count as the capacity; the operation reports how many
/// elements it wrote through its own result.
pub struct Array<T, D = In>(PhantomData<(T, D)>);

impl<T: Thunk> Shape for Array<T, In> {
    type Guest = GuestSlice;
    type Host = Vec<T>;
    const KIND: ShapeKind = ShapeKind::Array;
    const FIELDS: usize = 2;

    fn encode(value: GuestSlice, fields: &mut [u64]) {
        encode_slice(value, fields);
    }

    fn decode(fields: &[u64], cx: &CallContext) -> Result<Vec<T>, TranslateError> {
        match array_target(fields)? {
            Some((addr, count)) => read_elements(&**cx.translator(), addr, count),
            None => Ok(Vec::new()),
        }
    }
}

impl<T: Thunk> Shape for Array<T, Out> {
    type Guest = GuestSlice;
    type Host = OutArray<T>;
    const KIND: ShapeKind = ShapeKind::Array;
    const DIRECTION: Direction = Direction::Out;
    const FIELDS: usize = 2;

    fn encode(value: GuestSlice, fields: &mut [u64]) {
        encode_slice(value, fields);
    }

    fn decode(fields: &[u64], cx: &CallContext) -> Result<OutArray<T>, TranslateError> {
        let translator = Arc::clone(cx.translator());
        let (target, capacity) = match array_target(fields)? {
            Some((addr, capacity)) => {
                let stride = T::layout(translator.bitness()).size;
                let host = translator.to_host_range(addr, stride * capacity)?;
                (Some(Translated { guest: addr, host }), capacity)
            }
            None => (None, 0),
        };
        Ok(OutArray {
            target,
            capacity,
            translator,
            _marker: PhantomData,
        })
    }
}

impl<T: Thunk> Shape for Array<T, InOut> {
    type Guest = GuestSlice;
    type Host = InOutArray<T>;
    const KIND: ShapeKind = ShapeKind::Array;
    const DIRECTION: Direction = Direction::InOut;
    const FIELDS: usize = 2;

    fn encode(value: GuestSlice, fields: &mut [u64]) {
        encode_slice(value, fields);
    }

    fn decode(fields: &[u64], cx: &CallContext) -> Result<InOutArray<T>, TranslateError> {
        let translator = Arc::clone(cx.translator());
        let (target, items) = match array_target(fields)? {
            Some((addr, count)) => (Some(addr), read_elements(&*translator, addr, count)?),
            None => (None, Vec::new()),
        };
        Ok(InOutArray {
            items,
            target,
            translator,
            committed: false,
        })
    }
}

/// Fixed-capacity output array.
pub struct OutArray<T> {
    target: Option<Translated>,
    capacity: usize,
    translator: Arc<dyn AddressTranslator>,
    _marker: PhantomData<T>,
}

impl<T: Thunk> OutArray<T> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn target(&self) -> Option<Translated> {
        self.target
    }

    pub fn translator(&self) -> &Arc<dyn AddressTranslator> {
        &self.translator
    }

    /// Write up to `capacity` leading elements of `items`; returns how many
    /// were written. Nothing past the capacity is touched.
    pub fn fill(&self, items: &[T]) -> Result<usize, TranslateError> {
        let count = items.len().min(self.capacity);
        let target = match self.target {
            Some(target) if count > 0 => target,
            _ => return Ok(0),
        };
        write_elements(&*self.translator, target.guest, &items[..count])?;
        Ok(count)
    }
}

/// In/out array, written back element-wise when dropped or committed.
pub struct InOutArray<T: Thunk> {
    items: Vec<T>,
    target: Option<GuestAddr>,
    translator: Arc<dyn AddressTranslator>,
    committed: bool,
}

impl<T: Thunk> InOutArray<T> {
    pub fn commit(mut self) -> Result<(), TranslateError> {
        self.committed = true;
        self.flush()
    }

    fn flush(&self) -> Result<(), TranslateError> {
        match self.target {
            Some(addr) => write_elements(&*self.translator, addr, &self.items),
            None => Ok(()),
        }
    }
}

impl<T: Thunk> Deref for InOutArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T: Thunk> DerefMut for InOutArray<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.items
    }
}

impl<T: Thunk> Drop for InOutArray<T> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = self.flush() {
            log::warn!("in/out array write-back failed: {}", err);
        }
    }
}

/// Pointer to an array of pointers to `T`. Both the array entries and every
/// pointee are translated.
pub struct PtrArray<T, D = In>(PhantomData<(T, D)>);

fn read_pointer_array<T: Thunk>(
    translator: &dyn AddressTranslator,
    addr: GuestAddr,
    count: usize,
) -> Result<(Vec<GuestAddr>, Vec<Option<T>>), TranslateError> {
    let word = translator.bitness().word_size();
    let bytes = translator.read_bytes(addr, word * count)?;
    let mut reader = GuestReader::guest(&bytes, translator.bitness());
    let mut pointers = Vec::with_capacity(count);
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let element = GuestAddr(reader.word()?);
        let item = if element.is_null() {
            None
        } else {
            Some(thunk::load(translator, element)?)
        };
        pointers.push(element);
        items.push(item);
    }
    Ok((pointers, items))
}

impl<T: Thunk> Shape for PtrArray<T, In> {
    type Guest = GuestSlice;
    type Host = Vec<Option<T>>;
    const KIND: ShapeKind = ShapeKind::PointerArray;
    const FIELDS: usize = 2;

    fn encode(value: GuestSlice, fields: &mut [u64]) {
        encode_slice(value, fields);
    }

    fn decode(fields: &[u64], cx: &CallContext) -> Result<Vec<Option<T>>, TranslateError> {
        match array_target(fields)? {
            Some((addr, count)) => Ok(read_pointer_array(&**cx.translator(), addr, count)?.1),
            None => Ok(Vec::new()),
        }
    }
}

impl<T: Thunk> Shape for PtrArray<T, InOut> {
    type Guest = GuestSlice;
    type Host = InOutPtrArray<T>;
    const KIND: ShapeKind = ShapeKind::PointerArray;
    const DIRECTION: Direction = Direction::InOut;
    const FIELDS: usize = 2;

    fn encode(value: GuestSlice, fields: &mut [u64]) {
        encode_slice(value, fields);
    }

    fn decode(fields: &[u64], cx: &CallContext) -> Result<InOutPtrArray<T>, TranslateError> {
        let translator = Arc::clone(cx.translator());
        let (pointers, items) = match array_target(fields)? {
            Some((addr, count)) => read_pointer_array(&*translator, addr, count)?,
            None => (Vec::new(), Vec::new()),
        };
        Ok(InOutPtrArray {
            items,
            pointers,
            translator,
            committed: false,
        })
    }
}

impl<T: Thunk> Shape for PtrArray<T, Out> {
    type Guest = GuestSlice;
    type Host = OutPtrArray<T>;
    const KIND: ShapeKind = ShapeKind::PointerArray;
    const DIRECTION: Direction = Direction::Out;
    const FIELDS: usize = 2;

    fn encode(value: GuestSlice, fields: &mut [u64]) {
        encode_slice(value, fields);
    }

    fn decode(fields: &[u64], cx: &CallContext) -> Result<OutPtrArray<T>, TranslateError> {
        let translator = Arc::clone(cx.translator());
        let (target, capacity) = match array_target(fields)? {
            Some((addr, capacity)) => {
                let word = translator.bitness().word_size();
                let host = translator.to_host_range(addr, word * capacity)?;
                (Some(Translated { guest: addr, host }), capacity)
            }
            None => (None, 0),
        };
        Ok(OutPtrArray {
            target,
            capacity,
            translator,
            _marker: PhantomData,
        })
    }
}

/// Fixed-capacity output array of pointers to `T`.
///
/// The host hands over host addresses; each entry is translated back and
/// stored in the guest's word size.
pub struct OutPtrArray<T> {
    target: Option<Translated>,
    capacity: usize,
    translator: Arc<dyn AddressTranslator>,
    _marker: PhantomData<T>,
}

impl<T: Thunk> OutPtrArray<T> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn target(&self) -> Option<Translated> {
        self.target
    }

    /// The translator the pointers came through.
    pub fn translator(&self) -> &Arc<dyn AddressTranslator> {
        &self.translator
    }

    /// Write up to `capacity` leading entries of `pointers`; returns how
    /// many were written. Every non-null entry must point at a whole `T` the
    /// guest can reach, otherwise nothing is written.
    pub fn fill(&self, pointers: &[HostAddr]) -> Result<usize, TranslateError> {
        let count = pointers.len().min(self.capacity);
        let target = match self.target {
            Some(target) if count > 0 => target,
            _ => return Ok(0),
        };
        let translator = &*self.translator;
        let size = T::layout(translator.bitness()).size;
        let mut writer = GuestWriter::host(translator);
        for &pointer in &pointers[..count] {
            let guest = translator.to_guest(pointer)?;
            if !guest.is_null() {
                translator.to_host_range(guest, size)?;
            }
            writer.word(guest.raw())?;
        }
        translator.write_bytes(target.guest, &writer.into_bytes())?;
        Ok(count)
    }
}

/// In/out pointer array; each non-null pointee is written back in place.
pub struct InOutPtrArray<T: Thunk> {
    items: Vec<Option<T>>,
    pointers: Vec<GuestAddr>,
    translator: Arc<dyn AddressTranslator>,
    committed: bool,
}

impl<T: Thunk> InOutPtrArray<T> {
    /// The translator the pointees came through.
    pub fn translator(&self) -> &Arc<dyn AddressTranslator> {
        &self.translator
    }

    pub fn commit(mut self) -> Result<(), TranslateError> {
        self.committed = true;
        self.flush()
    }

    fn flush(&self) -> Result<(), TranslateError> {
        for (item, addr) in self.items.iter().zip(&self.pointers) {
            if let Some(item) = item {
                thunk::store(&*self.translator, *addr, item)?;
            }
        }
        Ok(())
    }
}

impl<T: Thunk> Deref for InOutPtrArray<T> {
    type Target = [Option<T>];

    fn deref(&self) -> &[Option<T>] {
        &self.items
    }
}

impl<T: Thunk> DerefMut for InOutPtrArray<T> {
    fn deref_mut(&mut self) -> &mut [Option<T>] {
        &mut self.items
    }
}

impl<T: Thunk> Drop for InOutPtrArray<T> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = self.flush() {
            log::warn!("pointer array write-back failed: {}", err);
        }
    }
}

/// Guest function pointer. A null pointer reaches the host as `None`.
pub struct Callback;

impl Shape for Callback {
    type Guest = GuestAddr;
    type Host = Option<GuestCallback>;
    const KIND: ShapeKind = ShapeKind::Callback;

    fn encode(value: GuestAddr, fields: &mut [u64]) {
        fields[0] = value.raw();
    }

    fn decode(fields: &[u64], cx: &CallContext) -> Result<Option<GuestCallback>, TranslateError> {
        let entry = GuestAddr(fields[0]);
        if entry.is_null() {
            return Ok(None);
        }
        Ok(Some(GuestCallback::new(entry, cx)))
    }
}

/// NUL-terminated UTF-16 string.
pub struct Text;

impl Shape for Text {
    type Guest = GuestAddr;
    type Host = Option<String>;
    const KIND: ShapeKind = ShapeKind::Text;

    fn encode(value: GuestAddr, fields: &mut [u64]) {
        fields[0] = value.raw();
    }

    fn decode(fields: &[u64], cx: &CallContext) -> Result<Option<String>, TranslateError> {
        let addr = GuestAddr(fields[0]);
        if addr.is_null() {
            return Ok(None);
        }
        let translator = cx.translator();
        let mut units = Vec::new();
        for i in 0..MAX_TEXT_LEN as u64 {
            let bytes = translator.read_bytes(addr.offset(i * 2), 2)?;
            let unit = u16::from_le_bytes([bytes[0], bytes[1]]);
            if unit == 0 {
                return Ok(Some(String::from_utf16_lossy(&units)));
            }
            units.push(unit);
        }
        Err(TranslateError::Unterminated(addr.raw()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, GUEST_BASE};

    fn decode<S: Shape>(value: S::Guest, cx: &CallContext) -> Result<S::Host, TranslateError> {
        let mut fields = vec![0u64; S::FIELDS];
        S::encode(value, &mut fields);
        S::decode(&fields, cx)
    }

    #[test]
    fn test_scalar_round_trip() {
        let cx = context();
        assert_eq!(decode::<i32>(-7, &cx).unwrap(), -7);
        assert_eq!(decode::<u64>(u64::MAX, &cx).unwrap(), u64::MAX);
        assert!(decode::<bool>(true, &cx).unwrap());
        assert_eq!(decode::<Iid>(Iid(5), &cx).unwrap(), Iid(5));
    }

    #[test]
    fn test_handle_is_sign_extended() {
        let cx = context();
        assert_eq!(
            decode::<Handle>(GuestHandle(0xffff_fffe), &cx).unwrap(),
            HostHandle((-2i64) as u64)
        );
    }

    #[test]
    fn test_ptr_in_reads_struct() {
        let cx = context();
        let addr = cx.scratch().alloc_value(&[3i32, 4]).unwrap();
        assert_eq!(decode::<Ptr<[i32; 2]>>(addr, &cx).unwrap(), Some([3, 4]));
        assert_eq!(decode::<Ptr<[i32; 2]>>(GuestAddr::NULL, &cx).unwrap(), None);
        assert!(decode::<Ptr<[i32; 2]>>(GuestAddr(0x10), &cx).is_err());
    }

    #[test]
    fn test_ptr_out_checks_range_up_front() {
        let cx = context();
        let end = GuestAddr(GUEST_BASE + cx.scratch().size() as u64 - 4);
        assert!(matches!(
            decode::<Ptr<u64, Out>>(end, &cx),
            Err(TranslateError::Unmapped { .. })
        ));
        let out = decode::<Ptr<u64, Out>>(GuestAddr::NULL, &cx).unwrap();
        assert!(out.is_null());
        assert_eq!(out.write(&1), Err(TranslateError::Null(8)));
    }

    #[test]
    fn test_inout_writes_back_on_drop() {
        let cx = context();
        let addr = cx.scratch().alloc_value(&10u32).unwrap();
        {
            let mut value = decode::<Ptr<u32, InOut>>(addr, &cx).unwrap();
            *value.get_mut().unwrap() += 5;
        }
        assert_eq!(cx.scratch().read::<u32>(addr).unwrap(), 15);
    }

    #[test]
    fn test_array_in_validation() {
        let cx = context();
        let err = decode::<Array<u16>>(GuestSlice::new(GuestAddr::NULL, 3), &cx).unwrap_err();
        assert_eq!(err, TranslateError::NullArray(3));
        let err = decode::<Array<u16>>(GuestSlice::new(GuestAddr(GUEST_BASE), 1 << 21), &cx)
            .unwrap_err();
        assert!(matches!(err, TranslateError::TooLarge { .. }));
        assert!(decode::<Array<u16>>(GuestSlice::EMPTY, &cx).unwrap().is_empty());
    }

    #[test]
    fn test_out_array_truncates() {
        let cx = context();
        let addr = cx.scratch().alloc_slice(&[0xeeu8; 8]).unwrap();
        let out = decode::<Array<u8, Out>>(GuestSlice::new(addr, 4), &cx).unwrap();
        assert_eq!(out.capacity(), 4);
        assert_eq!(out.fill(&[1, 2, 3, 4, 5, 6]).unwrap(), 4);
        assert_eq!(
            cx.scratch().read_slice::<u8>(addr, 8).unwrap(),
            vec![1, 2, 3, 4, 0xee, 0xee, 0xee, 0xee]
        );
    }

    #[test]
    fn test_inout_array_commit() {
        let cx = context();
        let addr = cx.scratch().alloc_slice(&[1i32, 2, 3]).unwrap();
        let mut items = decode::<Array<i32, InOut>>(GuestSlice::new(addr, 3), &cx).unwrap();
        items.iter_mut().for_each(|v| *v *= 10);
        items.commit().unwrap();
        assert_eq!(cx.scratch().read_slice::<i32>(addr, 3).unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn test_pointer_array_with_null_entry() {
        let cx = context();
        let arena = cx.scratch();
        let a = arena.alloc_value(&11u32).unwrap();
        let b = arena.alloc_value(&22u32).unwrap();
        let table = arena
            .alloc_slice(&[a.raw() as u32, 0, b.raw() as u32])
            .unwrap();
        let items = decode::<PtrArray<u32>>(GuestSlice::new(table, 3), &cx).unwrap();
        assert_eq!(items, vec![Some(11), None, Some(22)]);
    }

    #[test]
    fn test_out_pointer_array_translates_entries_back() {
        let cx = context();
        let arena = cx.scratch();
        let a = arena.alloc_value(&1u32).unwrap();
        let b = arena.alloc_value(&2u32).unwrap();
        let table = arena.alloc_slice(&[0xeeee_eeeeu32; 4]).unwrap();
        let host = |addr| cx.translator().to_host(addr).unwrap();

        let out = decode::<PtrArray<u32, Out>>(GuestSlice::new(table, 3), &cx).unwrap();
        assert_eq!(out.capacity(), 3);
        let written = out
            .fill(&[host(b), HostAddr::NULL, host(a), host(b)])
            .unwrap();
        assert_eq!(written, 3);
        assert_eq!(
            arena.read_slice::<u32>(table, 4).unwrap(),
            vec![b.raw() as u32, 0, a.raw() as u32, 0xeeee_eeee]
        );
    }

    #[test]
    fn test_out_pointer_array_rejects_unreachable_entry() {
        let cx = context();
        let arena = cx.scratch();
        let a = arena.alloc_value(&1u32).unwrap();
        let table = arena.alloc_slice(&[0u32; 2]).unwrap();
        let outside = 7u32;
        let out = decode::<PtrArray<u32, Out>>(GuestSlice::new(table, 2), &cx).unwrap();

        let err = out
            .fill(&[
                cx.translator().to_host(a).unwrap(),
                HostAddr::from_ptr(&outside),
            ])
            .unwrap_err();
        assert!(matches!(err, TranslateError::Unreachable(_)));
        // nothing was written, not even the good entry
        assert_eq!(arena.read_slice::<u32>(table, 2).unwrap(), vec![0, 0]);

        // a pointee straddling the end of guest memory is refused too
        let last = arena.host_base().offset(arena.size() as u64 - 2);
        assert!(out.fill(&[last]).is_err());
    }

    #[test]
    fn test_null_callback_stays_null() {
        let cx = context();
        assert!(decode::<Callback>(GuestAddr::NULL, &cx).unwrap().is_none());
        let cb = decode::<Callback>(GuestAddr(0x7f00_0000), &cx).unwrap().unwrap();
        assert_eq!(cb.entry(), GuestAddr(0x7f00_0000));
    }

    #[test]
    fn test_text() {
        let cx = context();
        let addr = cx.scratch().alloc_wide("caption").unwrap();
        assert_eq!(decode::<Text>(addr, &cx).unwrap().as_deref(), Some("caption"));
        assert_eq!(decode::<Text>(GuestAddr::NULL, &cx).unwrap(), None);
    }

    #[test]
    fn test_descriptor_constants() {
        assert_eq!(<Ptr<u32, InOut> as Shape>::DIRECTION, Direction::InOut);
        assert_eq!(<Array<u16, Out> as Shape>::FIELDS, 2);
        assert_eq!(<Ptr<u32> as Shape>::KIND, ShapeKind::Struct);
        assert_eq!(<Ptr<crate::translate::HostAddr> as Shape>::KIND, ShapeKind::NestedStruct);
    }
}
