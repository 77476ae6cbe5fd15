//! `#[derive(Thunk)]` used from outside the crate, over real guest memory.

use ferry_abi::thunk::{decode_guest, encode_guest, load, store};
use ferry_abi::{
    AddressTranslator, Bitness, GuestAddr, GuestArena, GuestHandle, HostAddr, HostHandle, Thunk,
    TranslateError, WindowTranslator,
};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Thunk)]
struct Entry {
    name: HostAddr,
    owner: HostHandle,
    flags: u16,
    size: u32,
}

fn translator(bits: Bitness) -> WindowTranslator {
    let arena = Arc::new(GuestArena::windowed(4096, 0x1000_0000).unwrap());
    WindowTranslator::new(arena, bits).unwrap()
}

#[test]
fn test_layout_follows_pointer_width() {
    let narrow = Entry::layout(Bitness::B32);
    assert_eq!((narrow.size, narrow.align), (16, 4));
    let wide = Entry::layout(Bitness::B64);
    assert_eq!((wide.size, wide.align), (24, 8));
}

#[test]
fn test_store_translates_nested_fields() {
    for bits in [Bitness::B32, Bitness::B64] {
        let t = translator(bits);
        let name = GuestAddr(0x1000_0100);
        let entry = Entry {
            name: t.to_host(name).unwrap(),
            owner: HostHandle(u64::MAX),
            flags: 7,
            size: 99,
        };
        let at = GuestAddr(0x1000_0200);
        store(&t, at, &entry).unwrap();

        let bytes = t.read_bytes(at, Entry::layout(bits).size).unwrap();
        let guest = decode_guest::<Entry>(&bytes, bits).unwrap();
        assert_eq!(guest.name, name, "{}", bits);
        let pseudo = match bits {
            Bitness::B32 => GuestHandle(0xffff_ffff),
            Bitness::B64 => GuestHandle(u64::MAX),
        };
        assert_eq!(guest.owner, pseudo);
        assert_eq!((guest.flags, guest.size), (7, 99));

        assert_eq!(load::<Entry>(&t, at).unwrap(), entry);
    }
}

#[test]
fn test_null_pointer_field_stays_null() {
    let t = translator(Bitness::B32);
    let guest = EntryGuest {
        name: GuestAddr::NULL,
        owner: GuestHandle::NULL,
        flags: 0,
        size: 0,
    };
    let at = GuestAddr(0x1000_0040);
    t.write_bytes(at, &encode_guest::<Entry>(&guest, Bitness::B32).unwrap())
        .unwrap();
    let entry = load::<Entry>(&t, at).unwrap();
    assert_eq!(entry.name, HostAddr::NULL);
    assert_eq!(entry.owner, HostHandle::NULL);
}

#[test]
fn test_unmapped_nested_pointer_is_reported() {
    let t = translator(Bitness::B32);
    let guest = EntryGuest {
        name: GuestAddr(0x5000_0000),
        owner: GuestHandle(1),
        flags: 0,
        size: 0,
    };
    let at = GuestAddr(0x1000_0080);
    t.write_bytes(at, &encode_guest::<Entry>(&guest, Bitness::B32).unwrap())
        .unwrap();
    assert!(matches!(
        load::<Entry>(&t, at),
        Err(TranslateError::Unmapped {
            addr: 0x5000_0000,
            ..
        })
    ));
}
