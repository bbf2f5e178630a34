//! Reader/Writer cursor tests.

use crate::wire::{Reader, Writer};

#[test]
fn reader_walks_fields() {
    let buf = [
        0x05, // u8
        0x00, 0x00, 0x00, 0x03, b'a', b'b', b'c', // string
        0x01, // boolean
        0xde, 0xad, // trailing bytes
    ];
    let mut r = Reader::new(&buf);
    assert_eq!(r.u8(), Some(5));
    assert_eq!(r.string(), Some(&b"abc"[..]));
    assert_eq!(r.boolean(), Some(true));
    assert_eq!(r.remaining(), 2);
    assert_eq!(r.bytes(2), Some(&[0xde, 0xad][..]));
    assert_eq!(r.u8(), None);
}

#[test]
fn reader_rejects_truncated_string() {
    let buf = [0x00, 0x00, 0x00, 0x10, b'x'];
    let mut r = Reader::new(&buf);
    assert_eq!(r.string(), None);
}

#[test]
fn reader_rejects_truncated_u32() {
    let mut r = Reader::new(&[0x00, 0x01]);
    assert_eq!(r.u32(), None);
}

#[test]
fn writer_round_trips() {
    let mut buf = [0u8; 64];
    let mut w = Writer::new(&mut buf);
    w.u8(31);
    w.u32(0xdead_beef);
    w.string(b"ssh-ed25519");
    w.boolean(false);
    let len = w.finish().expect("fits");

    let mut r = Reader::new(&buf[..len]);
    assert_eq!(r.u8(), Some(31));
    assert_eq!(r.u32(), Some(0xdead_beef));
    assert_eq!(r.string(), Some(&b"ssh-ed25519"[..]));
    assert_eq!(r.boolean(), Some(false));
    assert_eq!(r.remaining(), 0);
}

#[test]
fn writer_overflow_is_latched() {
    let mut buf = [0u8; 4];
    let mut w = Writer::new(&mut buf);
    w.u32(1);
    w.u8(2); // overflows
    assert_eq!(w.finish(), None);
}
