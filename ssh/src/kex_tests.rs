//! Key-exchange message construction tests: blob layouts and the
//! transcript helper.

use crate::kex::{
    HOST_KEY_BLOB_SIZE, SIGNATURE_BLOB_SIZE, build_ecdh_reply, parse_ecdh_init,
    write_host_key_blob,
};
use crate::names::name_list_contains;
use crate::packet::{SSH_MSG_KEX_ECDH_INIT, SSH_MSG_KEX_ECDH_REPLY};
use crate::wire::{Reader, Writer};

#[test]
fn name_list_matching() {
    assert!(name_list_contains(b"curve25519-sha256", b"curve25519-sha256"));
    assert!(name_list_contains(
        b"ecdh-sha2-nistp256,curve25519-sha256,kex-strict-c-v00@openssh.com",
        b"curve25519-sha256"
    ));
    // Substrings are not matches.
    assert!(!name_list_contains(
        b"curve25519-sha256@libssh.org",
        b"curve25519-sha256"
    ));
    assert!(!name_list_contains(b"", b"curve25519-sha256"));
}

#[test]
fn ecdh_init_parses_exact_key_size() {
    let mut buf = [0u8; 64];
    let mut w = Writer::new(&mut buf);
    w.u8(SSH_MSG_KEX_ECDH_INIT);
    w.string(&[0x42; 32]);
    let len = w.finish().unwrap();
    assert_eq!(parse_ecdh_init(&buf[..len]), Some([0x42; 32]));
}

#[test]
fn ecdh_init_rejects_wrong_key_size() {
    let mut buf = [0u8; 64];
    let mut w = Writer::new(&mut buf);
    w.u8(SSH_MSG_KEX_ECDH_INIT);
    w.string(&[0x42; 31]);
    let len = w.finish().unwrap();
    assert_eq!(parse_ecdh_init(&buf[..len]), None);

    let mut w = Writer::new(&mut buf);
    w.u8(SSH_MSG_KEX_ECDH_INIT);
    w.string(&[0x42; 33]);
    let len = w.finish().unwrap();
    assert_eq!(parse_ecdh_init(&buf[..len]), None);
}

#[test]
fn host_key_blob_layout() {
    let mut blob = [0u8; HOST_KEY_BLOB_SIZE];
    let len = write_host_key_blob(&mut blob, &[0x7a; 32]).expect("fits exactly");
    assert_eq!(len, HOST_KEY_BLOB_SIZE, "51 bytes");

    let mut r = Reader::new(&blob);
    assert_eq!(r.string(), Some(&b"ssh-ed25519"[..]));
    assert_eq!(r.string(), Some(&[0x7a; 32][..]));
    assert_eq!(r.remaining(), 0);
}

#[test]
fn ecdh_reply_layout() {
    let mut blob = [0u8; HOST_KEY_BLOB_SIZE];
    write_host_key_blob(&mut blob, &[0x01; 32]).unwrap();

    let mut reply = [0u8; 256];
    let len = build_ecdh_reply(&mut reply, &blob, &[0x02; 32], &[0x03; 64]).expect("fits");

    let mut r = Reader::new(&reply[..len]);
    assert_eq!(r.u8(), Some(SSH_MSG_KEX_ECDH_REPLY));
    assert_eq!(r.string(), Some(&blob[..]));
    assert_eq!(r.string(), Some(&[0x02; 32][..]));

    let sig_blob = r.string().expect("signature blob");
    assert_eq!(sig_blob.len(), SIGNATURE_BLOB_SIZE, "83 bytes");
    let mut sr = Reader::new(sig_blob);
    assert_eq!(sr.string(), Some(&b"ssh-ed25519"[..]));
    assert_eq!(sr.string(), Some(&[0x03; 64][..]));
    assert_eq!(r.remaining(), 0);
}
