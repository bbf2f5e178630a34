//! Packet framing rules: padding arithmetic and the KEXINIT validator.

use crate::kex::{build_kexinit, validate_kexinit};
use crate::packet::{MIN_PADDING, frame_packet, padding_for, wire_size};
use crate::wire::Writer;

#[test]
fn cleartext_padding_aligns_whole_packet_to_eight() {
    for payload_len in 0..128 {
        let pad = padding_for(payload_len, false);
        assert!(pad >= MIN_PADDING, "len {payload_len}");
        assert!(pad < MIN_PADDING + 8, "len {payload_len}");
        let total = 4 + 1 + payload_len + pad;
        assert_eq!(total % 8, 0, "len {payload_len}");
    }
}

#[test]
fn encrypted_padding_aligns_ciphertext_to_block() {
    for payload_len in 0..128 {
        let pad = padding_for(payload_len, true);
        assert!(pad >= MIN_PADDING, "len {payload_len}");
        assert!(pad < MIN_PADDING + 16, "len {payload_len}");
        // The length word is associated data, not ciphertext.
        let protected = 1 + payload_len + pad;
        assert_eq!(protected % 16, 0, "len {payload_len}");
    }
}

#[test]
fn frame_packet_layout() {
    let payload = [21u8]; // NEWKEYS
    let mut out = [0u8; 64];
    let mut fill = |pad: &mut [u8]| pad.fill(0xcc);
    let wire = frame_packet(&mut out, &payload, false, &mut fill).expect("fits");

    let packet_length = u32::from_be_bytes([out[0], out[1], out[2], out[3]]) as usize;
    let pad = out[4] as usize;
    assert_eq!(wire, 4 + packet_length);
    assert_eq!(packet_length, 1 + payload.len() + pad);
    assert_eq!(out[5], 21);
    assert!(out[6..wire].iter().all(|&b| b == 0xcc), "random padding");
    assert_eq!(wire_size(payload.len(), false), wire);
}

#[test]
fn frame_packet_rejects_short_buffer() {
    let payload = [0u8; 32];
    let mut out = [0u8; 16];
    let mut fill = |_: &mut [u8]| {};
    assert!(frame_packet(&mut out, &payload, false, &mut fill).is_none());
}

// =============================================================================
// KEXINIT validation
// =============================================================================

fn client_kexinit(
    kex: &[u8],
    host_key: &[u8],
    enc: &[u8],
    comp: &[u8],
    first_follows: bool,
) -> Vec<u8> {
    let mut buf = [0u8; 512];
    let mut w = Writer::new(&mut buf);
    w.u8(20);
    w.raw(&[0xab; 16]); // cookie
    w.string(kex);
    w.string(host_key);
    w.string(enc);
    w.string(enc);
    w.string(b"hmac-sha2-256"); // MACs are ignored for AEAD suites
    w.string(b"hmac-sha2-256");
    w.string(comp);
    w.string(comp);
    w.string(b"");
    w.string(b"");
    w.boolean(first_follows);
    w.u32(0);
    let len = w.finish().expect("fits");
    buf[..len].to_vec()
}

#[test]
fn kexinit_with_our_suite_passes() {
    let pkt = client_kexinit(
        b"curve25519-sha256,ecdh-sha2-nistp256",
        b"rsa-sha2-512,ssh-ed25519",
        b"chacha20-poly1305@openssh.com,aes128-gcm@openssh.com",
        b"none,zlib@openssh.com",
        false,
    );
    assert!(validate_kexinit(&pkt));
}

#[test]
fn kexinit_missing_kex_algorithm_fails() {
    let pkt = client_kexinit(
        b"ecdh-sha2-nistp256",
        b"ssh-ed25519",
        b"aes128-gcm@openssh.com",
        b"none",
        false,
    );
    assert!(!validate_kexinit(&pkt));
}

#[test]
fn kexinit_missing_cipher_fails() {
    let pkt = client_kexinit(
        b"curve25519-sha256",
        b"ssh-ed25519",
        b"aes128-ctr",
        b"none",
        false,
    );
    assert!(!validate_kexinit(&pkt));
}

#[test]
fn kexinit_guessed_packet_fails() {
    let pkt = client_kexinit(
        b"curve25519-sha256",
        b"ssh-ed25519",
        b"aes128-gcm@openssh.com",
        b"none",
        true,
    );
    assert!(!validate_kexinit(&pkt));
}

#[test]
fn kexinit_truncated_fails() {
    let pkt = client_kexinit(
        b"curve25519-sha256",
        b"ssh-ed25519",
        b"aes128-gcm@openssh.com",
        b"none",
        false,
    );
    assert!(!validate_kexinit(&pkt[..30]));
}

#[test]
fn our_kexinit_validates_against_ourselves() {
    let mut buf = [0u8; 256];
    let len = build_kexinit(&mut buf, &[0x11; 16]).expect("fits");
    assert!(validate_kexinit(&buf[..len]));
}
