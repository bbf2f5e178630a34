//! Key exchange messages: KEXINIT validation and construction, the
//! ECDH reply, and the exchange-hash transcript.
//!
//! The server supports exactly one algorithm per slot, so "negotiation"
//! is a containment check: each client name-list must include our
//! algorithm, and `first_kex_packet_follows` must be false (a guessed
//! packet for a different suite would desynchronise the stream).

use embernet_crypto::{CryptoEngine, ECDH_KEY_SIZE, ED25519_SIGNATURE_SIZE};

use crate::names::{
    COMPRESSION_ALGORITHM, ENCRYPTION_ALGORITHM, HOST_KEY_ALGORITHM, KEX_ALGORITHM, MAC_ALGORITHM,
    name_list_contains,
};
use crate::packet::{SSH_MSG_KEX_ECDH_REPLY, SSH_MSG_KEXINIT};
use crate::wire::{Reader, Writer};

/// Host-key blob: `string "ssh-ed25519" + string public_key`.
pub const HOST_KEY_BLOB_SIZE: usize = 4 + 11 + 4 + 32;

/// Signature blob: `string "ssh-ed25519" + string signature`.
pub const SIGNATURE_BLOB_SIZE: usize = 4 + 11 + 4 + 64;

/// Validates a client KEXINIT payload (`payload` starts at the type byte).
///
/// Checks that every negotiated slot can land on our sole cipher suite.
/// The MAC lists are ignored: AEAD modes carry no separate MAC and
/// clients are not obliged to advertise "none".  Language lists are
/// ignored too.
pub fn validate_kexinit(payload: &[u8]) -> bool {
    let mut r = Reader::new(payload);
    if r.u8() != Some(SSH_MSG_KEXINIT) {
        return false;
    }
    if r.bytes(16).is_none() {
        return false; // cookie
    }

    let Some(kex) = r.string() else { return false };
    let Some(host_key) = r.string() else { return false };
    let Some(enc_c2s) = r.string() else { return false };
    let Some(enc_s2c) = r.string() else { return false };
    let Some(_mac_c2s) = r.string() else { return false };
    let Some(_mac_s2c) = r.string() else { return false };
    let Some(comp_c2s) = r.string() else { return false };
    let Some(comp_s2c) = r.string() else { return false };
    let Some(_lang_c2s) = r.string() else { return false };
    let Some(_lang_s2c) = r.string() else { return false };
    let Some(first_kex_follows) = r.boolean() else {
        return false;
    };

    name_list_contains(kex, KEX_ALGORITHM)
        && name_list_contains(host_key, HOST_KEY_ALGORITHM)
        && name_list_contains(enc_c2s, ENCRYPTION_ALGORITHM)
        && name_list_contains(enc_s2c, ENCRYPTION_ALGORITHM)
        && name_list_contains(comp_c2s, COMPRESSION_ALGORITHM)
        && name_list_contains(comp_s2c, COMPRESSION_ALGORITHM)
        && !first_kex_follows
}

/// Builds our KEXINIT payload into `out`; returns the payload length.
pub fn build_kexinit(out: &mut [u8], cookie: &[u8; 16]) -> Option<usize> {
    let mut w = Writer::new(out);
    w.u8(SSH_MSG_KEXINIT);
    w.raw(cookie);
    w.string(KEX_ALGORITHM);
    w.string(HOST_KEY_ALGORITHM);
    w.string(ENCRYPTION_ALGORITHM);
    w.string(ENCRYPTION_ALGORITHM);
    w.string(MAC_ALGORITHM);
    w.string(MAC_ALGORITHM);
    w.string(COMPRESSION_ALGORITHM);
    w.string(COMPRESSION_ALGORITHM);
    w.string(b"");
    w.string(b"");
    w.boolean(false); // first_kex_packet_follows
    w.u32(0); // reserved
    w.finish()
}

/// Extracts the client's ephemeral public key from a KEX_ECDH_INIT
/// payload.  The key must be exactly 32 bytes.
pub fn parse_ecdh_init(payload: &[u8]) -> Option<[u8; ECDH_KEY_SIZE]> {
    let mut r = Reader::new(payload);
    if r.u8()? != crate::packet::SSH_MSG_KEX_ECDH_INIT {
        return None;
    }
    let key = r.string()?;
    key.try_into().ok()
}

/// Writes the host-key blob (as hashed and as sent) into `out`.
pub fn write_host_key_blob(out: &mut [u8], host_public: &[u8; 32]) -> Option<usize> {
    let mut w = Writer::new(out);
    w.string(HOST_KEY_ALGORITHM);
    w.string(host_public);
    w.finish()
}

/// Builds the KEX_ECDH_REPLY payload: host-key blob, our ephemeral
/// public key, and the ed25519 signature blob over the exchange hash.
pub fn build_ecdh_reply(
    out: &mut [u8],
    host_key_blob: &[u8],
    server_public: &[u8; ECDH_KEY_SIZE],
    signature: &[u8; ED25519_SIGNATURE_SIZE],
) -> Option<usize> {
    let mut w = Writer::new(out);
    w.u8(SSH_MSG_KEX_ECDH_REPLY);
    w.string(host_key_blob);
    w.string(server_public);
    // Signature blob nests the algorithm name around the raw signature.
    w.u32((4 + HOST_KEY_ALGORITHM.len() + 4 + signature.len()) as u32);
    w.string(HOST_KEY_ALGORITHM);
    w.string(signature);
    w.finish()
}

/// Feeds one length-prefixed block into the running exchange hash.
///
/// The transcript hashes banners and KEXINIT payloads as SSH strings even
/// though the prefix is never sent on the wire.
pub fn hash_string<C: CryptoEngine>(crypto: &mut C, data: &[u8]) {
    crypto.sha256_update(&(data.len() as u32).to_be_bytes());
    crypto.sha256_update(data);
}
