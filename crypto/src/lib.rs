//! Crypto capability boundary for the SSH transport.
//!
//! [`CryptoEngine`] is the interface the transport codes against: RNG,
//! a per-engine SHA-256 context, X25519 key agreement, Ed25519 host-key
//! signatures, and AES-128-GCM packet protection.  One engine instance
//! carries the state of one connection; `clear()` zeroises everything
//! except the long-lived host key so the instance can be reused.
//!
//! Key derivation (the OpenSSH 'A'..'D' labels) is provided on the trait
//! itself in terms of the engine's own hash operations, so hardware
//! backends inherit it unchanged.
//!
//! [`SoftCryptoEngine`](soft::SoftCryptoEngine) is the software backend.

#![cfg_attr(not(test), no_std)]

pub mod soft;
pub mod testutil;


pub const ECDH_KEY_SIZE: usize = 32;
pub const ED25519_KEY_SIZE: usize = 32;
pub const ED25519_SIGNATURE_SIZE: usize = 64;
pub const SHA256_DIGEST_SIZE: usize = 32;
pub const AES_KEY_SIZE: usize = 16;
pub const AES_BLOCK_SIZE: usize = 16;
pub const GCM_IV_SIZE: usize = 12;
pub const GCM_TAG_SIZE: usize = 16;

/// Directional session key material installed after key exchange.
///
/// Each IV is a 4-byte salt followed by an 8-byte big-endian invocation
/// counter; the counter advances by one per processed packet and the salt
/// never changes, even on counter wraparound.
#[derive(Clone, Copy, Default)]
pub struct SessionKeys {
    pub iv_client_to_server: [u8; GCM_IV_SIZE],
    pub iv_server_to_client: [u8; GCM_IV_SIZE],
    pub key_client_to_server: [u8; AES_KEY_SIZE],
    pub key_server_to_client: [u8; AES_KEY_SIZE],
}

/// Interface to an external crypto library or accelerator.
///
/// Each instance holds the state of a single connection.
pub trait CryptoEngine {
    /// Fills `buf` with cryptographic randomness.
    fn random(&mut self, buf: &mut [u8]);

    // --- SHA-256 (one running context per engine instance) ---------------

    fn sha256_init(&mut self);
    fn sha256_update(&mut self, data: &[u8]);
    fn sha256_final(&mut self, digest: &mut [u8; SHA256_DIGEST_SIZE]);

    // --- Key agreement and host signature ---------------------------------

    /// Generates an ephemeral X25519 key pair, keeping the private half
    /// internal and writing the public half to `public`.
    fn generate_x25519_keypair(&mut self, public: &mut [u8; ECDH_KEY_SIZE]);

    /// Computes the shared secret between our ephemeral private key and
    /// the peer's public key.
    fn shared_secret(&mut self, peer_public: &[u8; ECDH_KEY_SIZE], out: &mut [u8; ECDH_KEY_SIZE]);

    /// The long-lived Ed25519 host public key.
    fn host_public_key(&self) -> [u8; ED25519_KEY_SIZE];

    /// Signs an exchange hash with the host key.
    fn sign_exchange_hash(
        &mut self,
        exchange_hash: &[u8; SHA256_DIGEST_SIZE],
        signature: &mut [u8; ED25519_SIGNATURE_SIZE],
    );

    // --- Packet protection -------------------------------------------------

    /// Installs the four directional keys produced by
    /// [`derive_session_keys`](Self::derive_session_keys).
    fn install_session_keys(&mut self, keys: SessionKeys);

    /// Decrypts a client-to-server packet in place.
    ///
    /// `buf` holds the ciphertext followed by its 16-byte tag; `aad` is
    /// the cleartext packet-length word, which is authenticated but not
    /// encrypted.  Returns `false` on verification failure, in which case
    /// the invocation counter is **not** advanced and the connection must
    /// be torn down (a later packet could never verify).
    fn decrypt_and_verify(&mut self, aad: &[u8; 4], buf: &mut [u8]) -> bool;

    /// Encrypts a server-to-client packet in place and writes the tag.
    ///
    /// `buf` holds the plaintext followed by 16 reserved tag bytes.
    fn encrypt_and_mac(&mut self, aad: &[u8; 4], buf: &mut [u8]);

    /// Zeroises per-connection material (ephemeral key, session keys,
    /// running hash) but not the host key.
    fn clear(&mut self);

    // =========================================================================
    // Provided: OpenSSH key derivation
    // =========================================================================

    /// Hashes a 32-byte value in SSH mpint form: big-endian with a length
    /// prefix, plus a leading zero byte when the top bit is set.
    fn sha256_update_mpint32(&mut self, value: &[u8; 32]) {
        if value[0] & 0x80 != 0 {
            self.sha256_update(&[0, 0, 0, 33, 0]);
        } else {
            self.sha256_update(&[0, 0, 0, 32]);
        }
        self.sha256_update(value);
    }

    /// Derives one directional key: `HASH(K || H || label || session_id)`.
    fn derive_session_key(
        &mut self,
        shared_secret: &[u8; ECDH_KEY_SIZE],
        exchange_hash: &[u8; SHA256_DIGEST_SIZE],
        session_id: &[u8; SHA256_DIGEST_SIZE],
        label: u8,
        out: &mut [u8; SHA256_DIGEST_SIZE],
    ) {
        self.sha256_init();
        self.sha256_update_mpint32(shared_secret);
        self.sha256_update(exchange_hash);
        self.sha256_update(&[label]);
        self.sha256_update(session_id);
        self.sha256_final(out);
    }

    /// Derives and installs all four session keys.
    ///
    /// Labels follow the OpenSSH convention: 'A'/'B' are the
    /// client-to-server and server-to-client IVs, 'C'/'D' the
    /// corresponding cipher keys.  Until rekeying exists the exchange
    /// hash doubles as the session id.
    fn derive_session_keys(
        &mut self,
        shared_secret: &[u8; ECDH_KEY_SIZE],
        exchange_hash: &[u8; SHA256_DIGEST_SIZE],
        session_id: &[u8; SHA256_DIGEST_SIZE],
    ) {
        let mut keys = SessionKeys::default();
        let mut buf = [0u8; SHA256_DIGEST_SIZE];

        self.derive_session_key(shared_secret, exchange_hash, session_id, b'A', &mut buf);
        keys.iv_client_to_server.copy_from_slice(&buf[..GCM_IV_SIZE]);
        self.derive_session_key(shared_secret, exchange_hash, session_id, b'B', &mut buf);
        keys.iv_server_to_client.copy_from_slice(&buf[..GCM_IV_SIZE]);
        self.derive_session_key(shared_secret, exchange_hash, session_id, b'C', &mut buf);
        keys.key_client_to_server
            .copy_from_slice(&buf[..AES_KEY_SIZE]);
        self.derive_session_key(shared_secret, exchange_hash, session_id, b'D', &mut buf);
        keys.key_server_to_client
            .copy_from_slice(&buf[..AES_KEY_SIZE]);

        self.install_session_keys(keys);
    }
}
