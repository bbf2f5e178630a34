//! Software crypto backend over the RustCrypto crates.
//!
//! Suitable for hosted targets and test rigs; microcontroller ports
//! substitute an engine wrapping their hardware SHA/AES/PKA blocks behind
//! the same [`CryptoEngine`] trait.  The only state shared between
//! instances is nothing at all: each engine owns its hash context, its
//! ephemeral key, its session keys, and its own copy of the host key.

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, Key, KeyInit, Nonce, Tag};
use ed25519_dalek::{Signer, SigningKey};
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    CryptoEngine, ECDH_KEY_SIZE, ED25519_KEY_SIZE, ED25519_SIGNATURE_SIZE, GCM_IV_SIZE,
    GCM_TAG_SIZE, SHA256_DIGEST_SIZE, SessionKeys,
};

pub struct SoftCryptoEngine<R: RngCore + CryptoRng> {
    rng: R,
    hash: Sha256,
    host_key: Option<SigningKey>,
    host_public: [u8; ED25519_KEY_SIZE],
    ephemeral: Option<StaticSecret>,
    keys: SessionKeys,
}

impl<R: RngCore + CryptoRng> SoftCryptoEngine<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            hash: Sha256::new(),
            host_key: None,
            host_public: [0; ED25519_KEY_SIZE],
            ephemeral: None,
            keys: SessionKeys::default(),
        }
    }

    /// Installs the persistent host key pair.  Called once at boot; the
    /// key survives [`CryptoEngine::clear`].
    pub fn set_host_key(&mut self, public: &[u8; ED25519_KEY_SIZE], secret: &[u8; ED25519_KEY_SIZE]) {
        self.host_key = Some(SigningKey::from_bytes(secret));
        self.host_public = *public;
    }

    /// Bumps the big-endian invocation counter in the low 8 IV bytes.
    /// The 4-byte salt is untouched, including on counter wraparound.
    fn increment_iv(iv: &mut [u8; GCM_IV_SIZE]) {
        let mut counter = u64::from_be_bytes(iv[4..12].try_into().expect("8 iv bytes"));
        counter = counter.wrapping_add(1);
        iv[4..12].copy_from_slice(&counter.to_be_bytes());
    }
}

impl<R: RngCore + CryptoRng> CryptoEngine for SoftCryptoEngine<R> {
    fn random(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
    }

    fn sha256_init(&mut self) {
        self.hash = Sha256::new();
    }

    fn sha256_update(&mut self, data: &[u8]) {
        self.hash.update(data);
    }

    fn sha256_final(&mut self, digest: &mut [u8; SHA256_DIGEST_SIZE]) {
        let out = core::mem::replace(&mut self.hash, Sha256::new()).finalize();
        digest.copy_from_slice(&out);
    }

    fn generate_x25519_keypair(&mut self, public: &mut [u8; ECDH_KEY_SIZE]) {
        let secret = StaticSecret::random_from_rng(&mut self.rng);
        *public = PublicKey::from(&secret).to_bytes();
        self.ephemeral = Some(secret);
    }

    fn shared_secret(&mut self, peer_public: &[u8; ECDH_KEY_SIZE], out: &mut [u8; ECDH_KEY_SIZE]) {
        match &self.ephemeral {
            Some(secret) => {
                *out = secret.diffie_hellman(&PublicKey::from(*peer_public)).to_bytes();
            }
            None => out.fill(0),
        }
    }

    fn host_public_key(&self) -> [u8; ED25519_KEY_SIZE] {
        self.host_public
    }

    fn sign_exchange_hash(
        &mut self,
        exchange_hash: &[u8; SHA256_DIGEST_SIZE],
        signature: &mut [u8; ED25519_SIGNATURE_SIZE],
    ) {
        match &self.host_key {
            Some(key) => signature.copy_from_slice(&key.sign(exchange_hash).to_bytes()),
            None => signature.fill(0),
        }
    }

    fn install_session_keys(&mut self, keys: SessionKeys) {
        self.keys = keys;
    }

    fn decrypt_and_verify(&mut self, aad: &[u8; 4], buf: &mut [u8]) -> bool {
        if buf.len() < GCM_TAG_SIZE {
            return false;
        }
        let (ciphertext, tag) = buf.split_at_mut(buf.len() - GCM_TAG_SIZE);
        let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&self.keys.key_client_to_server));
        let nonce = Nonce::from_slice(&self.keys.iv_client_to_server);
        let ok = cipher
            .decrypt_in_place_detached(nonce, aad, ciphertext, Tag::from_slice(tag))
            .is_ok();
        if ok {
            // Only accepted packets advance the counter; a rejected one is
            // fatal to the connection anyway.
            Self::increment_iv(&mut self.keys.iv_client_to_server);
        }
        ok
    }

    fn encrypt_and_mac(&mut self, aad: &[u8; 4], buf: &mut [u8]) {
        if buf.len() < GCM_TAG_SIZE {
            return;
        }
        let split = buf.len() - GCM_TAG_SIZE;
        let (plaintext, tag_out) = buf.split_at_mut(split);
        let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&self.keys.key_server_to_client));
        let nonce = Nonce::from_slice(&self.keys.iv_server_to_client);
        match cipher.encrypt_in_place_detached(nonce, aad, plaintext) {
            Ok(tag) => {
                tag_out.copy_from_slice(&tag);
                Self::increment_iv(&mut self.keys.iv_server_to_client);
            }
            Err(_) => tag_out.fill(0),
        }
    }

    fn clear(&mut self) {
        self.ephemeral = None; // zeroized on drop
        self.keys = SessionKeys::default();
        self.hash = Sha256::new();
    }
}
