//! Security1 cryptographic primitives.
//!
//! Provides three things:
//!   1. Curve25519 keypair generation and ECDH, via x25519-dalek.
//!   2. Session key derivation from a proof-of-possession string.
//!   3. AES-CTR + HMAC-SHA256 encrypt/decrypt against a derived session key.
//!
//! All key material derives Zeroize/ZeroizeOnDrop — wiped from memory when
//! dropped. There is no unsafe code in this module. The Security1 state
//! machine that drives these primitives through a handshake lives in
//! valvelink-services; this module only ever sees keys and bytes.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// IV length for both handshake decryption (device_random) and session traffic.
pub const IV_LEN: usize = 16;
/// HMAC-SHA256 tag length.
pub const MAC_LEN: usize = 32;
/// `IV || ciphertext || mac` framing overhead.
pub const FRAMING_OVERHEAD: usize = IV_LEN + MAC_LEN;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("HMAC verification failed")]
    InvalidMac,
    #[error("ciphertext shorter than framing overhead: {0} bytes")]
    TooShort(usize),
}

// ── Keypair / ECDH ───────────────────────────────────────────────────────────

/// The device's ephemeral Curve25519 keypair for one handshake.
///
/// Generated fresh per SESSION_ESTABLISH request — Security1 has no
/// long-term device identity key, unlike a static-keypair protocol.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    private: [u8; 32],
    #[zeroize(skip)]
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a fresh random X25519 keypair using the OS RNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private: secret.to_bytes(),
            public: *public.as_bytes(),
        }
    }

    /// Compute the X25519 shared secret against a peer's public key.
    ///
    /// `x25519-dalek` already returns the shared u-coordinate in the byte
    /// order RFC 7748 specifies (little-endian), so no further conversion
    /// is needed before it is used as key material.
    pub fn diffie_hellman(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.private);
        let peer = PublicKey::from(*peer_public);
        *secret.diffie_hellman(&peer).as_bytes()
    }
}

/// Fill a fresh array with cryptographically random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

// ── Session key derivation ───────────────────────────────────────────────────

/// `session_key = curve25519_result XOR SHA256(pop)`.
pub fn derive_session_key(shared_secret: &[u8; 32], pop: &str) -> SessionKey {
    let pop_hash = Sha256::digest(pop.as_bytes());
    let mut key = [0u8; 32];
    for i in 0..32 {
        key[i] = shared_secret[i] ^ pop_hash[i];
    }
    SessionKey(key)
}

/// A derived Security1 session key. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop, Clone)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// ── AES-CTR / HMAC-SHA256 ────────────────────────────────────────────────────

/// Run AES-CTR in place against `key`/`iv`. Symmetric: the same call
/// encrypts or decrypts depending on which side provides the plaintext.
pub fn aes_ctr_apply(key: &[u8; 32], iv: &[u8; IV_LEN], data: &mut [u8]) {
    let key = GenericArray::from_slice(key);
    let nonce = GenericArray::from_slice(iv);
    let mut cipher = Aes256Ctr::new(key, nonce);
    cipher.apply_keystream(data);
}

pub fn hmac_sha256(key: &[u8; 32], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// `IV(16) || AES-CTR(key, IV, plaintext) || HMAC-SHA256(key, IV||ciphertext)`.
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Vec<u8> {
    let iv = random_bytes::<IV_LEN>();
    let mut body = plaintext.to_vec();
    aes_ctr_apply(key.as_bytes(), &iv, &mut body);

    let mut framed = Vec::with_capacity(IV_LEN + body.len() + MAC_LEN);
    framed.extend_from_slice(&iv);
    framed.extend_from_slice(&body);
    let mac = hmac_sha256(key.as_bytes(), &framed);
    framed.extend_from_slice(&mac);
    framed
}

/// Split `iv | body | mac`, verify the MAC in constant time, then decrypt.
///
/// Permitted as soon as the session key is derived, not only once the
/// session has reached SESSION_ACTIVE — SESSION_VERIFY itself decrypts a
/// token under this same key before the handshake completes.
pub fn decrypt(key: &SessionKey, input: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if input.len() < FRAMING_OVERHEAD {
        return Err(CryptoError::TooShort(input.len()));
    }
    let (head, mac) = input.split_at(input.len() - MAC_LEN);
    let (iv, body) = head.split_at(IV_LEN);

    let expected_mac = hmac_sha256(key.as_bytes(), head);
    if expected_mac.ct_eq(mac).unwrap_u8() != 1 {
        return Err(CryptoError::InvalidMac);
    }

    let mut plaintext = body.to_vec();
    let iv: [u8; IV_LEN] = iv.try_into().expect("split_at guarantees IV_LEN bytes");
    aes_ctr_apply(key.as_bytes(), &iv, &mut plaintext);
    Ok(plaintext)
}

/// `get_encrypted_size(n) = n + 48` for all `n`.
pub fn encrypted_size(plaintext_len: usize) -> usize {
    plaintext_len + FRAMING_OVERHEAD
}

/// `get_decrypted_size(n + 48) = n`; `n <= 48` yields 0.
pub fn decrypted_size(ciphertext_len: usize) -> usize {
    ciphertext_len.saturating_sub(FRAMING_OVERHEAD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdh_is_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_eq!(a.diffie_hellman(&b.public), b.diffie_hellman(&a.public));
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = derive_session_key(&[7u8; 32], "test_pop_12345");
        let plaintext = b"valve open command payload";
        let ct = encrypt(&key, plaintext);
        assert_eq!(ct.len(), encrypted_size(plaintext.len()));
        let pt = decrypt(&key, &ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn tampered_iv_fails_mac() {
        let key = derive_session_key(&[3u8; 32], "test_pop_12345");
        let mut ct = encrypt(&key, b"hello");
        ct[0] ^= 0x01;
        assert!(matches!(decrypt(&key, &ct), Err(CryptoError::InvalidMac)));
    }

    #[test]
    fn tampered_body_fails_mac() {
        let key = derive_session_key(&[3u8; 32], "test_pop_12345");
        let mut ct = encrypt(&key, b"hello world");
        let mid = ct.len() / 2;
        ct[mid] ^= 0x01;
        assert!(matches!(decrypt(&key, &ct), Err(CryptoError::InvalidMac)));
    }

    #[test]
    fn tampered_mac_fails() {
        let key = derive_session_key(&[3u8; 32], "test_pop_12345");
        let mut ct = encrypt(&key, b"hello");
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(matches!(decrypt(&key, &ct), Err(CryptoError::InvalidMac)));
    }

    #[test]
    fn size_helpers() {
        assert_eq!(encrypted_size(0), 48);
        assert_eq!(decrypted_size(48), 0);
        assert_eq!(decrypted_size(48 + 10), 10);
        assert_eq!(decrypted_size(10), 0);
    }

    #[test]
    fn too_short_input_rejected() {
        let key = SessionKey::zero();
        assert!(matches!(decrypt(&key, &[0u8; 10]), Err(CryptoError::TooShort(10))));
    }
}
