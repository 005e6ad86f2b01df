//! Cryptographic primitives for the peer transport: key derivation, the
//! per-frame stream cipher, message MACs, and the handshake credential.

use anyhow::Result;
use hmac::{Hmac, Mac};
use ofb::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const KEY_SIZE: usize = 32; // AES-256 and SHA-256
pub const SALT_SIZE: usize = 10;
pub const HASH_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;

/// Length of the handshake credential: salt, `"::"` separator, digest.
pub const CREDENTIAL_SIZE: usize = SALT_SIZE + 2 + HASH_SIZE;

/// Salts are drawn from this alphabet via `byte % SALT_ALPHABET.len()`.
const SALT_ALPHABET: &[u8] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-";

type HmacSha256 = Hmac<Sha256>;
type Aes256Ofb = ofb::Ofb<aes::Aes256>;

/// Per-link key material derived from the shared password. Fixed for the
/// whole lifetime of a connection.
#[derive(Clone)]
pub struct SessionKeys {
    pub enc: [u8; KEY_SIZE],
    pub mac: [u8; KEY_SIZE],
}

impl SessionKeys {
    /// Derive the encryption and MAC keys from the link password. Each key
    /// comes from a fresh HMAC keyed by the password.
    pub fn derive(password: &str) -> Self {
        Self {
            enc: hmac_sha256(password.as_bytes(), b"encryption key"),
            mac: hmac_sha256(password.as_bytes(), b"hmac key"),
        }
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("enc", &"[REDACTED]")
            .field("mac", &"[REDACTED]")
            .finish()
    }
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; HASH_SIZE] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Incremental HMAC-SHA256 over the plaintext of one encrypted frame.
pub struct FrameMac(HmacSha256);

impl FrameMac {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self(HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length"))
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; HASH_SIZE] {
        self.0.finalize().into_bytes().into()
    }
}

/// AES-256-OFB keystream for one encrypted frame. OFB is a stream mode, so
/// the same `apply` call encrypts and decrypts.
pub struct FrameCipher(Aes256Ofb);

impl FrameCipher {
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        Self(Aes256Ofb::new(key.into(), iv.into()))
    }

    pub fn apply(&mut self, buf: &mut [u8]) {
        self.0.apply_keystream(buf);
    }
}

/// Fresh random IV for one encrypted frame. IVs must never repeat under a
/// key, so they always come from the OS CSPRNG.
pub fn fresh_iv() -> Result<[u8; IV_SIZE]> {
    let mut iv = [0u8; IV_SIZE];
    OsRng.try_fill_bytes(&mut iv)?;
    Ok(iv)
}

/// Handshake credential with a newly generated salt:
/// `salt || "::" || SHA256(salt || "::" || password)`.
pub fn salted_hash_with_new_salt(password: &[u8]) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.try_fill_bytes(&mut salt)?;
    for b in salt.iter_mut() {
        *b = SALT_ALPHABET[(*b % SALT_ALPHABET.len() as u8) as usize];
    }
    Ok(salted_hash(password, &salt))
}

/// Same construction with a caller-provided salt. The salt prefix lets the
/// verifier recover it and recompute the digest.
pub fn salted_hash(password: &[u8], salt: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(salt.len() + 2 + HASH_SIZE);
    out.extend_from_slice(salt);
    out.extend_from_slice(b"::");

    let mut hasher = Sha256::new();
    hasher.update(&out);
    hasher.update(password);
    out.extend_from_slice(&hasher.finalize());
    out
}

/// Constant-time equality for MACs and credentials.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic_and_domain_separated() {
        let a = SessionKeys::derive("hunter2");
        let b = SessionKeys::derive("hunter2");
        assert_eq!(a.enc, b.enc);
        assert_eq!(a.mac, b.mac);
        assert_ne!(a.enc, a.mac);

        let c = SessionKeys::derive("hunter3");
        assert_ne!(a.enc, c.enc);
    }

    #[test]
    fn salted_hash_is_deterministic_for_fixed_salt() {
        let salt = b"0123456789";
        let one = salted_hash(b"secret", salt);
        let two = salted_hash(b"secret", salt);
        assert_eq!(one, two);
        assert_eq!(one.len(), CREDENTIAL_SIZE);
        assert_eq!(&one[..SALT_SIZE], salt);
        assert_eq!(&one[SALT_SIZE..SALT_SIZE + 2], b"::");
    }

    #[test]
    fn new_salt_stays_in_alphabet() {
        let cred = salted_hash_with_new_salt(b"secret").unwrap();
        assert_eq!(cred.len(), CREDENTIAL_SIZE);
        for b in &cred[..SALT_SIZE] {
            assert!(SALT_ALPHABET.contains(b), "salt byte {b} outside alphabet");
        }
    }

    #[test]
    fn different_salts_give_different_credentials() {
        let one = salted_hash(b"secret", b"aaaaaaaaaa");
        let two = salted_hash(b"secret", b"bbbbbbbbbb");
        assert_ne!(one, two);
    }

    #[test]
    fn cipher_round_trips() {
        let keys = SessionKeys::derive("k");
        let iv = fresh_iv().unwrap();
        let mut buf = b"attack at dawn".to_vec();

        FrameCipher::new(&keys.enc, &iv).apply(&mut buf);
        assert_ne!(&buf, b"attack at dawn");
        FrameCipher::new(&keys.enc, &iv).apply(&mut buf);
        assert_eq!(&buf, b"attack at dawn");
    }

    #[test]
    fn constant_time_eq_handles_lengths() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
