//! Symmetric and asymmetric cipher primitives used by the mesh protocol.
//!
//! - [`keystream_apply`] is the repeating-key XOR transform used for message
//!   payloads under a [`SessionKey`]. The keystream repeats every 16 bytes and
//!   is reused for every message under the same key, so it offers no
//!   protection against known-plaintext analysis across messages. It is the
//!   single place to substitute an authenticated stream cipher.
//! - [`asym_encrypt`] / [`asym_decrypt`] seal short payloads (session keys) to
//!   a node's Ed25519 identity: an ephemeral X25519 exchange against the
//!   recipient's key in Montgomery form, HKDF-SHA256, then ChaCha20-Poly1305.
//! - [`constant_time_equal`] is used for every identity comparison.

use crate::crypto::Identity;
use crate::utils::{CryptoError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use curve25519_dalek::edwards::CompressedEdwardsY;
use hkdf::Hkdf;
use rand::RngCore;
use rand_core::OsRng;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

/// Length of a session key in bytes
pub const SESSION_KEY_LENGTH: usize = 16;

/// Largest plaintext [`asym_encrypt`] accepts
pub const MAX_SEALED_PLAINTEXT: usize = 256;

const EPHEMERAL_KEY_LENGTH: usize = 32;
const TAG_LENGTH: usize = 16;
const SEAL_INFO: &[u8] = b"lan-mesh/seal/v1";

/// The 16-byte symmetric key shared by two nodes after a handshake
#[derive(Clone, Copy)]
pub struct SessionKey([u8; SESSION_KEY_LENGTH]);

impl SessionKey {
    /// Generate a fresh random session key
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Build a session key from exactly 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; SESSION_KEY_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!(
                    "Session key must be {} bytes, got {}",
                    SESSION_KEY_LENGTH,
                    bytes.len()
                ),
            })?;
        Ok(Self(key))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_equal(&self.0, &other.0)
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// XOR every byte of `buffer` with `key[i % key.len()]`, in place.
///
/// Applying it twice with the same key restores the input. An empty key
/// leaves the buffer untouched.
pub fn keystream_apply(buffer: &mut [u8], key: &[u8]) {
    if key.is_empty() {
        return;
    }
    for (byte, k) in buffer.iter_mut().zip(key.iter().cycle()) {
        *byte ^= k;
    }
}

/// Compare two byte strings without data-dependent early exit.
///
/// Length is not secret: different lengths compare unequal immediately.
pub fn constant_time_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Seal `plaintext` so only the holder of `public_key`'s private half can open it
///
/// # Errors
///
/// `CryptoError::InvalidKey` for a malformed recipient key,
/// `CryptoError::Encryption` for oversized plaintext or a degenerate exchange.
pub fn asym_encrypt(public_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.len() > MAX_SEALED_PLAINTEXT {
        return Err(CryptoError::Encryption {
            reason: format!(
                "Plaintext of {} bytes exceeds the {} byte limit",
                plaintext.len(),
                MAX_SEALED_PLAINTEXT
            ),
        }
        .into());
    }

    let recipient = montgomery_public_key(public_key)?;
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::Encryption {
            reason: "Recipient key produced a non-contributory exchange".to_string(),
        }
        .into());
    }

    let cipher = seal_cipher(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes())?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), plaintext)
        .map_err(|_| CryptoError::Encryption {
            reason: "AEAD encryption failed".to_string(),
        })?;

    let mut sealed = Vec::with_capacity(EPHEMERAL_KEY_LENGTH + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a payload produced by [`asym_encrypt`] for `identity`
///
/// # Errors
///
/// `CryptoError::Decryption` when the input is truncated, was sealed to a
/// different key, or was tampered with.
pub fn asym_decrypt(identity: &Identity, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < EPHEMERAL_KEY_LENGTH + TAG_LENGTH {
        return Err(CryptoError::Decryption {
            reason: format!("Sealed payload too short: {} bytes", sealed.len()),
        }
        .into());
    }

    let (ephemeral_bytes, ciphertext) = sealed.split_at(EPHEMERAL_KEY_LENGTH);
    let mut ephemeral = [0u8; EPHEMERAL_KEY_LENGTH];
    ephemeral.copy_from_slice(ephemeral_bytes);
    let ephemeral_public = X25519PublicKey::from(ephemeral);

    let secret = montgomery_secret(identity);
    let recipient = X25519PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(CryptoError::Decryption {
            reason: "Non-contributory ephemeral key".to_string(),
        }
        .into());
    }

    let cipher = seal_cipher(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes())?;
    cipher
        .decrypt(Nonce::from_slice(&[0u8; 12]), ciphertext)
        .map_err(|_| {
            CryptoError::Decryption {
                reason: "AEAD authentication failed".to_string(),
            }
            .into()
        })
}

/// Map an Ed25519 public key to its X25519 (Montgomery) form
fn montgomery_public_key(public_key: &[u8]) -> Result<X25519PublicKey> {
    let compressed = CompressedEdwardsY::from_slice(public_key).map_err(|_| {
        CryptoError::InvalidKey {
            reason: format!("Expected 32 byte public key, got {}", public_key.len()),
        }
    })?;
    let point = compressed.decompress().ok_or_else(|| CryptoError::InvalidKey {
        reason: "Public key is not a valid curve point".to_string(),
    })?;
    Ok(X25519PublicKey::from(point.to_montgomery().to_bytes()))
}

/// The X25519 scalar matching an Ed25519 seed: the low half of SHA-512(seed)
fn montgomery_secret(identity: &Identity) -> StaticSecret {
    let digest = Sha512::digest(identity.secret_key_bytes());
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&digest[..32]);
    StaticSecret::from(scalar)
}

fn seal_cipher(shared: &[u8], ephemeral: &[u8], recipient: &[u8]) -> Result<ChaCha20Poly1305> {
    let salt = Sha256::new()
        .chain_update(ephemeral)
        .chain_update(recipient)
        .finalize();
    let hkdf = Hkdf::<Sha256>::new(Some(salt.as_slice()), shared);

    let mut key = [0u8; 32];
    hkdf.expand(SEAL_INFO, &mut key)
        .map_err(|e| CryptoError::KeyDerivation {
            reason: e.to_string(),
        })?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
}
