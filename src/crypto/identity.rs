//! Node identity and Ed25519 signature operations.
//!
//! Every node owns one long-lived Ed25519 key pair. The 32-byte compressed
//! public key is the node's canonical identity on the wire; the private seed
//! never leaves the process. Signatures always cover the SHA-256 digest of the
//! signed bytes.

use crate::utils::{ConfigError, CryptoError, Result};
use base64::{engine::general_purpose, Engine};
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// File holding the base64 private seed inside the key directory
pub const PRIVATE_KEY_FILE: &str = "identity.key";

/// File holding the base64 public key inside the key directory
pub const PUBLIC_KEY_FILE: &str = "identity.pub";

/// Decodes key material handed to the mesh by the embedding application.
///
/// The textual container those bytes came from (PEM, base64 files, a keystore)
/// is the caller's business; the mesh only sees the decoded bytes.
pub trait KeyDecoder: Send + Sync {
    /// Decode a private key
    fn decode_private_key(&self, bytes: &[u8]) -> Result<SigningKey>;

    /// Decode a public key
    fn decode_public_key(&self, bytes: &[u8]) -> Result<VerifyingKey>;
}

/// Decoder for raw Ed25519 bytes: a 32-byte seed and a 32-byte compressed point
#[derive(Debug, Clone, Copy, Default)]
pub struct RawKeyDecoder;

impl KeyDecoder for RawKeyDecoder {
    fn decode_private_key(&self, bytes: &[u8]) -> Result<SigningKey> {
        let seed: [u8; SECRET_KEY_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!(
                    "Expected {} byte private key, got {}",
                    SECRET_KEY_LENGTH,
                    bytes.len()
                ),
            })?;
        Ok(SigningKey::from_bytes(&seed))
    }

    fn decode_public_key(&self, bytes: &[u8]) -> Result<VerifyingKey> {
        let point: [u8; PUBLIC_KEY_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!(
                    "Expected {} byte public key, got {}",
                    PUBLIC_KEY_LENGTH,
                    bytes.len()
                ),
            })?;
        VerifyingKey::from_bytes(&point).map_err(|_| {
            CryptoError::InvalidKey {
                reason: "Public key is not a valid curve point".to_string(),
            }
            .into()
        })
    }
}

/// The local node's key pair
///
/// Immutable once constructed; clones share nothing mutable and may sign
/// concurrently.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Identity {
    /// Generate a new random identity
    ///
    /// # Example
    ///
    /// ```rust
    /// use lan_mesh::crypto::Identity;
    ///
    /// let identity = Identity::generate();
    /// assert_eq!(identity.public_key_bytes().len(), 32);
    /// ```
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create an identity from a raw 32-byte private seed
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the seed has the wrong length
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> Result<Self> {
        Self::decode(&RawKeyDecoder, secret_bytes)
    }

    /// Create an identity through a caller-supplied key decoder
    pub fn decode(decoder: &dyn KeyDecoder, private_key: &[u8]) -> Result<Self> {
        let signing_key = decoder.decode_private_key(private_key)?;
        let verifying_key = signing_key.verifying_key();

        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Get the public verifying key
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Get the public key as bytes; this is the node's identity on the wire
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Get the private seed as bytes
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Sign the SHA-256 digest of `message`
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(&Sha256::digest(message)).to_bytes()
    }

    /// Short printable fingerprint of the public key
    pub fn short_id(&self) -> String {
        short_id(&self.public_key_bytes())
    }

    /// Base64 form of the public key, as used in trust files
    pub fn public_key_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.public_key_bytes())
    }

    /// Load the identity stored in `keys_dir`
    pub fn load<P: AsRef<Path>>(keys_dir: P) -> Result<Self> {
        let path = keys_dir.as_ref().join(PRIVATE_KEY_FILE);
        let encoded = std::fs::read_to_string(&path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        let seed = general_purpose::STANDARD.decode(encoded.trim())?;
        Self::from_secret_bytes(&seed)
    }

    /// Write the key pair to `keys_dir`, creating the directory if needed
    pub fn save<P: AsRef<Path>>(&self, keys_dir: P) -> Result<()> {
        let dir = keys_dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
            path: dir.display().to_string(),
        })?;

        let private_path = dir.join(PRIVATE_KEY_FILE);
        std::fs::write(
            &private_path,
            general_purpose::STANDARD.encode(self.secret_key_bytes()),
        )?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&private_path, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::write(dir.join(PUBLIC_KEY_FILE), self.public_key_base64())?;

        log::debug!("Saved identity {} to {}", self.short_id(), dir.display());
        Ok(())
    }

    /// Load the identity in `keys_dir`, generating and saving one if absent.
    ///
    /// Returns the identity and whether it was newly created.
    pub fn load_or_generate<P: AsRef<Path>>(keys_dir: P) -> Result<(Self, bool)> {
        let dir = keys_dir.as_ref();
        if dir.join(PRIVATE_KEY_FILE).exists() {
            return Ok((Self::load(dir)?, false));
        }

        let identity = Self::generate();
        identity.save(dir)?;
        log::info!("Generated new identity {}", identity.short_id());
        Ok((identity, true))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Sign `message` with `identity`'s private key
pub fn sign(identity: &Identity, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
    identity.sign(message)
}

/// Verify `signature` over the SHA-256 digest of `message`.
///
/// Malformed key or signature bytes verify as `false`; callers reject the
/// peer or message either way.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = RawKeyDecoder.decode_public_key(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };

    verifying_key
        .verify(&Sha256::digest(message), &signature)
        .is_ok()
}

/// First four bytes of the key's SHA-256 digest, hex encoded
pub fn short_id(public_key: &[u8]) -> String {
    hex::encode(&Sha256::digest(public_key)[..4])
}
