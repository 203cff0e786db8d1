//! Ed25519 identity signatures
//!
//! Long-term identity keys sign packet necks and endow vouches. Signatures are
//! 64 bytes, keys 32 bytes, generation deterministic per message.

use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;

use crate::error::CryptoError;

/// Ed25519 signature length
pub const SIGNATURE_LEN: usize = 64;

/// Ed25519 key length (seed and public key)
pub const KEY_LEN: usize = 32;

/// Ed25519 signing key (private identity key)
#[derive(Clone)]
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl SigningKey {
    /// Generate a new random signing key
    pub fn generate() -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from a raw 32-byte seed
    pub fn from_bytes(bytes: &[u8; KEY_LEN]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    /// Get the raw seed bytes
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.inner.to_bytes()
    }

    /// Sign a message, returning the 64-byte signature
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.inner.sign(message).to_bytes()
    }

    /// Get the corresponding verifying key (public key)
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").finish_non_exhaustive()
    }
}

/// Ed25519 verifying key (public identity key)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl VerifyingKey {
    /// Create from raw public key bytes
    pub fn from_bytes(bytes: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                got: bytes.len(),
            })?;
        Ok(Self { inner })
    }

    /// Create from a byte slice
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                got: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(slice);
        Self::from_bytes(&bytes)
    }

    /// Get the raw public key bytes
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.inner.to_bytes()
    }

    /// Verify a signature over a message
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        if signature.len() != SIGNATURE_LEN {
            return Err(CryptoError::InvalidSignature);
        }
        let mut bytes = [0u8; SIGNATURE_LEN];
        bytes.copy_from_slice(signature);
        let sig = ed25519_dalek::Signature::from_bytes(&bytes);

        self.inner
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let key = SigningKey::generate();
        let message = b"authenticate this packet";

        let signature = key.sign(message);
        assert_eq!(signature.len(), SIGNATURE_LEN);

        key.verifying_key().verify(message, &signature).unwrap();
    }

    #[test]
    fn test_verify_wrong_message() {
        let key = SigningKey::generate();
        let signature = key.sign(b"original");

        assert!(key.verifying_key().verify(b"tampered", &signature).is_err());
    }

    #[test]
    fn test_verify_wrong_key() {
        let key = SigningKey::generate();
        let other = SigningKey::generate();
        let signature = key.sign(b"message");

        assert!(other.verifying_key().verify(b"message", &signature).is_err());
    }

    #[test]
    fn test_key_bytes_roundtrip() {
        let key = SigningKey::generate();
        let restored = SigningKey::from_bytes(&key.to_bytes());

        assert_eq!(
            key.verifying_key().to_bytes(),
            restored.verifying_key().to_bytes()
        );

        let public = VerifyingKey::from_bytes(&key.verifying_key().to_bytes()).unwrap();
        assert_eq!(public, key.verifying_key());
    }
}
