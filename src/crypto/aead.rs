//! AEAD sealing for the tether transport
//!
//! Implements XChaCha20-Poly1305 with explicit random nonces, both raw
//! (session-keyed crypt tails) and DH-boxed (endow handshake payloads sealed
//! between a private key and a peer public key).

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use super::{blake2s, x25519};
use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// XChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// XChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 24;

/// Generate a fresh random nonce
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt plaintext using XChaCha20-Poly1305 with an explicit nonce
pub fn seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let xnonce = XNonce::from_slice(nonce);

    cipher
        .encrypt(
            xnonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt ciphertext using XChaCha20-Poly1305 with an explicit nonce
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let xnonce = XNonce::from_slice(nonce);

    cipher
        .decrypt(
            xnonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

/// Derive a boxed-seal key from a DH exchange
///
/// key = BLAKE2s(X25519(private, public)); symmetric in the two pairings of
/// a keypair exchange, so either side can derive it from its own private key
/// and the other side's public key.
fn boxed_key(private: &[u8; 32], public: &[u8; 32]) -> [u8; KEY_LEN] {
    blake2s::hash(&x25519::dh(private, public))
}

/// Seal plaintext to a peer: encrypt under the DH-derived key with a fresh nonce
///
/// Returns (nonce, ciphertext).
pub fn seal_to(
    private: &[u8; 32],
    peer_public: &[u8; 32],
    plaintext: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let key = boxed_key(private, peer_public);
    let nonce = random_nonce();
    let ciphertext = seal(&key, &nonce, plaintext, &[])?;
    Ok((nonce, ciphertext))
}

/// Open a sealed block from a peer under the DH-derived key
pub fn open_from(
    private: &[u8; 32],
    peer_public: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key = boxed_key(private, peer_public);
    open(&key, nonce, ciphertext, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [0u8; 32];
        let nonce = [1u8; 24];
        let plaintext = b"Hello, tether!";
        let aad = b"additional data";

        let ciphertext = seal(&key, &nonce, plaintext, aad).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);

        let decrypted = open(&key, &nonce, &ciphertext, aad).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_open_wrong_key() {
        let key = [0u8; 32];
        let wrong_key = [1u8; 32];
        let nonce = [1u8; 24];

        let ciphertext = seal(&key, &nonce, b"secret", &[]).unwrap();
        assert!(open(&wrong_key, &nonce, &ciphertext, &[]).is_err());
    }

    #[test]
    fn test_open_wrong_nonce() {
        let key = [0u8; 32];

        let ciphertext = seal(&key, &[1u8; 24], b"secret", &[]).unwrap();
        assert!(open(&key, &[2u8; 24], &ciphertext, &[]).is_err());
    }

    #[test]
    fn test_boxed_seal_both_pairings() {
        let (a_private, a_public) = x25519::generate_keypair();
        let (b_private, b_public) = x25519::generate_keypair();

        // Sealed with (a_private, b_public), opened with (b_private, a_public)
        let (nonce, cipher) = seal_to(&a_private, &b_public, b"cookie contents").unwrap();
        let plain = open_from(&b_private, &a_public, &nonce, &cipher).unwrap();
        assert_eq!(plain, b"cookie contents");
    }

    #[test]
    fn test_boxed_seal_tamper() {
        let (a_private, a_public) = x25519::generate_keypair();
        let (b_private, b_public) = x25519::generate_keypair();

        let (nonce, mut cipher) = seal_to(&a_private, &b_public, b"cookie contents").unwrap();
        cipher[0] ^= 0x01;
        assert!(open_from(&b_private, &a_public, &nonce, &cipher).is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let key = [0u8; 32];
        let nonce = [0u8; 24];

        let ciphertext = seal(&key, &nonce, &[], &[]).unwrap();
        assert_eq!(ciphertext.len(), TAG_LEN); // Just the tag

        let decrypted = open(&key, &nonce, &ciphertext, &[]).unwrap();
        assert!(decrypted.is_empty());
    }
}
