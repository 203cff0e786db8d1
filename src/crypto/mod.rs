//! Cryptographic primitives for the tether transport
//!
//! This module provides all cryptographic operations needed by the protocol:
//! - BLAKE2s hashing, HMAC, and key derivation (blake2s)
//! - XChaCha20-Poly1305 AEAD sealing, raw and DH-boxed (aead)
//! - X25519 Diffie-Hellman key exchange (x25519)
//! - Ed25519 identity signatures for packet necks and vouches (signing)

pub mod aead;
pub mod blake2s;
pub mod signing;
pub mod x25519;
