//! BLAKE2s hashing and key derivation
//!
//! Implements the hash, HMAC, and KDF functions used for session-key
//! derivation after the endow handshake.

use blake2::{
    digest::{FixedOutput, Mac as _, Update},
    Blake2s256, Digest,
};
use hmac::SimpleHmac;

/// Type alias for HMAC-BLAKE2s (RFC 2104 HMAC with BLAKE2s-256)
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 hash output
pub const HASH_LEN: usize = 32;

/// BLAKE2s-256 hash of a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// BLAKE2s-256 hash of two concatenated inputs: HASH(a || b)
pub fn hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, b);
    hasher.finalize().into()
}

/// HMAC-BLAKE2s using the standard RFC 2104 HMAC construction
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    let mut mac = HmacBlake2s::new_from_slice(key).expect("HMAC accepts any key length");
    Update::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// KDF1: Single-output key derivation
/// Returns one 32-byte key
pub fn kdf1(key: &[u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let temp = hmac(key, input);
    hmac(&temp, &[0x01])
}

/// KDF2: Two-output key derivation
/// Returns two 32-byte keys
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let temp = hmac(key, input);

    // T1 = HMAC(temp, 0x01)
    let t1 = hmac(&temp, &[0x01]);

    // T2 = HMAC(temp, T1 || 0x02)
    let mut t2_input = [0u8; HASH_LEN + 1];
    t2_input[..HASH_LEN].copy_from_slice(&t1);
    t2_input[HASH_LEN] = 0x02;
    let t2 = hmac(&temp, &t2_input);

    (t1, t2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_two() {
        let a = b"hello";
        let b = b"world";

        // hash_two(a, b) should equal hash(a || b)
        let result1 = hash_two(a, b);

        let mut combined = Vec::new();
        combined.extend_from_slice(a);
        combined.extend_from_slice(b);
        let result2 = hash(&combined);

        assert_eq!(result1, result2);
    }

    #[test]
    fn test_hmac_deterministic() {
        let key = [7u8; 32];
        let data = b"session input";

        assert_eq!(hmac(&key, data), hmac(&key, data));
        assert_ne!(hmac(&key, data), hmac(&key, b"other input"));
    }

    #[test]
    fn test_kdf_outputs() {
        let key = [0u8; 32];
        let input = b"test input";

        let k1 = kdf1(&key, input);
        assert_eq!(k1.len(), 32);

        let (k2a, k2b) = kdf2(&key, input);
        assert_eq!(k2a.len(), 32);
        assert_eq!(k2b.len(), 32);
        assert_ne!(k2a, k2b);
    }
}
