//! BLAKE3 fingerprints.
//!
//! Public keys are never logged in full; logs carry a short fingerprint so
//! two log lines about the same key can be correlated.

/// First 8 bytes of BLAKE3(public key), hex-encoded.
pub fn fingerprint(public: &[u8]) -> String {
    let digest = blake3::hash(public);
    hex::encode(&digest.as_bytes()[..8])
}
