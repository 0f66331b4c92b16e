use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    /// Authentication tag mismatch. Tampered, corrupted and wrong-session
    /// ciphertexts all end up here.
    #[error("Decryption failed (authentication tag mismatch)")]
    DecryptionFailure,

    #[error("Message key for counter {counter} was already consumed")]
    MessageKeyConsumed { counter: u32 },

    #[error("Counter gap of {gap} exceeds the skip limit of {limit}")]
    CounterDesync { gap: u32, limit: u32 },

    #[error("Send counter exhausted; the session must be re-established")]
    CounterExhausted,

    #[error("Unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Prekey error: {0}")]
    Prekey(String),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
