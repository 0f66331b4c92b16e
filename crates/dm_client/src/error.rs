use thiserror::Error;

use dm_crypto::CryptoError;
use dm_proto::EnvelopeError;
use dm_store::StoreError;

/// Everything a caller of this crate has to tell apart.
#[derive(Debug, Error)]
pub enum E2eeError {
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// The peer never published a key; secure messaging is unavailable.
    #[error("No public key published for {0}")]
    PeerKeyNotFound(String),

    #[error("No session established with {0}")]
    SessionNotEstablished(String),

    /// Tampered, corrupted, replayed or wrong-session ciphertext. Never
    /// partially recovered.
    #[error("Unable to decrypt message")]
    DecryptionFailure,

    #[error("Counter gap of {gap} exceeds the limit of {limit}")]
    CounterDesync { gap: u32, limit: u32 },

    /// Local secure storage failed. For the identity key this is fatal to
    /// the feature and must be surfaced, never worked around.
    #[error("Secure storage unavailable: {0}")]
    StorageUnavailable(#[source] StoreError),

    #[error("Invalid envelope format: {0}")]
    InvalidEnvelopeFormat(String),

    #[error("Key directory unreachable: {0}")]
    PeerUnreachable(String),

    /// Unexpected key-directory response.
    #[error("Key directory error: {0}")]
    Directory(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),
}

impl E2eeError {
    /// Errors after which the UI should show "secure chat unavailable with
    /// this user" and offer no messaging. Never a reason to fall back to
    /// plaintext.
    pub fn secure_chat_unavailable(&self) -> bool {
        matches!(
            self,
            Self::InvalidKeyFormat(_) | Self::PeerKeyNotFound(_) | Self::PeerUnreachable(_)
        )
    }
}

impl From<CryptoError> for E2eeError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::DecryptionFailure | CryptoError::MessageKeyConsumed { .. } => {
                Self::DecryptionFailure
            }
            CryptoError::CounterDesync { gap, limit } => Self::CounterDesync { gap, limit },
            CryptoError::InvalidKey(msg) => Self::InvalidKeyFormat(msg),
            CryptoError::Base64Decode(e) => Self::InvalidKeyFormat(e.to_string()),
            CryptoError::UnsupportedVersion(v) => {
                Self::InvalidEnvelopeFormat(format!("unsupported version {v}"))
            }
            other => Self::Crypto(other),
        }
    }
}

impl From<StoreError> for E2eeError {
    fn from(e: StoreError) -> Self {
        Self::StorageUnavailable(e)
    }
}

impl From<EnvelopeError> for E2eeError {
    fn from(e: EnvelopeError) -> Self {
        Self::InvalidEnvelopeFormat(e.to_string())
    }
}
