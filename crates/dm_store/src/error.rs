use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Vault is locked; unlock with password first")]
    VaultLocked,

    #[error("Wrong vault password")]
    WrongPassword,

    #[error("Crypto error: {0}")]
    Crypto(#[from] dm_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    /// A record exists but cannot be read back. Never a reason to
    /// regenerate key material.
    #[error("Corrupt record {scope}/{key}: {reason}")]
    Corrupt {
        scope: String,
        key: String,
        reason: String,
    },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("Migration error: {0}")]
    Migration(String),
}
