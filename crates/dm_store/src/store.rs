//! Scoped secure key-value storage.
//!
//! Everything the client must keep across restarts (identity, prekey
//! secrets, session state) goes through this trait. Backends guarantee that
//! values are encrypted at rest; callers never see ciphertext.

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::error::StoreError;

pub type Value = Zeroizing<Vec<u8>>;

#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Insert or overwrite.
    async fn put(&self, scope: &str, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, scope: &str, key: &str) -> Result<bool, StoreError>;

    /// Keys present in `scope`, sorted.
    async fn keys(&self, scope: &str) -> Result<Vec<String>, StoreError>;
}

/// JSON helpers shared by the typed stores. Serialised secrets are wrapped
/// in `Zeroizing` so the plaintext copy is wiped after the write.
pub(crate) async fn put_json<T: serde::Serialize + Sync>(
    store: &dyn SecureStore,
    scope: &str,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = Zeroizing::new(serde_json::to_vec(value)?);
    store.put(scope, key, &bytes).await
}

pub(crate) async fn get_json<T: serde::de::DeserializeOwned>(
    store: &dyn SecureStore,
    scope: &str,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(bytes) = store.get(scope, key).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            scope: scope.to_string(),
            key: key.to_string(),
            reason: e.to_string(),
        })
}
