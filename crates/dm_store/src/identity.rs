//! Persistent device identity.

use std::sync::Arc;

use tokio::sync::OnceCell;

use dm_crypto::IdentityKeyPair;

use crate::{error::StoreError, store::SecureStore};

pub const IDENTITY_SCOPE: &str = "identity";
const DEVICE_KEY: &str = "device";

/// Loads the device identity once and hands out the same pair afterwards.
pub struct IdentityKeyStore {
    store: Arc<dyn SecureStore>,
    cached: OnceCell<Arc<IdentityKeyPair>>,
}

impl IdentityKeyStore {
    pub fn new(store: Arc<dyn SecureStore>) -> Self {
        Self {
            store,
            cached: OnceCell::new(),
        }
    }

    /// Return the stored identity, generating and persisting one on first
    /// use. Storage errors propagate; a throwaway identity is never
    /// returned, since it would silently orphan every existing session.
    /// Concurrent first calls are serialised by the cell, so only one
    /// identity is ever generated.
    pub async fn get_or_create_identity(&self) -> Result<Arc<IdentityKeyPair>, StoreError> {
        self.cached
            .get_or_try_init(|| async {
                if let Some(bytes) = self.store.get(IDENTITY_SCOPE, DEVICE_KEY).await? {
                    let identity = IdentityKeyPair::from_storage_bytes(&bytes).map_err(|e| {
                        StoreError::Corrupt {
                            scope: IDENTITY_SCOPE.into(),
                            key: DEVICE_KEY.into(),
                            reason: e.to_string(),
                        }
                    })?;
                    tracing::debug!(fingerprint = %identity.public.fingerprint(), "identity loaded");
                    return Ok(Arc::new(identity));
                }

                let identity = IdentityKeyPair::generate();
                self.store
                    .put(IDENTITY_SCOPE, DEVICE_KEY, &identity.to_storage_bytes())
                    .await?;
                tracing::info!(fingerprint = %identity.public.fingerprint(), "new device identity created");
                Ok::<_, StoreError>(Arc::new(identity))
            })
            .await
            .cloned()
    }
}
