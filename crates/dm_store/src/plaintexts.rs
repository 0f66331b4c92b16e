//! Local copies of decrypted messages, keyed by server message id.
//!
//! Message keys are single-use, so an envelope can be opened exactly once.
//! Re-rendering a conversation later reads the plaintext from here instead.

use std::sync::Arc;

use dm_crypto::PublicKeyBytes;

use crate::{error::StoreError, store::SecureStore};

pub struct PlaintextCache {
    store: Arc<dyn SecureStore>,
    scope: String,
}

impl PlaintextCache {
    pub fn new(store: Arc<dyn SecureStore>, local_identity: &PublicKeyBytes) -> Self {
        Self {
            store,
            scope: format!("plaintext:{}", local_identity.fingerprint()),
        }
    }

    pub async fn get(&self, message_id: &str) -> Result<Option<String>, StoreError> {
        let Some(bytes) = self.store.get(&self.scope, message_id).await? else {
            return Ok(None);
        };
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                scope: self.scope.clone(),
                key: message_id.to_string(),
                reason: e.to_string(),
            })
    }

    pub async fn put(&self, message_id: &str, text: &str) -> Result<(), StoreError> {
        self.store.put(&self.scope, message_id, text.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use dm_crypto::IdentityKeyPair;

    #[tokio::test]
    async fn stores_text_per_identity() {
        let backing = Arc::new(MemoryStore::new());
        let me = IdentityKeyPair::generate();
        let cache = PlaintextCache::new(backing.clone(), &me.public);
        assert!(cache.get("m1").await.unwrap().is_none());
        cache.put("m1", "Hello Bob 👋").await.unwrap();
        assert_eq!(cache.get("m1").await.unwrap().as_deref(), Some("Hello Bob 👋"));

        let other = IdentityKeyPair::generate();
        assert!(PlaintextCache::new(backing, &other.public)
            .get("m1")
            .await
            .unwrap()
            .is_none());
    }
}
