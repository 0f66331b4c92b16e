//! Prekey secrets: the current and previous signed prekey, and the pool of
//! unused one-time prekeys.
//!
//! The previous signed prekey is kept after a rotation so that handshakes
//! started against the old bundle can still be accepted. One-time prekey
//! secrets are removed as soon as a session built on them authenticated its
//! first message.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use dm_crypto::{
    prekey::{OneTimePrekey, SignedPrekey},
    IdentityKeyPair, PublicKeyBytes, PublishedPrekeys,
};

use crate::{
    error::StoreError,
    store::{get_json, put_json, SecureStore},
};

pub const PREKEY_SCOPE: &str = "prekeys";
const CURRENT_SPK: &str = "spk:current";
const PREVIOUS_SPK: &str = "spk:previous";
const COUNTERS: &str = "counters";
const OPK_PREFIX: &str = "opk:";

fn opk_key(id: u32) -> String {
    // Zero-padded so lexical order is numeric order.
    format!("{OPK_PREFIX}{id:010}")
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Counters {
    next_spk_id: u32,
    next_opk_id: u32,
}

pub struct PrekeyStore {
    store: Arc<dyn SecureStore>,
    write_lock: Mutex<()>,
}

impl PrekeyStore {
    pub fn new(store: Arc<dyn SecureStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    async fn counters(&self) -> Result<Counters, StoreError> {
        Ok(get_json(&*self.store, PREKEY_SCOPE, COUNTERS)
            .await?
            .unwrap_or_default())
    }

    pub async fn current_signed_prekey(&self) -> Result<Option<SignedPrekey>, StoreError> {
        get_json(&*self.store, PREKEY_SCOPE, CURRENT_SPK).await
    }

    /// Look up a signed prekey by id among the current and previous one.
    pub async fn signed_prekey(&self, id: u32) -> Result<Option<SignedPrekey>, StoreError> {
        for slot in [CURRENT_SPK, PREVIOUS_SPK] {
            let spk: Option<SignedPrekey> = get_json(&*self.store, PREKEY_SCOPE, slot).await?;
            if let Some(spk) = spk.filter(|k| k.id == id) {
                return Ok(Some(spk));
            }
        }
        Ok(None)
    }

    /// Create a signed prekey if there is none, or replace it when it is
    /// `max_age` old. Returns whether a new key was made.
    pub async fn rotate_signed_prekey_if_due(
        &self,
        identity: &IdentityKeyPair,
        max_age: Duration,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let current = self.current_signed_prekey().await?;
        if current.as_ref().is_some_and(|k| !k.is_expired(max_age, now)) {
            return Ok(false);
        }

        // Reserve the id before any key is written, so a failed write can
        // never lead to two prekeys sharing one.
        let mut counters = self.counters().await?;
        let id = counters.next_spk_id.max(1);
        counters.next_spk_id = id.wrapping_add(1);
        put_json(&*self.store, PREKEY_SCOPE, COUNTERS, &counters).await?;

        let fresh = SignedPrekey::generate(identity, id, now);
        if let Some(old) = &current {
            put_json(&*self.store, PREKEY_SCOPE, PREVIOUS_SPK, old).await?;
        }
        put_json(&*self.store, PREKEY_SCOPE, CURRENT_SPK, &fresh).await?;
        tracing::info!(
            spk_id = id,
            replaced = current.as_ref().map(|k| k.id),
            "signed prekey rotated"
        );
        Ok(true)
    }

    pub async fn one_time_prekey_ids(&self) -> Result<Vec<u32>, StoreError> {
        Ok(self
            .store
            .keys(PREKEY_SCOPE)
            .await?
            .iter()
            .filter_map(|k| k.strip_prefix(OPK_PREFIX)?.parse().ok())
            .collect())
    }

    /// Top the one-time prekey pool back up to `target` keys. Returns how
    /// many were generated.
    pub async fn replenish_one_time_prekeys(&self, target: u32) -> Result<u32, StoreError> {
        let _guard = self.write_lock.lock().await;
        let have = u32::try_from(self.one_time_prekey_ids().await?.len()).unwrap_or(u32::MAX);
        let missing = target.saturating_sub(have);
        if missing == 0 {
            return Ok(0);
        }

        let mut counters = self.counters().await?;
        let first = counters.next_opk_id.max(1);
        counters.next_opk_id = first.wrapping_add(missing);
        put_json(&*self.store, PREKEY_SCOPE, COUNTERS, &counters).await?;

        for opk in dm_crypto::prekey::generate_one_time_prekeys(first, missing) {
            put_json(&*self.store, PREKEY_SCOPE, &opk_key(opk.id), &opk).await?;
        }
        tracing::debug!(first_id = first, count = missing, "one-time prekeys generated");
        Ok(missing)
    }

    pub async fn one_time_prekey(&self, id: u32) -> Result<Option<OneTimePrekey>, StoreError> {
        get_json(&*self.store, PREKEY_SCOPE, &opk_key(id)).await
    }

    pub async fn remove_one_time_prekey(&self, id: u32) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.store.delete(PREKEY_SCOPE, &opk_key(id)).await
    }

    /// Public halves to upload to the key directory.
    pub async fn published(&self, identity: &PublicKeyBytes) -> Result<PublishedPrekeys, StoreError> {
        let spk = self
            .current_signed_prekey()
            .await?
            .ok_or_else(|| StoreError::NotFound("signed prekey".into()))?;
        let mut one_time_prekeys = Vec::new();
        for id in self.one_time_prekey_ids().await? {
            if let Some(opk) = self.one_time_prekey(id).await? {
                one_time_prekeys.push(opk.public_part());
            }
        }
        Ok(PublishedPrekeys {
            identity_key: *identity,
            signed_prekey: spk.public_part(),
            one_time_prekeys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn prekeys() -> PrekeyStore {
        PrekeyStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn first_rotation_creates_a_signed_prekey() {
        let store = prekeys();
        let ik = IdentityKeyPair::generate();
        assert!(store.current_signed_prekey().await.unwrap().is_none());
        assert!(store.rotate_signed_prekey_if_due(&ik, Duration::days(7)).await.unwrap());
        assert!(!store.rotate_signed_prekey_if_due(&ik, Duration::days(7)).await.unwrap());

        let spk = store.current_signed_prekey().await.unwrap().unwrap();
        assert_eq!(spk.id, 1);
        spk.public_part().verify(&ik.public).unwrap();
    }

    #[tokio::test]
    async fn rotation_keeps_the_previous_key_reachable() {
        let store = prekeys();
        let ik = IdentityKeyPair::generate();
        store.rotate_signed_prekey_if_due(&ik, Duration::days(7)).await.unwrap();
        // A zero max age forces the next rotation.
        assert!(store.rotate_signed_prekey_if_due(&ik, Duration::zero()).await.unwrap());

        let current = store.current_signed_prekey().await.unwrap().unwrap();
        assert_eq!(current.id, 2);
        assert_eq!(store.signed_prekey(1).await.unwrap().unwrap().id, 1);
        assert_eq!(store.signed_prekey(2).await.unwrap().unwrap().id, 2);

        store.rotate_signed_prekey_if_due(&ik, Duration::zero()).await.unwrap();
        assert!(store.signed_prekey(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn one_time_pool_is_replenished_and_consumed() {
        let store = prekeys();
        assert_eq!(store.replenish_one_time_prekeys(5).await.unwrap(), 5);
        assert_eq!(store.one_time_prekey_ids().await.unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(store.replenish_one_time_prekeys(5).await.unwrap(), 0);

        assert!(store.remove_one_time_prekey(2).await.unwrap());
        assert!(store.one_time_prekey(2).await.unwrap().is_none());
        assert_eq!(store.replenish_one_time_prekeys(5).await.unwrap(), 1);
        // Ids are never reused.
        assert_eq!(store.one_time_prekey_ids().await.unwrap(), vec![1, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn published_bundle_lists_public_halves() {
        let store = prekeys();
        let ik = IdentityKeyPair::generate();
        assert!(matches!(
            store.published(&ik.public).await,
            Err(StoreError::NotFound(_))
        ));
        store.rotate_signed_prekey_if_due(&ik, Duration::days(7)).await.unwrap();
        store.replenish_one_time_prekeys(3).await.unwrap();

        let published = store.published(&ik.public).await.unwrap();
        assert_eq!(published.identity_key, ik.public);
        assert_eq!(published.one_time_prekeys.len(), 3);
        let opk = store.one_time_prekey(1).await.unwrap().unwrap();
        assert_eq!(published.one_time_prekeys[0].public, opk.public);
    }
}
