//! In-process `SecureStore`. Nothing touches disk, so "at rest" is the
//! process heap; values are zeroized when overwritten or dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::{
    error::StoreError,
    store::{SecureStore, Value},
};

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<(String, String), Value>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable`, as a broken keychain or a
    /// full disk would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SecureStore for MemoryStore {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.check()?;
        let records = self.records.lock();
        Ok(records
            .get(&(scope.to_string(), key.to_string()))
            .map(|v| Zeroizing::new(v.to_vec())))
    }

    async fn put(&self, scope: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        self.records.lock().insert(
            (scope.to_string(), key.to_string()),
            Zeroizing::new(value.to_vec()),
        );
        Ok(())
    }

    async fn delete(&self, scope: &str, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self
            .records
            .lock()
            .remove(&(scope.to_string(), key.to_string()))
            .is_some())
    }

    async fn keys(&self, scope: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        Ok(self
            .records
            .lock()
            .keys()
            .filter(|(s, _)| s == scope)
            .map(|(_, k)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scopes_are_isolated() {
        let store = MemoryStore::new();
        store.put("a", "k", b"one").await.unwrap();
        store.put("b", "k", b"two").await.unwrap();
        assert_eq!(store.get("a", "k").await.unwrap().unwrap().as_slice(), b"one");
        assert_eq!(store.keys("b").await.unwrap(), vec!["k".to_string()]);
        assert!(store.delete("a", "k").await.unwrap());
        assert!(!store.delete("a", "k").await.unwrap());
        assert!(store.get("a", "k").await.unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.put("s", "k", b"v").await.unwrap();
        store.set_unavailable(true);
        assert!(matches!(store.get("s", "k").await, Err(StoreError::Unavailable(_))));
        assert!(store.put("s", "k", b"w").await.is_err());
        store.set_unavailable(false);
        assert_eq!(store.get("s", "k").await.unwrap().unwrap().as_slice(), b"v");
    }
}
