//! Vault: the at-rest encryption key, held in memory while unlocked.
//!
//! The 32-byte key is derived from the user's password with Argon2id and a
//! per-database salt. Locking (explicitly or after the inactivity timeout)
//! drops and zeroizes it; every store read or write then fails with
//! `VaultLocked` until the next unlock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use zeroize::ZeroizeOnDrop;

use dm_crypto::kdf::{generate_salt, vault_key_from_password};

use crate::error::StoreError;

pub const DEFAULT_AUTO_LOCK: Duration = Duration::from_secs(30 * 60);

#[derive(ZeroizeOnDrop)]
struct VaultInner {
    key: [u8; 32],
    #[zeroize(skip)]
    last_activity: Instant,
}

impl VaultInner {
    fn expired(&self, auto_lock: Option<Duration>) -> bool {
        auto_lock.is_some_and(|limit| self.last_activity.elapsed() > limit)
    }
}

/// Shared vault handle. Clones refer to the same key.
#[derive(Clone)]
pub struct Vault {
    inner: Arc<RwLock<Option<VaultInner>>>,
    auto_lock: Arc<parking_lot::Mutex<Option<Duration>>>,
}

impl Vault {
    pub fn new() -> Self {
        Self::with_auto_lock(Some(DEFAULT_AUTO_LOCK))
    }

    /// `None` disables auto-lock.
    pub fn with_auto_lock(auto_lock: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            auto_lock: Arc::new(parking_lot::Mutex::new(auto_lock)),
        }
    }

    pub async fn unlock(&self, password: &[u8], salt: &[u8; 16]) -> Result<(), StoreError> {
        let vault_key = vault_key_from_password(password, salt)?;
        self.unlock_with_key(vault_key.0).await;
        Ok(())
    }

    pub async fn unlock_with_key(&self, key: [u8; 32]) {
        *self.inner.write().await = Some(VaultInner {
            key,
            last_activity: Instant::now(),
        });
    }

    pub async fn lock(&self) {
        *self.inner.write().await = None;
    }

    pub async fn is_locked(&self) -> bool {
        let auto_lock = *self.auto_lock.lock();
        match self.inner.read().await.as_ref() {
            Some(inner) => inner.expired(auto_lock),
            None => true,
        }
    }

    pub fn set_auto_lock(&self, auto_lock: Option<Duration>) {
        *self.auto_lock.lock() = auto_lock;
    }

    /// Run `f` with the raw key and reset the inactivity timer. An expired
    /// vault is locked on the spot.
    pub async fn with_key<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&[u8; 32]) -> Result<R, StoreError>,
    {
        let auto_lock = *self.auto_lock.lock();
        let mut guard = self.inner.write().await;
        if guard.as_ref().is_some_and(|inner| inner.expired(auto_lock)) {
            tracing::debug!("vault auto-locked after inactivity");
            *guard = None;
        }
        match guard.as_mut() {
            Some(inner) => {
                inner.last_activity = Instant::now();
                f(&inner.key)
            }
            None => Err(StoreError::VaultLocked),
        }
    }
}

impl Default for Vault {
    fn default() -> Self {
        Self::new()
    }
}

/// Fresh salt for a new database. Stored next to the data; not secret.
pub fn new_vault_salt() -> [u8; 16] {
    generate_salt()
}
