//! SQLite `SecureStore` via sqlx.
//!
//! SQLite does not encrypt. Every value is sealed with the vault key
//! (XChaCha20-Poly1305, random nonce) before it is written; the scope and
//! key are bound as associated data so a row cannot be moved to another
//! slot without failing authentication. Scopes and keys themselves are
//! stored in clear to allow lookups, so they must not carry secrets.

use std::path::Path;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use zeroize::Zeroizing;

use dm_crypto::{aead, CryptoError};

use crate::{
    error::StoreError,
    store::{SecureStore, Value},
    vault::{new_vault_salt, Vault},
};

const META_SALT: &str = "vault_salt";
const META_CHECK: &str = "vault_check";
const CHECK_PLAINTEXT: &[u8] = b"dm-store vault check";

fn record_aad(scope: &str, key: &str) -> Vec<u8> {
    format!("dm-store-v1:{scope}:{key}").into_bytes()
}

/// Cheap to clone (pool and vault are shared).
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    vault: Vault,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run pending migrations.
    ///
    /// WAL mode is set on the connection, not in a migration: SQLite refuses
    /// to change `journal_mode` inside the transaction sqlx wraps each
    /// migration in.
    pub async fn open(db_path: &Path, vault: Vault) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        tracing::debug!(path = %db_path.display(), "store opened");
        Ok(Self { pool, vault })
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// The database's Argon2 salt, created on first use.
    pub async fn vault_salt(&self) -> Result<[u8; 16], StoreError> {
        if let Some(salt) = self.meta(META_SALT).await? {
            return salt.try_into().map_err(|_| StoreError::Corrupt {
                scope: "meta".into(),
                key: META_SALT.into(),
                reason: "salt must be 16 bytes".into(),
            });
        }
        let salt = new_vault_salt();
        sqlx::query("INSERT INTO meta (name, value) VALUES (?, ?)")
            .bind(META_SALT)
            .bind(salt.as_slice())
            .execute(&self.pool)
            .await?;
        Ok(salt)
    }

    /// Derive the vault key from `password`. The first unlock of a new
    /// database records a check value; later unlocks with another password
    /// fail with `WrongPassword` and leave the vault locked.
    pub async fn unlock(&self, password: &[u8]) -> Result<(), StoreError> {
        let salt = self.vault_salt().await?;
        self.vault.unlock(password, &salt).await?;

        match self.meta(META_CHECK).await? {
            Some(check) => {
                let opened = self
                    .vault
                    .with_key(|key| match aead::decrypt(key, &check, META_CHECK.as_bytes()) {
                        Ok(pt) => Ok(pt.as_slice() == CHECK_PLAINTEXT),
                        Err(CryptoError::DecryptionFailure) => Ok(false),
                        Err(e) => Err(e.into()),
                    })
                    .await?;
                if !opened {
                    self.vault.lock().await;
                    return Err(StoreError::WrongPassword);
                }
            }
            None => {
                let check = self
                    .vault
                    .with_key(|key| Ok(aead::encrypt(key, CHECK_PLAINTEXT, META_CHECK.as_bytes())?))
                    .await?;
                sqlx::query("INSERT INTO meta (name, value) VALUES (?, ?)")
                    .bind(META_CHECK)
                    .bind(check)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn meta(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(
            sqlx::query_scalar::<_, Vec<u8>>("SELECT value FROM meta WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn seal(&self, scope: &str, key: &str, plaintext: &[u8]) -> Result<String, StoreError> {
        let aad = record_aad(scope, key);
        self.vault
            .with_key(|k| Ok(URL_SAFE_NO_PAD.encode(aead::encrypt(k, plaintext, &aad)?)))
            .await
    }

    async fn open_value(&self, scope: &str, key: &str, b64: &str) -> Result<Value, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            scope: scope.to_string(),
            key: key.to_string(),
            reason,
        };
        let ct = URL_SAFE_NO_PAD
            .decode(b64)
            .map_err(|e| corrupt(e.to_string()))?;
        let aad = record_aad(scope, key);
        let pt = self
            .vault
            .with_key(|k| {
                aead::decrypt(k, &ct, &aad).map_err(|_| corrupt("authentication failed".into()))
            })
            .await?;
        Ok(Zeroizing::new(pt.to_vec()))
    }
}

#[async_trait]
impl SecureStore for SqliteStore {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query_scalar::<_, String>("SELECT value FROM kv WHERE scope = ? AND key = ?")
            .bind(scope)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(b64) => Ok(Some(self.open_value(scope, key, &b64).await?)),
            None => Ok(None),
        }
    }

    async fn put(&self, scope: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let sealed = self.seal(scope, key, value).await?;
        sqlx::query(
            "INSERT INTO kv (scope, key, value, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(scope, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(scope)
        .bind(key)
        .bind(sealed)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, scope: &str, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM kv WHERE scope = ? AND key = ?")
            .bind(scope)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn keys(&self, scope: &str) -> Result<Vec<String>, StoreError> {
        Ok(
            sqlx::query_scalar::<_, String>("SELECT key FROM kv WHERE scope = ? ORDER BY key")
                .bind(scope)
                .fetch_all(&self.pool)
                .await?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_unlocked(dir: &TempDir) -> SqliteStore {
        let store = SqliteStore::open(&dir.path().join("dm.db"), Vault::new())
            .await
            .expect("open store");
        store.vault().unlock_with_key([3u8; 32]).await;
        store
    }

    #[tokio::test]
    async fn values_are_encrypted_at_rest() {
        let dir = TempDir::new().unwrap();
        let store = open_unlocked(&dir).await;
        store.put("sessions", "bob", b"very secret chain key").await.unwrap();

        let raw: String = sqlx::query_scalar("SELECT value FROM kv WHERE scope = ? AND key = ?")
            .bind("sessions")
            .bind("bob")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let raw_bytes = URL_SAFE_NO_PAD.decode(raw).unwrap();
        assert!(!raw_bytes
            .windows(b"secret".len())
            .any(|w| w == b"secret"));

        let back = store.get("sessions", "bob").await.unwrap().unwrap();
        assert_eq!(back.as_slice(), b"very secret chain key");
    }

    #[tokio::test]
    async fn moved_row_fails_authentication() {
        let dir = TempDir::new().unwrap();
        let store = open_unlocked(&dir).await;
        store.put("sessions", "bob", b"bob's state").await.unwrap();
        sqlx::query("UPDATE kv SET key = 'carol' WHERE key = 'bob'")
            .execute(&store.pool)
            .await
            .unwrap();
        assert!(matches!(
            store.get("sessions", "carol").await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn locked_vault_blocks_reads_and_writes() {
        let dir = TempDir::new().unwrap();
        let store = open_unlocked(&dir).await;
        store.put("s", "k", b"v").await.unwrap();
        store.vault().lock().await;
        assert!(matches!(store.get("s", "k").await, Err(StoreError::VaultLocked)));
        assert!(matches!(store.put("s", "k", b"w").await, Err(StoreError::VaultLocked)));
    }

    #[tokio::test]
    async fn overwrite_delete_and_list() {
        let dir = TempDir::new().unwrap();
        let store = open_unlocked(&dir).await;
        store.put("p", "b", b"1").await.unwrap();
        store.put("p", "a", b"2").await.unwrap();
        store.put("p", "a", b"3").await.unwrap();
        store.put("q", "z", b"4").await.unwrap();
        assert_eq!(store.keys("p").await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.get("p", "a").await.unwrap().unwrap().as_slice(), b"3");
        assert!(store.delete("p", "a").await.unwrap());
        assert!(!store.delete("p", "a").await.unwrap());
        assert_eq!(store.keys("p").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn password_is_checked_on_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dm.db");
        {
            let store = SqliteStore::open(&path, Vault::new()).await.unwrap();
            store.unlock(b"hunter2").await.unwrap();
            store.put("identity", "device", b"keys").await.unwrap();
        }

        let store = SqliteStore::open(&path, Vault::new()).await.unwrap();
        assert!(matches!(
            store.unlock(b"wrong").await,
            Err(StoreError::WrongPassword)
        ));
        assert!(store.vault().is_locked().await);

        store.unlock(b"hunter2").await.unwrap();
        let value = store.get("identity", "device").await.unwrap().unwrap();
        assert_eq!(value.as_slice(), b"keys");
    }
}
