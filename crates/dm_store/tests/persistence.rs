use std::sync::Arc;

use chrono::Duration;
use dm_store::{IdentityKeyStore, PrekeyStore, SecureStore, SqliteStore, StoreError, Vault};
use tempfile::TempDir;

async fn open(dir: &TempDir, password: &[u8]) -> Result<Arc<SqliteStore>, StoreError> {
    let store = SqliteStore::open(&dir.path().join("dm.db"), Vault::new()).await?;
    store.unlock(password).await?;
    Ok(Arc::new(store))
}

#[tokio::test]
async fn identity_and_prekeys_survive_restart() {
    let dir = TempDir::new().unwrap();

    let (public, spk_id, opk_ids) = {
        let store = open(&dir, b"pw").await.unwrap();
        let identity = IdentityKeyStore::new(store.clone())
            .get_or_create_identity()
            .await
            .unwrap();
        let prekeys = PrekeyStore::new(store.clone());
        prekeys
            .rotate_signed_prekey_if_due(&identity, Duration::days(7))
            .await
            .unwrap();
        prekeys.replenish_one_time_prekeys(4).await.unwrap();
        let spk = prekeys.current_signed_prekey().await.unwrap().unwrap();
        (
            identity.public,
            spk.id,
            prekeys.one_time_prekey_ids().await.unwrap(),
        )
    };

    let store = open(&dir, b"pw").await.unwrap();
    let identity = IdentityKeyStore::new(store.clone())
        .get_or_create_identity()
        .await
        .unwrap();
    assert_eq!(identity.public, public);

    let prekeys = PrekeyStore::new(store.clone());
    assert_eq!(prekeys.current_signed_prekey().await.unwrap().unwrap().id, spk_id);
    assert_eq!(prekeys.one_time_prekey_ids().await.unwrap(), opk_ids);
    assert!(!prekeys
        .rotate_signed_prekey_if_due(&identity, Duration::days(7))
        .await
        .unwrap());
}

#[tokio::test]
async fn locked_store_surfaces_instead_of_regenerating() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, b"pw").await.unwrap();
    let first = IdentityKeyStore::new(store.clone())
        .get_or_create_identity()
        .await
        .unwrap();

    store.vault().lock().await;
    let ids = IdentityKeyStore::new(store.clone());
    assert!(matches!(
        ids.get_or_create_identity().await,
        Err(StoreError::VaultLocked)
    ));

    store.unlock(b"pw").await.unwrap();
    assert_eq!(ids.get_or_create_identity().await.unwrap().public, first.public);
    assert_eq!(store.keys("identity").await.unwrap().len(), 1);
}
