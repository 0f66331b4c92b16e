//! Durable session state, keyed by peer id.
//!
//! Sessions are scoped to the local identity: a device that ever replaced
//! its identity cannot pick up sessions built on the old one.
//!
//! Next to the active session a peer may have an inbound one: the session
//! the peer started while ours was still unanswered. It is only ever read
//! from, and lives in its own scope so it never shows up in `peers`.

use std::sync::Arc;

use dm_crypto::{PublicKeyBytes, Session};

use crate::{
    error::StoreError,
    store::{get_json, put_json, SecureStore},
};

pub struct SessionStore {
    store: Arc<dyn SecureStore>,
    scope: String,
    inbound_scope: String,
}

impl SessionStore {
    pub fn new(store: Arc<dyn SecureStore>, local_identity: &PublicKeyBytes) -> Self {
        Self {
            store,
            scope: format!("sessions:{}", local_identity.fingerprint()),
            inbound_scope: format!("sessions-inbound:{}", local_identity.fingerprint()),
        }
    }

    pub async fn load(&self, peer_id: &str) -> Result<Option<Session>, StoreError> {
        get_json(&*self.store, &self.scope, peer_id).await
    }

    pub async fn save(&self, peer_id: &str, session: &Session) -> Result<(), StoreError> {
        put_json(&*self.store, &self.scope, peer_id, session).await
    }

    pub async fn delete(&self, peer_id: &str) -> Result<bool, StoreError> {
        self.store.delete(&self.scope, peer_id).await
    }

    pub async fn load_inbound(&self, peer_id: &str) -> Result<Option<Session>, StoreError> {
        get_json(&*self.store, &self.inbound_scope, peer_id).await
    }

    pub async fn save_inbound(&self, peer_id: &str, session: &Session) -> Result<(), StoreError> {
        put_json(&*self.store, &self.inbound_scope, peer_id, session).await
    }

    pub async fn delete_inbound(&self, peer_id: &str) -> Result<bool, StoreError> {
        self.store.delete(&self.inbound_scope, peer_id).await
    }

    pub async fn peers(&self) -> Result<Vec<String>, StoreError> {
        self.store.keys(&self.scope).await
    }
}
