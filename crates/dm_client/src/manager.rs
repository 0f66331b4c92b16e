//! Per-peer session lifecycle on one device.
//!
//! Each peer gets its own async lock. A send or receive holds it for the
//! whole read-modify-write of the session, so two messages can never be
//! sealed under the same counter. Different peers proceed in parallel.
//!
//! State changes follow one rule: work on a copy, persist the copy, then
//! swap it in. A failed decrypt, a failed save or a cancelled key fetch
//! leaves the previous session untouched.
//!
//! When both sides start a session before hearing from each other, the
//! lower identity key keeps sending on its own session and reads the
//! peer's messages from an inbound session kept alongside, until the peer
//! switches over.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use dm_crypto::{
    cipher, x3dh, CryptoError, Decrypted, IdentityKeyPair, InitHeader, PublicKeyBytes, Session,
    SessionConfig,
};
use dm_proto::{envelope, DisplayBody, StoredMessage};
use dm_store::{IdentityKeyStore, PlaintextCache, PrekeyStore, SecureStore, SessionStore};

use crate::{config::ClientConfig, directory::KeyDirectory, error::E2eeError};

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    pub session: SessionConfig,
    pub fetch_timeout: Duration,
    pub one_time_prekey_batch: u32,
    pub signed_prekey_max_age: chrono::Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for ManagerConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            session: config.session_config(),
            fetch_timeout: config.fetch_timeout(),
            one_time_prekey_batch: config.one_time_prekey_batch,
            signed_prekey_max_age: config.signed_prekey_max_age(),
        }
    }
}

#[derive(Default)]
struct Slot {
    loaded: bool,
    session: Option<Session>,
    inbound: Option<Session>,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.session.is_none() && self.inbound.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Active,
    Inbound,
}

/// How a received envelope is to be opened, and where the session goes
/// once the message authenticated.
struct Candidate {
    session: Session,
    target: Target,
    /// Freshly built from the envelope's init header.
    accepted: bool,
}

pub struct SessionManager {
    identity: Arc<IdentityKeyPair>,
    prekeys: PrekeyStore,
    sessions: SessionStore,
    plaintexts: PlaintextCache,
    directory: Arc<dyn KeyDirectory>,
    config: ManagerConfig,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<Slot>>>>,
}

impl SessionManager {
    /// Load (or create) the device identity and wire up the typed stores.
    /// A storage failure here is surfaced as is; no throwaway identity is
    /// ever made up.
    pub async fn open(
        store: Arc<dyn SecureStore>,
        directory: Arc<dyn KeyDirectory>,
        config: ManagerConfig,
    ) -> Result<Self, E2eeError> {
        let identity = IdentityKeyStore::new(Arc::clone(&store))
            .get_or_create_identity()
            .await?;
        Ok(Self {
            prekeys: PrekeyStore::new(Arc::clone(&store)),
            sessions: SessionStore::new(Arc::clone(&store), &identity.public),
            plaintexts: PlaintextCache::new(store, &identity.public),
            identity,
            directory,
            config,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn identity_public(&self) -> PublicKeyBytes {
        self.identity.public
    }

    /// Rotate the signed prekey when due, top up one-time prekeys and upload
    /// both the identity key and the bundle.
    pub async fn publish_keys(&self) -> Result<(), E2eeError> {
        let rotated = self
            .prekeys
            .rotate_signed_prekey_if_due(&self.identity, self.config.signed_prekey_max_age)
            .await?;
        let generated = self
            .prekeys
            .replenish_one_time_prekeys(self.config.one_time_prekey_batch)
            .await?;
        self.directory.publish(&self.identity.public_b64()).await?;
        let published = self.prekeys.published(&self.identity.public).await?;
        self.directory.publish_bundle(&published).await?;
        tracing::info!(
            fingerprint = %self.identity.public.fingerprint(),
            rotated,
            generated,
            "keys published"
        );
        Ok(())
    }

    fn slot(&self, peer_id: &str) -> Arc<AsyncMutex<Slot>> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(peer_id.to_string()).or_default())
    }

    /// Forget the slot of a peer that has no session and that no other
    /// task is waiting on.
    fn release(&self, peer_id: &str) {
        let mut slots = self.slots.lock();
        let idle = slots.get(peer_id).is_some_and(|slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|s| s.is_empty())
        });
        if idle {
            slots.remove(peer_id);
        }
    }

    async fn lock_peer(&self, peer_id: &str) -> Result<OwnedMutexGuard<Slot>, E2eeError> {
        let mut slot = self.slot(peer_id).lock_owned().await;
        if !slot.loaded {
            slot.session = self.sessions.load(peer_id).await?;
            slot.inbound = self.sessions.load_inbound(peer_id).await?;
            slot.loaded = true;
        }
        Ok(slot)
    }

    async fn with_timeout<T, F>(&self, peer_id: &str, fut: F) -> Result<T, E2eeError>
    where
        F: std::future::Future<Output = Result<T, E2eeError>>,
    {
        tokio::time::timeout(self.config.fetch_timeout, fut)
            .await
            .map_err(|_| E2eeError::PeerUnreachable(format!("key fetch for {peer_id} timed out")))?
    }

    async fn establish_locked(&self, peer_id: &str, slot: &mut Slot) -> Result<(), E2eeError> {
        if slot.session.is_some() {
            return Ok(());
        }
        let bundle = self
            .with_timeout(peer_id, self.directory.fetch(peer_id))
            .await?;
        let session = x3dh::establish(&self.identity, &bundle, self.config.session)?;
        self.sessions.save(peer_id, &session).await?;
        tracing::info!(
            peer = peer_id,
            peer_fingerprint = %bundle.identity_key.fingerprint(),
            legacy = bundle.is_identity_only(),
            one_time_prekey = bundle.one_time_prekey.is_some(),
            "session established"
        );
        slot.session = Some(session);
        Ok(())
    }

    /// Make sure a session with `peer_id` exists, fetching its bundle if
    /// needed. Cancelling this future commits nothing.
    pub async fn ensure_session(&self, peer_id: &str) -> Result<(), E2eeError> {
        let result = self.ensure_locked(peer_id).await;
        self.release(peer_id);
        result
    }

    async fn ensure_locked(&self, peer_id: &str) -> Result<(), E2eeError> {
        let mut slot = self.lock_peer(peer_id).await?;
        self.establish_locked(peer_id, &mut slot).await
    }

    pub async fn has_session(&self, peer_id: &str) -> Result<bool, E2eeError> {
        let result = self
            .lock_peer(peer_id)
            .await
            .map(|slot| slot.session.is_some());
        self.release(peer_id);
        result
    }

    /// Encrypt `plaintext` for `peer_id` and return the envelope string.
    pub async fn send(&self, peer_id: &str, plaintext: &str) -> Result<String, E2eeError> {
        let result = self.send_locked(peer_id, plaintext).await;
        self.release(peer_id);
        result
    }

    async fn send_locked(&self, peer_id: &str, plaintext: &str) -> Result<String, E2eeError> {
        let mut slot = self.lock_peer(peer_id).await?;
        self.establish_locked(peer_id, &mut slot).await?;
        let mut next = slot
            .session
            .clone()
            .ok_or_else(|| E2eeError::SessionNotEstablished(peer_id.to_string()))?;

        let sealed = cipher::encrypt(&mut next, plaintext.as_bytes())?;
        self.sessions.save(peer_id, &next).await?;
        slot.session = Some(next);
        tracing::debug!(peer = peer_id, counter = sealed.counter, "message encrypted");
        Ok(envelope::encode(&sealed))
    }

    /// Decrypt an envelope string from `peer_id`.
    ///
    /// A prekey message may start (or replace) the session. A regular one
    /// needs a session already; with single-key peers both sides get it
    /// from `ensure_session`.
    pub async fn receive(&self, peer_id: &str, wire: &str) -> Result<Decrypted, E2eeError> {
        let result = self.receive_locked(peer_id, wire).await;
        self.release(peer_id);
        result
    }

    async fn receive_locked(&self, peer_id: &str, wire: &str) -> Result<Decrypted, E2eeError> {
        let sealed = envelope::decode(wire)?;
        let mut slot = self.lock_peer(peer_id).await?;

        let Candidate {
            session: mut next,
            target,
            accepted,
        } = match &sealed.init {
            Some(init) => self.candidate_for_init(peer_id, &slot, init).await?,
            None => Candidate {
                session: slot
                    .session
                    .clone()
                    .ok_or_else(|| E2eeError::SessionNotEstablished(peer_id.to_string()))?,
                target: Target::Active,
                accepted: false,
            },
        };

        let decrypted = cipher::decrypt(&mut next, &sealed).map_err(|e| {
            tracing::debug!(peer = peer_id, counter = sealed.counter, error = %e, "decrypt failed");
            E2eeError::from(e)
        })?;
        match target {
            Target::Active => {
                self.sessions.save(peer_id, &next).await?;
                slot.session = Some(next);
            }
            Target::Inbound => {
                self.sessions.save_inbound(peer_id, &next).await?;
                slot.inbound = Some(next);
            }
        }

        if accepted {
            tracing::info!(
                peer = peer_id,
                inbound = target == Target::Inbound,
                "session accepted"
            );
            if let Some(id) = sealed.init.as_ref().and_then(|init| init.one_time_prekey_id) {
                if let Err(e) = self.prekeys.remove_one_time_prekey(id).await {
                    tracing::warn!(opk_id = id, error = %e, "could not delete used one-time prekey");
                }
            }
        }
        if decrypted.gap > 0 {
            tracing::warn!(
                peer = peer_id,
                counter = decrypted.counter,
                gap = decrypted.gap,
                "messages missing before this one"
            );
        }
        Ok(decrypted)
    }

    /// Decrypt the envelope of server message `message_id` and keep the
    /// text, so the message still renders once its key is gone.
    pub async fn receive_message(
        &self,
        peer_id: &str,
        message_id: &str,
        wire: &str,
    ) -> Result<String, E2eeError> {
        let text = self.receive_text(peer_id, wire).await?;
        if let Err(e) = self.plaintexts.put(message_id, &text).await {
            tracing::warn!(message = message_id, error = %e, "plaintext cache write failed");
        }
        Ok(text)
    }

    /// Convenience for callers that only deal in text.
    pub async fn receive_text(&self, peer_id: &str, wire: &str) -> Result<String, E2eeError> {
        let decrypted = self.receive(peer_id, wire).await?;
        std::str::from_utf8(&decrypted.plaintext)
            .map(str::to_owned)
            .map_err(|_| E2eeError::DecryptionFailure)
    }

    async fn candidate_for_init(
        &self,
        peer_id: &str,
        slot: &Slot,
        init: &InitHeader,
    ) -> Result<Candidate, E2eeError> {
        for (existing, target) in [
            (&slot.session, Target::Active),
            (&slot.inbound, Target::Inbound),
        ] {
            if let Some(session) = existing.as_ref().filter(|s| s.origin() == Some(init)) {
                return Ok(Candidate {
                    session: session.clone(),
                    target,
                    accepted: false,
                });
            }
        }

        let target = match &slot.session {
            // Both sides started a session before hearing from the other.
            // The lower identity key keeps sending on its own; the other
            // side switches once our init header reaches it.
            Some(session)
                if session.pending_init().is_some()
                    && self.identity.public < init.initiator_identity =>
            {
                tracing::info!(
                    peer = peer_id,
                    conflict = "simultaneous_start",
                    "keeping our session, reading the peer's alongside"
                );
                Target::Inbound
            }
            Some(_) => {
                tracing::warn!(
                    peer = peer_id,
                    peer_fingerprint = %init.initiator_identity.fingerprint(),
                    "peer started a new session"
                );
                Target::Active
            }
            None => Target::Active,
        };

        let spk = self
            .prekeys
            .signed_prekey(init.signed_prekey_id)
            .await?
            .ok_or_else(|| {
                CryptoError::Prekey(format!(
                    "signed prekey {} is no longer available",
                    init.signed_prekey_id
                ))
            })?;
        let opk = match init.one_time_prekey_id {
            Some(id) => self.prekeys.one_time_prekey(id).await?,
            None => None,
        };
        let session = x3dh::accept(&self.identity, &spk, opk.as_ref(), init, self.config.session)?;
        Ok(Candidate {
            session,
            target,
            accepted: true,
        })
    }

    /// Forget the session with `peer_id`. The next send starts a new one.
    pub async fn reset_session(&self, peer_id: &str) -> Result<bool, E2eeError> {
        let result = self.reset_locked(peer_id).await;
        self.release(peer_id);
        result
    }

    async fn reset_locked(&self, peer_id: &str) -> Result<bool, E2eeError> {
        let mut slot = self.lock_peer(peer_id).await?;
        let existed = self.sessions.delete(peer_id).await?;
        self.sessions.delete_inbound(peer_id).await?;
        slot.session = None;
        slot.inbound = None;
        tracing::info!(peer = peer_id, existed, "session reset");
        Ok(existed)
    }

    pub async fn peers(&self) -> Result<Vec<String>, E2eeError> {
        Ok(self.sessions.peers().await?)
    }

    /// Remember what we sent as `message_id`. Send keys are single-use, so
    /// this is the only way our own history stays readable.
    pub async fn cache_plaintext(&self, message_id: &str, text: &str) -> Result<(), E2eeError> {
        Ok(self.plaintexts.put(message_id, text).await?)
    }

    /// Turn a page of stored messages into what the conversation shows.
    /// One bad message never aborts the page.
    pub async fn render_history(
        &self,
        messages: &[StoredMessage],
        local_user_id: &str,
    ) -> Vec<(String, DisplayBody)> {
        let mut rendered = Vec::with_capacity(messages.len());
        for message in messages {
            let body = self.render(message, local_user_id).await;
            rendered.push((message.id.clone(), body));
        }
        rendered
    }

    async fn render(&self, message: &StoredMessage, local_user_id: &str) -> DisplayBody {
        if !message.is_e2ee {
            return DisplayBody::Plaintext(message.content.clone());
        }
        match self.plaintexts.get(&message.id).await {
            Ok(Some(text)) => return DisplayBody::Decrypted(text),
            Ok(None) => {}
            Err(e) => tracing::warn!(message = %message.id, error = %e, "plaintext cache read failed"),
        }
        if message.sender_id == local_user_id {
            return DisplayBody::SentEncrypted;
        }

        match self
            .receive_message(&message.sender_id, &message.id, &message.content)
            .await
        {
            Ok(text) => DisplayBody::Decrypted(text),
            Err(e) => {
                tracing::warn!(
                    message = %message.id,
                    sender = %message.sender_id,
                    error = %e,
                    "message could not be decrypted"
                );
                DisplayBody::Undecryptable(e.to_string())
            }
        }
    }
}
