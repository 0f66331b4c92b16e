//! Key directory: where public key material is published and fetched.
//!
//! `HttpKeyDirectory` talks to the platform REST API. `MemoryKeyDirectory`
//! plays the server for tests and local demos.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;

use dm_crypto::{
    prekey::{OneTimePrekeyPublic, SignedPrekeyPublic},
    PublicKeyBundle, PublicKeyBytes, PublishedPrekeys,
};
use dm_proto::api::{ErrorResponse, PrekeyBundleBody, PublicKeyBody, PublishBundleRequest};

use crate::error::E2eeError;

#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Replace the caller's long-term public key. The key is checked before
    /// anything is sent.
    async fn publish(&self, public_key_b64: &str) -> Result<(), E2eeError>;

    /// Replace the caller's signed prekey and add the one-time prekeys the
    /// directory has never handed out. Ids already issued stay consumed.
    async fn publish_bundle(&self, prekeys: &PublishedPrekeys) -> Result<(), E2eeError>;

    /// `PeerKeyNotFound` when the peer never published anything.
    async fn fetch(&self, peer_id: &str) -> Result<PublicKeyBundle, E2eeError>;

    /// The peer's long-term key alone. Does not consume a one-time prekey.
    async fn fetch_identity_key(&self, peer_id: &str) -> Result<PublicKeyBytes, E2eeError>;
}

fn validate_key(public_key_b64: &str) -> Result<PublicKeyBytes, E2eeError> {
    PublicKeyBytes::from_b64(public_key_b64).map_err(E2eeError::from)
}

// ── HTTP ─────────────────────────────────────────────────────────────────────

pub struct HttpKeyDirectory {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

/// Readable reason from a directory error body. The server answers
/// `{ "error": "...", "code": "..." }`; anything else falls back to the status.
fn directory_error(status: StatusCode, body: &str) -> String {
    if let Ok(err) = serde_json::from_str::<ErrorResponse>(body) {
        return err.code.unwrap_or(err.error);
    }
    match status.as_u16() {
        401 | 403 => "unauthorized".to_string(),
        429 => "rate_limited".to_string(),
        code => format!("server_error (HTTP {code})"),
    }
}

fn transport_error(e: reqwest::Error) -> E2eeError {
    if e.is_timeout() || e.is_connect() {
        E2eeError::PeerUnreachable(e.to_string())
    } else {
        E2eeError::Directory(e.to_string())
    }
}

impl HttpKeyDirectory {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, E2eeError> {
        let base = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| E2eeError::Config(format!("api_base_url: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(E2eeError::Config(format!("api_base_url {base_url} cannot be a base")));
        }
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| E2eeError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    /// `segments` are appended one by one, so a peer id is always a single
    /// escaped path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// `Ok(None)` on 404.
    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>, E2eeError> {
        let resp = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        let body = resp.text().await.map_err(transport_error)?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(E2eeError::Directory(directory_error(status, &body)));
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| E2eeError::Directory(format!("malformed response: {e}")))
    }

    async fn put_json<T>(&self, url: Url, body: &T) -> Result<(), E2eeError>
    where
        T: serde::Serialize + Sync,
    {
        let resp = self
            .authorize(self.client.put(url))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        let reason = directory_error(status, &text);
        if status == StatusCode::BAD_REQUEST {
            return Err(E2eeError::InvalidKeyFormat(reason));
        }
        Err(E2eeError::Directory(reason))
    }
}

#[async_trait]
impl KeyDirectory for HttpKeyDirectory {
    async fn publish(&self, public_key_b64: &str) -> Result<(), E2eeError> {
        let key = validate_key(public_key_b64)?;
        self.put_json(self.url(&["user", "publicKey"]), &PublicKeyBody::new(&key))
            .await?;
        tracing::info!(fingerprint = %key.fingerprint(), "published identity key");
        Ok(())
    }

    async fn publish_bundle(&self, prekeys: &PublishedPrekeys) -> Result<(), E2eeError> {
        let body = PublishBundleRequest::from(prekeys);
        self.put_json(self.url(&["user", "prekeyBundle"]), &body).await?;
        tracing::info!(
            signed_prekey = prekeys.signed_prekey.id,
            one_time_prekeys = prekeys.one_time_prekeys.len(),
            "published prekey bundle"
        );
        Ok(())
    }

    async fn fetch(&self, peer_id: &str) -> Result<PublicKeyBundle, E2eeError> {
        let bundle: Option<PrekeyBundleBody> =
            self.get_json(self.url(&["user", peer_id, "prekeyBundle"])).await?;
        if let Some(body) = bundle {
            return Ok(PublicKeyBundle::try_from(&body)?);
        }

        // Peers that only ever uploaded a single key.
        let key = self.fetch_identity_key(peer_id).await?;
        tracing::debug!(peer = peer_id, "no prekey bundle, using identity key only");
        Ok(PublicKeyBundle::identity_only(key))
    }

    async fn fetch_identity_key(&self, peer_id: &str) -> Result<PublicKeyBytes, E2eeError> {
        let key: Option<PublicKeyBody> =
            self.get_json(self.url(&["user", peer_id, "publicKey"])).await?;
        match key {
            Some(body) => Ok(body.parse()?),
            None => Err(E2eeError::PeerKeyNotFound(peer_id.to_string())),
        }
    }
}

// ── In-memory ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Published {
    identity: Option<PublicKeyBytes>,
    signed_prekey: Option<SignedPrekeyPublic>,
    pool: VecDeque<OneTimePrekeyPublic>,
    /// Ids already handed out; re-uploads never put them back in the pool.
    issued: HashSet<u32>,
}

impl Published {
    fn set_identity(&mut self, key: PublicKeyBytes) {
        if self.identity.is_some_and(|old| old != key) {
            self.signed_prekey = None;
            self.pool.clear();
            self.issued.clear();
        }
        self.identity = Some(key);
    }
}

/// Server-side state shared by every `MemoryDirectoryClient` made from it.
///
/// Bundle uploads replace the signed prekey and add one-time prekeys the
/// directory has not seen yet, like the platform endpoint does.
#[derive(Default)]
pub struct MemoryKeyDirectory {
    users: Mutex<HashMap<String, Published>>,
    unreachable: AtomicBool,
}

impl MemoryKeyDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A client authenticated as `user_id`.
    pub fn client(self: &Arc<Self>, user_id: impl Into<String>) -> MemoryDirectoryClient {
        MemoryDirectoryClient {
            server: Arc::clone(self),
            user_id: user_id.into(),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// One-time prekeys still on offer for `user_id`.
    pub fn remaining_one_time_prekeys(&self, user_id: &str) -> usize {
        self.users.lock().get(user_id).map_or(0, |p| p.pool.len())
    }

    fn check_reachable(&self) -> Result<(), E2eeError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(E2eeError::PeerUnreachable("directory offline".into()));
        }
        Ok(())
    }

    fn published_identity(&self, peer_id: &str) -> Result<PublicKeyBytes, E2eeError> {
        self.users
            .lock()
            .get(peer_id)
            .and_then(|p| p.identity)
            .ok_or_else(|| E2eeError::PeerKeyNotFound(peer_id.to_string()))
    }
}

pub struct MemoryDirectoryClient {
    server: Arc<MemoryKeyDirectory>,
    user_id: String,
}

#[async_trait]
impl KeyDirectory for MemoryDirectoryClient {
    async fn publish(&self, public_key_b64: &str) -> Result<(), E2eeError> {
        let key = validate_key(public_key_b64)?;
        self.server.check_reachable()?;
        let mut users = self.server.users.lock();
        users.entry(self.user_id.clone()).or_default().set_identity(key);
        Ok(())
    }

    async fn publish_bundle(&self, prekeys: &PublishedPrekeys) -> Result<(), E2eeError> {
        prekeys.signed_prekey.verify(&prekeys.identity_key)?;
        self.server.check_reachable()?;
        let mut users = self.server.users.lock();
        let entry = users.entry(self.user_id.clone()).or_default();
        entry.set_identity(prekeys.identity_key);
        entry.signed_prekey = Some(prekeys.signed_prekey.clone());
        for opk in &prekeys.one_time_prekeys {
            let known = entry.issued.contains(&opk.id) || entry.pool.iter().any(|k| k.id == opk.id);
            if !known {
                entry.pool.push_back(opk.clone());
            }
        }
        Ok(())
    }

    async fn fetch(&self, peer_id: &str) -> Result<PublicKeyBundle, E2eeError> {
        self.server.check_reachable()?;
        let mut users = self.server.users.lock();
        let entry = users
            .get_mut(peer_id)
            .ok_or_else(|| E2eeError::PeerKeyNotFound(peer_id.to_string()))?;
        let identity_key = entry
            .identity
            .ok_or_else(|| E2eeError::PeerKeyNotFound(peer_id.to_string()))?;
        let Some(signed_prekey) = entry.signed_prekey.clone() else {
            return Ok(PublicKeyBundle::identity_only(identity_key));
        };
        let one_time_prekey = entry.pool.pop_front();
        if let Some(opk) = &one_time_prekey {
            entry.issued.insert(opk.id);
        }
        Ok(PublicKeyBundle {
            identity_key,
            signed_prekey: Some(signed_prekey),
            one_time_prekey,
        })
    }

    async fn fetch_identity_key(&self, peer_id: &str) -> Result<PublicKeyBytes, E2eeError> {
        self.server.check_reachable()?;
        self.server.published_identity(peer_id)
    }
}
