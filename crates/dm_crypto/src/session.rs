//! Per-peer session state.
//!
//! The root key produced by `x3dh` is split into the two chains right away
//! and never stored. What remains (chains, counters, skipped keys, handshake
//! bookkeeping) is the only mutable state of a conversation; it is held on
//! the client, persisted encrypted by `dm_store`, and never transmitted.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    identity::PublicKeyBytes,
    ratchet::{self, ChainKey, ChainPolicy, RecvChain, SendChain, DEFAULT_MAX_SKIP},
    x3dh::InitHeader,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub policy: ChainPolicy,
    /// Largest counter gap tolerated, and size of the skipped-key cache.
    pub max_skip: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: ChainPolicy::default(),
            max_skip: DEFAULT_MAX_SKIP,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    pub(crate) peer_identity: PublicKeyBytes,
    pub(crate) role: Role,
    pub(crate) config: SessionConfig,
    pub(crate) send: SendChain,
    pub(crate) recv: RecvChain,
    /// Attached to outgoing envelopes until the peer's first reply proves
    /// it holds the session too.
    pub(crate) pending_init: Option<InitHeader>,
    /// Handshake a responder session was accepted from.
    pub(crate) origin: Option<InitHeader>,
    pub(crate) created_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn from_root(
        root: &[u8; 32],
        role: Role,
        peer_identity: PublicKeyBytes,
        config: SessionConfig,
        pending_init: Option<InitHeader>,
        origin: Option<InitHeader>,
    ) -> Self {
        let (initiator_send, initiator_recv) = ratchet::split_root(root);
        let (send, recv) = match role {
            Role::Initiator => (initiator_send, initiator_recv),
            Role::Responder => (initiator_recv, initiator_send),
        };
        Self {
            peer_identity,
            role,
            config,
            send: SendChain::new(send),
            recv: RecvChain::new(recv),
            pending_init,
            origin,
            created_at: Utc::now(),
        }
    }

    pub fn peer_identity(&self) -> &PublicKeyBytes {
        &self.peer_identity
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }

    pub fn send_counter(&self) -> u32 {
        self.send.counter()
    }

    pub fn recv_counter(&self) -> u32 {
        self.recv.next_counter()
    }

    pub fn pending_init(&self) -> Option<&InitHeader> {
        self.pending_init.as_ref()
    }

    pub fn origin(&self) -> Option<&InitHeader> {
        self.origin.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn send_chain_key(&self) -> &ChainKey {
        self.send.chain_key()
    }

    pub fn recv_chain_key(&self) -> &ChainKey {
        self.recv.chain_key()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer_identity)
            .field("role", &self.role)
            .field("policy", &self.config.policy)
            .field("send_counter", &self.send_counter())
            .field("recv_counter", &self.recv_counter())
            .field("pending_init", &self.pending_init.is_some())
            .finish_non_exhaustive()
    }
}
