//! Symmetric ratchet: chain keys and message keys.
//!
//!   root  → (send chain, recv chain)     split_root, once per session
//!   ck    → H(ck ‖ "next")               advance, one-way
//!   mk    → policy dependent, see `ChainPolicy`
//!
//! Every derivation is SHA-512/256 over a fixed concatenation (`kdf::hash32`).
//!
//! Direction labels are fixed from the initiator's point of view: the
//! initiator sends on H(root ‖ "send"), the responder sends on
//! H(root ‖ "recv"). One side's send chain is the other side's recv chain.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{error::CryptoError, kdf};

const LABEL_SEND: &[u8] = b"send";
const LABEL_RECV: &[u8] = b"recv";
const LABEL_NEXT: &[u8] = b"next";
const LABEL_MESSAGE: &[u8] = b"msg";

/// Upper bound on cached keys for messages that have not arrived yet.
pub const DEFAULT_MAX_SKIP: u32 = 256;

/// How message keys are derived from a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainPolicy {
    /// `mk = H(ck ‖ LE32(counter))`; the chain key is never mutated per
    /// message. Anyone holding one chain snapshot can derive every key of
    /// the epoch.
    CounterIndexed,
    /// `mk = H(ck ‖ "msg")`, then `ck ← advance(ck)`. The counter is only
    /// ordering metadata; earlier keys cannot be rebuilt from a later chain.
    #[default]
    Advancing,
}

// ── Keys ─────────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey([u8; 32]);

impl ChainKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChainKey(..)")
    }
}

/// Single-use key for exactly one ciphertext.
pub type MessageKey = Zeroizing<[u8; 32]>;

/// One-way chain advancement: `H(ck ‖ "next")`.
pub fn advance(ck: &ChainKey) -> ChainKey {
    ChainKey(kdf::hash32(&[&ck.0, LABEL_NEXT]))
}

/// Split a root key into `(initiator send chain, initiator recv chain)`.
pub fn split_root(root: &[u8; 32]) -> (ChainKey, ChainKey) {
    (
        ChainKey(kdf::hash32(&[root, LABEL_SEND])),
        ChainKey(kdf::hash32(&[root, LABEL_RECV])),
    )
}

pub fn counter_message_key(ck: &ChainKey, counter: u32) -> MessageKey {
    Zeroizing::new(kdf::hash32(&[&ck.0, &counter.to_le_bytes()]))
}

fn chain_message_key(ck: &ChainKey) -> MessageKey {
    Zeroizing::new(kdf::hash32(&[&ck.0, LABEL_MESSAGE]))
}

// ── Sending chain ────────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct SendChain {
    key: ChainKey,
    counter: u32,
}

impl SendChain {
    pub fn new(key: ChainKey) -> Self {
        Self { key, counter: 0 }
    }

    /// Counter the next outgoing message will carry.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn chain_key(&self) -> &ChainKey {
        &self.key
    }

    /// Derive the key for the next outgoing message and move past it, so the
    /// same `(chain, counter)` pair is never handed out twice.
    pub fn next_message_key(&mut self, policy: ChainPolicy) -> Result<(u32, MessageKey), CryptoError> {
        let counter = self.counter;
        let next = counter.checked_add(1).ok_or(CryptoError::CounterExhausted)?;
        let mk = match policy {
            ChainPolicy::CounterIndexed => counter_message_key(&self.key, counter),
            ChainPolicy::Advancing => {
                let mk = chain_message_key(&self.key);
                self.key = advance(&self.key);
                mk
            }
        };
        self.counter = next;
        Ok((counter, mk))
    }
}

// ── Receiving chain ──────────────────────────────────────────────────────────

/// For `CounterIndexed`, `key` is the epoch base. For `Advancing`, `key` is
/// the chain value for counter `next_counter`; keys of counters skipped on
/// the way are parked in `skipped` until their message arrives.
#[derive(Clone, Serialize, Deserialize)]
pub struct RecvChain {
    key: ChainKey,
    next_counter: u32,
    skipped: BTreeMap<u32, [u8; 32]>,
}

impl Drop for RecvChain {
    fn drop(&mut self) {
        for mk in self.skipped.values_mut() {
            mk.zeroize();
        }
    }
}

impl RecvChain {
    pub fn new(key: ChainKey) -> Self {
        Self {
            key,
            next_counter: 0,
            skipped: BTreeMap::new(),
        }
    }

    /// One past the highest counter seen so far.
    pub fn next_counter(&self) -> u32 {
        self.next_counter
    }

    pub fn chain_key(&self) -> &ChainKey {
        &self.key
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Derive the key for `counter` without touching `self`. Returns the key
    /// and the chain state to commit once the ciphertext authenticated, so a
    /// forged message can never move the chain.
    pub fn message_key(
        &self,
        counter: u32,
        policy: ChainPolicy,
        max_skip: u32,
    ) -> Result<(MessageKey, RecvChain), CryptoError> {
        let mut next = self.clone();
        match policy {
            ChainPolicy::CounterIndexed => {
                let mk = counter_message_key(&self.key, counter);
                next.next_counter = next.next_counter.max(counter.saturating_add(1));
                Ok((mk, next))
            }
            ChainPolicy::Advancing if counter < self.next_counter => {
                let mk = next
                    .skipped
                    .remove(&counter)
                    .ok_or(CryptoError::MessageKeyConsumed { counter })?;
                Ok((Zeroizing::new(mk), next))
            }
            ChainPolicy::Advancing => {
                let gap = counter - self.next_counter;
                if gap > max_skip {
                    return Err(CryptoError::CounterDesync { gap, limit: max_skip });
                }
                while next.next_counter < counter {
                    let mk = chain_message_key(&next.key);
                    next.skipped.insert(next.next_counter, *mk);
                    next.key = advance(&next.key);
                    next.next_counter += 1;
                }
                let mk = chain_message_key(&next.key);
                next.key = advance(&next.key);
                next.next_counter = counter.saturating_add(1);
                // Oldest keys go first when the cache is full.
                while next.skipped.len() > max_skip as usize {
                    if let Some((_, mut old)) = next.skipped.pop_first() {
                        old.zeroize();
                    }
                }
                Ok((mk, next))
            }
        }
    }
}
