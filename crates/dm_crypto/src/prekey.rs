//! Prekeys and the public key bundle.
//!
//! - Signed Prekey (SPK): X25519, rotated periodically, public half signed
//!   by the Ed25519 identity key.
//! - One-Time Prekeys (OPK): X25519, handed out once by the directory and
//!   deleted locally once a session consumed them.
//!
//! A `PublicKeyBundle` is what a peer fetches to start a session. A bundle
//! holding only the identity key is the legacy single-key directory record.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::{
    error::CryptoError,
    identity::{IdentityKeyPair, PublicKeyBytes},
};

// ── Private halves ───────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SignedPrekey {
    #[zeroize(skip)]
    pub id: u32,
    secret: [u8; 32],
    #[zeroize(skip)]
    pub public: [u8; 32],
    #[zeroize(skip)]
    pub signature: Vec<u8>,
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
}

impl SignedPrekey {
    pub fn generate(identity: &IdentityKeyPair, id: u32, now: DateTime<Utc>) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret).to_bytes();
        let signature = identity.sign(&public).to_vec();
        Self {
            id,
            secret: secret.to_bytes(),
            public,
            signature,
            created_at: now,
        }
    }

    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }

    pub fn is_expired(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at >= max_age
    }

    pub fn public_part(&self) -> SignedPrekeyPublic {
        SignedPrekeyPublic {
            id: self.id,
            public: self.public,
            signature: self.signature.clone(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct OneTimePrekey {
    #[zeroize(skip)]
    pub id: u32,
    secret: [u8; 32],
    #[zeroize(skip)]
    pub public: [u8; 32],
}

impl OneTimePrekey {
    pub fn generate(id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self {
            id,
            public: X25519Public::from(&secret).to_bytes(),
            secret: secret.to_bytes(),
        }
    }

    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }

    pub fn public_part(&self) -> OneTimePrekeyPublic {
        OneTimePrekeyPublic {
            id: self.id,
            public: self.public,
        }
    }
}

/// Generate `count` one-time prekeys with consecutive ids starting at `first_id`.
pub fn generate_one_time_prekeys(first_id: u32, count: u32) -> Vec<OneTimePrekey> {
    (0..count)
        .map(|i| OneTimePrekey::generate(first_id.wrapping_add(i)))
        .collect()
}

// ── Public halves ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPrekeyPublic {
    pub id: u32,
    pub public: [u8; 32],
    pub signature: Vec<u8>,
}

impl SignedPrekeyPublic {
    pub fn verify(&self, identity: &PublicKeyBytes) -> Result<(), CryptoError> {
        IdentityKeyPair::verify(identity, &self.public, &self.signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePrekeyPublic {
    pub id: u32,
    pub public: [u8; 32],
}

/// What a peer fetches from the key directory to start a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyBundle {
    pub identity_key: PublicKeyBytes,
    pub signed_prekey: Option<SignedPrekeyPublic>,
    pub one_time_prekey: Option<OneTimePrekeyPublic>,
}

impl PublicKeyBundle {
    /// Legacy record: one static key per user, no prekeys.
    pub fn identity_only(identity_key: PublicKeyBytes) -> Self {
        Self {
            identity_key,
            signed_prekey: None,
            one_time_prekey: None,
        }
    }

    pub fn is_identity_only(&self) -> bool {
        self.signed_prekey.is_none() && self.one_time_prekey.is_none()
    }
}

/// What a device uploads: its identity, the current signed prekey and a
/// pool of one-time prekeys. The directory hands out at most one OPK per
/// fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPrekeys {
    pub identity_key: PublicKeyBytes,
    pub signed_prekey: SignedPrekeyPublic,
    pub one_time_prekeys: Vec<OneTimePrekeyPublic>,
}

impl PublishedPrekeys {
    pub fn bundle_with(&self, one_time_prekey: Option<OneTimePrekeyPublic>) -> PublicKeyBundle {
        PublicKeyBundle {
            identity_key: self.identity_key,
            signed_prekey: Some(self.signed_prekey.clone()),
            one_time_prekey,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_prekey_verifies_against_owner_only() {
        let owner = IdentityKeyPair::generate();
        let stranger = IdentityKeyPair::generate();
        let spk = SignedPrekey::generate(&owner, 1, Utc::now());
        spk.public_part().verify(&owner.public).unwrap();
        assert!(matches!(
            spk.public_part().verify(&stranger.public),
            Err(CryptoError::SignatureVerification)
        ));
    }

    #[test]
    fn signed_prekey_expiry() {
        let owner = IdentityKeyPair::generate();
        let created = Utc::now() - Duration::days(8);
        let spk = SignedPrekey::generate(&owner, 1, created);
        assert!(spk.is_expired(Duration::days(7), Utc::now()));
        assert!(!spk.is_expired(Duration::days(30), Utc::now()));
    }

    #[test]
    fn one_time_prekeys_have_consecutive_ids_and_distinct_keys() {
        let opks = generate_one_time_prekeys(10, 5);
        let ids: Vec<u32> = opks.iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![10, 11, 12, 13, 14]);
        for (i, a) in opks.iter().enumerate() {
            for b in &opks[i + 1..] {
                assert_ne!(a.public, b.public);
            }
        }
    }
}
