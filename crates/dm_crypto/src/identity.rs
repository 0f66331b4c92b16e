//! Identity key management
//!
//! Each *device* owns exactly one long-term `IdentityKeyPair`. It is an
//! Ed25519 keypair (the Edwards form of Curve25519) so that it can sign the
//! device's prekeys; for Diffie-Hellman it is mapped to its X25519
//! (Montgomery) form. Both forms share the same 32-byte secret.
//!
//! Regenerating the identity invalidates every session built on it, so the
//! store layer creates it once and never replaces it on a read failure.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{error::CryptoError, hash};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
/// Length of a 32-byte key in padded standard base64.
pub const PUBLIC_KEY_B64_LEN: usize = 44;

// ── Public key newtype ────────────────────────────────────────────────────────

/// 32-byte Ed25519 identity public key, standard base64 on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub [u8; PUBLIC_KEY_LEN]);

impl PublicKeyBytes {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("public key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn to_b64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        if s.len() != PUBLIC_KEY_B64_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "encoded public key must be {PUBLIC_KEY_B64_LEN} characters, got {}",
                s.len()
            )));
        }
        Self::from_slice(&STANDARD.decode(s)?)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn fingerprint(&self) -> String {
        hash::fingerprint(&self.0)
    }

    /// Map the Edwards point to its Montgomery form for X25519.
    pub fn to_x25519(&self) -> Result<X25519Public, CryptoError> {
        use curve25519_dalek::edwards::CompressedEdwardsY;
        let point = CompressedEdwardsY(self.0)
            .decompress()
            .ok_or_else(|| CryptoError::InvalidKey("identity key is not a curve point".into()))?;
        Ok(X25519Public::from(point.to_montgomery().to_bytes()))
    }
}

impl fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyBytes({})", self.fingerprint())
    }
}

// ── Identity keypair ──────────────────────────────────────────────────────────

/// Long-term device identity. Drop clears the secret via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            public: PublicKeyBytes(signing_key.verifying_key().to_bytes()),
            secret_bytes: signing_key.to_bytes(),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("identity secret must be 32 bytes, got {}", bytes.len()))
        })?;
        let signing_key = SigningKey::from_bytes(&arr);
        Ok(Self {
            public: PublicKeyBytes(signing_key.verifying_key().to_bytes()),
            secret_bytes: arr,
        })
    }

    /// Storage form: `secret (32) || public (32)`.
    pub fn to_storage_bytes(&self) -> zeroize::Zeroizing<Vec<u8>> {
        let mut out = zeroize::Zeroizing::new(Vec::with_capacity(64));
        out.extend_from_slice(&self.secret_bytes);
        out.extend_from_slice(&self.public.0);
        out
    }

    /// Inverse of [`to_storage_bytes`](Self::to_storage_bytes). Rejects a
    /// stored public half that does not match the secret.
    pub fn from_storage_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 64 {
            return Err(CryptoError::InvalidKey(format!(
                "stored identity must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        let pair = Self::from_secret_bytes(&bytes[..32])?;
        if pair.public.0[..] != bytes[32..] {
            return Err(CryptoError::InvalidKey(
                "stored identity public key does not match its secret".into(),
            ));
        }
        Ok(pair)
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    pub fn public_b64(&self) -> String {
        self.public.to_b64()
    }

    /// Sign arbitrary bytes; returns the raw 64-byte Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_LEN] {
        SigningKey::from_bytes(&self.secret_bytes).sign(msg).to_bytes()
    }

    pub fn verify(public: &PublicKeyBytes, msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(&public.0)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig_arr: [u8; SIGNATURE_LEN] = sig_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("signature must be 64 bytes".into()))?;
        vk.verify(msg, &Signature::from_bytes(&sig_arr))
            .map_err(|_| CryptoError::SignatureVerification)
    }

    /// X25519 secret for this identity: the clamped lower half of
    /// SHA-512(seed), the same scalar Ed25519 signs with.
    pub fn dh_secret(&self) -> StaticSecret {
        let mut h = Sha512::digest(self.secret_bytes);
        h[0] &= 248;
        h[31] &= 127;
        h[31] |= 64;
        let mut key = [0u8; 32];
        key.copy_from_slice(&h[..32]);
        h.as_mut_slice().zeroize();
        let secret = StaticSecret::from(key);
        key.zeroize();
        secret
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
