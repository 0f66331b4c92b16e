//! Key-directory REST bodies. These map directly to JSON on the wire.
//!
//!   PUT /user/publicKey          PublicKeyBody
//!   GET /user/:id/publicKey      -> PublicKeyBody | 404
//!   PUT /user/prekeyBundle       PublishBundleRequest
//!   GET /user/:id/prekeyBundle   -> PrekeyBundleBody | 404
//!
//! A bundle upload replaces the signed prekey; one-time prekeys are added
//! to the pool unless the server already handed out that id.
//!
//! All keys travel as standard base64. Validation happens on conversion to
//! the `dm_crypto` types, never later.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use dm_crypto::{
    identity::SIGNATURE_LEN,
    prekey::{OneTimePrekeyPublic, SignedPrekeyPublic},
    CryptoError, PublicKeyBundle, PublicKeyBytes, PublishedPrekeys,
};

// ── Single-key record ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyBody {
    pub public_key: String,
}

impl PublicKeyBody {
    pub fn new(key: &PublicKeyBytes) -> Self {
        Self {
            public_key: key.to_b64(),
        }
    }

    pub fn parse(&self) -> Result<PublicKeyBytes, CryptoError> {
        PublicKeyBytes::from_b64(&self.public_key)
    }
}

// ── Prekey bundle ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPrekeyBody {
    pub id: u32,
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePrekeyBody {
    pub id: u32,
    pub public_key: String,
}

/// Response of `GET /user/:id/prekeyBundle`. The server picks (and removes)
/// one one-time prekey per fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrekeyBundleBody {
    pub identity_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_prekey: Option<SignedPrekeyBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_prekey: Option<OneTimePrekeyBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishBundleRequest {
    pub identity_key: String,
    pub signed_prekey: SignedPrekeyBody,
    pub one_time_prekeys: Vec<OneTimePrekeyBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub code: Option<String>,
}

fn key32(field: &str, what: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = STANDARD.decode(field)?;
    bytes.try_into().map_err(|v: Vec<u8>| {
        CryptoError::InvalidKey(format!("{what} must be 32 bytes, got {}", v.len()))
    })
}

impl From<&SignedPrekeyPublic> for SignedPrekeyBody {
    fn from(spk: &SignedPrekeyPublic) -> Self {
        Self {
            id: spk.id,
            public_key: STANDARD.encode(spk.public),
            signature: STANDARD.encode(&spk.signature),
        }
    }
}

impl TryFrom<&SignedPrekeyBody> for SignedPrekeyPublic {
    type Error = CryptoError;

    fn try_from(body: &SignedPrekeyBody) -> Result<Self, Self::Error> {
        let signature = STANDARD.decode(&body.signature)?;
        if signature.len() != SIGNATURE_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "signature must be {SIGNATURE_LEN} bytes, got {}",
                signature.len()
            )));
        }
        Ok(Self {
            id: body.id,
            public: key32(&body.public_key, "signed prekey")?,
            signature,
        })
    }
}

impl From<&OneTimePrekeyPublic> for OneTimePrekeyBody {
    fn from(opk: &OneTimePrekeyPublic) -> Self {
        Self {
            id: opk.id,
            public_key: STANDARD.encode(opk.public),
        }
    }
}

impl TryFrom<&OneTimePrekeyBody> for OneTimePrekeyPublic {
    type Error = CryptoError;

    fn try_from(body: &OneTimePrekeyBody) -> Result<Self, Self::Error> {
        Ok(Self {
            id: body.id,
            public: key32(&body.public_key, "one-time prekey")?,
        })
    }
}

impl From<&PublicKeyBundle> for PrekeyBundleBody {
    fn from(bundle: &PublicKeyBundle) -> Self {
        Self {
            identity_key: bundle.identity_key.to_b64(),
            signed_prekey: bundle.signed_prekey.as_ref().map(Into::into),
            one_time_prekey: bundle.one_time_prekey.as_ref().map(Into::into),
        }
    }
}

impl TryFrom<&PrekeyBundleBody> for PublicKeyBundle {
    type Error = CryptoError;

    /// Checks encodings and lengths only; the signature is verified by
    /// session establishment.
    fn try_from(body: &PrekeyBundleBody) -> Result<Self, Self::Error> {
        Ok(Self {
            identity_key: PublicKeyBytes::from_b64(&body.identity_key)?,
            signed_prekey: body
                .signed_prekey
                .as_ref()
                .map(SignedPrekeyPublic::try_from)
                .transpose()?,
            one_time_prekey: body
                .one_time_prekey
                .as_ref()
                .map(OneTimePrekeyPublic::try_from)
                .transpose()?,
        })
    }
}

impl From<&PublishedPrekeys> for PublishBundleRequest {
    fn from(published: &PublishedPrekeys) -> Self {
        Self {
            identity_key: published.identity_key.to_b64(),
            signed_prekey: (&published.signed_prekey).into(),
            one_time_prekeys: published.one_time_prekeys.iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<&PublishBundleRequest> for PublishedPrekeys {
    type Error = CryptoError;

    fn try_from(req: &PublishBundleRequest) -> Result<Self, Self::Error> {
        Ok(Self {
            identity_key: PublicKeyBytes::from_b64(&req.identity_key)?,
            signed_prekey: SignedPrekeyPublic::try_from(&req.signed_prekey)?,
            one_time_prekeys: req
                .one_time_prekeys
                .iter()
                .map(OneTimePrekeyPublic::try_from)
                .collect::<Result<_, _>>()?,
        })
    }
}
