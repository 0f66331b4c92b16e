//! Multi-DH session establishment.
//!
//! Alice (initiator) fetches Bob's bundle from the key directory:
//!   IK_B  (identity, Ed25519 public → converted to X25519)
//!   SPK_B (signed prekey, X25519) + IK_B signature over SPK_B
//!   OPK_B (optional one-time prekey, X25519)
//!
//! DH calculations, all with Alice's identity secret:
//!   DH1 = DH(IK_A, SPK_B)
//!   DH2 = DH(IK_A, IK_B)
//!   DH3 = DH(IK_A, OPK_B)      [only if the bundle carried an OPK]
//!
//!   root = SHA-512(DH1 ‖ DH2 [‖ DH3])[..32]
//!
//! Bob computes the same values from his secrets and IK_A (X25519 is
//! commutative) once Alice's `InitHeader` tells him which SPK/OPK she used.
//!
//! Legacy bundles carry IK_B only; the agreement collapses to DH2, which is
//! symmetric, so either side can run `establish`. The lower identity key
//! then takes the initiator's direction labels.

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    identity::{IdentityKeyPair, PublicKeyBytes},
    kdf,
    prekey::{OneTimePrekey, PublicKeyBundle, SignedPrekey},
    session::{Role, Session, SessionConfig},
};

/// Travels with the initiator's envelopes until the responder replies, so
/// the responder can rebuild the root key without being online earlier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitHeader {
    pub initiator_identity: PublicKeyBytes,
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

fn dh(secret: &StaticSecret, public: &X25519Public) -> Result<SharedSecret, CryptoError> {
    let shared = secret.diffie_hellman(public);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("low-order public key in key agreement".into()));
    }
    Ok(shared)
}

fn root_from(dh_outputs: &[SharedSecret]) -> Zeroizing<[u8; 32]> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * dh_outputs.len()));
    for out in dh_outputs {
        ikm.extend_from_slice(out.as_bytes());
    }
    Zeroizing::new(kdf::hash32(&[ikm.as_slice()]))
}

// ── Initiator ────────────────────────────────────────────────────────────────

/// Start a session with the owner of `peer`.
///
/// Verifies the signed prekey before any DH is computed. The returned
/// session carries the `InitHeader` to attach to outgoing envelopes.
pub fn establish(
    local: &IdentityKeyPair,
    peer: &PublicKeyBundle,
    config: SessionConfig,
) -> Result<Session, CryptoError> {
    if local.public == peer.identity_key {
        return Err(CryptoError::InvalidKey(
            "cannot establish a session with our own identity".into(),
        ));
    }
    let ik = local.dh_secret();
    let peer_ik = peer.identity_key.to_x25519()?;

    let Some(spk) = &peer.signed_prekey else {
        if peer.one_time_prekey.is_some() {
            return Err(CryptoError::Prekey(
                "bundle carries a one-time prekey without a signed prekey".into(),
            ));
        }
        let root = root_from(&[dh(&ik, &peer_ik)?]);
        let role = if local.public < peer.identity_key {
            Role::Initiator
        } else {
            Role::Responder
        };
        return Ok(Session::from_root(&root, role, peer.identity_key, config, None, None));
    };

    spk.verify(&peer.identity_key)?;
    let mut outputs = vec![
        dh(&ik, &X25519Public::from(spk.public))?,
        dh(&ik, &peer_ik)?,
    ];
    if let Some(opk) = &peer.one_time_prekey {
        outputs.push(dh(&ik, &X25519Public::from(opk.public))?);
    }
    let root = root_from(&outputs);

    let header = InitHeader {
        initiator_identity: local.public,
        signed_prekey_id: spk.id,
        one_time_prekey_id: peer.one_time_prekey.as_ref().map(|k| k.id),
    };
    Ok(Session::from_root(
        &root,
        Role::Initiator,
        peer.identity_key,
        config,
        Some(header),
        None,
    ))
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Rebuild the initiator's session from our prekey secrets.
///
/// `spk` and `opk` must be the keys named in `header`; the caller looks them
/// up and deletes the one-time prekey once the first message authenticated.
pub fn accept(
    local: &IdentityKeyPair,
    spk: &SignedPrekey,
    opk: Option<&OneTimePrekey>,
    header: &InitHeader,
    config: SessionConfig,
) -> Result<Session, CryptoError> {
    if header.initiator_identity == local.public {
        return Err(CryptoError::InvalidKey(
            "init header names our own identity".into(),
        ));
    }
    if header.signed_prekey_id != spk.id {
        return Err(CryptoError::Prekey(format!(
            "init header uses signed prekey {}, got {}",
            header.signed_prekey_id, spk.id
        )));
    }
    let initiator = header.initiator_identity.to_x25519()?;

    let mut outputs = vec![
        dh(&spk.secret(), &initiator)?,
        dh(&local.dh_secret(), &initiator)?,
    ];
    match (header.one_time_prekey_id, opk) {
        (None, _) => {}
        (Some(id), Some(opk)) if opk.id == id => outputs.push(dh(&opk.secret(), &initiator)?),
        (Some(id), _) => {
            return Err(CryptoError::Prekey(format!("one-time prekey {id} is not available")));
        }
    }
    let root = root_from(&outputs);

    Ok(Session::from_root(
        &root,
        Role::Responder,
        header.initiator_identity,
        config,
        None,
        Some(header.clone()),
    ))
}
