//! Message encryption and decryption over a `Session`.
//!
//! Every ciphertext is XChaCha20-Poly1305 under a single-use message key
//! with a fresh random 24-byte nonce. The envelope header (version, counter,
//! init header) is bound as associated data, so tampering with any field
//! fails authentication instead of decrypting under another key.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    aead::{self, NONCE_LEN},
    error::CryptoError,
    session::{Role, Session},
    x3dh::InitHeader,
};

pub const ENVELOPE_VERSION: u8 = 1;

const AAD_DOMAIN: &[u8] = b"dm-e2ee-envelope";

/// The only artifact that leaves the device. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub counter: u32,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    /// Present on initiator envelopes until the responder replied.
    pub init: Option<InitHeader>,
}

impl Envelope {
    pub fn associated_data(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(AAD_DOMAIN.len() + 48);
        aad.extend_from_slice(AAD_DOMAIN);
        aad.push(self.version);
        aad.extend_from_slice(&self.counter.to_le_bytes());
        if let Some(init) = &self.init {
            aad.push(1);
            aad.extend_from_slice(init.initiator_identity.as_bytes());
            aad.extend_from_slice(&init.signed_prekey_id.to_le_bytes());
            match init.one_time_prekey_id {
                Some(id) => {
                    aad.push(1);
                    aad.extend_from_slice(&id.to_le_bytes());
                }
                None => aad.push(0),
            }
        } else {
            aad.push(0);
        }
        aad
    }
}

/// Result of a successful decryption.
pub struct Decrypted {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub counter: u32,
    /// Messages between the last one seen and this one that have not
    /// arrived (yet). Informational; out-of-order delivery is tolerated.
    pub gap: u32,
    /// This message arrived after a later one.
    pub late: bool,
}

/// Encrypt `plaintext` for the peer and advance the send counter.
pub fn encrypt(session: &mut Session, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
    let (counter, mk) = session.send.next_message_key(session.config.policy)?;
    let mut envelope = Envelope {
        version: ENVELOPE_VERSION,
        counter,
        nonce: aead::random_nonce(),
        ciphertext: Vec::new(),
        init: session.pending_init.clone(),
    };
    envelope.ciphertext = aead::seal(&mk, &envelope.nonce, plaintext, &envelope.associated_data())?;
    Ok(envelope)
}

/// Decrypt an envelope from the peer.
///
/// The session is only updated after the tag verified; on any error it is
/// left exactly as it was, so one bad message cannot disturb the rest of
/// the conversation.
pub fn decrypt(session: &mut Session, envelope: &Envelope) -> Result<Decrypted, CryptoError> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(CryptoError::UnsupportedVersion(envelope.version));
    }
    let expected = session.recv.next_counter();
    let (mk, next_recv) =
        session
            .recv
            .message_key(envelope.counter, session.config.policy, session.config.max_skip)?;
    let plaintext = aead::open(
        &mk,
        &envelope.nonce,
        &envelope.ciphertext,
        &envelope.associated_data(),
    )?;

    session.recv = next_recv;
    if session.role == Role::Initiator {
        session.pending_init = None;
    }
    Ok(Decrypted {
        plaintext,
        counter: envelope.counter,
        gap: envelope.counter.saturating_sub(expected),
        late: envelope.counter < expected,
    })
}
