//! Envelope wire string: what the server stores and the transport relays.
//!
//!   regular:        1:<counter>:<nonce_b64>:<ciphertext_b64>
//!   prekey message: 1x:<counter>:<nonce_b64>:<ciphertext_b64>:<ik_b64>:<spk_id>:<opk_id|->
//!
//! Base64 is the standard alphabet with padding, which never contains `:`.
//! The prekey form is sent by an initiator until the peer replied; it tells
//! the responder which of its prekeys the session was built from.
//!
//! The string is produced once and then treated as an opaque blob. Nothing
//! downstream may re-encode it.

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

use dm_crypto::{
    aead::{NONCE_LEN, TAG_LEN},
    cipher::ENVELOPE_VERSION,
    InitHeader, PublicKeyBytes,
};

pub use dm_crypto::Envelope;

const TAG_REGULAR: &str = "1";
const TAG_PREKEY: &str = "1x";
const NO_PREKEY: &str = "-";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Invalid envelope format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported envelope version tag {0:?}")]
    UnsupportedVersion(String),
}

fn invalid(msg: impl Into<String>) -> EnvelopeError {
    EnvelopeError::InvalidFormat(msg.into())
}

pub fn encode(envelope: &Envelope) -> String {
    let nonce = STANDARD.encode(envelope.nonce);
    let ct = STANDARD.encode(&envelope.ciphertext);
    match &envelope.init {
        None => format!("{TAG_REGULAR}:{}:{nonce}:{ct}", envelope.counter),
        Some(init) => {
            let opk = init
                .one_time_prekey_id
                .map_or_else(|| NO_PREKEY.to_string(), |id| id.to_string());
            format!(
                "{TAG_PREKEY}:{}:{nonce}:{ct}:{}:{}:{opk}",
                envelope.counter,
                init.initiator_identity.to_b64(),
                init.signed_prekey_id,
            )
        }
    }
}

pub fn decode(wire: &str) -> Result<Envelope, EnvelopeError> {
    let fields: Vec<&str> = wire.split(':').collect();
    let has_init = match fields[0] {
        TAG_REGULAR => false,
        TAG_PREKEY => true,
        other if other.chars().all(|c| c.is_ascii_alphanumeric()) && !other.is_empty() => {
            return Err(EnvelopeError::UnsupportedVersion(other.to_string()));
        }
        _ => return Err(invalid("missing version tag")),
    };
    let expected = if has_init { 7 } else { 4 };
    if fields.len() != expected {
        return Err(invalid(format!(
            "expected {expected} fields, got {}",
            fields.len()
        )));
    }

    let counter = parse_u32(fields[1], "counter")?;
    let nonce: [u8; NONCE_LEN] = decode_b64(fields[2], "nonce")?
        .try_into()
        .map_err(|v: Vec<u8>| invalid(format!("nonce must be {NONCE_LEN} bytes, got {}", v.len())))?;
    let ciphertext = decode_b64(fields[3], "ciphertext")?;
    if ciphertext.len() < TAG_LEN {
        return Err(invalid("ciphertext shorter than the authentication tag"));
    }

    let init = if has_init {
        let initiator_identity = PublicKeyBytes::from_b64(fields[4])
            .map_err(|e| invalid(format!("initiator identity: {e}")))?;
        let signed_prekey_id = parse_u32(fields[5], "signed prekey id")?;
        let one_time_prekey_id = match fields[6] {
            NO_PREKEY => None,
            id => Some(parse_u32(id, "one-time prekey id")?),
        };
        Some(InitHeader {
            initiator_identity,
            signed_prekey_id,
            one_time_prekey_id,
        })
    } else {
        None
    };

    Ok(Envelope {
        version: ENVELOPE_VERSION,
        counter,
        nonce,
        ciphertext,
        init,
    })
}

/// Cheap check used when rendering history: does `content` look like an
/// envelope at all? Says nothing about whether it decrypts.
pub fn looks_like_envelope(content: &str) -> bool {
    content.starts_with("1:") || content.starts_with("1x:")
}

/// Plain decimal, no sign, no leading zeros, so that one envelope has
/// exactly one spelling.
fn parse_u32(field: &str, what: &str) -> Result<u32, EnvelopeError> {
    let canonical = !field.is_empty()
        && field.bytes().all(|b| b.is_ascii_digit())
        && (field == "0" || !field.starts_with('0'));
    if !canonical {
        return Err(invalid(format!("{what} is not a decimal number")));
    }
    field
        .parse()
        .map_err(|_| invalid(format!("{what} out of range")))
}

fn decode_b64(field: &str, what: &str) -> Result<Vec<u8>, EnvelopeError> {
    STANDARD
        .decode(field)
        .map_err(|e| invalid(format!("{what}: {e}")))
}
