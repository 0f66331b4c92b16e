//! Key derivation functions
//!
//! `hash32`: SHA-512 truncated to 256 bits. Every session-level derivation
//!   (root key, chain keys, message keys) is a `hash32` over a fixed
//!   concatenation of inputs.
//!
//! `vault_key_from_password`: Argon2id, derives the 32-byte key used to
//!   encrypt the local store at rest.

use argon2::{Argon2, Params, Version};
use rand::RngCore;
use sha2::{Digest, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;

// ── SHA-512/256 ───────────────────────────────────────────────────────────────

/// Hash the concatenation of `parts` with SHA-512 and keep the first 32 bytes.
pub fn hash32(parts: &[&[u8]]) -> [u8; KEY_LEN] {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let mut digest = hasher.finalize();
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&digest[..KEY_LEN]);
    digest.as_mut_slice().zeroize();
    out
}

// ── Vault key (Argon2id) ──────────────────────────────────────────────────────

/// 32-byte vault key derived from the user password. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct VaultKey(pub [u8; 32]);

/// Interactive-use parameters: 64 MiB, 3 passes, 1 lane.
fn argon2_params() -> Result<Params, CryptoError> {
    Params::new(64 * 1024, 3, 1, Some(KEY_LEN))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive a vault key from a user password + 16-byte salt.
/// The salt is stored next to the encrypted data (it is not secret).
pub fn vault_key_from_password(password: &[u8], salt: &[u8; 16]) -> Result<VaultKey, CryptoError> {
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params()?);
    let mut output = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(VaultKey(output))
}

/// Fresh random 16-byte salt (generated once per store).
pub fn generate_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}
