//! dm_crypto: cryptographic core of direct-message end-to-end encryption
//!
//! # Design principles
//! - NO custom primitives; X25519/Ed25519, SHA-512 and XChaCha20-Poly1305
//!   come from audited Rust crates.
//! - Zeroize secret material on drop.
//! - Everything here is synchronous and CPU-bound; I/O lives in `dm_store`
//!   and `dm_client`.
//!
//! # Module layout
//! - `identity`: long-term per-device identity keypair
//! - `prekey`: signed / one-time prekeys and the public key bundle
//! - `x3dh`: multi-DH session establishment (initiator + responder)
//! - `ratchet`: chain keys, one-way advancement, message-key derivation
//! - `session`: per-peer mutable session state
//! - `cipher`: envelope encryption / decryption
//! - `aead`: XChaCha20-Poly1305 helpers
//! - `kdf`: SHA-512/256 hashing and Argon2id vault keys
//! - `hash`: BLAKE3 fingerprints for logs
//! - `error`: unified error type

pub mod aead;
pub mod cipher;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod prekey;
pub mod ratchet;
pub mod session;
pub mod x3dh;

pub use cipher::{Decrypted, Envelope};
pub use error::CryptoError;
pub use identity::{IdentityKeyPair, PublicKeyBytes};
pub use prekey::{PublicKeyBundle, PublishedPrekeys};
pub use ratchet::ChainPolicy;
pub use session::{Role, Session, SessionConfig};
pub use x3dh::InitHeader;
