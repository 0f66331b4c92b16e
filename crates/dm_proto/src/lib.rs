//! dm_proto: wire types for direct-message E2EE
//!
//! Everything in here is what the server, the database or the transport
//! get to see: opaque envelope strings and public key material. No secret
//! ever reaches a type in this crate.
//!
//! # Modules
//! - `envelope`: the delimited envelope string stored as message content
//! - `api`: JSON bodies of the key-directory REST endpoints
//! - `message`: stored-message record and history rendering types

pub mod api;
pub mod envelope;
pub mod message;

pub use envelope::{decode, encode, EnvelopeError};
pub use message::{DisplayBody, StoredMessage};
