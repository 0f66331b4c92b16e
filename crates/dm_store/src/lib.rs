//! dm_store: encrypted local storage for direct-message E2EE
//!
//! # Encryption strategy
//! SQLite does NOT natively encrypt. Values are sealed at the application
//! level:
//! - Every record (identity secret, prekey secrets, session state) is
//!   XChaCha20-Poly1305 ciphertext, base64-encoded.
//! - The vault key is derived from the user password via Argon2id and held
//!   in memory only while the store is unlocked.
//! - Scope and key names stay in clear for lookups and carry no secrets.
//!
//! # Layout
//! - `store`: `SecureStore` trait (scoped get/put/delete)
//! - `db`: SQLite backend; migrations in `migrations/` run on open
//! - `memory`: in-process backend for tests and ephemeral clients
//! - `vault`: password-derived key with auto-lock
//! - `identity` / `prekeys` / `sessions` / `plaintexts`: typed stores on top

pub mod db;
pub mod error;
pub mod identity;
pub mod memory;
pub mod plaintexts;
pub mod prekeys;
pub mod sessions;
pub mod store;
pub mod vault;

pub use db::SqliteStore;
pub use error::StoreError;
pub use identity::IdentityKeyStore;
pub use memory::MemoryStore;
pub use plaintexts::PlaintextCache;
pub use prekeys::PrekeyStore;
pub use sessions::SessionStore;
pub use store::SecureStore;
pub use vault::Vault;
