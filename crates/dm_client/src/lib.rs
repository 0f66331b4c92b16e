//! dm_client: direct-message E2EE on a device
//!
//! Ties the crypto core to local storage and the key directory:
//! - `config`: client settings (file + environment)
//! - `directory`: key-directory client (REST and in-memory)
//! - `manager`: per-peer sessions (establish, send, receive, history)
//! - `error`: the error taxonomy callers match on
//! - `logging`: tracing subscriber setup

pub mod config;
pub mod directory;
pub mod error;
pub mod logging;
pub mod manager;

pub use config::ClientConfig;
pub use directory::{HttpKeyDirectory, KeyDirectory, MemoryKeyDirectory};
pub use error::E2eeError;
pub use manager::{ManagerConfig, SessionManager};
