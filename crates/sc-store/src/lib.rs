//! sc-store — encrypted local key-value store backing the secure channel
//! crypto core.
//!
//! # Storage model
//! SQLite holds a single generic `kv_store(key, value, updated_at)` table
//! via `sqlx`. There is no relational schema beyond that — every
//! higher-level record the façade needs (identity, prekeys, sessions,
//! sender-key state, peer trust) is serialized and AEAD-sealed as one
//! value under a stable key name. See [`keystore::KeyStore`].

pub mod error;
pub mod keystore;

pub use error::StoreError;
pub use keystore::KeyStore;
