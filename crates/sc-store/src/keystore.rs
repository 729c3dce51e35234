//! Encrypted local key-value store — the secure channel's single
//! persistence primitive. Every higher-level construct (identity, prekeys,
//! sessions, sender-key state, peer trust records) is serialized and
//! stored here as an AEAD-sealed blob keyed by a stable string name.
//!
//! # Master key
//! A single 32-byte master key is generated with a CSPRNG on first use and
//! stored in the OS keychain (via `keyring`) under a fixed service/account
//! identifier. If the keychain is unavailable, the store falls back to an
//! unprotected local key and logs a warning — development only, never to
//! be relied on in a production build.
//!
//! # AEAD
//! Each value is sealed independently with XChaCha20-Poly1305, a fresh
//! random 24-byte nonce per value, no AAD beyond a fixed domain string.
//! Corruption in one value (AEAD tag mismatch) never poisons another —
//! every `get` decrypts its own row in isolation and a failure there is
//! never retried.
//!
//! # Shred
//! `shred_key` does three AEAD-sealed-random overwrite passes plus one
//! zero pass, then deletes the row. `shred_all` does that for every row,
//! drops the database file, deletes the master key from the keychain, and
//! zeroizes the in-memory master-key buffer. The storage overwrite passes
//! are best-effort defense in depth — destruction of the master key is
//! what actually makes the data unrecoverable.

use std::path::Path;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use rand::RngCore;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
    SqlitePool,
};
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::StoreError;

const KEYCHAIN_SERVICE: &str = "sc-secure-channel";
const KEYCHAIN_ACCOUNT: &str = "master-key";
const AEAD_AAD: &[u8] = b"sc-keystore-v1";
const SHRED_PASSES: usize = 3;

pub struct KeyStore {
    pool: SqlitePool,
    master_key: Zeroizing<[u8; 32]>,
    degraded: bool,
}

impl KeyStore {
    /// Open (or create) the database at `db_path`, running pending
    /// migrations, and load (or generate) the master key.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let (master_key, degraded) = load_or_generate_master_key();

        Ok(Self { pool, master_key, degraded })
    }

    /// Whether this store is running without OS-keychain protection for
    /// its master key. Callers should surface this prominently; it must
    /// never be true in a production deployment.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            None => Ok(None),
            Some((sealed,)) => {
                let pt = sc_crypto::aead::decrypt(&self.master_key, &sealed, AEAD_AAD)
                    .map_err(|_| StoreError::Corruption(key.to_string()))?;
                Ok(Some(pt.to_vec()))
            }
        }
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let sealed = sc_crypto::aead::encrypt(&self.master_key, value, AEAD_AAD)?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(sealed)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn has(&self, key: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Snapshot of every key with the given prefix. Keys are stored in
    /// plaintext (only values are sealed), since prefix scans need them.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let escaped = prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        let pattern = format!("{escaped}%");
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM kv_store WHERE key LIKE ? ESCAPE '\\'")
                .bind(pattern)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_store").execute(&self.pool).await?;
        Ok(())
    }

    /// Three AEAD-sealed-random overwrite passes plus a zero pass, then
    /// delete the row. A no-op if the key is already absent.
    pub async fn shred_key(&self, key: &str) -> Result<(), StoreError> {
        if !self.has(key).await? {
            return Ok(());
        }
        for _ in 0..SHRED_PASSES {
            let mut junk = [0u8; 64];
            rand::rngs::OsRng.fill_bytes(&mut junk);
            let sealed = sc_crypto::aead::encrypt(&self.master_key, &junk, AEAD_AAD)?;
            sqlx::query("UPDATE kv_store SET value = ? WHERE key = ?")
                .bind(sealed)
                .bind(key)
                .execute(&self.pool)
                .await?;
        }
        sqlx::query("UPDATE kv_store SET value = ? WHERE key = ?")
            .bind(vec![0u8; 64])
            .bind(key)
            .execute(&self.pool)
            .await?;
        self.delete(key).await
    }

    /// Full destruction, in order: shred every row, drop the database
    /// files, delete the master key from the keychain, zeroize the
    /// in-memory master-key buffer. The master-key destruction is the
    /// real guarantee; everything before it is defense in depth.
    pub async fn shred_all(mut self, db_path: &Path) -> Result<(), StoreError> {
        let keys = self.list_keys("").await?;
        for key in keys {
            self.shred_key(&key).await?;
        }

        self.pool.close().await;
        let _ = std::fs::remove_file(db_path);
        let _ = std::fs::remove_file(format!("{}-wal", db_path.display()));
        let _ = std::fs::remove_file(format!("{}-shm", db_path.display()));

        if let Ok(entry) = keyring::Entry::new(KEYCHAIN_SERVICE, KEYCHAIN_ACCOUNT) {
            let _ = entry.delete_password();
        }

        for b in self.master_key.iter_mut() {
            *b = 0;
        }
        Ok(())
    }
}

fn load_or_generate_master_key() -> (Zeroizing<[u8; 32]>, bool) {
    let entry = match keyring::Entry::new(KEYCHAIN_SERVICE, KEYCHAIN_ACCOUNT) {
        Ok(e) => e,
        Err(e) => {
            warn!("OS keychain unavailable ({e}); falling back to an unprotected master key. Development use only.");
            return (fresh_key(), true);
        }
    };

    match entry.get_password() {
        Ok(encoded) => match URL_SAFE_NO_PAD.decode(&encoded).ok().and_then(|b| to_32(&b)) {
            Some(key) => (Zeroizing::new(key), false),
            None => {
                warn!("keychain entry for the master key is malformed; generating a fresh unprotected key. Development use only.");
                (fresh_key(), true)
            }
        },
        Err(keyring::Error::NoEntry) => {
            let key = fresh_key();
            let encoded = URL_SAFE_NO_PAD.encode(*key);
            match entry.set_password(&encoded) {
                Ok(()) => (key, false),
                Err(e) => {
                    warn!("failed to persist master key to OS keychain ({e}); continuing with an unprotected key for this process. Development use only.");
                    (key, true)
                }
            }
        }
        Err(e) => {
            warn!("OS keychain unavailable ({e}); falling back to an unprotected master key. Development use only.");
            (fresh_key(), true)
        }
    }
}

fn fresh_key() -> Zeroizing<[u8; 32]> {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    Zeroizing::new(key)
}

fn to_32(bytes: &[u8]) -> Option<[u8; 32]> {
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("sc-keystore-test-{}.db", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let path = temp_db_path();
        let store = KeyStore::open(&path).await.unwrap();

        store.set("identity", b"secret-bytes").await.unwrap();
        let got = store.get("identity").await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"secret-bytes"[..]));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_key_returns_none() {
        let path = temp_db_path();
        let store = KeyStore::open(&path).await.unwrap();
        assert_eq!(store.get("nope").await.unwrap(), None);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn list_keys_returns_only_matching_prefix() {
        let path = temp_db_path();
        let store = KeyStore::open(&path).await.unwrap();

        store.set("peer_identity:alice", b"a").await.unwrap();
        store.set("peer_identity:bob", b"b").await.unwrap();
        store.set("sessions", b"s").await.unwrap();

        let mut keys = store.list_keys("peer_identity:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["peer_identity:alice", "peer_identity:bob"]);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn shred_key_removes_value_and_row() {
        let path = temp_db_path();
        let store = KeyStore::open(&path).await.unwrap();

        store.set("prekeys", b"batch").await.unwrap();
        store.shred_key("prekeys").await.unwrap();

        assert_eq!(store.get("prekeys").await.unwrap(), None);
        assert!(!store.has("prekeys").await.unwrap());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn shred_all_removes_every_key() {
        let path = temp_db_path();
        let store = KeyStore::open(&path).await.unwrap();

        store.set("identity", b"a").await.unwrap();
        store.set("sessions", b"b").await.unwrap();

        store.shred_all(&path).await.unwrap();

        // A fresh open after shred must not see any prior key.
        let reopened = KeyStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("identity").await.unwrap(), None);
        assert_eq!(reopened.get("sessions").await.unwrap(), None);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn clear_empties_store_but_keeps_master_key() {
        let path = temp_db_path();
        let store = KeyStore::open(&path).await.unwrap();

        store.set("device_id", b"1").await.unwrap();
        store.clear().await.unwrap();

        assert_eq!(store.get("device_id").await.unwrap(), None);
        let _ = std::fs::remove_file(&path);
    }
}
