//! Peer Trust Store — TOFU (trust-on-first-use) identity key tracking.
//!
//! Trust is never carried silently across an identity-key change: the
//! first key seen for a peer is recorded at trust level `tofu`; if a
//! different key later shows up for the same peer, the record resets to
//! `tofu` and `verified_at` is cleared, regardless of whether the old key
//! had been verified. Canonicalization compares raw decoded key bytes,
//! not base64 strings — two different encodings of the same bytes must
//! compare equal.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sc_store::KeyStore;

use crate::error::FacadeError;

const KEY_PREFIX: &str = "peer_identity:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Tofu,
    Verified,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredIdentityRecord {
    /// Raw identity key bytes, base64-encoded for storage.
    identity_key: String,
    first_seen: DateTime<Utc>,
    verified: bool,
    verified_at: Option<DateTime<Utc>>,
    trust_level: TrustLevel,
}

/// Result of [`PeerTrustStore::store_identity`].
#[derive(Debug, Clone)]
pub struct StoreIdentityOutcome {
    pub is_new: bool,
    pub has_changed: bool,
    /// Raw bytes of the previously-stored key, if this call changed it.
    pub previous_key: Option<Vec<u8>>,
}

/// Result of [`PeerTrustStore::check_identity_status`].
#[derive(Debug, Clone)]
pub struct IdentityStatus {
    pub has_stored: bool,
    pub matches: bool,
    pub is_verified: bool,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_verified: Option<DateTime<Utc>>,
    pub previous_key: Option<Vec<u8>>,
}

pub struct PeerTrustStore<'a> {
    store: &'a KeyStore,
}

impl<'a> PeerTrustStore<'a> {
    pub fn new(store: &'a KeyStore) -> Self {
        Self { store }
    }

    fn key_for(peer_id: &str) -> String {
        format!("{KEY_PREFIX}{peer_id}")
    }

    async fn load(&self, peer_id: &str) -> Result<Option<StoredIdentityRecord>, FacadeError> {
        match self.store.get(&Self::key_for(peer_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, peer_id: &str, record: &StoredIdentityRecord) -> Result<(), FacadeError> {
        self.store.set(&Self::key_for(peer_id), &serde_json::to_vec(record)?).await?;
        Ok(())
    }

    /// First call for a peer records the key at trust level `tofu` and
    /// reports `is_new`. A repeat call with the same key is a no-op. A
    /// call with a different key resets the record to `tofu`,
    /// `verified = false`, and reports the previous key.
    pub async fn store_identity(&self, peer_id: &str, key_bytes: &[u8]) -> Result<StoreIdentityOutcome, FacadeError> {
        match self.load(peer_id).await? {
            None => {
                let record = StoredIdentityRecord {
                    identity_key: URL_SAFE_NO_PAD.encode(key_bytes),
                    first_seen: Utc::now(),
                    verified: false,
                    verified_at: None,
                    trust_level: TrustLevel::Tofu,
                };
                self.save(peer_id, &record).await?;
                Ok(StoreIdentityOutcome { is_new: true, has_changed: false, previous_key: None })
            }
            Some(existing) => {
                let stored_bytes = URL_SAFE_NO_PAD
                    .decode(&existing.identity_key)
                    .map_err(sc_crypto::CryptoError::Base64Decode)?;

                if stored_bytes == key_bytes {
                    Ok(StoreIdentityOutcome { is_new: false, has_changed: false, previous_key: None })
                } else {
                    let record = StoredIdentityRecord {
                        identity_key: URL_SAFE_NO_PAD.encode(key_bytes),
                        first_seen: existing.first_seen,
                        verified: false,
                        verified_at: None,
                        trust_level: TrustLevel::Tofu,
                    };
                    self.save(peer_id, &record).await?;
                    Ok(StoreIdentityOutcome { is_new: false, has_changed: true, previous_key: Some(stored_bytes) })
                }
            }
        }
    }

    pub async fn get_stored_identity(&self, peer_id: &str) -> Result<Option<Vec<u8>>, FacadeError> {
        match self.load(peer_id).await? {
            Some(record) => Ok(Some(
                URL_SAFE_NO_PAD.decode(&record.identity_key).map_err(sc_crypto::CryptoError::Base64Decode)?,
            )),
            None => Ok(None),
        }
    }

    /// Read-only status check — never mutates the record. Useful before
    /// deciding whether a change warrants a `store_identity` call.
    pub async fn check_identity_status(&self, peer_id: &str, key_bytes: &[u8]) -> Result<IdentityStatus, FacadeError> {
        match self.load(peer_id).await? {
            None => Ok(IdentityStatus {
                has_stored: false,
                matches: false,
                is_verified: false,
                first_seen: None,
                last_verified: None,
                previous_key: None,
            }),
            Some(existing) => {
                let stored_bytes = URL_SAFE_NO_PAD
                    .decode(&existing.identity_key)
                    .map_err(sc_crypto::CryptoError::Base64Decode)?;
                let matches = stored_bytes == key_bytes;
                Ok(IdentityStatus {
                    has_stored: true,
                    matches,
                    is_verified: matches && existing.verified,
                    first_seen: Some(existing.first_seen),
                    last_verified: existing.verified_at,
                    previous_key: if matches { None } else { Some(stored_bytes) },
                })
            }
        }
    }

    /// Idempotent: marking an already-verified key as verified again has
    /// no observable effect beyond refreshing `verified_at`.
    pub async fn mark_verified(&self, peer_id: &str) -> Result<(), FacadeError> {
        let mut record = self.load(peer_id).await?.ok_or_else(|| {
            FacadeError::Crypto(sc_crypto::CryptoError::InvalidKey(format!("no identity on file for {peer_id}")))
        })?;
        record.verified = true;
        record.verified_at = Some(Utc::now());
        record.trust_level = TrustLevel::Verified;
        self.save(peer_id, &record).await
    }

    pub async fn revoke_trust(&self, peer_id: &str) -> Result<(), FacadeError> {
        let mut record = self.load(peer_id).await?.ok_or_else(|| {
            FacadeError::Crypto(sc_crypto::CryptoError::InvalidKey(format!("no identity on file for {peer_id}")))
        })?;
        record.verified = false;
        record.verified_at = None;
        record.trust_level = TrustLevel::Revoked;
        self.save(peer_id, &record).await
    }

    pub async fn delete_identity(&self, peer_id: &str) -> Result<(), FacadeError> {
        self.store.delete(&Self::key_for(peer_id)).await?;
        Ok(())
    }
}
