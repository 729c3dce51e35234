//! Identity & Prekey Vault.
//!
//! Owns the long-term Ed25519 identity keypair, the device id, and the
//! rotating pre-key material (signed prekey, KEM prekey, one-time
//! prekeys) published in upload bundles. Everything here is persisted
//! through the [`sc_store::KeyStore`] under the stable key names listed
//! in each function's doc comment.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use pqcrypto_kyber::kyber768::SecretKey as KemSecretKey;
use pqcrypto_traits::kem::{PublicKey as _, SecretKey as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sc_crypto::{identity::IdentityKeyPair, pqkem, x3dh};
use sc_store::KeyStore;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::FacadeError;

const KEY_IDENTITY: &str = "identity";
const KEY_DEVICE_ID: &str = "device_id";
const KEY_SIGNED_PREKEY: &str = "signed_prekeys";
const KEY_SIGNED_PREKEY_ID: &str = "signed_prekey_id";
const KEY_KEM_PREKEY: &str = "kyber_prekeys";
const KEY_KEM_PREKEY_ID: &str = "kyber_prekey_id";
const KEY_ONE_TIME_PREKEYS: &str = "prekeys";
const KEY_PREKEY_ID_COUNTER: &str = "prekey_id_counter";

const DEFAULT_DEVICE_ID: u32 = 1;
const REGISTRATION_ID_MAX: u16 = 0x3FFF;

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    secret: String,
    registration_id: u16,
}

#[derive(Serialize, Deserialize, Clone)]
struct StoredSignedPrekey {
    id: u64,
    secret: String,
    public: String,
    signature: String,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone)]
struct StoredKemPrekey {
    id: u64,
    secret: String,
    public: String,
    signature: String,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone)]
struct StoredOneTimePrekey {
    id: u64,
    secret: String,
    public: String,
}

/// Public identity + prekey material, suitable for publishing to a
/// directory so other users can initiate sessions. Private halves never
/// appear here.
pub struct UploadBundle {
    pub identity_public_key: Vec<u8>,
    pub registration_id: u16,
    pub signed_prekey_id: u64,
    pub signed_prekey_public: Vec<u8>,
    pub signed_prekey_signature: Vec<u8>,
    pub kem_prekey_id: u64,
    pub kem_prekey_public: Vec<u8>,
    pub kem_prekey_signature: Vec<u8>,
    pub one_time_prekeys: Vec<(u64, Vec<u8>)>,
}

pub struct IdentityVault {
    store: KeyStore,
    identity: IdentityKeyPair,
    registration_id: u16,
    device_id: u32,
}

impl IdentityVault {
    /// Load the identity keypair and registration id from `identity`, or
    /// generate and persist them on first use. Loads (or defaults to 1)
    /// the device id from `device_id`.
    pub async fn init(store: KeyStore) -> Result<Self, FacadeError> {
        let (identity, registration_id) = match store.get(KEY_IDENTITY).await? {
            Some(bytes) => {
                let stored: StoredIdentity = serde_json::from_slice(&bytes)?;
                let secret = URL_SAFE_NO_PAD
                    .decode(&stored.secret)
                    .map_err(sc_crypto::CryptoError::Base64Decode)?;
                (IdentityKeyPair::from_bytes(&secret)?, stored.registration_id)
            }
            None => {
                let identity = IdentityKeyPair::generate()?;
                let registration_id = (rand::rngs::OsRng.next_u32() % REGISTRATION_ID_MAX as u32 + 1) as u16;
                let stored = StoredIdentity {
                    secret: URL_SAFE_NO_PAD.encode(identity.secret_bytes()),
                    registration_id,
                };
                store.set(KEY_IDENTITY, &serde_json::to_vec(&stored)?).await?;
                (identity, registration_id)
            }
        };

        let device_id = match store.get(KEY_DEVICE_ID).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => {
                store.set(KEY_DEVICE_ID, &serde_json::to_vec(&DEFAULT_DEVICE_ID)?).await?;
                DEFAULT_DEVICE_ID
            }
        };

        Ok(Self { store, identity, registration_id, device_id })
    }

    /// Cached at init; never returns an empty key and never requires a
    /// suspending call.
    pub fn identity_public_key(&self) -> &[u8] {
        &self.identity.public.0
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    /// Unwrap the owned backing store — used only by full destruction,
    /// which needs to consume the `KeyStore` to close its pool and remove
    /// the database files.
    pub fn into_store(self) -> KeyStore {
        self.store
    }

    pub fn registration_id(&self) -> u16 {
        self.registration_id
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    async fn load_signed_prekey(&self) -> Result<Option<StoredSignedPrekey>, FacadeError> {
        match self.store.get(KEY_SIGNED_PREKEY).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn load_kem_prekey(&self) -> Result<Option<StoredKemPrekey>, FacadeError> {
        match self.store.get(KEY_KEM_PREKEY).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn next_prekey_id(&self) -> Result<u64, FacadeError> {
        match self.store.get(KEY_PREKEY_ID_COUNTER).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(1),
        }
    }

    /// Generate the signed prekey if missing, persisting it under
    /// `signed_prekeys` / `signed_prekey_id`.
    async fn ensure_signed_prekey(&self) -> Result<StoredSignedPrekey, FacadeError> {
        if let Some(existing) = self.load_signed_prekey().await? {
            return Ok(existing);
        }
        let id = self.next_prekey_id().await?;
        let (secret, public, sig) = x3dh::generate_signed_prekey(&self.identity)?;
        let stored = StoredSignedPrekey {
            id,
            secret: URL_SAFE_NO_PAD.encode(secret.to_bytes()),
            public: URL_SAFE_NO_PAD.encode(public.as_bytes()),
            signature: URL_SAFE_NO_PAD.encode(&sig),
            created_at: Utc::now(),
        };
        self.store.set(KEY_SIGNED_PREKEY, &serde_json::to_vec(&stored)?).await?;
        self.store.set(KEY_SIGNED_PREKEY_ID, &serde_json::to_vec(&id)?).await?;
        self.store.set(KEY_PREKEY_ID_COUNTER, &serde_json::to_vec(&(id + 1))?).await?;
        tracing::info!(signed_prekey_id = id, "generated signed prekey");
        Ok(stored)
    }

    /// Generate the KEM prekey if missing, persisting it under
    /// `kyber_prekeys` / `kyber_prekey_id`.
    async fn ensure_kem_prekey(&self) -> Result<StoredKemPrekey, FacadeError> {
        if let Some(existing) = self.load_kem_prekey().await? {
            return Ok(existing);
        }
        let id = self.next_prekey_id().await?;
        let (secret, public, sig) = pqkem::generate_kem_prekey(&self.identity)?;
        let stored = StoredKemPrekey {
            id,
            secret: URL_SAFE_NO_PAD.encode(secret.as_bytes()),
            public: URL_SAFE_NO_PAD.encode(public.as_bytes()),
            signature: URL_SAFE_NO_PAD.encode(&sig),
            created_at: Utc::now(),
        };
        self.store.set(KEY_KEM_PREKEY, &serde_json::to_vec(&stored)?).await?;
        self.store.set(KEY_KEM_PREKEY_ID, &serde_json::to_vec(&id)?).await?;
        self.store.set(KEY_PREKEY_ID_COUNTER, &serde_json::to_vec(&(id + 1))?).await?;
        tracing::info!(kem_prekey_id = id, "generated KEM prekey");
        Ok(stored)
    }

    /// Assemble an upload bundle, lazily generating the signed/KEM
    /// prekeys on first request. Does not consume one-time prekeys —
    /// it only lists the public halves of whatever batch is on hand.
    pub async fn build_upload_bundle(&self) -> Result<UploadBundle, FacadeError> {
        let signed = self.ensure_signed_prekey().await?;
        let kem = self.ensure_kem_prekey().await?;

        let otps: Vec<StoredOneTimePrekey> = match self.store.get(KEY_ONE_TIME_PREKEYS).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Vec::new(),
        };

        Ok(UploadBundle {
            identity_public_key: self.identity.public.0.clone(),
            registration_id: self.registration_id,
            signed_prekey_id: signed.id,
            signed_prekey_public: URL_SAFE_NO_PAD.decode(&signed.public).map_err(sc_crypto::CryptoError::Base64Decode)?,
            signed_prekey_signature: URL_SAFE_NO_PAD.decode(&signed.signature).map_err(sc_crypto::CryptoError::Base64Decode)?,
            kem_prekey_id: kem.id,
            kem_prekey_public: URL_SAFE_NO_PAD.decode(&kem.public).map_err(sc_crypto::CryptoError::Base64Decode)?,
            kem_prekey_signature: URL_SAFE_NO_PAD.decode(&kem.signature).map_err(sc_crypto::CryptoError::Base64Decode)?,
            one_time_prekeys: otps
                .into_iter()
                .map(|o| Ok::<_, FacadeError>((o.id, URL_SAFE_NO_PAD.decode(&o.public).map_err(sc_crypto::CryptoError::Base64Decode)?)))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Generate `n` fresh one-time prekeys: reads the counter, emits ids
    /// `[counter, counter+n)`, persists the new batch, advances the
    /// counter as the last step.
    pub async fn generate_more_prekeys(&self, n: usize) -> Result<Vec<u64>, FacadeError> {
        let start = self.next_prekey_id().await?;
        let fresh = x3dh::generate_one_time_prekeys(n);

        let mut existing: Vec<StoredOneTimePrekey> = match self.store.get(KEY_ONE_TIME_PREKEYS).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Vec::new(),
        };

        let mut ids = Vec::with_capacity(n);
        for (i, (secret, public)) in fresh.into_iter().enumerate() {
            let id = start + i as u64;
            ids.push(id);
            existing.push(StoredOneTimePrekey {
                id,
                secret: URL_SAFE_NO_PAD.encode(secret.to_bytes()),
                public: URL_SAFE_NO_PAD.encode(public.as_bytes()),
            });
        }

        self.store.set(KEY_ONE_TIME_PREKEYS, &serde_json::to_vec(&existing)?).await?;
        self.store.set(KEY_PREKEY_ID_COUNTER, &serde_json::to_vec(&(start + n as u64))?).await?;
        tracing::info!(count = n, first_id = start, "replenished one-time prekeys");
        Ok(ids)
    }

    /// Return the keypair for one-time prekey `id`, then delete it.
    /// A second call for the same id fails with `PreKeyExhausted`.
    pub async fn consume_one_time_prekey(&self, id: u64) -> Result<(StaticSecret, X25519Public), FacadeError> {
        let mut existing: Vec<StoredOneTimePrekey> = match self.store.get(KEY_ONE_TIME_PREKEYS).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => return Err(FacadeError::PreKeyExhausted),
        };

        let pos = existing.iter().position(|o| o.id == id).ok_or(FacadeError::PreKeyExhausted)?;
        let consumed = existing.remove(pos);
        self.store.set(KEY_ONE_TIME_PREKEYS, &serde_json::to_vec(&existing)?).await?;
        tracing::debug!(one_time_prekey_id = id, remaining = existing.len(), "consumed one-time prekey");

        let secret_bytes = URL_SAFE_NO_PAD.decode(&consumed.secret).map_err(sc_crypto::CryptoError::Base64Decode)?;
        let secret_arr: [u8; 32] = secret_bytes.try_into().map_err(|_| sc_crypto::CryptoError::InvalidKey("one-time prekey secret wrong length".into()))?;
        let secret = StaticSecret::from(secret_arr);
        let public = X25519Public::from(&secret);
        Ok((secret, public))
    }

    /// Secret half of the currently active signed prekey.
    pub async fn signed_prekey_secret(&self) -> Result<StaticSecret, FacadeError> {
        let stored = self.ensure_signed_prekey().await?;
        let bytes = URL_SAFE_NO_PAD.decode(&stored.secret).map_err(sc_crypto::CryptoError::Base64Decode)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| sc_crypto::CryptoError::InvalidKey("signed prekey secret wrong length".into()))?;
        Ok(StaticSecret::from(arr))
    }

    /// Secret half of the currently active KEM prekey, if its id matches
    /// `kem_id`. Returns `None` if the caller's KEM id refers to a prekey
    /// we've since rotated away (the bundle was stale).
    pub async fn kem_prekey_secret(&self, kem_id: u64) -> Result<Option<KemSecretKey>, FacadeError> {
        let Some(stored) = self.load_kem_prekey().await? else { return Ok(None) };
        if stored.id != kem_id {
            return Ok(None);
        }
        let bytes = URL_SAFE_NO_PAD.decode(&stored.secret).map_err(sc_crypto::CryptoError::Base64Decode)?;
        Ok(Some(pqkem::secret_from_bytes(&bytes)?))
    }
}
