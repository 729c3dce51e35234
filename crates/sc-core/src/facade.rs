//! Crypto Façade — the single entry point every caller outside this crate
//! talks to. Owns the vault, trust store, session engine, group engine and
//! safety-number helper, and serializes every operation through one mutex
//! so callers never race two mutations of the same on-disk state.
//!
//! Every operation except `init` requires the façade to have been
//! initialised; every group operation additionally requires
//! [`CryptoFacade::set_local_user_id`] to have been called once first.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sc_crypto::x3dh;
use sc_proto::{envelope::{ChannelEnvelope, DmEnvelope}, group::SenderKeyDistributionMessage};
use sc_store::KeyStore;
use tokio::sync::Mutex;

use crate::{
    error::FacadeError,
    group::GroupSenderKeyEngine,
    safety::{self, SafetyNumber},
    session::PairwiseSessionEngine,
    trust::{IdentityStatus, PeerTrustStore, StoreIdentityOutcome},
    vault::IdentityVault,
};

struct FacadeState {
    vault: IdentityVault,
    local_user_id: Option<String>,
    db_path: PathBuf,
}

pub struct CryptoFacade {
    state: Mutex<Option<FacadeState>>,
    // Cached at `init` so `get_identity_public_key` can be a synchronous,
    // non-suspending accessor instead of taking the engine lock.
    identity_public_key: std::sync::Mutex<Option<String>>,
    // Set once at construction, never mutated afterward. See
    // `with_degraded_mode`.
    degraded_mode: bool,
}

impl Default for CryptoFacade {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoFacade {
    pub fn new() -> Self {
        Self::with_degraded_mode(false).expect("degraded_mode=false is always available")
    }

    /// `degraded_mode=true` swaps DM encryption for the development-only
    /// [`sc_crypto::degraded`] sealed box instead of a real X3DH/ratchet
    /// session — no handshake, no forward secrecy, a fixed public key.
    /// Refused unconditionally in a release build so it can never ship.
    /// The flag is recorded here and never mutated afterward.
    pub fn with_degraded_mode(degraded_mode: bool) -> Result<Self, FacadeError> {
        if degraded_mode && !cfg!(debug_assertions) {
            return Err(FacadeError::Crypto(sc_crypto::CryptoError::DegradedModeUnavailable));
        }
        Ok(Self {
            state: Mutex::new(None),
            identity_public_key: std::sync::Mutex::new(None),
            degraded_mode,
        })
    }

    pub fn is_degraded_mode(&self) -> bool {
        self.degraded_mode
    }

    /// Open (or create) the encrypted local store at `db_path` and load (or
    /// generate) the identity/prekey material. Safe to call again after
    /// `crypto_shred` to start over.
    pub async fn init(&self, db_path: &Path) -> Result<(), FacadeError> {
        if self.degraded_mode {
            tracing::warn!("crypto façade initialising in degraded mode; DMs will use an unauthenticated sealed box, not a real session. Development use only.");
        }
        let store = KeyStore::open(db_path).await?;
        let vault = IdentityVault::init(store).await?;
        let cached = URL_SAFE_NO_PAD.encode(vault.identity_public_key());
        tracing::debug!(device_id = vault.device_id(), "identity vault loaded");
        let mut guard = self.state.lock().await;
        *guard = Some(FacadeState { vault, local_user_id: None, db_path: db_path.to_path_buf() });
        drop(guard);
        *self.identity_public_key.lock().expect("identity_public_key mutex poisoned") = Some(cached);
        Ok(())
    }

    /// Must be called once before any channel/group operation. Idempotent.
    pub async fn set_local_user_id(&self, user_id: &str) -> Result<(), FacadeError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(FacadeError::NotInitialized)?;
        state.local_user_id = Some(user_id.to_string());
        Ok(())
    }

    fn require_local_user_id(state: &FacadeState) -> Result<String, FacadeError> {
        state.local_user_id.clone().ok_or(FacadeError::NotInitialized)
    }

    /// Synchronous, non-suspending: reads the value cached by `init`, never
    /// the engine state itself.
    pub fn get_identity_public_key(&self) -> Result<String, FacadeError> {
        self.identity_public_key
            .lock()
            .expect("identity_public_key mutex poisoned")
            .clone()
            .ok_or(FacadeError::NotInitialized)
    }

    /// Current publishable identity/prekey bundle (lazily generating the
    /// signed/KEM prekeys on first call). `user_id` must already be set via
    /// [`Self::set_local_user_id`].
    pub async fn get_prekey_bundle(&self) -> Result<x3dh::PrekeyBundle, FacadeError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(FacadeError::NotInitialized)?;
        let user_id = Self::require_local_user_id(state)?;
        let bundle = state.vault.build_upload_bundle().await?;

        let (opk_pub, opk_id) = match bundle.one_time_prekeys.first() {
            Some((id, public)) => (Some(URL_SAFE_NO_PAD.encode(public)), Some(id.to_string())),
            None => (None, None),
        };

        Ok(x3dh::PrekeyBundle {
            user_id,
            ik_pub: URL_SAFE_NO_PAD.encode(&bundle.identity_public_key),
            spk_pub: URL_SAFE_NO_PAD.encode(&bundle.signed_prekey_public),
            spk_sig: URL_SAFE_NO_PAD.encode(&bundle.signed_prekey_signature),
            kem_pub: Some(URL_SAFE_NO_PAD.encode(&bundle.kem_prekey_public)),
            kem_sig: Some(URL_SAFE_NO_PAD.encode(&bundle.kem_prekey_signature)),
            kem_id: Some(bundle.kem_prekey_id),
            opk_pub,
            opk_id,
        })
    }

    pub async fn generate_more_prekeys(&self, n: usize) -> Result<Vec<u64>, FacadeError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(FacadeError::NotInitialized)?;
        state.vault.generate_more_prekeys(n).await
    }

    /// Establish a session with `peer_user_id`/`peer_device_id` from their
    /// published bundle. A no-op if a session already exists.
    ///
    /// In degraded mode there is no session to establish — every call is a
    /// no-op (a `warn!` still fires so the condition is never silent).
    pub async fn ensure_dm_session(
        &self,
        peer_user_id: &str,
        peer_device_id: u32,
        bundle: x3dh::PrekeyBundle,
    ) -> Result<(), FacadeError> {
        if self.degraded_mode {
            tracing::warn!(peer_user_id, peer_device_id, "degraded mode active; skipping real session establishment");
            return Ok(());
        }
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(FacadeError::NotInitialized)?;
        let my_user_id = Self::require_local_user_id(state)?;

        let store = state.vault.store();
        let sessions = PairwiseSessionEngine::new(store);
        if sessions.has_session(peer_user_id, peer_device_id).await? {
            return Ok(());
        }
        let trust = PeerTrustStore::new(store);
        tracing::debug!(peer_user_id, peer_device_id, "establishing outgoing session");
        sessions
            .establish_outgoing(&trust, &my_user_id, state.vault.identity(), peer_user_id, peer_device_id, bundle)
            .await
    }

    pub async fn encrypt_dm(&self, peer_user_id: &str, peer_device_id: u32, plaintext: &[u8]) -> Result<DmEnvelope, FacadeError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(FacadeError::NotInitialized)?;
        if self.degraded_mode {
            tracing::warn!(peer_user_id, peer_device_id, "degraded mode active; encrypting with the unauthenticated sealed box, not a real session");
            let sealed = sc_crypto::degraded::seal(plaintext)?;
            return Ok(DmEnvelope::Message {
                ciphertext: URL_SAFE_NO_PAD.encode(sealed),
                sender_device_id: state.vault.device_id(),
            });
        }
        let sessions = PairwiseSessionEngine::new(state.vault.store());
        sessions
            .encrypt_dm(peer_user_id, peer_device_id, state.vault.device_id(), state.vault.registration_id(), plaintext)
            .await
    }

    pub async fn decrypt_dm(&self, peer_user_id: &str, envelope: &DmEnvelope) -> Result<Vec<u8>, FacadeError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(FacadeError::NotInitialized)?;
        if self.degraded_mode {
            tracing::warn!(peer_user_id, "degraded mode active; decrypting with the unauthenticated sealed box, not a real session");
            let sealed = URL_SAFE_NO_PAD.decode(envelope.ciphertext()).map_err(sc_crypto::CryptoError::Base64Decode)?;
            return Ok(sc_crypto::degraded::open(&sealed)?);
        }
        let store = state.vault.store();
        let trust = PeerTrustStore::new(store);
        let sessions = PairwiseSessionEngine::new(store);
        sessions.decrypt_dm(&trust, &state.vault, peer_user_id, envelope).await
    }

    pub async fn ensure_channel_session(
        &self,
        channel_id: &str,
        member_ids: &[String],
    ) -> Result<SenderKeyDistributionMessage, FacadeError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(FacadeError::NotInitialized)?;
        let user_id = Self::require_local_user_id(state)?;
        let groups = GroupSenderKeyEngine::new(state.vault.store());
        groups.ensure_channel_session(channel_id, &user_id, state.vault.device_id(), member_ids).await
    }

    pub async fn encrypt_channel(&self, channel_id: &str, plaintext: &[u8]) -> Result<ChannelEnvelope, FacadeError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(FacadeError::NotInitialized)?;
        let user_id = Self::require_local_user_id(state)?;
        let groups = GroupSenderKeyEngine::new(state.vault.store());
        groups.encrypt_channel(channel_id, &user_id, state.vault.device_id(), plaintext).await
    }

    pub async fn decrypt_channel(&self, channel_id: &str, sender_user_id: &str, envelope: &ChannelEnvelope) -> Result<Vec<u8>, FacadeError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(FacadeError::NotInitialized)?;
        Self::require_local_user_id(state)?;
        let groups = GroupSenderKeyEngine::new(state.vault.store());
        groups.decrypt_channel(channel_id, sender_user_id, envelope).await
    }

    pub async fn process_sender_key_distribution(
        &self,
        channel_id: &str,
        sender_user_id: &str,
        sender_device_id: u32,
        msg: &SenderKeyDistributionMessage,
    ) -> Result<(), FacadeError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(FacadeError::NotInitialized)?;
        Self::require_local_user_id(state)?;
        let groups = GroupSenderKeyEngine::new(state.vault.store());
        groups.process_sender_key_distribution(channel_id, sender_user_id, sender_device_id, msg).await
    }

    pub async fn store_identity(&self, peer_id: &str, identity_key: &[u8]) -> Result<StoreIdentityOutcome, FacadeError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(FacadeError::NotInitialized)?;
        PeerTrustStore::new(state.vault.store()).store_identity(peer_id, identity_key).await
    }

    pub async fn check_identity_status(&self, peer_id: &str, identity_key: &[u8]) -> Result<IdentityStatus, FacadeError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(FacadeError::NotInitialized)?;
        PeerTrustStore::new(state.vault.store()).check_identity_status(peer_id, identity_key).await
    }

    pub async fn mark_identity_verified(&self, peer_id: &str) -> Result<(), FacadeError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(FacadeError::NotInitialized)?;
        PeerTrustStore::new(state.vault.store()).mark_verified(peer_id).await
    }

    /// Safety number between us and `remote_user_id`, whose identity key
    /// must already be on file (via `store_identity`).
    pub async fn compute_safety_number(&self, remote_user_id: &str) -> Result<SafetyNumber, FacadeError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(FacadeError::NotInitialized)?;
        let my_user_id = Self::require_local_user_id(state)?;
        let trust = PeerTrustStore::new(state.vault.store());
        let remote_key = trust
            .get_stored_identity(remote_user_id)
            .await?
            .ok_or_else(|| FacadeError::Crypto(sc_crypto::CryptoError::InvalidKey(format!("no identity on file for {remote_user_id}"))))?;

        Ok(safety::compute_safety_number(&my_user_id, state.vault.identity_public_key(), remote_user_id, &remote_key))
    }

    /// Empty every stored record but keep the identity/master key — a soft
    /// reset, e.g. for "log out of all sessions and groups".
    pub async fn clear_all_data(&self) -> Result<(), FacadeError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(FacadeError::NotInitialized)?;
        Ok(state.vault.store().clear().await?)
    }

    /// Irreversibly destroy everything: every stored record, the database
    /// files, and the OS-keychain master key. The façade must be
    /// re-initialised with `init` before any further use.
    pub async fn crypto_shred(&self) -> Result<(), FacadeError> {
        let mut guard = self.state.lock().await;
        let state = guard.take().ok_or(FacadeError::NotInitialized)?;
        drop(guard);
        let db_path = state.db_path.clone();
        state.vault.into_store().shred_all(&db_path).await?;
        *self.identity_public_key.lock().expect("identity_public_key mutex poisoned") = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("sc-core-test-{}.db", uuid::Uuid::new_v4()))
    }

    async fn ready_facade(user_id: &str) -> (CryptoFacade, PathBuf) {
        let path = temp_db_path();
        let facade = CryptoFacade::new();
        facade.init(&path).await.unwrap();
        facade.set_local_user_id(user_id).await.unwrap();
        (facade, path)
    }

    #[tokio::test]
    async fn handshake_and_two_messages_round_trip() {
        let (alice, alice_path) = ready_facade("alice").await;
        let (bob, bob_path) = ready_facade("bob").await;

        let alice_bundle = alice.get_prekey_bundle().await.unwrap();
        bob.ensure_dm_session("alice", 1, alice_bundle).await.unwrap();

        let envelope = bob.encrypt_dm("alice", 1, b"hi").await.unwrap();
        assert!(envelope.is_initial());
        let plaintext = alice.decrypt_dm("bob", &envelope).await.unwrap();
        assert_eq!(plaintext, b"hi");

        let envelope = bob.encrypt_dm("alice", 1, b"again").await.unwrap();
        assert!(!envelope.is_initial());
        let plaintext = alice.decrypt_dm("bob", &envelope).await.unwrap();
        assert_eq!(plaintext, b"again");

        let _ = std::fs::remove_file(&alice_path);
        let _ = std::fs::remove_file(&bob_path);
    }

    #[tokio::test]
    async fn identity_change_is_detected_and_resets_verification() {
        let (facade, path) = ready_facade("carol").await;

        let k1 = vec![1u8; 32];
        let k2 = vec![2u8; 32];

        let outcome = facade.store_identity("dave", &k1).await.unwrap();
        assert!(outcome.is_new && !outcome.has_changed);

        let outcome = facade.store_identity("dave", &k1).await.unwrap();
        assert!(!outcome.is_new && !outcome.has_changed);

        facade.mark_identity_verified("dave").await.unwrap();
        let status = facade.check_identity_status("dave", &k1).await.unwrap();
        assert!(status.is_verified);

        let outcome = facade.store_identity("dave", &k2).await.unwrap();
        assert!(!outcome.is_new && outcome.has_changed);
        assert_eq!(outcome.previous_key.as_deref(), Some(k1.as_slice()));

        let status = facade.check_identity_status("dave", &k2).await.unwrap();
        assert!(status.matches && !status.is_verified);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn unverified_identity_change_is_rejected_on_decrypt() {
        let (alice, alice_path) = ready_facade("alice").await;
        let (bob, bob_path) = ready_facade("bob").await;

        // Bob has TOFU'd a key for "alice" that isn't actually alice's —
        // never verified, just the first thing he saw.
        bob.store_identity("alice", &[7u8; 32]).await.unwrap();

        let bob_bundle = bob.get_prekey_bundle().await.unwrap();
        alice.ensure_dm_session("bob", 1, bob_bundle).await.unwrap();

        let envelope = alice.encrypt_dm("bob", 1, b"hi bob").await.unwrap();
        let err = bob.decrypt_dm("alice", &envelope).await.unwrap_err();
        assert!(matches!(err, FacadeError::IdentityMismatch));

        // The trust store still moves to alice's real key even on rejection.
        let status = bob.check_identity_status("alice", &URL_SAFE_NO_PAD.decode(&alice.get_identity_public_key().unwrap()).unwrap()).await.unwrap();
        assert!(status.matches && !status.is_verified);

        let _ = std::fs::remove_file(&alice_path);
        let _ = std::fs::remove_file(&bob_path);
    }

    #[tokio::test]
    async fn replayed_channel_envelope_is_rejected() {
        let (facade, path) = ready_facade("erin").await;

        let members = vec!["erin".to_string(), "frank".to_string()];
        facade.ensure_channel_session("room", &members).await.unwrap();
        let envelope = facade.encrypt_channel("room", b"hello room").await.unwrap();

        let dist = facade.ensure_channel_session("room", &members).await.unwrap();
        facade.process_sender_key_distribution("room", "erin", 1, &dist).await.unwrap();

        let plaintext = facade.decrypt_channel("room", "erin", &envelope).await.unwrap();
        assert_eq!(plaintext, b"hello room");

        let err = facade.decrypt_channel("room", "erin", &envelope).await.unwrap_err();
        assert!(matches!(err, FacadeError::Replay));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn safety_number_is_symmetric() {
        let (alice, alice_path) = ready_facade("alice").await;
        let (bob, bob_path) = ready_facade("bob").await;

        let alice_key = alice.get_identity_public_key().unwrap();
        let bob_key = bob.get_identity_public_key().unwrap();

        alice.store_identity("bob", &URL_SAFE_NO_PAD.decode(&bob_key).unwrap()).await.unwrap();
        bob.store_identity("alice", &URL_SAFE_NO_PAD.decode(&alice_key).unwrap()).await.unwrap();

        let from_alice = alice.compute_safety_number("bob").await.unwrap();
        let from_bob = bob.compute_safety_number("alice").await.unwrap();
        assert_eq!(from_alice.numeric, from_bob.numeric);

        let _ = std::fs::remove_file(&alice_path);
        let _ = std::fs::remove_file(&bob_path);
    }

    #[tokio::test]
    async fn shred_is_irreversible_and_allows_reinitialisation() {
        let (facade, path) = ready_facade("frank").await;

        let first_key = facade.get_identity_public_key().unwrap();
        facade.store_identity("peer", &[9u8; 32]).await.unwrap();

        facade.crypto_shred().await.unwrap();
        assert!(matches!(facade.get_identity_public_key(), Err(FacadeError::NotInitialized)));

        facade.init(&path).await.unwrap();
        facade.set_local_user_id("frank").await.unwrap();
        let second_key = facade.get_identity_public_key().unwrap();
        assert_ne!(first_key, second_key);

        let status = facade.check_identity_status("peer", &[9u8; 32]).await.unwrap();
        assert!(!status.has_stored);

        let _ = std::fs::remove_file(&path);
    }
}
