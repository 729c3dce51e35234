//! Pairwise Session Engine.
//!
//! Wraps [`sc_crypto::x3dh`] (handshake) and [`sc_crypto::ratchet`] (ongoing
//! message encryption) into session state addressed by `(peer_user_id,
//! peer_device_id)` and persisted one record per address under
//! `session:<user>:<device>`.
//!
//! A fresh session's first outgoing message is wire-tagged `Prekey` and
//! carries the X3DH init header folded into the opaque `ciphertext` blob
//! alongside the ratchet header; every later message is `Message` and
//! carries only the ratchet header. The receiver never needs anything from
//! the envelope itself beyond `type` and `senderDeviceId` — all handshake
//! material travels inside `ciphertext`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use sc_crypto::{identity::IdentityKeyPair, ratchet, x3dh};
use sc_proto::envelope::DmEnvelope;
use sc_store::KeyStore;
use x25519_dalek::PublicKey as X25519Public;

use crate::{error::FacadeError, trust::PeerTrustStore, vault::IdentityVault};

fn session_key(peer_user_id: &str, peer_device_id: u32) -> String {
    format!("session:{peer_user_id}:{peer_device_id}")
}

fn to_32(bytes: &[u8]) -> Result<[u8; 32], FacadeError> {
    bytes
        .try_into()
        .map_err(|_| FacadeError::Crypto(sc_crypto::CryptoError::InvalidKey("expected 32-byte key".into())))
}

/// What actually travels in a [`DmEnvelope`]'s `ciphertext` field: the
/// ratchet header is present on every message; the X3DH header is present
/// only on the first message of a session.
#[derive(Serialize, Deserialize)]
struct DmWireBody {
    ratchet_header: ratchet::RatchetHeader,
    x3dh_header: Option<x3dh::X3DHHeader>,
    payload: String,
}

#[derive(Serialize, Deserialize)]
struct SessionRecord {
    ratchet: ratchet::RatchetSession,
    sent_initial: bool,
    /// Set at establishment, cleared once the first outgoing message has
    /// carried it.
    pending_x3dh_header: Option<x3dh::X3DHHeader>,
}

pub struct PairwiseSessionEngine<'a> {
    store: &'a KeyStore,
}

impl<'a> PairwiseSessionEngine<'a> {
    pub fn new(store: &'a KeyStore) -> Self {
        Self { store }
    }

    async fn load(&self, peer_user_id: &str, peer_device_id: u32) -> Result<Option<SessionRecord>, FacadeError> {
        match self.store.get(&session_key(peer_user_id, peer_device_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, peer_user_id: &str, peer_device_id: u32, record: &SessionRecord) -> Result<(), FacadeError> {
        self.store
            .set(&session_key(peer_user_id, peer_device_id), &serde_json::to_vec(record)?)
            .await?;
        Ok(())
    }

    pub async fn has_session(&self, peer_user_id: &str, peer_device_id: u32) -> Result<bool, FacadeError> {
        Ok(self.store.has(&session_key(peer_user_id, peer_device_id)).await?)
    }

    /// Run X3DH against a freshly-fetched bundle and persist the resulting
    /// ratchet state as the initiator. Records the peer's identity key in
    /// the trust store (TOFU on first contact).
    pub async fn establish_outgoing(
        &self,
        trust: &PeerTrustStore<'_>,
        my_user_id: &str,
        my_identity: &IdentityKeyPair,
        peer_user_id: &str,
        peer_device_id: u32,
        bundle: x3dh::PrekeyBundle,
    ) -> Result<(), FacadeError> {
        let ik_bytes = URL_SAFE_NO_PAD
            .decode(&bundle.ik_pub)
            .map_err(sc_crypto::CryptoError::Base64Decode)?;
        trust.store_identity(peer_user_id, &ik_bytes).await?;

        let spk_pub_bytes = URL_SAFE_NO_PAD
            .decode(&bundle.spk_pub)
            .map_err(sc_crypto::CryptoError::Base64Decode)?;
        let spk_pub = X25519Public::from(to_32(&spk_pub_bytes)?);

        let result = x3dh::initiate(my_user_id, my_identity, &bundle)?;
        let ratchet = ratchet::RatchetSession::init_alice(
            result.header.session_id.clone(),
            peer_user_id.to_string(),
            result.shared_key,
            &spk_pub,
        )?;

        let record = SessionRecord {
            ratchet,
            sent_initial: false,
            pending_x3dh_header: Some(result.header),
        };
        tracing::info!(peer_user_id, peer_device_id, "established outgoing X3DH session");
        self.save(peer_user_id, peer_device_id, &record).await
    }

    /// Encrypt one plaintext DM. The first call after establishment produces
    /// a `Prekey` envelope; every call after that produces `Message`.
    pub async fn encrypt_dm(
        &self,
        peer_user_id: &str,
        peer_device_id: u32,
        my_device_id: u32,
        my_registration_id: u16,
        plaintext: &[u8],
    ) -> Result<DmEnvelope, FacadeError> {
        let mut record = self
            .load(peer_user_id, peer_device_id)
            .await?
            .ok_or(FacadeError::SessionUnknown)?;

        let (ratchet_header, mk) = record.ratchet.encrypt_step()?;
        let ciphertext = sc_crypto::aead::encrypt(&mk, plaintext, b"")?;

        let body = DmWireBody {
            ratchet_header,
            x3dh_header: if record.sent_initial { None } else { record.pending_x3dh_header.clone() },
            payload: URL_SAFE_NO_PAD.encode(ciphertext),
        };
        let wire = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&body)?);

        let envelope = if record.sent_initial {
            DmEnvelope::Message { ciphertext: wire, sender_device_id: my_device_id }
        } else {
            DmEnvelope::Prekey {
                ciphertext: wire,
                sender_device_id: my_device_id,
                registration_id: my_registration_id as u32,
            }
        };

        record.sent_initial = true;
        record.pending_x3dh_header = None;
        self.save(peer_user_id, peer_device_id, &record).await?;
        Ok(envelope)
    }

    /// Decrypt one incoming DM. `Prekey` envelopes bootstrap a brand-new
    /// session (verifying the sender's signed prekey and, if present, KEM
    /// prekey signature, consuming the referenced one-time prekey);
    /// `Message` envelopes require an existing session.
    pub async fn decrypt_dm(
        &self,
        trust: &PeerTrustStore<'_>,
        vault: &IdentityVault,
        peer_user_id: &str,
        envelope: &DmEnvelope,
    ) -> Result<Vec<u8>, FacadeError> {
        let sender_device_id = envelope.sender_device_id();
        let wire_bytes = URL_SAFE_NO_PAD
            .decode(envelope.ciphertext())
            .map_err(sc_crypto::CryptoError::Base64Decode)?;
        let body: DmWireBody = serde_json::from_slice(&wire_bytes)?;
        let payload = URL_SAFE_NO_PAD
            .decode(&body.payload)
            .map_err(sc_crypto::CryptoError::Base64Decode)?;

        match envelope {
            DmEnvelope::Prekey { .. } => {
                let header = body
                    .x3dh_header
                    .as_ref()
                    .ok_or_else(|| FacadeError::InvalidBundle("prekey envelope carries no x3dh header".into()))?;

                let sender_ik_bytes = URL_SAFE_NO_PAD
                    .decode(&header.ik_pub)
                    .map_err(sc_crypto::CryptoError::Base64Decode)?;

                // Any stored identity changing under us is rejected, never silently
                // re-trusted — verified or not. The trust store still records the
                // new key so the mismatch is visible on the next lookup; the
                // message itself is never decrypted on top of it.
                let status = trust.check_identity_status(peer_user_id, &sender_ik_bytes).await?;
                let identity_mismatch = status.has_stored && !status.matches;
                trust.store_identity(peer_user_id, &sender_ik_bytes).await?;
                if identity_mismatch {
                    tracing::warn!(peer_user_id, was_verified = status.is_verified, "peer identity key changed; rejecting prekey message");
                    return Err(FacadeError::IdentityMismatch);
                }

                let my_spk_secret = vault.signed_prekey_secret().await?;
                let my_kem_secret = match header.kem_id {
                    Some(kem_id) => vault.kem_prekey_secret(kem_id).await?,
                    None => None,
                };
                let my_opk_secret = match &header.opk_id {
                    Some(opk_id) => {
                        let id: u64 = opk_id
                            .parse()
                            .map_err(|_| FacadeError::InvalidBundle("malformed one-time prekey id".into()))?;
                        Some(vault.consume_one_time_prekey(id).await?.0)
                    }
                    None => None,
                };

                let sender_ik_arr = to_32(&sender_ik_bytes)?;
                let shared_key = x3dh::respond(
                    vault.identity(),
                    &my_spk_secret,
                    my_opk_secret.as_ref(),
                    my_kem_secret.as_ref(),
                    &sender_ik_arr,
                    header,
                )?;

                let my_spk_pub = X25519Public::from(&my_spk_secret);
                let mut ratchet = ratchet::RatchetSession::init_bob(
                    header.session_id.clone(),
                    peer_user_id.to_string(),
                    shared_key,
                    &my_spk_secret,
                    &my_spk_pub,
                )?;

                let mk = ratchet.decrypt_step(&body.ratchet_header)?;
                let plaintext = decrypt_payload(&mk, &payload)?;

                let record = SessionRecord { ratchet, sent_initial: false, pending_x3dh_header: None };
                tracing::info!(peer_user_id, sender_device_id, "bootstrapped incoming X3DH session from prekey message");
                self.save(peer_user_id, sender_device_id, &record).await?;
                Ok(plaintext)
            }
            DmEnvelope::Message { .. } => {
                let mut record = self
                    .load(peer_user_id, sender_device_id)
                    .await?
                    .ok_or(FacadeError::SessionUnknown)?;

                let mk = record.ratchet.decrypt_step(&body.ratchet_header)?;
                let plaintext = decrypt_payload(&mk, &payload)?;

                self.save(peer_user_id, sender_device_id, &record).await?;
                Ok(plaintext)
            }
        }
    }
}

fn decrypt_payload(mk: &[u8; 32], payload: &[u8]) -> Result<Vec<u8>, FacadeError> {
    sc_crypto::aead::decrypt(mk, payload, b"").map(|pt| pt.to_vec()).map_err(|e| match e {
        sc_crypto::CryptoError::AeadDecrypt => FacadeError::MacFailure,
        other => FacadeError::Crypto(other),
    })
}
