//! Group Sender-Key Engine.
//!
//! Each channel has one global, strictly-increasing epoch number shared by
//! every member. Each device maintains its own symmetric sender-key chain
//! per epoch — a single HKDF-based chain key stepped forward per message,
//! the same `chain_step` primitive the pairwise ratchet uses for its
//! per-message keys, just without a DH ratchet on top (there is no
//! receiving-side counterpart to ratchet against in a fan-out broadcast).
//!
//! A new chain key is distributed to every other member via a
//! [`SenderKeyDistributionMessage`] sent over each member's existing 1:1
//! session — this module only derives and validates the chain; the 1:1
//! delivery itself is the pairwise session engine's job.
//!
//! Incoming messages are checked in a fixed order: the replay window first
//! (cheapest, catches exact retransmission), then whether the epoch is
//! known at all (too far behind → pruned and stale; ahead of what we've
//! processed → no sender key yet), then whether the counter has already
//! been consumed within that epoch, and only then is the message key
//! derived and the plaintext returned.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sc_crypto::{hash, kdf};
use sc_proto::{envelope::ChannelEnvelope, group::SenderKeyDistributionMessage};
use sc_store::KeyStore;

use crate::error::FacadeError;

/// Replay window size per (channel, sender, device).
const REPLAY_WINDOW_SIZE: usize = 1000;
/// Keep chain state for this many epochs behind the newest one we know of.
/// Purely a memory bound on [`RecvRecord::chains`] — staleness itself is
/// decided by `last_seen_epoch` and [`OLD_EPOCH_GRACE_PERIOD_SECS`] below.
const EPOCH_PRUNE_WINDOW: u64 = 2;
/// Bound on how far ahead of our last-derived counter we'll skip-forward
/// for a single out-of-order message, mirroring the ratchet's own skip cap.
const MAX_COUNTER_SKIP: u64 = 1000;
/// A message from an epoch older than the newest one we've seen is only
/// accepted if it was sent within this long of being received — accounts
/// for messages already in flight when a rekey (e.g. member removal)
/// happens. Older than this, it's rejected as `StaleEpoch` even if its
/// chain state happens to still be in memory.
const OLD_EPOCH_GRACE_PERIOD_SECS: i64 = 5 * 60;

const MAX_MESSAGES_PER_EPOCH: u64 = 1000;
const MAX_EPOCH_AGE_SECS: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RekeyReason {
    Initial,
    MemberAdded,
    MemberRemoved,
    Rotation,
    MaxMessages,
    MaxAge,
}

fn send_key(channel_id: &str) -> String {
    format!("channel_send:{channel_id}")
}

fn recv_key(channel_id: &str, sender_user_id: &str, sender_device_id: u32) -> String {
    format!("channel_recv:{channel_id}:{sender_user_id}:{sender_device_id}")
}

fn to_32(bytes: &[u8]) -> Result<[u8; 32], FacadeError> {
    bytes
        .try_into()
        .map_err(|_| FacadeError::Crypto(sc_crypto::CryptoError::InvalidKey("expected 32-byte chain key".into())))
}

#[derive(Serialize, Deserialize)]
struct SendChainRecord {
    distribution_id: String,
    epoch_number: u64,
    chain_key: [u8; 32],
    counter: u64,
    created_at: DateTime<Utc>,
    messages_sent: u64,
    /// Membership as of this epoch, so the next `ensure_channel_session`
    /// call can diff against it instead of trusting the caller to know
    /// whether anyone was added or removed.
    #[serde(default)]
    members: BTreeSet<String>,
}

#[derive(Serialize, Deserialize)]
struct EpochChain {
    chain_key: [u8; 32],
    next_counter: u64,
    skipped: HashMap<u64, [u8; 32]>,
}

/// Ring-buffer-backed replay set: bounded memory, O(1) membership test and
/// insertion, oldest id evicted first.
#[derive(Serialize, Deserialize)]
struct ReplayWindow {
    slots: Vec<Option<String>>,
    ids: HashSet<String>,
    next_index: usize,
}

impl ReplayWindow {
    fn new() -> Self {
        Self { slots: vec![None; REPLAY_WINDOW_SIZE], ids: HashSet::new(), next_index: 0 }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String) {
        if let Some(evicted) = self.slots[self.next_index].take() {
            self.ids.remove(&evicted);
        }
        self.ids.insert(id.clone());
        self.slots[self.next_index] = Some(id);
        self.next_index = (self.next_index + 1) % self.slots.len();
    }
}

#[derive(Serialize, Deserialize)]
struct RecvRecord {
    chains: BTreeMap<u64, EpochChain>,
    replay: ReplayWindow,
    /// Newest epoch number this sender has ever distributed a chain for.
    /// Drives the grace-period staleness check independently of how many
    /// epochs of chain state `chains` happens to still be retaining.
    #[serde(default)]
    last_seen_epoch: u64,
}

impl RecvRecord {
    fn empty() -> Self {
        Self { chains: BTreeMap::new(), replay: ReplayWindow::new(), last_seen_epoch: 0 }
    }
}

/// Step a chain key forward to `target`, returning the message key at that
/// position. Positions already stepped past (and not cached as skipped)
/// are a counter-reuse error; positions too far ahead are refused outright.
fn derive_message_key(chain: &mut EpochChain, target: u64) -> Result<[u8; 32], FacadeError> {
    if let Some(mk) = chain.skipped.remove(&target) {
        return Ok(mk);
    }
    if target < chain.next_counter {
        return Err(FacadeError::CounterReuse);
    }
    let skip = target - chain.next_counter;
    if skip > MAX_COUNTER_SKIP {
        return Err(FacadeError::Crypto(sc_crypto::CryptoError::RatchetStep(format!(
            "sender-key counter skip too large ({skip} > {MAX_COUNTER_SKIP})"
        ))));
    }
    while chain.next_counter < target {
        let (new_ck, mk) = kdf::chain_step(&chain.chain_key)?;
        chain.chain_key = new_ck;
        chain.skipped.insert(chain.next_counter, mk);
        chain.next_counter += 1;
    }
    let (new_ck, mk) = kdf::chain_step(&chain.chain_key)?;
    chain.chain_key = new_ck;
    chain.next_counter += 1;
    Ok(mk)
}

pub struct GroupSenderKeyEngine<'a> {
    store: &'a KeyStore,
}

impl<'a> GroupSenderKeyEngine<'a> {
    pub fn new(store: &'a KeyStore) -> Self {
        Self { store }
    }

    async fn load_send_chain(&self, channel_id: &str) -> Result<Option<SendChainRecord>, FacadeError> {
        match self.store.get(&send_key(channel_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_send_chain(&self, channel_id: &str, record: &SendChainRecord) -> Result<(), FacadeError> {
        self.store.set(&send_key(channel_id), &serde_json::to_vec(record)?).await?;
        Ok(())
    }

    async fn load_recv_record(
        &self,
        channel_id: &str,
        sender_user_id: &str,
        sender_device_id: u32,
    ) -> Result<Option<RecvRecord>, FacadeError> {
        match self.store.get(&recv_key(channel_id, sender_user_id, sender_device_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_recv_record(
        &self,
        channel_id: &str,
        sender_user_id: &str,
        sender_device_id: u32,
        record: &RecvRecord,
    ) -> Result<(), FacadeError> {
        self.store
            .set(&recv_key(channel_id, sender_user_id, sender_device_id), &serde_json::to_vec(record)?)
            .await?;
        Ok(())
    }

    fn distribution_message(&self, my_user_id: &str, my_device_id: u32, record: &SendChainRecord) -> SenderKeyDistributionMessage {
        SenderKeyDistributionMessage {
            distribution_id: record.distribution_id.clone(),
            epoch_number: record.epoch_number,
            chain_key: URL_SAFE_NO_PAD.encode(record.chain_key),
            sender_id: my_user_id.to_string(),
            sender_device_id: my_device_id,
        }
    }

    /// Whether the current sending chain needs rotation before the next
    /// send — either because none exists yet, or a rotation threshold has
    /// been crossed. Does not mutate anything.
    pub async fn rekey_reason_due(&self, channel_id: &str) -> Result<Option<RekeyReason>, FacadeError> {
        match self.load_send_chain(channel_id).await? {
            None => Ok(Some(RekeyReason::Initial)),
            Some(record) => {
                if record.messages_sent >= MAX_MESSAGES_PER_EPOCH {
                    return Ok(Some(RekeyReason::MaxMessages));
                }
                if Utc::now() - record.created_at > Duration::seconds(MAX_EPOCH_AGE_SECS) {
                    return Ok(Some(RekeyReason::MaxAge));
                }
                Ok(None)
            }
        }
    }

    /// Idempotent as long as membership and the rotation thresholds haven't
    /// moved: returns the existing chain's distribution message unchanged.
    /// Membership is diffed against what the last epoch was minted with, so
    /// the engine itself — not the caller — detects additions/removals.
    /// A removal always mints a fresh epoch (a departed member must never
    /// be able to derive a key from a chain it can still see distributed);
    /// an addition does too, so a new member never inherits messages sent
    /// before it joined. `messages_sent`/`created_at` thresholds mint a
    /// fresh epoch the same way even with no membership change at all.
    pub async fn ensure_channel_session(
        &self,
        channel_id: &str,
        my_user_id: &str,
        my_device_id: u32,
        member_ids: &[String],
    ) -> Result<SenderKeyDistributionMessage, FacadeError> {
        let existing = self.load_send_chain(channel_id).await?;
        let new_members: BTreeSet<String> = member_ids.iter().cloned().collect();

        let reason = match &existing {
            None => Some(RekeyReason::Initial),
            Some(record) => {
                let removed = record.members.difference(&new_members).next().is_some();
                let added = new_members.difference(&record.members).next().is_some();
                if removed {
                    Some(RekeyReason::MemberRemoved)
                } else if added {
                    Some(RekeyReason::MemberAdded)
                } else if record.messages_sent >= MAX_MESSAGES_PER_EPOCH {
                    Some(RekeyReason::MaxMessages)
                } else if Utc::now() - record.created_at > Duration::seconds(MAX_EPOCH_AGE_SECS) {
                    Some(RekeyReason::MaxAge)
                } else {
                    None
                }
            }
        };

        let Some(reason) = reason else {
            return Ok(self.distribution_message(my_user_id, my_device_id, existing.as_ref().expect("no-rekey implies existing chain")));
        };

        let epoch_number = existing.map(|r| r.epoch_number + 1).unwrap_or(1);
        let mut chain_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut chain_key);

        let record = SendChainRecord {
            distribution_id: uuid::Uuid::new_v4().to_string(),
            epoch_number,
            chain_key,
            counter: 0,
            created_at: Utc::now(),
            messages_sent: 0,
            members: new_members,
        };
        tracing::info!(channel_id, epoch_number, ?reason, "rekeying channel sender-key chain");
        self.save_send_chain(channel_id, &record).await?;
        Ok(self.distribution_message(my_user_id, my_device_id, &record))
    }

    pub async fn encrypt_channel(
        &self,
        channel_id: &str,
        my_user_id: &str,
        my_device_id: u32,
        plaintext: &[u8],
    ) -> Result<ChannelEnvelope, FacadeError> {
        let mut record = self.load_send_chain(channel_id).await?.ok_or(FacadeError::NoSenderKey)?;

        let (new_ck, mk) = kdf::chain_step(&record.chain_key)?;
        record.chain_key = new_ck;
        let counter = record.counter;
        record.counter += 1;
        record.messages_sent += 1;

        let ciphertext = sc_crypto::aead::encrypt(&mk, plaintext, b"")?;
        let message_id = hash::channel_message_id(channel_id, my_user_id, record.epoch_number, counter);
        let envelope = ChannelEnvelope {
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
            sender_device_id: my_device_id,
            distribution_id: record.distribution_id.clone(),
            epoch_number: record.epoch_number,
            message_counter: counter,
            message_id,
            timestamp: Utc::now(),
        };

        self.save_send_chain(channel_id, &record).await?;
        Ok(envelope)
    }

    /// Adopt a freshly-received chain key for `sender_user_id`/
    /// `sender_device_id`, pruning any chain more than
    /// [`EPOCH_PRUNE_WINDOW`] epochs behind the newest one on file.
    pub async fn process_sender_key_distribution(
        &self,
        channel_id: &str,
        sender_user_id: &str,
        sender_device_id: u32,
        msg: &SenderKeyDistributionMessage,
    ) -> Result<(), FacadeError> {
        let mut recv = self
            .load_recv_record(channel_id, sender_user_id, sender_device_id)
            .await?
            .unwrap_or_else(RecvRecord::empty);

        let chain_key = to_32(&URL_SAFE_NO_PAD.decode(&msg.chain_key).map_err(sc_crypto::CryptoError::Base64Decode)?)?;
        recv.chains.insert(msg.epoch_number, EpochChain { chain_key, next_counter: 0, skipped: HashMap::new() });

        let max_epoch = *recv.chains.keys().max().expect("just inserted one");
        recv.chains.retain(|epoch, _| max_epoch.saturating_sub(*epoch) <= EPOCH_PRUNE_WINDOW);
        recv.last_seen_epoch = recv.last_seen_epoch.max(max_epoch);

        tracing::debug!(channel_id, sender_user_id, sender_device_id, epoch_number = msg.epoch_number, "adopted sender-key distribution");
        self.save_recv_record(channel_id, sender_user_id, sender_device_id, &recv).await
    }

    /// Checks, in order: replay → epoch known/stale → counter reuse →
    /// accept and advance state.
    pub async fn decrypt_channel(
        &self,
        channel_id: &str,
        sender_user_id: &str,
        envelope: &ChannelEnvelope,
    ) -> Result<Vec<u8>, FacadeError> {
        let mut recv = self
            .load_recv_record(channel_id, sender_user_id, envelope.sender_device_id)
            .await?
            .ok_or(FacadeError::NoSenderKey)?;

        if recv.replay.contains(&envelope.message_id) {
            return Err(FacadeError::Replay);
        }

        let max_known = recv.chains.keys().copied().max();
        match max_known {
            None => return Err(FacadeError::NoSenderKey),
            Some(max) if envelope.epoch_number > max => return Err(FacadeError::NoSenderKey),
            _ => {}
        }

        if envelope.epoch_number < recv.last_seen_epoch {
            let age = Utc::now() - envelope.timestamp;
            if age > Duration::seconds(OLD_EPOCH_GRACE_PERIOD_SECS) {
                tracing::warn!(channel_id, sender_user_id, epoch_number = envelope.epoch_number, last_seen_epoch = recv.last_seen_epoch, "rejecting message outside epoch grace period");
                return Err(FacadeError::StaleEpoch);
            }
        }
        if !recv.chains.contains_key(&envelope.epoch_number) {
            return Err(FacadeError::StaleEpoch);
        }

        let ciphertext = URL_SAFE_NO_PAD.decode(&envelope.ciphertext).map_err(sc_crypto::CryptoError::Base64Decode)?;

        let chain = recv.chains.get_mut(&envelope.epoch_number).expect("checked above");
        let mk = derive_message_key(chain, envelope.message_counter)?;
        let plaintext = sc_crypto::aead::decrypt(&mk, &ciphertext, b"").map(|pt| pt.to_vec()).map_err(|e| match e {
            sc_crypto::CryptoError::AeadDecrypt => FacadeError::MacFailure,
            other => FacadeError::Crypto(other),
        })?;

        recv.replay.insert(envelope.message_id.clone());
        self.save_recv_record(channel_id, sender_user_id, envelope.sender_device_id, &recv).await?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sc-core-group-test-{}.db", uuid::Uuid::new_v4()))
    }

    fn members(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Mirrors the documented worked example: a channel that has rekeyed up
    /// to epoch 4 (member churn) receives, in-band, a message still on
    /// epoch 3 whose timestamp is 10 minutes old. With a 5-minute grace
    /// period this must be `StaleEpoch` even though epoch 3's chain state
    /// is still retained under `EPOCH_PRUNE_WINDOW`.
    #[tokio::test]
    async fn message_from_pruned_epoch_outside_grace_period_is_stale() {
        let path = temp_db_path();
        let store = KeyStore::open(&path).await.unwrap();
        let engine = GroupSenderKeyEngine::new(&store);

        let dist1 = engine.ensure_channel_session("room", "erin", 1, &members(&["erin", "frank"])).await.unwrap();
        engine.process_sender_key_distribution("room", "erin", 1, &dist1).await.unwrap();

        let dist2 = engine.ensure_channel_session("room", "erin", 1, &members(&["erin"])).await.unwrap();
        engine.process_sender_key_distribution("room", "erin", 1, &dist2).await.unwrap();

        let dist3 = engine.ensure_channel_session("room", "erin", 1, &members(&["erin", "gail"])).await.unwrap();
        engine.process_sender_key_distribution("room", "erin", 1, &dist3).await.unwrap();
        let mut stale_envelope = engine.encrypt_channel("room", "erin", 1, b"epoch 3 message").await.unwrap();

        let dist4 = engine.ensure_channel_session("room", "erin", 1, &members(&["erin", "gail", "hank"])).await.unwrap();
        engine.process_sender_key_distribution("room", "erin", 1, &dist4).await.unwrap();

        assert_eq!(stale_envelope.epoch_number, 3);
        stale_envelope.timestamp = Utc::now() - Duration::minutes(10);

        let err = engine.decrypt_channel("room", "erin", &stale_envelope).await.unwrap_err();
        assert!(matches!(err, FacadeError::StaleEpoch));

        let _ = std::fs::remove_file(&path);
    }

    /// The same epoch-3 message, if it arrives promptly, is accepted even
    /// though two newer epochs have since been minted.
    #[tokio::test]
    async fn message_from_pruned_epoch_within_grace_period_is_accepted() {
        let path = temp_db_path();
        let store = KeyStore::open(&path).await.unwrap();
        let engine = GroupSenderKeyEngine::new(&store);

        let dist1 = engine.ensure_channel_session("room", "erin", 1, &members(&["erin", "frank"])).await.unwrap();
        engine.process_sender_key_distribution("room", "erin", 1, &dist1).await.unwrap();

        let dist2 = engine.ensure_channel_session("room", "erin", 1, &members(&["erin"])).await.unwrap();
        engine.process_sender_key_distribution("room", "erin", 1, &dist2).await.unwrap();

        let dist3 = engine.ensure_channel_session("room", "erin", 1, &members(&["erin", "gail"])).await.unwrap();
        engine.process_sender_key_distribution("room", "erin", 1, &dist3).await.unwrap();
        let envelope = engine.encrypt_channel("room", "erin", 1, b"epoch 3 message").await.unwrap();

        let dist4 = engine.ensure_channel_session("room", "erin", 1, &members(&["erin", "gail", "hank"])).await.unwrap();
        engine.process_sender_key_distribution("room", "erin", 1, &dist4).await.unwrap();

        let plaintext = engine.decrypt_channel("room", "erin", &envelope).await.unwrap();
        assert_eq!(plaintext, b"epoch 3 message");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn member_removal_always_advances_epoch_even_without_explicit_reason() {
        let path = temp_db_path();
        let store = KeyStore::open(&path).await.unwrap();
        let engine = GroupSenderKeyEngine::new(&store);

        let dist1 = engine.ensure_channel_session("room", "erin", 1, &members(&["erin", "frank"])).await.unwrap();
        assert_eq!(dist1.epoch_number, 1);

        // Same membership: idempotent, no rekey.
        let dist_same = engine.ensure_channel_session("room", "erin", 1, &members(&["erin", "frank"])).await.unwrap();
        assert_eq!(dist_same.epoch_number, 1);
        assert_eq!(dist_same.distribution_id, dist1.distribution_id);

        // Frank leaves: the engine must detect this itself and rekey.
        let dist2 = engine.ensure_channel_session("room", "erin", 1, &members(&["erin"])).await.unwrap();
        assert_eq!(dist2.epoch_number, 2);
        assert_ne!(dist2.distribution_id, dist1.distribution_id);

        let _ = std::fs::remove_file(&path);
    }
}
