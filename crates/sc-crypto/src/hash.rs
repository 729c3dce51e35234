//! BLAKE3-based hash utilities shared across the crypto-core layers.

pub fn hash(data: &[u8]) -> [u8; 32] {
    blake3::hash(data).into()
}

/// Keyed hash — used for MACs where a key context differentiates domains.
pub fn keyed_hash(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    blake3::keyed_hash(key, data).into()
}

/// Deterministic channel message id: hash of (channel, sender, epoch, counter).
///
/// Used as the replay-window key — two envelopes with the same inputs always
/// collide, regardless of ciphertext, so a relay that re-delivers a message
/// verbatim cannot manufacture a distinct id.
pub fn channel_message_id(channel_id: &str, sender_id: &str, epoch_number: u64, counter: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"sc-channel-msg-id-v1\x00");
    hasher.update(channel_id.as_bytes());
    hasher.update(b"\x00");
    hasher.update(sender_id.as_bytes());
    hasher.update(b"\x00");
    hasher.update(&epoch_number.to_be_bytes());
    hasher.update(&counter.to_be_bytes());
    hex::encode(hasher.finalize().as_bytes())
}
