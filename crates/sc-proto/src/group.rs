//! Sender-key distribution message — the opaque blob a channel member sends
//! to every other member (over a 1:1 session) so they can derive the
//! current sender-key chain.
//!
//! The content of `chain_key` is produced and consumed entirely by the
//! group-ratchet engine in `sc-core`; this crate only carries it across
//! the wire.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderKeyDistributionMessage {
    pub distribution_id: String,
    pub epoch_number: u64,
    /// Opaque sender-key chain material (base64).
    pub chain_key: String,
    pub sender_id: String,
    pub sender_device_id: u32,
}
