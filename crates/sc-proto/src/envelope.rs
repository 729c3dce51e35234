//! Message envelopes — what travels between the crypto façade and whatever
//! transport the caller wires up. The façade only ever produces and
//! consumes these two shapes; it has no opinion on how they get delivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pairwise (1:1) envelope.
///
/// `Prekey` carries the X3DH init header's registration id and is used for
/// the first outgoing message of a freshly-established session; every
/// later message on that session is `Message`. Modeling this as a sum type
/// rather than a flag makes "registration id present iff prekey" a
/// structural fact instead of a runtime check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DmEnvelope {
    Prekey {
        ciphertext: String,
        #[serde(rename = "senderDeviceId")]
        sender_device_id: u32,
        #[serde(rename = "registrationId")]
        registration_id: u32,
    },
    Message {
        ciphertext: String,
        #[serde(rename = "senderDeviceId")]
        sender_device_id: u32,
    },
}

impl DmEnvelope {
    pub fn ciphertext(&self) -> &str {
        match self {
            DmEnvelope::Prekey { ciphertext, .. } => ciphertext,
            DmEnvelope::Message { ciphertext, .. } => ciphertext,
        }
    }

    pub fn sender_device_id(&self) -> u32 {
        match self {
            DmEnvelope::Prekey { sender_device_id, .. } => *sender_device_id,
            DmEnvelope::Message { sender_device_id, .. } => *sender_device_id,
        }
    }

    pub fn is_initial(&self) -> bool {
        matches!(self, DmEnvelope::Prekey { .. })
    }
}

/// Group (sender-key) envelope. One per message, scoped to a channel and a
/// sender-key epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEnvelope {
    pub ciphertext: String,
    #[serde(rename = "senderDeviceId")]
    pub sender_device_id: u32,
    /// Identifies which sender-key chain this message belongs to.
    #[serde(rename = "distributionId")]
    pub distribution_id: String,
    #[serde(rename = "epochNumber")]
    pub epoch_number: u64,
    #[serde(rename = "messageCounter")]
    pub message_counter: u64,
    /// `hash::channel_message_id(channel_id, sender_id, epoch_number, message_counter)`
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}
