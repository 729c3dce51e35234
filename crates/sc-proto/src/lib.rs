//! sc-proto — wire types for the secure channel crypto core.
//!
//! # Modules
//! - `envelope` — DM and channel message envelopes (what the façade emits/consumes)
//! - `group`    — sender-key distribution message

pub mod envelope;
pub mod group;

pub use envelope::{ChannelEnvelope, DmEnvelope};
pub use group::SenderKeyDistributionMessage;
