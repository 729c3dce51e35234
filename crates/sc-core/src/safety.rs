//! Safety-Number Engine — façade-level binding of
//! [`sc_crypto::safety_number`] to user ids and raw identity key bytes.

use sc_crypto::safety_number::{CombinedSafetyNumber, Sha512Hash};

/// Numeric safety number rendering plus the raw combined bytes a QR code
/// would encode, for one local/remote identity-key pair.
pub struct SafetyNumber {
    pub numeric: String,
    pub qr_payload: [u8; 61],
}

/// `local_user_id`/`remote_user_id` are the stable identifiers the
/// fingerprint is bound to (rejects a key presented under the wrong
/// identity); `local_identity_key`/`remote_identity_key` are the raw
/// Ed25519 public key bytes.
pub fn compute_safety_number(
    local_user_id: &str,
    local_identity_key: &[u8],
    remote_user_id: &str,
    remote_identity_key: &[u8],
) -> SafetyNumber {
    let combined = CombinedSafetyNumber::compute(
        &Sha512Hash,
        local_identity_key,
        local_user_id.as_bytes(),
        remote_identity_key,
        remote_user_id.as_bytes(),
    );
    SafetyNumber { numeric: combined.render(), qr_payload: combined.qr_payload() }
}
