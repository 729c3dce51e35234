//! Degraded-mode "sealed box" — a development-only stand-in for the real
//! X3DH handshake and Double Ratchet, used when a caller explicitly opts
//! into [`CryptoError::DegradedModeUnavailable`]-guarded testing without
//! key material round-tripping through a platform keychain.
//!
//! This is not a session: there is no handshake, no forward secrecy, no
//! post-compromise security, and the "key" is a fixed public constant, not
//! a secret. It exists purely so local testing can encrypt/decrypt DMs
//! without provisioning real identity/prekey material. The wire format is
//! identical to a real ratchet message — same AEAD, same nonce-prefixed
//! ciphertext shape — so nothing about the bytes on the wire reveals that
//! degraded mode produced them.

use crate::{aead, hash, CryptoError};

const SEALED_BOX_CONTEXT: &[u8] = b"sc-core-degraded-mode-sealed-box-v1";

fn sealed_box_key() -> [u8; 32] {
    hash::hash(SEALED_BOX_CONTEXT)
}

pub fn seal(plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    aead::encrypt(&sealed_box_key(), plaintext, SEALED_BOX_CONTEXT)
}

pub fn open(sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    aead::decrypt(&sealed_box_key(), sealed, SEALED_BOX_CONTEXT).map(|pt| pt.to_vec())
}
