//! Key derivation functions — HKDF-SHA256 over handshake and ratchet state.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;

// ── HKDF-SHA256 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be empty (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive 32-byte root key for DH output.
pub fn derive_root_key(dh_output: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut key = [0u8; 32];
    hkdf_expand(dh_output, Some(b"sc-secure-channel-v1"), info, &mut key)?;
    Ok(key)
}

/// Derive sending / receiving chain keys from a root key (ratchet step).
/// Returns (new_root_key, chain_key_send, chain_key_recv)
pub fn ratchet_keys(
    root_key: &[u8; 32],
    dh_ratchet_output: &[u8],
) -> Result<([u8; 32], [u8; 32], [u8; 32]), CryptoError> {
    let mut new_root = [0u8; 32];
    let mut ck_send = [0u8; 32];
    let mut ck_recv = [0u8; 32];

    // KDF_RK(rk, dh_out) → (rk', ck_send, ck_recv)
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_ratchet_output);
    hk.expand(b"sc-root-key", &mut new_root)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(b"sc-chain-send", &mut ck_send)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(b"sc-chain-recv", &mut ck_recv)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    Ok((new_root, ck_send, ck_recv))
}

/// Derive a per-message key from a chain key (symmetric ratchet step).
/// Returns (next_chain_key, message_key)
pub fn chain_step(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(ck), b"sc-chain-step");
    let mut next_ck = [0u8; 32];
    let mut mk = [0u8; 32];
    hk.expand(b"next-chain-key", &mut next_ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(b"message-key", &mut mk)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((next_ck, mk))
}
