use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch — possible tampering)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Session not initialised")]
    SessionNotInitialised,

    #[error("Ratchet step failed: {0}")]
    RatchetStep(String),

    #[error("Nonce generation failed")]
    NonceGeneration,

    #[error("Prekey error: {0}")]
    PrekeyError(String),

    #[error("One-time pre-key already consumed")]
    PreKeyExhausted,

    #[error("Pre-key bundle rejected: {0}")]
    InvalidBundle(String),

    #[error("Post-quantum KEM operation failed: {0}")]
    Kem(String),

    #[error("degraded mode is unavailable in a release build")]
    DegradedModeUnavailable,

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
