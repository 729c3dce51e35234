use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] sc_crypto::CryptoError),

    /// AEAD tag mismatch on a single value. Never retried; the record is
    /// left intact (corruption of one value never poisons others).
    #[error("Corrupted value for key {0}")]
    Corruption(String),

    #[error("Backend I/O error: {0}")]
    Backend(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
