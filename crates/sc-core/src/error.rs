//! Unified façade error type. Every subsystem's error converts into this;
//! callers outside the core only ever see `FacadeError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FacadeError {
    /// A caller invoked an operation before `init` (or a group operation
    /// before `setLocalUserId`). This is a precondition bug in the caller,
    /// not a recoverable runtime condition.
    #[error("façade not initialised")]
    NotInitialized,

    /// The `KeyStore` backend was momentarily unreachable. Callers may
    /// retry once; a second failure should surface.
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A stored value failed AEAD authentication. Never retried; the
    /// record is left intact unless the caller explicitly sheds it.
    #[error("stored record corrupted: {0}")]
    Corruption(String),

    /// A pre-key bundle failed signature verification; session
    /// establishment is refused.
    #[error("pre-key bundle rejected: {0}")]
    InvalidBundle(String),

    /// All one-time pre-keys have been consumed; caller may fall back to
    /// a signed-prekey-only (no one-time) handshake.
    #[error("one-time pre-keys exhausted")]
    PreKeyExhausted,

    /// No session exists for the given (peer, device) address.
    #[error("no session for this address")]
    SessionUnknown,

    /// The same message id was already accepted.
    #[error("duplicate message")]
    DuplicateMessage,

    /// AEAD authentication failed while decrypting a DM or channel message.
    /// Never consumed as a state advance.
    #[error("message authentication failed")]
    MacFailure,

    /// The sender's identity key does not match what is on file. The trust
    /// store has already recorded the change; the message is rejected,
    /// never silently accepted.
    #[error("sender identity does not match stored record")]
    IdentityMismatch,

    /// No sender-key state exists for this channel.
    #[error("no sender-key state for this channel")]
    NoSenderKey,

    /// Message id already present in the replay window.
    #[error("replayed message")]
    Replay,

    /// Message counter did not strictly exceed the per-epoch high-water
    /// mark.
    #[error("counter reuse within epoch")]
    CounterReuse,

    /// Epoch is more than the grace period behind the last-seen epoch.
    #[error("stale epoch")]
    StaleEpoch,

    #[error(transparent)]
    Crypto(#[from] sc_crypto::CryptoError),

    #[error(transparent)]
    Store(#[from] sc_store::StoreError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
