//! sc-crypto — secure channel cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - All public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `identity` — long-term Ed25519 identity keypair
//! - `x3dh`     — X3DH-like asynchronous key agreement, hybrid with a Kyber768 KEM
//! - `pqkem`    — post-quantum KEM pre-key generation / encapsulation
//! - `ratchet`  — full Double Ratchet with DH ratchet steps + skipped message keys
//! - `aead`     — XChaCha20-Poly1305 encrypt/decrypt helpers
//! - `kdf`      — HKDF key derivation
//! - `hash`     — BLAKE3 utilities (channel message ids)
//! - `safety_number` — iterated-hash fingerprint / safety number rendering
//! - `degraded` — development-only sealed-box stand-in for session + ratchet
//! - `error`    — unified error type

pub mod aead;
pub mod degraded;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod pqkem;
pub mod ratchet;
pub mod safety_number;
pub mod x3dh;

pub use error::CryptoError;
