//! sc-core — the secure channel crypto façade.
//!
//! # Layers
//! - `vault`   — Identity & Prekey Vault: long-term identity, signed/KEM/
//!               one-time prekeys, upload bundles
//! - `trust`   — Peer Trust Store: TOFU identity-key tracking
//! - `session` — Pairwise Session Engine: X3DH + Double Ratchet over 1:1
//!               `DmEnvelope`s
//! - `group`   — Group Sender-Key Engine: per-epoch sender-key chains over
//!               `ChannelEnvelope`s, with replay and rekey handling
//! - `safety`  — Safety-Number Engine: numeric/QR fingerprint rendering
//! - `facade`  — [`facade::CryptoFacade`], the single entry point composing
//!               all of the above
//! - `error`   — unified [`error::FacadeError`]

pub mod error;
pub mod facade;
pub mod group;
pub mod safety;
pub mod session;
pub mod trust;
pub mod vault;

pub use error::FacadeError;
pub use facade::CryptoFacade;
