//! # gardien-crypto
//!
//! Olm account and session management for the Gardien trust core: the
//! in-memory crypto session store, the session negotiation protocol with
//! its version tie-breaking, prekey hygiene across the content and
//! notification accounts, and the dual-session notification scheme that
//! tolerates out-of-order encrypted push delivery.
//!
//! The double-ratchet primitive itself is `vodozemac`; this crate decides
//! when sessions are created, replaced, persisted, and raced.

pub mod account;
pub mod negotiation;
pub mod notif;
pub mod pickle;
pub mod store;

mod error;

pub use account::AccountPair;
pub use error::SessionError;
pub use negotiation::{session_race_winner, RaceOutcome};
pub use notif::NotifPeer;
pub use store::CryptoStore;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SessionError>;
