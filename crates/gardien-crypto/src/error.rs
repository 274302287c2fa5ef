use thiserror::Error;

use gardien_shared::{SealedError, SigningError};
use gardien_store::StoreError;

/// Errors produced by session management.
///
/// The first three variants are the negotiation protocol's verdicts:
/// callers distinguish "go negotiate first" from "a concurrent creation
/// needs tie-breaking" from "drop this stale handshake".
#[derive(Error, Debug)]
pub enum SessionError {
    /// Encrypt/decrypt was attempted against a peer with no established
    /// session. Caller error; never retried internally.
    #[error("No session established with device: {0}")]
    SessionDoesNotExist(String),

    /// An inbound handshake carried a version below the locally stored
    /// one; a newer local session supersedes it.
    #[error("Session already created at a newer version")]
    SessionAlreadyCreated,

    /// Both sides created a session concurrently at the same version.
    /// Resolved by the identity-key tie-break in [`session_race_winner`].
    ///
    /// [`session_race_winner`]: crate::negotiation::session_race_winner
    #[error("Concurrent session creation detected")]
    SessionRaceCondition,

    /// The payload was encrypted under a session version that a newer
    /// local session has superseded.
    #[error("Invalid session version")]
    InvalidSessionVersion,

    /// Bad key, corrupt ciphertext, or tampered payload. Fails closed.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// A peer's prekey signature did not verify against its identity key.
    #[error("Prekey signature rejected")]
    PrekeySignature,

    /// Key material that does not parse.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// A ciphertext that does not decode into an Olm message.
    #[error("Malformed Olm message: {0}")]
    Malformed(String),

    /// Unpickling an account or session failed (wrong pickling key or
    /// corrupt blob).
    #[error("Pickle error: {0}")]
    Pickle(String),

    #[error("Crypto store not initialized")]
    NotInitialized,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sealed(#[from] SealedError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
