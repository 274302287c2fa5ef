//! Protocol-wide constants.

/// Nonce size for the symmetric envelope (IETF ChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 12;

/// BLAKE3 derivation context for turning a string pickling key into the
/// 32-byte key that encrypts Olm pickles.
pub const KDF_CONTEXT_PICKLE_KEY: &str = "gardien 2025-06-01 olm pickle key";

/// Fixed payload encrypted immediately after an outbound session is
/// created, proving liveness to the peer. The plaintext is discarded on
/// the receiving side.
pub const INITIAL_ENCRYPTED_MESSAGE: &str = "{\"type\": \"init\"}";

/// Logical storage ID of the content (message encryption) account.
pub const CONTENT_ACCOUNT_ID: &str = "content";

/// Logical storage ID of the notification (push-payload) account.
pub const NOTIFICATIONS_ACCOUNT_ID: &str = "notifications";
