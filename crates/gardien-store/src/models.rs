//! Typed rows for the store's tables.

use serde::{Deserialize, Serialize};

/// Delivery state of an outbound P2P message.
///
/// `Persisted -> Encrypted -> Sent`; rows are deleted on delivery
/// confirmation, so `Sent` is only ever observable if a crash interrupts
/// confirmation mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Persisted,
    Encrypted,
    Sent,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Persisted => "persisted",
            DeliveryStatus::Encrypted => "encrypted",
            DeliveryStatus::Sent => "sent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "persisted" => Some(DeliveryStatus::Persisted),
            "encrypted" => Some(DeliveryStatus::Encrypted),
            "sent" => Some(DeliveryStatus::Sent),
            _ => None,
        }
    }
}

/// Status value written for freshly decrypted inbound messages.
pub const INBOUND_STATUS_DECRYPTED: &str = "decrypted";

/// A row of `outbound_p2p_messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub message_id: String,
    pub device_id: String,
    pub user_id: String,
    /// Milliseconds since the epoch; replay order is `(timestamp, device_id)`.
    pub timestamp: i64,
    pub plaintext: String,
    /// Serialized `EncryptedData` JSON, or `""` before encryption.
    pub ciphertext: String,
    pub status: DeliveryStatus,
    pub supports_auto_retry: bool,
}

/// A row of `inbound_p2p_messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Monotonic rowid, used to trim processed history.
    pub id: i64,
    pub message_id: String,
    pub sender_device_id: String,
    pub sender_user_id: String,
    pub plaintext: String,
    pub status: String,
}

/// Storage record of a pickled Olm account, serialized to JSON in the
/// `olm_accounts` table and in the sealed notification-account blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickledAccount {
    pub pickling_key: String,
    pub pickled_account: String,
    /// Current prekey (base64) and its signature. Cached outside the
    /// pickle because the primitive only exposes unpublished prekeys.
    #[serde(default)]
    pub prekey: Option<String>,
    #[serde(default)]
    pub prekey_signature: Option<String>,
    /// Epoch ms of the last prekey publication, used by rotation policy.
    #[serde(default)]
    pub prekey_published_at: Option<i64>,
    /// Epoch ms of the last prekey rotation, used to forget the old one.
    #[serde(default)]
    pub prekey_rotated_at: Option<i64>,
}

/// A pickled content session as read back from `olm_sessions`.
#[derive(Debug, Clone)]
pub struct PickledSession {
    pub target_device_id: String,
    pub session_data: String,
    pub version: i64,
}
