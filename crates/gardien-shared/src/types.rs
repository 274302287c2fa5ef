//! Wire-facing types exchanged between devices and with the identity
//! directory. Field names follow the JSON forms the rest of the fleet
//! already speaks (camelCase).

use serde::{Deserialize, Serialize};

/// A device's public identity keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeys {
    /// Signing key, unpadded base64. Also serves as the device ID.
    pub ed25519: String,
    /// Diffie-Hellman key, unpadded base64.
    pub curve25519: String,
}

/// Identity keys of both accounts of one device, as serialized into the
/// signed ownership blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityKeysBlob {
    pub primary_identity_public_keys: IdentityKeys,
    pub notification_identity_public_keys: IdentityKeys,
}

/// A JSON-serialized [`IdentityKeysBlob`] signed with the content
/// account's ed25519 key, proving the device owns both accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedIdentityKeys {
    pub payload: String,
    pub signature: String,
}

/// Everything a caller needs to advertise this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPublicKeys {
    pub primary_identity_public_keys: IdentityKeys,
    pub notification_identity_public_keys: IdentityKeys,
    pub blob_payload: String,
    pub signature: String,
}

/// A peer's published handshake material, fetched from the identity
/// directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrekeyBundle {
    /// Medium-term prekey, unpadded base64 curve25519.
    pub prekey: String,
    /// Detached ed25519 signature over the prekey, by the peer's identity.
    pub prekey_signature: String,
    /// Single-use key consumed by the first inbound session against it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_key: Option<String>,
}

/// One account's prekey and its signature, ready for upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prekey {
    pub prekey: String,
    pub prekey_signature: String,
}

/// Prekeys of both accounts, uploaded in one batch so the directory never
/// sees them drift apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrekeyUpload {
    pub content_prekey: Prekey,
    pub notif_prekey: Prekey,
}

/// Fresh one-time keys for both accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeKeyUpload {
    pub content_one_time_keys: Vec<String>,
    pub notification_one_time_keys: Vec<String>,
}

/// A peer device's published key material, as served by the identity
/// directory: identity keys and prekey bundles for both of its accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeys {
    pub primary_identity_public_keys: IdentityKeys,
    pub notification_identity_public_keys: IdentityKeys,
    pub content_prekey_bundle: PrekeyBundle,
    pub notif_prekey_bundle: PrekeyBundle,
}

/// An Olm-encrypted payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedData {
    /// Unpadded base64 ciphertext.
    pub message: String,
    /// 0 = prekey (session-establishing), 1 = normal.
    pub message_type: u8,
    /// Version of the sender's session at encryption time. Absent on
    /// notification payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_version: Option<i64>,
}

/// Olm prekey message type.
pub const MESSAGE_TYPE_PREKEY: u8 = 0;
/// Olm normal message type.
pub const MESSAGE_TYPE_NORMAL: u8 = 1;

/// Opaque credentials for remote services. This core never mints or
/// refreshes them; callers pass them through.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMetadata {
    pub user_id: String,
    pub device_id: String,
    pub access_token: String,
}
