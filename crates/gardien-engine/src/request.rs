//! The closed set of requests callers can submit.
//!
//! Every caller-facing operation is one variant carrying its arguments
//! and a oneshot responder. The worker matches exhaustively, so adding an
//! operation without handling it is a compile error rather than an
//! unknown-message-type branch at runtime.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use gardien_crypto::NotifPeer;
use gardien_shared::sealed::SealedKey;
use gardien_shared::types::{
    AuthMetadata, ClientPublicKeys, EncryptedData, IdentityKeys, OneTimeKeyUpload, PrekeyBundle,
};
use gardien_store::{InboundMessage, OutboundMessage};

use crate::audit::AuditEntry;
use crate::error::EngineError;

type Respond<T> = oneshot::Sender<Result<T, EngineError>>;

/// Result of creating an outbound session: the handshake ciphertext and
/// the version the new session was stored at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundSessionCreation {
    pub encrypted_data: EncryptedData,
    pub session_version: i64,
}

pub(crate) enum Request {
    InitializeCryptoAccount {
        respond: Respond<()>,
    },
    GetPublicKeys {
        respond: Respond<ClientPublicKeys>,
    },
    SignMessage {
        message: String,
        respond: Respond<String>,
    },
    VerifyMessage {
        message: String,
        signature: String,
        public_key: String,
        respond: Respond<bool>,
    },
    Encrypt {
        content: String,
        device_id: String,
        respond: Respond<EncryptedData>,
    },
    EncryptAndPersist {
        content: String,
        device_id: String,
        message_id: String,
        respond: Respond<EncryptedData>,
    },
    Decrypt {
        payload: EncryptedData,
        device_id: String,
        respond: Respond<String>,
    },
    DecryptAndPersist {
        payload: EncryptedData,
        device_id: String,
        user_id: String,
        message_id: String,
        respond: Respond<String>,
    },
    CreateOutboundSession {
        peer: IdentityKeys,
        bundle: PrekeyBundle,
        respond: Respond<OutboundSessionCreation>,
    },
    NegotiateOutboundSession {
        device_id: String,
        auth: AuthMetadata,
        respond: Respond<OutboundSessionCreation>,
    },
    CreateInboundSession {
        peer: IdentityKeys,
        initial: EncryptedData,
        session_version: i64,
        overwrite: bool,
        respond: Respond<String>,
    },
    IsContentSessionInitialized {
        device_id: String,
        respond: Respond<bool>,
    },
    CreateNotificationsSession {
        peer: NotifPeer,
        peer_keys: IdentityKeys,
        bundle: PrekeyBundle,
        respond: Respond<EncryptedData>,
    },
    DecryptNotification {
        peer: NotifPeer,
        payload: EncryptedData,
        respond: Respond<String>,
    },
    IsNotificationsSessionInitialized {
        peer: NotifPeer,
        respond: Respond<bool>,
    },
    ReassignNotificationsSession {
        keyserver_id: String,
        prev_cookie: Option<String>,
        new_cookie: Option<String>,
        respond: Respond<()>,
    },
    GetOneTimeKeys {
        count: usize,
        respond: Respond<OneTimeKeyUpload>,
    },
    UploadOneTimeKeys {
        auth: AuthMetadata,
        count: usize,
        respond: Respond<()>,
    },
    ValidateAndUploadPrekeys {
        auth: AuthMetadata,
        respond: Respond<()>,
    },
    MarkPrekeysAsPublished {
        respond: Respond<()>,
    },
    EnqueueOutboundMessage {
        plaintext: String,
        device_id: String,
        user_id: String,
        supports_auto_retry: bool,
        respond: Respond<String>,
    },
    GetUnsentOutboundMessages {
        respond: Respond<Vec<OutboundMessage>>,
    },
    GetOutboundMessagesById {
        ids: Vec<String>,
        respond: Respond<Vec<OutboundMessage>>,
    },
    MarkMessageSent {
        message_id: String,
        device_id: String,
        respond: Respond<()>,
    },
    RemoveOutboundMessage {
        message_id: String,
        device_id: String,
        respond: Respond<()>,
    },
    ResetOutboundMessagesForDevice {
        device_id: String,
        new_device_id: Option<String>,
        respond: Respond<Vec<String>>,
    },
    RecordInboundMessage {
        message_id: String,
        sender_device_id: String,
        sender_user_id: String,
        plaintext: String,
        respond: Respond<bool>,
    },
    GetInboundMessages {
        respond: Respond<Vec<InboundMessage>>,
    },
    RemoveInboundMessages {
        ids: Vec<String>,
        respond: Respond<()>,
    },
    RemoveInboundMessagesBefore {
        id: i64,
        respond: Respond<()>,
    },
    GetStorageItem {
        key: String,
        respond: Respond<Option<(Vec<u8>, String)>>,
    },
    SetStorageItem {
        key: String,
        item: Vec<u8>,
        expected: Option<String>,
        respond: Respond<String>,
    },
    ForceSetStorageItem {
        key: String,
        item: Vec<u8>,
        respond: Respond<String>,
    },
    RemoveStorageItem {
        key: String,
        respond: Respond<()>,
    },
    StampUserId {
        user_id: String,
        respond: Respond<()>,
    },
    GetStampedUserId {
        respond: Respond<Option<String>>,
    },
    RestoreBackup {
        backup_id: String,
        auth: AuthMetadata,
        backup_data_key: SealedKey,
        backup_log_data_key: SealedKey,
        respond: Respond<()>,
    },
    RecentActivity {
        respond: Respond<Vec<AuditEntry>>,
    },
    ClearSensitiveData {
        respond: Respond<()>,
    },
    Shutdown {
        respond: Respond<()>,
    },
}

impl Request {
    /// Label recorded in the audit log.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Request::InitializeCryptoAccount { .. } => "initialize_crypto_account",
            Request::GetPublicKeys { .. } => "get_public_keys",
            Request::SignMessage { .. } => "sign_message",
            Request::VerifyMessage { .. } => "verify_message",
            Request::Encrypt { .. } => "encrypt",
            Request::EncryptAndPersist { .. } => "encrypt_and_persist",
            Request::Decrypt { .. } => "decrypt",
            Request::DecryptAndPersist { .. } => "decrypt_and_persist",
            Request::CreateOutboundSession { .. } => "create_outbound_session",
            Request::NegotiateOutboundSession { .. } => "negotiate_outbound_session",
            Request::CreateInboundSession { .. } => "create_inbound_session",
            Request::IsContentSessionInitialized { .. } => "is_content_session_initialized",
            Request::CreateNotificationsSession { .. } => "create_notifications_session",
            Request::DecryptNotification { .. } => "decrypt_notification",
            Request::IsNotificationsSessionInitialized { .. } => {
                "is_notifications_session_initialized"
            }
            Request::ReassignNotificationsSession { .. } => "reassign_notifications_session",
            Request::GetOneTimeKeys { .. } => "get_one_time_keys",
            Request::UploadOneTimeKeys { .. } => "upload_one_time_keys",
            Request::ValidateAndUploadPrekeys { .. } => "validate_and_upload_prekeys",
            Request::MarkPrekeysAsPublished { .. } => "mark_prekeys_as_published",
            Request::EnqueueOutboundMessage { .. } => "enqueue_outbound_message",
            Request::GetUnsentOutboundMessages { .. } => "get_unsent_outbound_messages",
            Request::GetOutboundMessagesById { .. } => "get_outbound_messages_by_id",
            Request::MarkMessageSent { .. } => "mark_message_sent",
            Request::RemoveOutboundMessage { .. } => "remove_outbound_message",
            Request::ResetOutboundMessagesForDevice { .. } => "reset_outbound_messages_for_device",
            Request::RecordInboundMessage { .. } => "record_inbound_message",
            Request::GetInboundMessages { .. } => "get_inbound_messages",
            Request::RemoveInboundMessages { .. } => "remove_inbound_messages",
            Request::RemoveInboundMessagesBefore { .. } => "remove_inbound_messages_before",
            Request::GetStorageItem { .. } => "get_storage_item",
            Request::SetStorageItem { .. } => "set_storage_item",
            Request::ForceSetStorageItem { .. } => "force_set_storage_item",
            Request::RemoveStorageItem { .. } => "remove_storage_item",
            Request::StampUserId { .. } => "stamp_user_id",
            Request::GetStampedUserId { .. } => "get_stamped_user_id",
            Request::RestoreBackup { .. } => "restore_backup",
            Request::RecentActivity { .. } => "recent_activity",
            Request::ClearSensitiveData { .. } => "clear_sensitive_data",
            Request::Shutdown { .. } => "shutdown",
        }
    }
}
