//! Backup restore protocol.
//!
//! A fresh device is seeded from a remote compacted snapshot plus an
//! ordered log of incremental operations:
//!
//! 1. download and decrypt the snapshot, write it to a scratch file;
//! 2. validate the scratch schema version *before* touching the live
//!    database; a backup newer than this client is fatal and leaves no
//!    partial state behind;
//! 3. preserve the caller's local-only blobs, import the snapshot into
//!    the live database, re-inject the blobs;
//! 4. replay the log in order, each entry sealed independently. Any
//!    per-entry failure aborts the whole restore with the underlying
//!    error (log replay is not idempotent; callers must restart from the
//!    snapshot);
//! 5. run the standard forward-migration chain up to the current schema.
//!
//! Restoring the same snapshot twice is safe; a partially replayed log is
//! not, which is why the error is surfaced instead of swallowed.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gardien_shared::sealed::{EncryptedPayload, SealedKey};
use gardien_shared::types::AuthMetadata;
use gardien_store::models::INBOUND_STATUS_DECRYPTED;
use gardien_store::{migrations, Database, OutboundMessage, PickledAccount};

use crate::error::EngineError;
use crate::services::BackupService;

/// One incremental operation recorded in the backup log after the
/// snapshot was compacted. Entries are bincode-encoded and sealed
/// individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogOperation {
    StoreOlmAccount {
        account_id: String,
        record: PickledAccount,
    },
    StoreOlmSession {
        device_id: String,
        pickle: String,
        version: i64,
    },
    AddOutboundMessage(OutboundMessage),
    RemoveOutboundMessagesForDevice {
        device_id: String,
    },
    AddInboundMessage {
        message_id: String,
        sender_device_id: String,
        sender_user_id: String,
        plaintext: String,
    },
    SetMetadata {
        name: String,
        data: String,
    },
    PutStorageItem {
        key: String,
        item: Vec<u8>,
    },
    RemoveStorageItem {
        key: String,
    },
}

pub(crate) async fn run_restore<B: BackupService>(
    db: &mut Database,
    backup: &B,
    auth: &AuthMetadata,
    backup_id: &str,
    backup_data_key: &SealedKey,
    backup_log_data_key: &SealedKey,
    preserved_storage_keys: &[String],
) -> Result<(), EngineError> {
    tracing::info!(backup_id, "restore: downloading snapshot");
    let snapshot_blob = backup.download_snapshot(auth, backup_id).await?;

    let payload: EncryptedPayload = serde_json::from_slice(&snapshot_blob)?;
    let snapshot_bytes = backup_data_key.open(&payload)?;

    let scratch = std::env::temp_dir().join(format!("gardien-restore-{}.db", Uuid::new_v4()));
    std::fs::write(&scratch, &snapshot_bytes)?;

    let result = restore_from_scratch_file(
        db,
        backup,
        auth,
        backup_id,
        backup_log_data_key,
        preserved_storage_keys,
        &scratch,
    )
    .await;

    let _ = std::fs::remove_file(&scratch);
    result
}

async fn restore_from_scratch_file<B: BackupService>(
    db: &mut Database,
    backup: &B,
    auth: &AuthMetadata,
    backup_id: &str,
    backup_log_data_key: &SealedKey,
    preserved_storage_keys: &[String],
    scratch: &std::path::Path,
) -> Result<(), EngineError> {
    // Version gate runs against the scratch copy so an incompatible
    // backup never mutates live state.
    let stored_version = Database::open_raw(scratch)?.schema_version()?;
    if stored_version > migrations::CURRENT_VERSION {
        return Err(EngineError::IncompatibleBackupVersion {
            stored: stored_version,
            supported: migrations::CURRENT_VERSION,
        });
    }

    let mut preserved = Vec::new();
    for key in preserved_storage_keys {
        if let Some((value, _)) = db.kv_get(key)? {
            preserved.push((key.clone(), value));
        }
    }

    tracing::info!(backup_id, "restore: importing snapshot");
    db.import_snapshot_file(scratch)?;

    for (key, value) in preserved {
        db.kv_force_put(&key, &value)?;
    }

    tracing::info!(backup_id, "restore: replaying log");
    let entries = backup.download_logs(auth, backup_id).await?;
    for (index, entry) in entries.iter().enumerate() {
        let payload: EncryptedPayload = serde_json::from_slice(entry)
            .map_err(|e| EngineError::BackupLog(format!("entry {index}: {e}")))?;
        let plaintext = backup_log_data_key
            .open(&payload)
            .map_err(|e| EngineError::BackupLog(format!("entry {index}: {e}")))?;
        let operation: LogOperation = bincode::deserialize(&plaintext)
            .map_err(|e| EngineError::BackupLog(format!("entry {index}: {e}")))?;

        apply_log_operation(db, operation)
            .map_err(|e| EngineError::BackupLog(format!("entry {index}: {e}")))?;
    }

    tracing::info!(backup_id, "restore: running forward migrations");
    db.run_migrations()?;

    tracing::info!(backup_id, "restore: done");
    Ok(())
}

fn apply_log_operation(db: &Database, operation: LogOperation) -> Result<(), EngineError> {
    match operation {
        LogOperation::StoreOlmAccount { account_id, record } => {
            db.store_olm_account(&account_id, &record)?;
        }
        LogOperation::StoreOlmSession {
            device_id,
            pickle,
            version,
        } => {
            db.store_olm_session(&device_id, &pickle, version)?;
        }
        LogOperation::AddOutboundMessage(message) => {
            db.add_outbound_message(&message)?;
        }
        LogOperation::RemoveOutboundMessagesForDevice { device_id } => {
            db.remove_all_outbound_messages(&device_id)?;
        }
        LogOperation::AddInboundMessage {
            message_id,
            sender_device_id,
            sender_user_id,
            plaintext,
        } => {
            db.add_inbound_message(
                &message_id,
                &sender_device_id,
                &sender_user_id,
                &plaintext,
                INBOUND_STATUS_DECRYPTED,
            )?;
        }
        LogOperation::SetMetadata { name, data } => {
            db.set_metadata(&name, &data)?;
        }
        LogOperation::PutStorageItem { key, item } => {
            db.kv_force_put(&key, &item)?;
        }
        LogOperation::RemoveStorageItem { key } => {
            db.kv_remove(&key)?;
        }
    }
    Ok(())
}

/// Seal a log operation the way the backup service stores entries. Used
/// by tests and by log producers.
pub fn seal_log_operation(
    operation: &LogOperation,
    log_key: &SealedKey,
) -> Result<Vec<u8>, EngineError> {
    let plaintext =
        bincode::serialize(operation).map_err(|e| EngineError::BackupLog(e.to_string()))?;
    let payload = log_key.seal(&plaintext)?;
    Ok(serde_json::to_vec(&payload)?)
}
