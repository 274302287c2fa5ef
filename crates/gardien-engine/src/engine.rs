//! The single-writer worker and its caller-facing handle.
//!
//! One tokio task owns the [`Database`] and the [`CryptoStore`]; callers
//! talk to it through a cloneable [`EngineHandle`] backed by an mpsc
//! channel with a oneshot responder per request. Requests run strictly in
//! submission order, so no two mutations ever interleave and no reader
//! observes a half-committed transaction.

use std::path::PathBuf;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use gardien_crypto::{notif, CryptoStore, NotifPeer};
use gardien_shared::sealed::{EncryptedPayload, SealedKey};
use gardien_shared::types::{
    AuthMetadata, ClientPublicKeys, EncryptedData, IdentityKeys, OneTimeKeyUpload, PrekeyBundle,
};
use gardien_store::models::{DeliveryStatus, INBOUND_STATUS_DECRYPTED};
use gardien_store::{Database, InboundMessage, OutboundMessage};

use crate::audit::{AuditEntry, AuditLog};
use crate::error::EngineError;
use crate::request::{OutboundSessionCreation, Request};
use crate::restore;
use crate::services::{BackupService, IdentityDirectory};

/// How many recent requests the audit ring remembers.
const AUDIT_CAPACITY: usize = 1024;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Database file location; `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    /// Where the sealed whole-database snapshot is written after each
    /// write burst. `None` disables snapshot persistence.
    pub snapshot_path: Option<PathBuf>,
    /// Envelope key sealing the snapshot. Required when `snapshot_path`
    /// is set.
    pub snapshot_key: Option<SealedKey>,
    /// Keyserver the legacy cookie-only notification keys are migrated
    /// under at initialization, if any.
    pub legacy_keyserver_id: Option<String>,
    /// Blob-store keys that must survive a backup restore (local-only UI
    /// state and the like).
    pub preserved_storage_keys: Vec<String>,
    /// Request channel depth.
    pub request_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            snapshot_path: None,
            snapshot_key: None,
            legacy_keyserver_id: None,
            preserved_storage_keys: Vec::new(),
            request_buffer: 64,
        }
    }
}

/// Spawn the engine worker. Must be called within a tokio runtime.
pub fn spawn<I, B>(
    config: EngineConfig,
    identity: I,
    backup: B,
) -> Result<EngineHandle, EngineError>
where
    I: IdentityDirectory,
    B: BackupService,
{
    let db = open_database(&config)?;
    let (tx, rx) = mpsc::channel(config.request_buffer);

    let worker = Worker {
        db,
        crypto: None,
        identity,
        backup,
        config,
        dirty: false,
        audit: AuditLog::new(AUDIT_CAPACITY),
        seq: 0,
    };
    tokio::spawn(worker.run(rx));

    Ok(EngineHandle { tx })
}

/// Open the live database, seeding it from the sealed snapshot when the
/// database file is missing but a snapshot survives.
fn open_database(config: &EngineConfig) -> Result<Database, EngineError> {
    let Some(path) = &config.db_path else {
        return Ok(Database::open_in_memory()?);
    };

    if !path.exists() {
        if let (Some(snapshot_path), Some(key)) = (&config.snapshot_path, &config.snapshot_key) {
            if snapshot_path.exists() {
                tracing::info!(
                    snapshot = %snapshot_path.display(),
                    "database missing, seeding from sealed snapshot"
                );
                let blob = std::fs::read(snapshot_path)?;
                let payload: EncryptedPayload = serde_json::from_slice(&blob)?;
                let bytes = key.open(&payload)?;

                let mut db = Database::open_at(path)?;
                db.import_snapshot_bytes(&bytes)?;
                return Ok(db);
            }
        }
    }

    Ok(Database::open_at(path)?)
}

struct Worker<I, B> {
    db: Database,
    crypto: Option<CryptoStore>,
    identity: I,
    backup: B,
    config: EngineConfig,
    dirty: bool,
    audit: AuditLog,
    seq: u64,
}

impl<I: IdentityDirectory, B: BackupService> Worker<I, B> {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        tracing::info!("engine worker started");

        while let Some(request) = rx.recv().await {
            self.seq += 1;
            self.audit.record(self.seq, request.kind());

            if self.handle(request).await {
                break;
            }
        }

        tracing::info!("engine worker stopped");
    }

    /// Process one request. Returns `true` on shutdown.
    async fn handle(&mut self, request: Request) -> bool {
        match request {
            Request::InitializeCryptoAccount { respond } => {
                let result = self.write_op(|w| {
                    if let Some(keyserver_id) = w.config.legacy_keyserver_id.clone() {
                        notif::migrate_legacy_data_keys(&w.db, &keyserver_id)
                            .map_err(EngineError::from)?;
                    }
                    let crypto = CryptoStore::initialize(&w.db)?;
                    w.crypto = Some(crypto);
                    Ok(())
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::GetPublicKeys { respond } => {
                let result = self
                    .crypto()
                    .and_then(|crypto| crypto.public_keys().map_err(EngineError::from));
                let _ = respond.send(result);
            }
            Request::SignMessage { message, respond } => {
                let result = self.crypto().map(|crypto| crypto.sign_message(&message));
                let _ = respond.send(result);
            }
            Request::VerifyMessage {
                message,
                signature,
                public_key,
                respond,
            } => {
                let _ = respond.send(Ok(CryptoStore::verify_message(
                    &message,
                    &signature,
                    &public_key,
                )));
            }
            Request::Encrypt {
                content,
                device_id,
                respond,
            } => {
                let result = self.write_op(|w| {
                    let crypto = w.crypto.as_mut().ok_or(EngineError::NotInitialized)?;
                    let data = crypto.encrypt(&device_id, &content)?;
                    crypto.persist(&w.db)?;
                    Ok(data)
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::EncryptAndPersist {
                content,
                device_id,
                message_id,
                respond,
            } => {
                // Ciphertext and the session checkpoint that produced it
                // land in one transaction; a crash cannot separate them.
                let result = self.write_op(|w| {
                    let crypto = w.crypto.as_mut().ok_or(EngineError::NotInitialized)?;
                    let data = crypto.encrypt(&device_id, &content)?;
                    let ciphertext = serde_json::to_string(&data)?;
                    w.db
                        .set_ciphertext_for_outbound_message(&message_id, &device_id, &ciphertext)?;
                    crypto.persist(&w.db)?;
                    Ok(data)
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::Decrypt {
                payload,
                device_id,
                respond,
            } => {
                let result = self.write_op(|w| {
                    let crypto = w.crypto.as_mut().ok_or(EngineError::NotInitialized)?;
                    let plaintext = crypto.decrypt(&device_id, &payload)?;
                    crypto.persist(&w.db)?;
                    Ok(plaintext)
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::DecryptAndPersist {
                payload,
                device_id,
                user_id,
                message_id,
                respond,
            } => {
                let result = self.write_op(|w| {
                    let crypto = w.crypto.as_mut().ok_or(EngineError::NotInitialized)?;
                    let plaintext = crypto.decrypt(&device_id, &payload)?;
                    w.db.add_inbound_message(
                        &message_id,
                        &device_id,
                        &user_id,
                        &plaintext,
                        INBOUND_STATUS_DECRYPTED,
                    )?;
                    crypto.persist(&w.db)?;
                    Ok(plaintext)
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::CreateOutboundSession {
                peer,
                bundle,
                respond,
            } => {
                let result = self.write_op(|w| {
                    let crypto = w.crypto.as_mut().ok_or(EngineError::NotInitialized)?;
                    let (encrypted_data, session_version) =
                        crypto.create_outbound_session(&peer, &bundle)?;
                    crypto.persist(&w.db)?;
                    Ok(OutboundSessionCreation {
                        encrypted_data,
                        session_version,
                    })
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::NegotiateOutboundSession {
                device_id,
                auth,
                respond,
            } => {
                // Fetch the peer's bundle from the directory, then run
                // the regular outbound creation against it.
                let fetched = self
                    .identity
                    .fetch_device_keys(&auth, &device_id)
                    .await
                    .map_err(EngineError::from);

                let result = match fetched {
                    Ok(keys) => self.write_op(|w| {
                        let crypto = w.crypto.as_mut().ok_or(EngineError::NotInitialized)?;
                        let (encrypted_data, session_version) = crypto.create_outbound_session(
                            &keys.primary_identity_public_keys,
                            &keys.content_prekey_bundle,
                        )?;
                        crypto.persist(&w.db)?;
                        Ok(OutboundSessionCreation {
                            encrypted_data,
                            session_version,
                        })
                    }),
                    Err(e) => Err(e),
                };
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::CreateInboundSession {
                peer,
                initial,
                session_version,
                overwrite,
                respond,
            } => {
                let result = self.write_op(|w| {
                    let crypto = w.crypto.as_mut().ok_or(EngineError::NotInitialized)?;
                    let plaintext =
                        crypto.create_inbound_session(&peer, &initial, session_version, overwrite)?;
                    crypto.persist(&w.db)?;
                    Ok(plaintext)
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::IsContentSessionInitialized { device_id, respond } => {
                let result = self.crypto().map(|crypto| crypto.has_session(&device_id));
                let _ = respond.send(result);
            }
            Request::CreateNotificationsSession {
                peer,
                peer_keys,
                bundle,
                respond,
            } => {
                let result = self.write_op(|w| {
                    let crypto = w.crypto.as_ref().ok_or(EngineError::NotInitialized)?;
                    let data = crypto
                        .create_notifications_outbound_session(&w.db, &peer, &peer_keys, &bundle)?;
                    Ok(data)
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::DecryptNotification {
                peer,
                payload,
                respond,
            } => {
                // Runs against the sealed blob store alone; usable from a
                // delivery context that never initialized the accounts.
                let result = self.write_op(|w| {
                    notif::decrypt_notification(&w.db, &peer, &payload).map_err(EngineError::from)
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::IsNotificationsSessionInitialized { peer, respond } => {
                let result = notif::is_notifications_session_initialized(&self.db, &peer)
                    .map_err(EngineError::from);
                let _ = respond.send(result);
            }
            Request::ReassignNotificationsSession {
                keyserver_id,
                prev_cookie,
                new_cookie,
                respond,
            } => {
                let result = self.write_op(|w| {
                    notif::reassign_notifications_session(
                        &w.db,
                        &keyserver_id,
                        prev_cookie.clone(),
                        new_cookie.clone(),
                    )
                    .map_err(EngineError::from)
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::GetOneTimeKeys { count, respond } => {
                let result = self.write_op(|w| {
                    let crypto = w.crypto.as_mut().ok_or(EngineError::NotInitialized)?;
                    let upload = crypto.one_time_keys(count);
                    crypto.persist(&w.db)?;
                    Ok(upload)
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::UploadOneTimeKeys {
                auth,
                count,
                respond,
            } => {
                let prepared = self.write_op(|w| {
                    let crypto = w.crypto.as_mut().ok_or(EngineError::NotInitialized)?;
                    let upload = crypto.one_time_keys(count);
                    crypto.persist(&w.db)?;
                    Ok(upload)
                });
                let result = match prepared {
                    Ok(upload) => {
                        // The generated keys are already committed; keep
                        // the snapshot loop armed even if the upload
                        // fails below.
                        self.dirty = true;
                        self.identity
                            .publish_one_time_keys(&auth, upload)
                            .await
                            .map_err(EngineError::from)
                    }
                    Err(e) => Err(e),
                };
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::ValidateAndUploadPrekeys { auth, respond } => {
                let result = self.validate_and_upload_prekeys(&auth).await;
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::MarkPrekeysAsPublished { respond } => {
                let result = self.write_op(|w| {
                    let crypto = w.crypto.as_mut().ok_or(EngineError::NotInitialized)?;
                    crypto
                        .accounts_mut()
                        .mark_prekeys_published(Utc::now().timestamp_millis());
                    crypto.persist(&w.db)?;
                    Ok(())
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::EnqueueOutboundMessage {
                plaintext,
                device_id,
                user_id,
                supports_auto_retry,
                respond,
            } => {
                let result = self.write_op(|w| {
                    let message = OutboundMessage {
                        message_id: Uuid::new_v4().to_string(),
                        device_id,
                        user_id,
                        timestamp: Utc::now().timestamp_millis(),
                        plaintext,
                        ciphertext: String::new(),
                        status: DeliveryStatus::Persisted,
                        supports_auto_retry,
                    };
                    w.db.add_outbound_message(&message)?;
                    Ok(message.message_id)
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::GetUnsentOutboundMessages { respond } => {
                let result = self
                    .db
                    .get_unsent_outbound_messages()
                    .map_err(EngineError::from);
                let _ = respond.send(result);
            }
            Request::GetOutboundMessagesById { ids, respond } => {
                let result = self
                    .db
                    .get_outbound_messages_by_id(&ids)
                    .map_err(EngineError::from);
                let _ = respond.send(result);
            }
            Request::MarkMessageSent {
                message_id,
                device_id,
                respond,
            } => {
                let result = self.write_op(|w| {
                    w.db.mark_outbound_message_as_sent(&message_id, &device_id)?;
                    Ok(())
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::RemoveOutboundMessage {
                message_id,
                device_id,
                respond,
            } => {
                let result = self.write_op(|w| {
                    w.db.remove_outbound_message(&message_id, &device_id)?;
                    Ok(())
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::ResetOutboundMessagesForDevice {
                device_id,
                new_device_id,
                respond,
            } => {
                let result = self.write_op(|w| {
                    let ids = w
                        .db
                        .reset_outbound_messages_for_device(&device_id, new_device_id.as_deref())?;
                    Ok(ids)
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::RecordInboundMessage {
                message_id,
                sender_device_id,
                sender_user_id,
                plaintext,
                respond,
            } => {
                let result = self.write_op(|w| {
                    let inserted = w.db.add_inbound_message(
                        &message_id,
                        &sender_device_id,
                        &sender_user_id,
                        &plaintext,
                        INBOUND_STATUS_DECRYPTED,
                    )?;
                    Ok(inserted)
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::GetInboundMessages { respond } => {
                let result = self.db.get_all_inbound_messages().map_err(EngineError::from);
                let _ = respond.send(result);
            }
            Request::RemoveInboundMessages { ids, respond } => {
                let result = self.write_op(|w| {
                    w.db.remove_inbound_messages(&ids)?;
                    Ok(())
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::RemoveInboundMessagesBefore { id, respond } => {
                let result = self.write_op(|w| {
                    w.db.remove_inbound_messages_before(id)?;
                    Ok(())
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::GetStorageItem { key, respond } => {
                let result = self.db.kv_get(&key).map_err(EngineError::from);
                let _ = respond.send(result);
            }
            Request::SetStorageItem {
                key,
                item,
                expected,
                respond,
            } => {
                let result = self.write_op(|w| {
                    let token = w.db.kv_put(&key, &item, expected.as_deref())?;
                    Ok(token)
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::ForceSetStorageItem { key, item, respond } => {
                let result = self.write_op(|w| {
                    let token = w.db.kv_force_put(&key, &item)?;
                    Ok(token)
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::RemoveStorageItem { key, respond } => {
                let result = self.write_op(|w| {
                    w.db.kv_remove(&key)?;
                    Ok(())
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::StampUserId { user_id, respond } => {
                let result = self.write_op(|w| {
                    w.db.set_metadata("stamped_user_id", &user_id)?;
                    Ok(())
                });
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::GetStampedUserId { respond } => {
                let result = self
                    .db
                    .get_metadata("stamped_user_id")
                    .map_err(EngineError::from);
                let _ = respond.send(result);
            }
            Request::RestoreBackup {
                backup_id,
                auth,
                backup_data_key,
                backup_log_data_key,
                respond,
            } => {
                let result = restore::run_restore(
                    &mut self.db,
                    &self.backup,
                    &auth,
                    &backup_id,
                    &backup_data_key,
                    &backup_log_data_key,
                    &self.config.preserved_storage_keys,
                )
                .await;

                let result = match result {
                    Ok(()) => {
                        // The restored tables are the new source of truth.
                        CryptoStore::initialize(&self.db)
                            .map(|store| {
                                self.crypto = Some(store);
                            })
                            .map_err(EngineError::from)
                    }
                    Err(e) => Err(e),
                };
                let result = self.finish_write(result).await;
                let _ = respond.send(result);
            }
            Request::RecentActivity { respond } => {
                let _ = respond.send(Ok(self.audit.entries()));
            }
            Request::ClearSensitiveData { respond } => {
                let result = self.clear_sensitive_data().await;
                let _ = respond.send(result);
            }
            Request::Shutdown { respond } => {
                let _ = respond.send(Ok(()));
                return true;
            }
        }

        false
    }

    fn crypto(&self) -> Result<&CryptoStore, EngineError> {
        self.crypto.as_ref().ok_or(EngineError::NotInitialized)
    }

    /// Run a mutating closure inside one storage transaction, rolling
    /// back and re-raising on any error.
    fn write_op<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.db.begin_transaction()?;
        match f(self) {
            Ok(value) => {
                self.db.commit_transaction()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.db.rollback_transaction() {
                    tracing::error!(error = %rollback_err, "transaction rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Mark the store dirty after a successful mutation and run the
    /// snapshot persistence loop. Flush failures are surfaced to the
    /// request that triggered them, never lost.
    async fn finish_write<T>(
        &mut self,
        result: Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        match result {
            Ok(value) => {
                self.dirty = true;
                self.flush_snapshot().await?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    /// Export/seal/store while dirty. The flag clears *before* the
    /// export, so a mutation landing mid-export re-triggers the loop
    /// instead of being dropped. Only the worker runs this, so it can
    /// never race itself.
    async fn flush_snapshot(&mut self) -> Result<(), EngineError> {
        let (path, key) = match (&self.config.snapshot_path, &self.config.snapshot_key) {
            (Some(path), Some(key)) => (path.clone(), key.clone()),
            _ => {
                self.dirty = false;
                return Ok(());
            }
        };

        while self.dirty {
            self.dirty = false;
            let bytes = self.db.export_snapshot_bytes()?;
            let sealed = key.seal(&bytes)?;
            let blob = serde_json::to_vec(&sealed)?;
            tokio::fs::write(&path, blob).await?;
            tracing::debug!(path = %path.display(), "sealed snapshot persisted");
        }
        Ok(())
    }

    async fn validate_and_upload_prekeys(
        &mut self,
        auth: &AuthMetadata,
    ) -> Result<(), EngineError> {
        let now = Utc::now().timestamp_millis();

        let upload = self.write_op(|w| {
            let crypto = w.crypto.as_mut().ok_or(EngineError::NotInitialized)?;
            let accounts = crypto.accounts_mut();
            accounts.rotate_prekeys_if_needed(now);
            accounts.forget_old_prekeys_if_due(now);
            let upload = accounts
                .has_unpublished_prekey()
                .then(|| accounts.prekey_upload());
            crypto.persist(&w.db)?;
            Ok(upload)
        })?;
        self.dirty = true;

        let Some(upload) = upload else {
            // Nothing pending upload; the published prekey is current.
            return Ok(());
        };

        self.identity.publish_prekeys(auth, upload).await?;

        // Publication is recorded only after the directory accepted it.
        self.write_op(|w| {
            let crypto = w.crypto.as_mut().ok_or(EngineError::NotInitialized)?;
            crypto
                .accounts_mut()
                .mark_prekeys_published(Utc::now().timestamp_millis());
            crypto.persist(&w.db)?;
            Ok(())
        })
    }

    async fn clear_sensitive_data(&mut self) -> Result<(), EngineError> {
        tracing::info!("clearing sensitive data");
        self.crypto = None;
        self.db.clear_sensitive_data()?;

        if let Some(path) = &self.config.snapshot_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.dirty = false;
        Ok(())
    }
}

/// Cloneable handle submitting requests to the engine worker.
///
/// Requests are enqueued in call order and processed one at a time. A
/// request, once enqueued, runs to completion or failure; there is no
/// cancellation below this boundary.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Request>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> Request,
    ) -> Result<T, EngineError> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(build(respond))
            .await
            .map_err(|_| EngineError::WorkerGone)?;
        rx.await.map_err(|_| EngineError::WorkerGone)?
    }

    /// Load or create both accounts and all persisted sessions.
    pub async fn initialize_crypto_account(&self) -> Result<(), EngineError> {
        self.call(|respond| Request::InitializeCryptoAccount { respond })
            .await
    }

    /// Identity keys of both accounts plus the signed ownership blob.
    pub async fn get_public_keys(&self) -> Result<ClientPublicKeys, EngineError> {
        self.call(|respond| Request::GetPublicKeys { respond }).await
    }

    pub async fn sign_message(&self, message: impl Into<String>) -> Result<String, EngineError> {
        self.call(|respond| Request::SignMessage {
            message: message.into(),
            respond,
        })
        .await
    }

    pub async fn verify_message(
        &self,
        message: impl Into<String>,
        signature: impl Into<String>,
        public_key: impl Into<String>,
    ) -> Result<bool, EngineError> {
        self.call(|respond| Request::VerifyMessage {
            message: message.into(),
            signature: signature.into(),
            public_key: public_key.into(),
            respond,
        })
        .await
    }

    pub async fn encrypt(
        &self,
        content: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Result<EncryptedData, EngineError> {
        self.call(|respond| Request::Encrypt {
            content: content.into(),
            device_id: device_id.into(),
            respond,
        })
        .await
    }

    /// Encrypt and store the ciphertext on the queued outbound message in
    /// one transaction.
    pub async fn encrypt_and_persist(
        &self,
        content: impl Into<String>,
        device_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Result<EncryptedData, EngineError> {
        self.call(|respond| Request::EncryptAndPersist {
            content: content.into(),
            device_id: device_id.into(),
            message_id: message_id.into(),
            respond,
        })
        .await
    }

    pub async fn decrypt(
        &self,
        payload: EncryptedData,
        device_id: impl Into<String>,
    ) -> Result<String, EngineError> {
        self.call(|respond| Request::Decrypt {
            payload,
            device_id: device_id.into(),
            respond,
        })
        .await
    }

    /// Decrypt and record the inbound message in one transaction.
    pub async fn decrypt_and_persist(
        &self,
        payload: EncryptedData,
        device_id: impl Into<String>,
        user_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Result<String, EngineError> {
        self.call(|respond| Request::DecryptAndPersist {
            payload,
            device_id: device_id.into(),
            user_id: user_id.into(),
            message_id: message_id.into(),
            respond,
        })
        .await
    }

    pub async fn create_outbound_session(
        &self,
        peer: IdentityKeys,
        bundle: PrekeyBundle,
    ) -> Result<OutboundSessionCreation, EngineError> {
        self.call(|respond| Request::CreateOutboundSession {
            peer,
            bundle,
            respond,
        })
        .await
    }

    /// Fetch the peer's bundle from the identity directory and create an
    /// outbound session against it in one step.
    pub async fn negotiate_outbound_session(
        &self,
        device_id: impl Into<String>,
        auth: AuthMetadata,
    ) -> Result<OutboundSessionCreation, EngineError> {
        self.call(|respond| Request::NegotiateOutboundSession {
            device_id: device_id.into(),
            auth,
            respond,
        })
        .await
    }

    pub async fn create_inbound_session(
        &self,
        peer: IdentityKeys,
        initial: EncryptedData,
        session_version: i64,
        overwrite: bool,
    ) -> Result<String, EngineError> {
        self.call(|respond| Request::CreateInboundSession {
            peer,
            initial,
            session_version,
            overwrite,
            respond,
        })
        .await
    }

    pub async fn is_content_session_initialized(
        &self,
        device_id: impl Into<String>,
    ) -> Result<bool, EngineError> {
        self.call(|respond| Request::IsContentSessionInitialized {
            device_id: device_id.into(),
            respond,
        })
        .await
    }

    pub async fn create_notifications_session(
        &self,
        peer: NotifPeer,
        peer_keys: IdentityKeys,
        bundle: PrekeyBundle,
    ) -> Result<EncryptedData, EngineError> {
        self.call(|respond| Request::CreateNotificationsSession {
            peer,
            peer_keys,
            bundle,
            respond,
        })
        .await
    }

    pub async fn decrypt_notification(
        &self,
        peer: NotifPeer,
        payload: EncryptedData,
    ) -> Result<String, EngineError> {
        self.call(|respond| Request::DecryptNotification {
            peer,
            payload,
            respond,
        })
        .await
    }

    pub async fn is_notifications_session_initialized(
        &self,
        peer: NotifPeer,
    ) -> Result<bool, EngineError> {
        self.call(|respond| Request::IsNotificationsSessionInitialized { peer, respond })
            .await
    }

    pub async fn reassign_notifications_session(
        &self,
        keyserver_id: impl Into<String>,
        prev_cookie: Option<String>,
        new_cookie: Option<String>,
    ) -> Result<(), EngineError> {
        self.call(|respond| Request::ReassignNotificationsSession {
            keyserver_id: keyserver_id.into(),
            prev_cookie,
            new_cookie,
            respond,
        })
        .await
    }

    pub async fn get_one_time_keys(&self, count: usize) -> Result<OneTimeKeyUpload, EngineError> {
        self.call(|respond| Request::GetOneTimeKeys { count, respond })
            .await
    }

    pub async fn upload_one_time_keys(
        &self,
        auth: AuthMetadata,
        count: usize,
    ) -> Result<(), EngineError> {
        self.call(|respond| Request::UploadOneTimeKeys {
            auth,
            count,
            respond,
        })
        .await
    }

    /// Rotate prekeys when due and push any unpublished ones to the
    /// identity directory.
    pub async fn validate_and_upload_prekeys(
        &self,
        auth: AuthMetadata,
    ) -> Result<(), EngineError> {
        self.call(|respond| Request::ValidateAndUploadPrekeys { auth, respond })
            .await
    }

    pub async fn mark_prekeys_as_published(&self) -> Result<(), EngineError> {
        self.call(|respond| Request::MarkPrekeysAsPublished { respond })
            .await
    }

    /// Queue an outbound message in `persisted` state; returns its ID.
    pub async fn enqueue_outbound_message(
        &self,
        plaintext: impl Into<String>,
        device_id: impl Into<String>,
        user_id: impl Into<String>,
        supports_auto_retry: bool,
    ) -> Result<String, EngineError> {
        self.call(|respond| Request::EnqueueOutboundMessage {
            plaintext: plaintext.into(),
            device_id: device_id.into(),
            user_id: user_id.into(),
            supports_auto_retry,
            respond,
        })
        .await
    }

    pub async fn get_unsent_outbound_messages(&self) -> Result<Vec<OutboundMessage>, EngineError> {
        self.call(|respond| Request::GetUnsentOutboundMessages { respond })
            .await
    }

    pub async fn get_outbound_messages_by_id(
        &self,
        ids: Vec<String>,
    ) -> Result<Vec<OutboundMessage>, EngineError> {
        self.call(|respond| Request::GetOutboundMessagesById { ids, respond })
            .await
    }

    pub async fn mark_message_sent(
        &self,
        message_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.call(|respond| Request::MarkMessageSent {
            message_id: message_id.into(),
            device_id: device_id.into(),
            respond,
        })
        .await
    }

    pub async fn remove_outbound_message(
        &self,
        message_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.call(|respond| Request::RemoveOutboundMessage {
            message_id: message_id.into(),
            device_id: device_id.into(),
            respond,
        })
        .await
    }

    /// Return a re-keyed device's messages to `persisted` for
    /// re-encryption; returns the affected message IDs.
    pub async fn reset_outbound_messages_for_device(
        &self,
        device_id: impl Into<String>,
        new_device_id: Option<String>,
    ) -> Result<Vec<String>, EngineError> {
        self.call(|respond| Request::ResetOutboundMessagesForDevice {
            device_id: device_id.into(),
            new_device_id,
            respond,
        })
        .await
    }

    /// Record an inbound message; duplicates are no-ops. Returns whether
    /// a new row was inserted.
    pub async fn record_inbound_message(
        &self,
        message_id: impl Into<String>,
        sender_device_id: impl Into<String>,
        sender_user_id: impl Into<String>,
        plaintext: impl Into<String>,
    ) -> Result<bool, EngineError> {
        self.call(|respond| Request::RecordInboundMessage {
            message_id: message_id.into(),
            sender_device_id: sender_device_id.into(),
            sender_user_id: sender_user_id.into(),
            plaintext: plaintext.into(),
            respond,
        })
        .await
    }

    pub async fn get_inbound_messages(&self) -> Result<Vec<InboundMessage>, EngineError> {
        self.call(|respond| Request::GetInboundMessages { respond })
            .await
    }

    pub async fn remove_inbound_messages(&self, ids: Vec<String>) -> Result<(), EngineError> {
        self.call(|respond| Request::RemoveInboundMessages { ids, respond })
            .await
    }

    pub async fn remove_inbound_messages_before(&self, id: i64) -> Result<(), EngineError> {
        self.call(|respond| Request::RemoveInboundMessagesBefore { id, respond })
            .await
    }

    pub async fn get_storage_item(
        &self,
        key: impl Into<String>,
    ) -> Result<Option<(Vec<u8>, String)>, EngineError> {
        self.call(|respond| Request::GetStorageItem {
            key: key.into(),
            respond,
        })
        .await
    }

    /// Token-checked blob write; fails with a conflict when another
    /// writer advanced the row since `expected` was read.
    pub async fn set_storage_item(
        &self,
        key: impl Into<String>,
        item: Vec<u8>,
        expected: Option<String>,
    ) -> Result<String, EngineError> {
        self.call(|respond| Request::SetStorageItem {
            key: key.into(),
            item,
            expected,
            respond,
        })
        .await
    }

    /// Unconditional blob write.
    pub async fn force_set_storage_item(
        &self,
        key: impl Into<String>,
        item: Vec<u8>,
    ) -> Result<String, EngineError> {
        self.call(|respond| Request::ForceSetStorageItem {
            key: key.into(),
            item,
            respond,
        })
        .await
    }

    pub async fn remove_storage_item(&self, key: impl Into<String>) -> Result<(), EngineError> {
        self.call(|respond| Request::RemoveStorageItem {
            key: key.into(),
            respond,
        })
        .await
    }

    pub async fn stamp_user_id(&self, user_id: impl Into<String>) -> Result<(), EngineError> {
        self.call(|respond| Request::StampUserId {
            user_id: user_id.into(),
            respond,
        })
        .await
    }

    pub async fn get_stamped_user_id(&self) -> Result<Option<String>, EngineError> {
        self.call(|respond| Request::GetStampedUserId { respond })
            .await
    }

    /// Seed this device from a remote backup (snapshot + ordered log).
    pub async fn restore_backup(
        &self,
        backup_id: impl Into<String>,
        auth: AuthMetadata,
        backup_data_key: SealedKey,
        backup_log_data_key: SealedKey,
    ) -> Result<(), EngineError> {
        self.call(|respond| Request::RestoreBackup {
            backup_id: backup_id.into(),
            auth,
            backup_data_key,
            backup_log_data_key,
            respond,
        })
        .await
    }

    /// Recent request-processing history, in strict processing order.
    pub async fn recent_activity(&self) -> Result<Vec<AuditEntry>, EngineError> {
        self.call(|respond| Request::RecentActivity { respond })
            .await
    }

    /// Wipe accounts, sessions, queues, blobs, and the sealed snapshot.
    pub async fn clear_sensitive_data(&self) -> Result<(), EngineError> {
        self.call(|respond| Request::ClearSensitiveData { respond })
            .await
    }

    /// Stop the worker after the queue drains up to this request.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.call(|respond| Request::Shutdown { respond }).await
    }
}
