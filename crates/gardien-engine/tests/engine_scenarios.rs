//! End-to-end scenarios driven through the engine handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::join_all;

use gardien_crypto::NotifPeer;
use gardien_engine::restore::{seal_log_operation, LogOperation};
use gardien_engine::{
    spawn, BackupService, EngineConfig, EngineError, EngineHandle, IdentityDirectory,
    ServiceError,
};
use gardien_shared::sealed::SealedKey;
use gardien_shared::types::{
    AuthMetadata, DeviceKeys, EncryptedData, IdentityKeys, OneTimeKeyUpload, PrekeyBundle,
    PrekeyUpload,
};
use gardien_store::{Database, DeliveryStatus};

#[derive(Clone, Default)]
struct MockDirectory {
    prekeys: Arc<Mutex<Vec<PrekeyUpload>>>,
    one_time_keys: Arc<Mutex<Vec<OneTimeKeyUpload>>>,
    device_keys: Arc<Mutex<HashMap<String, DeviceKeys>>>,
}

impl IdentityDirectory for MockDirectory {
    async fn publish_prekeys(
        &self,
        _auth: &AuthMetadata,
        upload: PrekeyUpload,
    ) -> Result<(), ServiceError> {
        self.prekeys.lock().unwrap().push(upload);
        Ok(())
    }

    async fn publish_one_time_keys(
        &self,
        _auth: &AuthMetadata,
        upload: OneTimeKeyUpload,
    ) -> Result<(), ServiceError> {
        self.one_time_keys.lock().unwrap().push(upload);
        Ok(())
    }

    async fn fetch_device_keys(
        &self,
        _auth: &AuthMetadata,
        device_id: &str,
    ) -> Result<DeviceKeys, ServiceError> {
        self.device_keys
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(device_id.to_string()))
    }
}

#[derive(Clone, Default)]
struct MockBackup {
    snapshot: Arc<Mutex<Option<Vec<u8>>>>,
    logs: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BackupService for MockBackup {
    async fn download_snapshot(
        &self,
        _auth: &AuthMetadata,
        backup_id: &str,
    ) -> Result<Vec<u8>, ServiceError> {
        self.snapshot
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ServiceError::NotFound(backup_id.to_string()))
    }

    async fn download_logs(
        &self,
        _auth: &AuthMetadata,
        _backup_id: &str,
    ) -> Result<Vec<Vec<u8>>, ServiceError> {
        Ok(self.logs.lock().unwrap().clone())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn auth() -> AuthMetadata {
    AuthMetadata {
        user_id: "user-1".to_string(),
        device_id: "device-1".to_string(),
        access_token: "token".to_string(),
    }
}

struct Peer {
    handle: EngineHandle,
    directory: MockDirectory,
    identity: IdentityKeys,
    notif_identity: IdentityKeys,
}

/// Spawn an initialized engine and publish its first prekeys so other
/// peers can build bundles against it.
async fn peer() -> Peer {
    init_tracing();
    let directory = MockDirectory::default();
    let handle = spawn(
        EngineConfig::default(),
        directory.clone(),
        MockBackup::default(),
    )
    .unwrap();

    handle.initialize_crypto_account().await.unwrap();
    handle.validate_and_upload_prekeys(auth()).await.unwrap();

    let keys = handle.get_public_keys().await.unwrap();
    Peer {
        handle,
        directory,
        identity: keys.primary_identity_public_keys,
        notif_identity: keys.notification_identity_public_keys,
    }
}

/// Build a content prekey bundle for `peer`, with a fresh one-time key.
async fn content_bundle(peer: &Peer) -> PrekeyBundle {
    let prekey = peer.directory.prekeys.lock().unwrap().last().unwrap().clone();
    let mut otks = peer.handle.get_one_time_keys(1).await.unwrap();

    PrekeyBundle {
        prekey: prekey.content_prekey.prekey,
        prekey_signature: prekey.content_prekey.prekey_signature,
        one_time_key: Some(otks.content_one_time_keys.remove(0)),
    }
}

async fn notif_bundle(peer: &Peer) -> PrekeyBundle {
    let prekey = peer.directory.prekeys.lock().unwrap().last().unwrap().clone();
    let mut otks = peer.handle.get_one_time_keys(1).await.unwrap();

    PrekeyBundle {
        prekey: prekey.notif_prekey.prekey,
        prekey_signature: prekey.notif_prekey.prekey_signature,
        one_time_key: Some(otks.notification_one_time_keys.remove(0)),
    }
}

// ---------------------------------------------------------------------
// Scenario A: queue lifecycle against a freshly negotiated session
// ---------------------------------------------------------------------

#[tokio::test]
async fn scenario_a_enqueue_negotiate_encrypt_send() {
    let alice = peer().await;
    let bob = peer().await;
    let bob_device = bob.identity.ed25519.clone();

    let message_id = alice
        .handle
        .enqueue_outbound_message("salut", &bob_device, "user-bob", true)
        .await
        .unwrap();

    // No session yet: encryption must fail, the row stays persisted.
    let err = alice
        .handle
        .encrypt_and_persist("salut", &bob_device, &message_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Session(gardien_crypto::SessionError::SessionDoesNotExist(_))
    ));

    // Negotiate, then encryption succeeds and flips the status.
    let bundle = content_bundle(&bob).await;
    let creation = alice
        .handle
        .create_outbound_session(bob.identity.clone(), bundle)
        .await
        .unwrap();
    assert_eq!(creation.session_version, 1);

    alice
        .handle
        .encrypt_and_persist("salut", &bob_device, &message_id)
        .await
        .unwrap();

    let rows = alice
        .handle
        .get_outbound_messages_by_id(vec![message_id.clone()])
        .await
        .unwrap();
    assert_eq!(rows[0].status, DeliveryStatus::Encrypted);
    assert!(!rows[0].ciphertext.is_empty());

    // Bob accepts the handshake and decrypts the queued ciphertext.
    bob.handle
        .create_inbound_session(
            alice.identity.clone(),
            creation.encrypted_data,
            creation.session_version,
            false,
        )
        .await
        .unwrap();

    let payload: EncryptedData = serde_json::from_str(&rows[0].ciphertext).unwrap();
    let plaintext = bob
        .handle
        .decrypt_and_persist(payload, alice.identity.ed25519.clone(), "user-alice", &message_id)
        .await
        .unwrap();
    assert_eq!(plaintext, "salut");

    // Delivery confirmation removes the row; confirming twice is a no-op.
    alice
        .handle
        .mark_message_sent(&message_id, &bob_device)
        .await
        .unwrap();
    assert!(alice
        .handle
        .get_unsent_outbound_messages()
        .await
        .unwrap()
        .is_empty());
    alice
        .handle
        .mark_message_sent(&message_id, &bob_device)
        .await
        .unwrap();
}

#[tokio::test]
async fn directory_fetch_drives_outbound_negotiation() {
    let alice = peer().await;
    let bob = peer().await;

    // The directory serves bob's published bundle to alice.
    let bundle = DeviceKeys {
        primary_identity_public_keys: bob.identity.clone(),
        notification_identity_public_keys: bob.notif_identity.clone(),
        content_prekey_bundle: content_bundle(&bob).await,
        notif_prekey_bundle: notif_bundle(&bob).await,
    };
    alice
        .directory
        .device_keys
        .lock()
        .unwrap()
        .insert(bob.identity.ed25519.clone(), bundle);

    let creation = alice
        .handle
        .negotiate_outbound_session(bob.identity.ed25519.clone(), auth())
        .await
        .unwrap();
    assert_eq!(creation.session_version, 1);

    bob.handle
        .create_inbound_session(
            alice.identity.clone(),
            creation.encrypted_data,
            creation.session_version,
            false,
        )
        .await
        .unwrap();

    // An unknown device surfaces the directory's error untouched.
    let err = alice
        .handle
        .negotiate_outbound_session("no-such-device", auth())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Service(ServiceError::NotFound(_))
    ));
}

#[tokio::test]
async fn inbound_recording_is_idempotent() {
    let engine = peer().await;

    assert!(engine
        .handle
        .record_inbound_message("m-1", "d-1", "u-1", "hello")
        .await
        .unwrap());
    assert!(!engine
        .handle
        .record_inbound_message("m-1", "d-1", "u-1", "hello again")
        .await
        .unwrap());

    let inbound = engine.handle.get_inbound_messages().await.unwrap();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].plaintext, "hello");
}

#[tokio::test]
async fn reset_for_device_requeues_and_rekeys() {
    let alice = peer().await;
    let bob = peer().await;
    let bob_device = bob.identity.ed25519.clone();

    let bundle = content_bundle(&bob).await;
    alice
        .handle
        .create_outbound_session(bob.identity.clone(), bundle)
        .await
        .unwrap();

    let m1 = alice
        .handle
        .enqueue_outbound_message("один", &bob_device, "user-bob", true)
        .await
        .unwrap();
    alice
        .handle
        .encrypt_and_persist("один", &bob_device, &m1)
        .await
        .unwrap();

    let reset = alice
        .handle
        .reset_outbound_messages_for_device(&bob_device, Some("bob-next".to_string()))
        .await
        .unwrap();
    assert_eq!(reset, vec![m1.clone()]);

    let rows = alice
        .handle
        .get_outbound_messages_by_id(vec![m1])
        .await
        .unwrap();
    assert_eq!(rows[0].status, DeliveryStatus::Persisted);
    assert_eq!(rows[0].device_id, "bob-next");
    assert!(rows[0].ciphertext.is_empty());
    assert!(rows[0].supports_auto_retry);
}

// ---------------------------------------------------------------------
// Scenario B: concurrent negotiation race
// ---------------------------------------------------------------------

#[tokio::test]
async fn scenario_b_concurrent_negotiation_race() {
    let alice = peer().await;
    let bob = peer().await;

    // Both sides create outbound sessions at version 1.
    let bob_bundle = content_bundle(&bob).await;
    let alice_bundle = content_bundle(&alice).await;
    let alice_creation = alice
        .handle
        .create_outbound_session(bob.identity.clone(), bob_bundle)
        .await
        .unwrap();
    bob.handle
        .create_outbound_session(alice.identity.clone(), alice_bundle)
        .await
        .unwrap();

    // Bob sees Alice's handshake at his own version: race detected.
    let err = bob
        .handle
        .create_inbound_session(
            alice.identity.clone(),
            alice_creation.encrypted_data.clone(),
            alice_creation.session_version,
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Session(gardien_crypto::SessionError::SessionRaceCondition)
    ));

    // A superseding attempt at version 2 wins outright.
    let bob_bundle = content_bundle(&bob).await;
    let second = alice
        .handle
        .create_outbound_session(bob.identity.clone(), bob_bundle)
        .await
        .unwrap();
    assert_eq!(second.session_version, 2);

    bob.handle
        .create_inbound_session(
            alice.identity.clone(),
            second.encrypted_data,
            second.session_version,
            false,
        )
        .await
        .unwrap();

    // Traffic flows over the surviving session.
    let encrypted = alice
        .handle
        .encrypt("après la course", bob.identity.ed25519.clone())
        .await
        .unwrap();
    let plaintext = bob
        .handle
        .decrypt(encrypted, alice.identity.ed25519.clone())
        .await
        .unwrap();
    assert_eq!(plaintext, "après la course");
}

// ---------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------

#[tokio::test]
async fn notification_session_setup_and_reassignment() {
    let alice = peer().await;
    let keyserver = peer().await;

    let peer_id = NotifPeer::keyserver("ks-1", Some("cookie-a".to_string()));
    let bundle = notif_bundle(&keyserver).await;

    let init = alice
        .handle
        .create_notifications_session(
            peer_id.clone(),
            keyserver.notif_identity.clone(),
            bundle,
        )
        .await
        .unwrap();
    assert_eq!(init.message_type, 0);
    assert!(alice
        .handle
        .is_notifications_session_initialized(peer_id.clone())
        .await
        .unwrap());

    alice
        .handle
        .reassign_notifications_session(
            "ks-1",
            Some("cookie-a".to_string()),
            Some("cookie-b".to_string()),
        )
        .await
        .unwrap();

    assert!(!alice
        .handle
        .is_notifications_session_initialized(peer_id)
        .await
        .unwrap());
    assert!(alice
        .handle
        .is_notifications_session_initialized(NotifPeer::keyserver(
            "ks-1",
            Some("cookie-b".to_string())
        ))
        .await
        .unwrap());
}

// ---------------------------------------------------------------------
// Storage items with optimistic concurrency
// ---------------------------------------------------------------------

#[tokio::test]
async fn storage_item_conflicts_are_typed() {
    let engine = peer().await;

    let token = engine
        .handle
        .set_storage_item("persist:root", b"v1".to_vec(), None)
        .await
        .unwrap();

    // Another writer advances the row; the stale token now fails.
    engine
        .handle
        .set_storage_item("persist:root", b"v2".to_vec(), Some(token.clone()))
        .await
        .unwrap();
    let err = engine
        .handle
        .set_storage_item("persist:root", b"v3".to_vec(), Some(token))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Store(gardien_store::StoreError::Conflict(_))
    ));

    // The force escape hatch still lands.
    engine
        .handle
        .force_set_storage_item("persist:root", b"forced".to_vec())
        .await
        .unwrap();
    let (value, _) = engine
        .handle
        .get_storage_item("persist:root")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, b"forced");
}

// ---------------------------------------------------------------------
// Scenario C + restore
// ---------------------------------------------------------------------

fn seal_snapshot(db: &Database, key: &SealedKey) -> Vec<u8> {
    let bytes = db.export_snapshot_bytes().unwrap();
    let payload = key.seal(&bytes).unwrap();
    serde_json::to_vec(&payload).unwrap()
}

#[tokio::test]
async fn scenario_c_incompatible_backup_version_leaves_no_trace() {
    let backup = MockBackup::default();
    let handle = spawn(
        EngineConfig::default(),
        MockDirectory::default(),
        backup.clone(),
    )
    .unwrap();
    handle.initialize_crypto_account().await.unwrap();
    handle.stamp_user_id("local-user").await.unwrap();

    // A backup written by a newer client than this one.
    let data_key = SealedKey::generate();
    let future_db = Database::open_in_memory().unwrap();
    future_db.set_metadata("stamped_user_id", "from-backup").unwrap();
    future_db
        .conn()
        .pragma_update(None, "user_version", 99)
        .unwrap();
    *backup.snapshot.lock().unwrap() = Some(seal_snapshot(&future_db, &data_key));

    let err = handle
        .restore_backup("backup-1", auth(), data_key, SealedKey::generate())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::IncompatibleBackupVersion {
            stored: 99,
            supported: 1
        }
    ));

    // No mutation observable afterwards.
    assert_eq!(
        handle.get_stamped_user_id().await.unwrap().as_deref(),
        Some("local-user")
    );
}

#[tokio::test]
async fn restore_applies_snapshot_logs_and_preserved_blobs() {
    let backup = MockBackup::default();
    let config = EngineConfig {
        preserved_storage_keys: vec!["persist:ui".to_string()],
        ..EngineConfig::default()
    };
    let handle = spawn(config, MockDirectory::default(), backup.clone()).unwrap();
    handle.initialize_crypto_account().await.unwrap();
    handle
        .force_set_storage_item("persist:ui", b"keep me".to_vec())
        .await
        .unwrap();

    let data_key = SealedKey::generate();
    let log_key = SealedKey::generate();

    let source = Database::open_in_memory().unwrap();
    source.set_metadata("stamped_user_id", "restored-user").unwrap();
    source.kv_force_put("remote:blob", b"from snapshot").unwrap();
    *backup.snapshot.lock().unwrap() = Some(seal_snapshot(&source, &data_key));

    *backup.logs.lock().unwrap() = vec![
        seal_log_operation(
            &LogOperation::SetMetadata {
                name: "log_marker".to_string(),
                data: "applied".to_string(),
            },
            &log_key,
        )
        .unwrap(),
        seal_log_operation(
            &LogOperation::AddInboundMessage {
                message_id: "from-log".to_string(),
                sender_device_id: "d".to_string(),
                sender_user_id: "u".to_string(),
                plaintext: "replayed".to_string(),
            },
            &log_key,
        )
        .unwrap(),
    ];

    handle
        .restore_backup("backup-1", auth(), data_key, log_key)
        .await
        .unwrap();

    assert_eq!(
        handle.get_stamped_user_id().await.unwrap().as_deref(),
        Some("restored-user")
    );
    let (ui, _) = handle.get_storage_item("persist:ui").await.unwrap().unwrap();
    assert_eq!(ui, b"keep me");
    let (blob, _) = handle.get_storage_item("remote:blob").await.unwrap().unwrap();
    assert_eq!(blob, b"from snapshot");

    let inbound = handle.get_inbound_messages().await.unwrap();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].plaintext, "replayed");

    // The crypto store reloaded from restored tables still works.
    handle.get_public_keys().await.unwrap();
}

#[tokio::test]
async fn corrupt_log_entry_aborts_restore_with_the_underlying_error() {
    let backup = MockBackup::default();
    let handle = spawn(
        EngineConfig::default(),
        MockDirectory::default(),
        backup.clone(),
    )
    .unwrap();
    handle.initialize_crypto_account().await.unwrap();

    let data_key = SealedKey::generate();
    let source = Database::open_in_memory().unwrap();
    *backup.snapshot.lock().unwrap() = Some(seal_snapshot(&source, &data_key));
    *backup.logs.lock().unwrap() = vec![b"not an encrypted payload".to_vec()];

    let err = handle
        .restore_backup("backup-1", auth(), data_key, SealedKey::generate())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BackupLog(_)));
}

// ---------------------------------------------------------------------
// Scenario D: strict submission-order processing
// ---------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_d_requests_process_in_strict_submission_order() {
    let config = EngineConfig {
        request_buffer: 1024,
        ..EngineConfig::default()
    };
    let handle = spawn(config, MockDirectory::default(), MockBackup::default()).unwrap();
    handle.initialize_crypto_account().await.unwrap();

    let baseline = handle.recent_activity().await.unwrap().len();

    // 500 mutating requests issued without waiting for responses; the
    // channel fixes their submission order.
    let writes: Vec<_> = (0..500)
        .map(|i| handle.force_set_storage_item("counter", format!("{i}").into_bytes()))
        .collect();
    for result in join_all(writes).await {
        result.unwrap();
    }

    // Last submitted write is the surviving value.
    let (value, _) = handle.get_storage_item("counter").await.unwrap().unwrap();
    assert_eq!(value, b"499");

    let entries = handle.recent_activity().await.unwrap();
    let writes: Vec<_> = entries
        .iter()
        .skip(baseline)
        .filter(|e| e.kind == "force_set_storage_item")
        .collect();
    assert_eq!(writes.len(), 500);
    for pair in writes.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
    }
    // Sequence numbers are consecutive: nothing interleaved between them.
    assert_eq!(writes[499].seq - writes[0].seq, 499);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_writer() {
    let handle = spawn(
        EngineConfig::default(),
        MockDirectory::default(),
        MockBackup::default(),
    )
    .unwrap();
    handle.initialize_crypto_account().await.unwrap();

    let mut tasks = Vec::new();
    for task_id in 0..8 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                handle
                    .force_set_storage_item(
                        format!("task:{task_id}:{i}"),
                        b"payload".to_vec(),
                    )
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for task_id in 0..8 {
        for i in 0..25 {
            assert!(handle
                .get_storage_item(format!("task:{task_id}:{i}"))
                .await
                .unwrap()
                .is_some());
        }
    }
}

// ---------------------------------------------------------------------
// Snapshot persistence across restarts
// ---------------------------------------------------------------------

#[tokio::test]
async fn sealed_snapshot_seeds_a_replacement_database() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("gardien.db");
    let snapshot_path = dir.path().join("snapshot.sealed");
    let key = SealedKey::generate();

    let config = EngineConfig {
        db_path: Some(db_path.clone()),
        snapshot_path: Some(snapshot_path.clone()),
        snapshot_key: Some(key.clone()),
        ..EngineConfig::default()
    };

    let handle = spawn(config.clone(), MockDirectory::default(), MockBackup::default()).unwrap();
    handle.initialize_crypto_account().await.unwrap();
    handle.stamp_user_id("durable-user").await.unwrap();
    let keys_before = handle.get_public_keys().await.unwrap();
    handle.shutdown().await.unwrap();

    // Give the worker task a moment to drop the database handle.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(snapshot_path.exists());

    // The database file is lost; only the sealed snapshot survives.
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(dir.path().join(format!("gardien.db{suffix}")));
    }

    let handle = spawn(config, MockDirectory::default(), MockBackup::default()).unwrap();
    handle.initialize_crypto_account().await.unwrap();

    assert_eq!(
        handle.get_stamped_user_id().await.unwrap().as_deref(),
        Some("durable-user")
    );
    // Same accounts, not fresh ones: identity keys survived the seed.
    let keys_after = handle.get_public_keys().await.unwrap();
    assert_eq!(
        keys_before.primary_identity_public_keys,
        keys_after.primary_identity_public_keys
    );
}

#[tokio::test]
async fn clear_sensitive_data_wipes_state_and_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        db_path: Some(dir.path().join("gardien.db")),
        snapshot_path: Some(dir.path().join("snapshot.sealed")),
        snapshot_key: Some(SealedKey::generate()),
        ..EngineConfig::default()
    };

    let handle = spawn(config.clone(), MockDirectory::default(), MockBackup::default()).unwrap();
    handle.initialize_crypto_account().await.unwrap();
    handle.stamp_user_id("doomed").await.unwrap();
    assert!(config.snapshot_path.as_ref().unwrap().exists());

    handle.clear_sensitive_data().await.unwrap();

    assert!(!config.snapshot_path.as_ref().unwrap().exists());
    assert!(handle.get_stamped_user_id().await.unwrap().is_none());
    // Crypto operations require re-initialization after the wipe.
    assert!(matches!(
        handle.get_public_keys().await.unwrap_err(),
        EngineError::NotInitialized
    ));
}
