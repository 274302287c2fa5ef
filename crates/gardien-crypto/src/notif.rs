//! Notification sessions.
//!
//! Push payloads may be decrypted by a different execution context than
//! the one driving the main ratchet forward, so every peer's notification
//! state keeps *two* pickled sessions: `pending_session_update` absorbs
//! each ratchet step, and is promoted into `main_session` only after a
//! quiescence window. A payload that arrives slightly out of order can
//! then still fall back to `main_session`.
//!
//! All blobs are sealed with a per-entry envelope key whose JWK lives
//! under a sibling `…:encryptionKey` entry.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vodozemac::olm::SessionConfig;
use vodozemac::Curve25519PublicKey;

use gardien_shared::constants::INITIAL_ENCRYPTED_MESSAGE;
use gardien_shared::sealed::{EncryptedPayload, SealedKey};
use gardien_shared::signing::{self, decode_b64};
use gardien_shared::types::{EncryptedData, IdentityKeys, PrekeyBundle};
use gardien_store::Database;

use crate::error::SessionError;
use crate::pickle;
use crate::store::{decode_olm_message, encode_olm_message, CryptoStore};
use crate::Result;

/// How long a pending session update must sit quiescent before it is
/// promoted into the main session.
pub const SESSION_UPDATE_MAX_AGE_MS: i64 = 10_000;

/// The remote end of a notification session: a peer device, or a
/// keyserver (addressed per authentication cookie).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifPeer {
    Device {
        device_id: String,
    },
    Keyserver {
        keyserver_id: String,
        cookie: Option<String>,
    },
}

impl NotifPeer {
    pub fn device(device_id: impl Into<String>) -> Self {
        NotifPeer::Device {
            device_id: device_id.into(),
        }
    }

    pub fn keyserver(keyserver_id: impl Into<String>, cookie: Option<String>) -> Self {
        NotifPeer::Keyserver {
            keyserver_id: keyserver_id.into(),
            cookie,
        }
    }

    /// Storage key of the sealed session data.
    pub fn data_key(&self) -> String {
        match self {
            NotifPeer::Device { device_id } => format!("device:{device_id}:olmData"),
            NotifPeer::Keyserver {
                keyserver_id,
                cookie: Some(cookie),
            } => format!("keyserver:{keyserver_id}:olmData:{cookie}"),
            NotifPeer::Keyserver {
                keyserver_id,
                cookie: None,
            } => format!("keyserver:{keyserver_id}:olmData"),
        }
    }

    /// Storage key of the JWK sealing the session data.
    pub fn encryption_key_label(&self) -> String {
        format!("{}:encryptionKey", self.data_key())
    }

    /// Prefix shared by every generation of this logical peer's entries.
    fn generation_prefix(&self) -> String {
        match self {
            NotifPeer::Device { device_id } => format!("device:{device_id}:olmData"),
            NotifPeer::Keyserver { keyserver_id, .. } => {
                format!("keyserver:{keyserver_id}:olmData")
            }
        }
    }
}

/// Persisted notification session state for one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifOlmData {
    pub main_session: String,
    pub pending_session_update: String,
    pub update_creation_timestamp: i64,
    pub pickling_key: String,
}

impl CryptoStore {
    /// Create an outbound notification session to a peer and persist it.
    ///
    /// Both pickled slots start out identical; the split only appears
    /// once decrypts begin advancing the ratchet. Returns the encrypted
    /// initialization payload for delivery to the peer.
    pub fn create_notifications_outbound_session(
        &self,
        db: &Database,
        peer: &NotifPeer,
        peer_keys: &IdentityKeys,
        bundle: &PrekeyBundle,
    ) -> Result<EncryptedData> {
        let prekey_bytes = decode_b64(&bundle.prekey)?;
        signing::verify_signature(&peer_keys.ed25519, &prekey_bytes, &bundle.prekey_signature)
            .map_err(|_| SessionError::PrekeySignature)?;

        let identity_key = parse_curve25519(&peer_keys.curve25519)?;
        let handshake_key =
            parse_curve25519(bundle.one_time_key.as_deref().unwrap_or(&bundle.prekey))?;

        let mut session = self
            .accounts
            .notifications
            .account()
            .create_outbound_session(SessionConfig::version_2(), identity_key, handshake_key);

        let message = session.encrypt(INITIAL_ENCRYPTED_MESSAGE.as_bytes());

        let pickling_key = Uuid::new_v4().to_string();
        let pickled = pickle::pickle_session(&session, &pickling_key);
        let data = NotifOlmData {
            main_session: pickled.clone(),
            pending_session_update: pickled,
            update_creation_timestamp: Utc::now().timestamp_millis(),
            pickling_key,
        };

        // A re-keyed peer replaces whatever generation was there before.
        let key = load_or_create_sealing_key(db, peer)?;
        store_notif_data(db, peer, &data, &key, None)?;

        tracing::debug!(key = %peer.data_key(), "notification session created");

        Ok(encode_olm_message(&message, None))
    }
}

/// Decrypt a push payload for the given peer.
///
/// Tries `pending_session_update` first; on success the advanced state
/// becomes the new pending, and the previous pending is promoted into
/// `main_session` once it has sat past the quiescence window. If the
/// pending copy cannot decrypt, `main_session` gets a turn; success there
/// keeps main authoritative and rewrites pending from it.
pub fn decrypt_notification(
    db: &Database,
    peer: &NotifPeer,
    payload: &EncryptedData,
) -> Result<String> {
    let Some((mut data, key, token)) = load_notif_data(db, peer)? else {
        return Err(SessionError::SessionDoesNotExist(peer.data_key()));
    };
    prune_stale_generations(db, peer)?;

    let message = decode_olm_message(payload)?;
    let now = Utc::now().timestamp_millis();

    let pending_attempt = pickle::unpickle_session(&data.pending_session_update, &data.pickling_key)
        .and_then(|mut session| {
            session
                .decrypt(&message)
                .map(|plaintext| (session, plaintext))
                .map_err(|e| SessionError::Decryption(e.to_string()))
        });

    let plaintext = match pending_attempt {
        Ok((session, plaintext)) => {
            let advanced = pickle::pickle_session(&session, &data.pickling_key);
            if now - data.update_creation_timestamp > SESSION_UPDATE_MAX_AGE_MS {
                data.main_session = data.pending_session_update.clone();
            }
            data.pending_session_update = advanced;
            data.update_creation_timestamp = now;
            plaintext
        }
        Err(_) => {
            let mut main = pickle::unpickle_session(&data.main_session, &data.pickling_key)?;
            let plaintext = main
                .decrypt(&message)
                .map_err(|e| SessionError::Decryption(e.to_string()))?;
            data.pending_session_update = pickle::pickle_session(&main, &data.pickling_key);
            data.update_creation_timestamp = now;
            plaintext
        }
    };

    store_notif_data(db, peer, &data, &key, Some(&token))?;

    String::from_utf8(plaintext).map_err(|e| SessionError::Decryption(e.to_string()))
}

/// Whether a notification session (data and sealing key) exists for the
/// peer.
pub fn is_notifications_session_initialized(db: &Database, peer: &NotifPeer) -> Result<bool> {
    Ok(db.kv_get(&peer.data_key())?.is_some()
        && db.kv_get(&peer.encryption_key_label())?.is_some())
}

/// Move a keyserver's notification session from one cookie to another.
///
/// Entries already present at the destination are kept; the source keys
/// are removed either way.
pub fn reassign_notifications_session(
    db: &Database,
    keyserver_id: &str,
    prev_cookie: Option<String>,
    new_cookie: Option<String>,
) -> Result<()> {
    let source = NotifPeer::keyserver(keyserver_id, prev_cookie);
    let destination = NotifPeer::keyserver(keyserver_id, new_cookie);
    if source == destination {
        return Ok(());
    }

    reassign_item(db, &source.data_key(), &destination.data_key())?;
    reassign_item(
        db,
        &source.encryption_key_label(),
        &destination.encryption_key_label(),
    )?;
    Ok(())
}

/// One-time startup migration from the legacy cookie-only key scheme
/// (`olmData:<cookie>` / `olmDataEncryptionKey:<cookie>`) into the
/// keyserver namespace. Not a standing code path; new writes never use
/// the legacy keys.
pub fn migrate_legacy_data_keys(db: &Database, keyserver_id: &str) -> Result<()> {
    for legacy_key in db.kv_keys_with_prefix("olmData:")? {
        let cookie = legacy_key.trim_start_matches("olmData:");
        let peer = NotifPeer::keyserver(keyserver_id, Some(cookie.to_string()));
        reassign_item(db, &legacy_key, &peer.data_key())?;
    }
    for legacy_label in db.kv_keys_with_prefix("olmDataEncryptionKey:")? {
        let cookie = legacy_label.trim_start_matches("olmDataEncryptionKey:");
        let peer = NotifPeer::keyserver(keyserver_id, Some(cookie.to_string()));
        reassign_item(db, &legacy_label, &peer.encryption_key_label())?;
    }
    Ok(())
}

fn reassign_item(db: &Database, source: &str, destination: &str) -> Result<()> {
    let Some((value, _)) = db.kv_get(source)? else {
        return Ok(());
    };
    if db.kv_get(destination)?.is_none() {
        db.kv_force_put(destination, &value)?;
    }
    db.kv_remove(source)?;
    Ok(())
}

/// Load and unseal a peer's notification data along with its sealing key
/// and current sync token.
pub fn load_notif_data(
    db: &Database,
    peer: &NotifPeer,
) -> Result<Option<(NotifOlmData, SealedKey, String)>> {
    let Some((blob, token)) = db.kv_get(&peer.data_key())? else {
        return Ok(None);
    };
    let Some((jwk_bytes, _)) = db.kv_get(&peer.encryption_key_label())? else {
        return Ok(None);
    };

    let jwk =
        String::from_utf8(jwk_bytes).map_err(|e| SessionError::Pickle(e.to_string()))?;
    let key = SealedKey::from_jwk(&jwk)?;

    let payload: EncryptedPayload = serde_json::from_slice(&blob)?;
    let data: NotifOlmData = serde_json::from_slice(&key.open(&payload)?)?;

    Ok(Some((data, key, token)))
}

/// Seal and store a peer's notification data. `expected = None` performs
/// an unconditional write (fresh session creation); otherwise the write
/// carries the token precondition.
pub fn store_notif_data(
    db: &Database,
    peer: &NotifPeer,
    data: &NotifOlmData,
    key: &SealedKey,
    expected: Option<&str>,
) -> Result<String> {
    let plaintext = serde_json::to_vec(data)?;
    let sealed = key.seal(&plaintext)?;
    let blob = serde_json::to_vec(&sealed)?;

    let token = match expected {
        Some(token) => db.kv_put(&peer.data_key(), &blob, Some(token))?,
        None => db.kv_force_put(&peer.data_key(), &blob)?,
    };
    Ok(token)
}

fn load_or_create_sealing_key(db: &Database, peer: &NotifPeer) -> Result<SealedKey> {
    if let Some((jwk_bytes, _)) = db.kv_get(&peer.encryption_key_label())? {
        let jwk =
            String::from_utf8(jwk_bytes).map_err(|e| SessionError::Pickle(e.to_string()))?;
        return Ok(SealedKey::from_jwk(&jwk)?);
    }

    let key = SealedKey::generate();
    let jwk = key.export_jwk()?;
    db.kv_force_put(&peer.encryption_key_label(), jwk.as_bytes())?;
    Ok(key)
}

/// Keep exactly one live generation per logical peer: after a successful
/// read, every other `olmData` entry under the peer's prefix is removed.
fn prune_stale_generations(db: &Database, peer: &NotifPeer) -> Result<()> {
    let live_data = peer.data_key();
    let live_label = peer.encryption_key_label();

    for key in db.kv_keys_with_prefix(&peer.generation_prefix())? {
        if key != live_data && key != live_label {
            tracing::debug!(key = %key, "pruning stale notification data");
            db.kv_remove(&key)?;
        }
    }
    Ok(())
}

fn parse_curve25519(key: &str) -> Result<Curve25519PublicKey> {
    Curve25519PublicKey::from_base64(key).map_err(|e| SessionError::InvalidKey(e.to_string()))
}
