//! Device accounts and prekey hygiene.
//!
//! Every device carries two Olm accounts: *content* (message encryption)
//! and *notification* (push-payload encryption). Their prekeys must stay
//! synchronized for key-upload batching, so rotation is only expressible
//! through [`AccountPair`], which mutates both accounts in one call.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use uuid::Uuid;
use vodozemac::olm::Account;

use gardien_shared::types::{
    ClientPublicKeys, IdentityKeys, IdentityKeysBlob, OneTimeKeyUpload, Prekey, PrekeyUpload,
    SignedIdentityKeys,
};
use gardien_store::PickledAccount;

use crate::pickle;
use crate::Result;

/// Rotate the published prekey once it is this old.
pub const PREKEY_ROTATION_INTERVAL_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Forget the superseded prekey this long after a rotation.
pub const OLD_PREKEY_GRACE_MS: i64 = 24 * 60 * 60 * 1000;

/// One Olm account plus the prekey bookkeeping the primitive does not
/// track: the current prekey is cached outside the pickle (the primitive
/// only exposes *unpublished* prekeys), and rotation runs off wall-clock
/// timestamps persisted with the account record.
pub struct DeviceAccount {
    account: Account,
    pickling_key: String,
    prekey: String,
    prekey_signature: String,
    pub(crate) prekey_published_at: Option<i64>,
    pub(crate) prekey_rotated_at: Option<i64>,
}

impl DeviceAccount {
    /// Create a fresh account with a generated prekey.
    pub fn create() -> Self {
        let mut account = Account::new();
        let (prekey, prekey_signature) = generate_prekey(&mut account);

        Self {
            account,
            pickling_key: Uuid::new_v4().to_string(),
            prekey,
            prekey_signature,
            prekey_published_at: None,
            prekey_rotated_at: None,
        }
    }

    /// Restore from a persisted record.
    pub fn from_record(record: &PickledAccount) -> Result<Self> {
        let mut account = pickle::unpickle_account(&record.pickled_account, &record.pickling_key)?;

        // Records written before a prekey was ever cached regenerate one.
        let (prekey, prekey_signature) = match (&record.prekey, &record.prekey_signature) {
            (Some(prekey), Some(signature)) => (prekey.clone(), signature.clone()),
            _ => generate_prekey(&mut account),
        };

        Ok(Self {
            account,
            pickling_key: record.pickling_key.clone(),
            prekey,
            prekey_signature,
            prekey_published_at: record.prekey_published_at,
            prekey_rotated_at: record.prekey_rotated_at,
        })
    }

    /// Serialize for storage.
    pub fn to_record(&self) -> PickledAccount {
        PickledAccount {
            pickling_key: self.pickling_key.clone(),
            pickled_account: pickle::pickle_account(&self.account, &self.pickling_key),
            prekey: Some(self.prekey.clone()),
            prekey_signature: Some(self.prekey_signature.clone()),
            prekey_published_at: self.prekey_published_at,
            prekey_rotated_at: self.prekey_rotated_at,
        }
    }

    pub fn identity_keys(&self) -> IdentityKeys {
        IdentityKeys {
            ed25519: self.account.ed25519_key().to_base64(),
            curve25519: self.account.curve25519_key().to_base64(),
        }
    }

    /// Sign arbitrary bytes with the account's ed25519 key.
    pub fn sign(&self, message: &[u8]) -> String {
        self.account.sign(message).to_base64()
    }

    pub fn prekey(&self) -> Prekey {
        Prekey {
            prekey: self.prekey.clone(),
            prekey_signature: self.prekey_signature.clone(),
        }
    }

    /// Whether a rotated prekey has not been uploaded yet. Rotation is
    /// skipped while this holds, otherwise the still-active previous
    /// prekey would be discarded.
    pub fn has_unpublished_prekey(&self) -> bool {
        !self.account.fallback_key().is_empty()
    }

    fn rotate_prekey(&mut self, now_ms: i64) {
        let (prekey, signature) = generate_prekey(&mut self.account);
        self.prekey = prekey;
        self.prekey_signature = signature;
        self.prekey_rotated_at = Some(now_ms);
    }

    fn forget_old_prekey(&mut self) -> bool {
        self.account.forget_fallback_key()
    }

    fn mark_prekey_published(&mut self, now_ms: i64) {
        self.account.mark_keys_as_published();
        self.prekey_published_at = Some(now_ms);
    }

    /// Generate `count` fresh one-time keys. Marking them published is a
    /// separate step so nothing is forgotten before the upload succeeds.
    fn generate_one_time_keys(&mut self, count: usize) -> Vec<String> {
        let _ = self.account.generate_one_time_keys(count);
        let mut keys: Vec<String> = self
            .account
            .one_time_keys()
            .into_values()
            .map(|key| key.to_base64())
            .collect();
        keys.sort();
        keys
    }

    pub(crate) fn account(&self) -> &Account {
        &self.account
    }

    pub(crate) fn account_mut(&mut self) -> &mut Account {
        &mut self.account
    }

    pub(crate) fn pickling_key(&self) -> &str {
        &self.pickling_key
    }
}

/// Generate a prekey and sign its raw bytes with the account identity.
fn generate_prekey(account: &mut Account) -> (String, String) {
    let _ = account.generate_fallback_key();
    let public = account
        .fallback_key()
        .into_values()
        .next()
        .map(|key| key.to_base64())
        .unwrap_or_default();

    let prekey_bytes = STANDARD_NO_PAD.decode(&public).unwrap_or_default();
    let signature = account.sign(&prekey_bytes).to_base64();
    (public, signature)
}

/// The content and notification accounts of one device, rotated in
/// lockstep.
pub struct AccountPair {
    pub content: DeviceAccount,
    pub notifications: DeviceAccount,
}

impl AccountPair {
    pub fn create() -> Self {
        Self {
            content: DeviceAccount::create(),
            notifications: DeviceAccount::create(),
        }
    }

    /// Rotate both prekeys when the published one has aged out. Both
    /// accounts always rotate together, so checking the content account
    /// suffices. Returns whether a rotation happened.
    pub fn rotate_prekeys_if_needed(&mut self, now_ms: i64) -> bool {
        if self.content.has_unpublished_prekey() {
            return false;
        }

        let due = match self.content.prekey_published_at {
            Some(published_at) => now_ms - published_at >= PREKEY_ROTATION_INTERVAL_MS,
            // Never published: the initial prekey is still pending upload.
            None => false,
        };
        if !due {
            return false;
        }

        tracing::info!("rotating prekeys for both accounts");
        self.content.rotate_prekey(now_ms);
        self.notifications.rotate_prekey(now_ms);
        true
    }

    /// Forget superseded prekeys once the grace period after rotation has
    /// passed.
    pub fn forget_old_prekeys_if_due(&mut self, now_ms: i64) {
        let due = match self.content.prekey_rotated_at {
            Some(rotated_at) => now_ms - rotated_at >= OLD_PREKEY_GRACE_MS,
            None => false,
        };
        if due && !self.content.has_unpublished_prekey() {
            self.content.forget_old_prekey();
            self.notifications.forget_old_prekey();
        }
    }

    pub fn has_unpublished_prekey(&self) -> bool {
        self.content.has_unpublished_prekey()
    }

    pub fn prekey_upload(&self) -> PrekeyUpload {
        PrekeyUpload {
            content_prekey: self.content.prekey(),
            notif_prekey: self.notifications.prekey(),
        }
    }

    /// Record a successful directory upload. Never called before the
    /// network call returns.
    pub fn mark_prekeys_published(&mut self, now_ms: i64) {
        self.content.mark_prekey_published(now_ms);
        self.notifications.mark_prekey_published(now_ms);
    }

    /// Fresh one-time keys for both accounts, marked published
    /// immediately (they are returned exactly once).
    pub fn one_time_keys(&mut self, count: usize) -> OneTimeKeyUpload {
        let content_one_time_keys = self.content.generate_one_time_keys(count);
        self.content.account_mut().mark_keys_as_published();

        let notification_one_time_keys = self.notifications.generate_one_time_keys(count);
        self.notifications.account_mut().mark_keys_as_published();

        OneTimeKeyUpload {
            content_one_time_keys,
            notification_one_time_keys,
        }
    }

    /// JSON identity-keys blob signed by the content account, proving the
    /// device owns both accounts.
    pub fn signed_identity_blob(&self) -> Result<SignedIdentityKeys> {
        let blob = IdentityKeysBlob {
            primary_identity_public_keys: self.content.identity_keys(),
            notification_identity_public_keys: self.notifications.identity_keys(),
        };
        let payload = serde_json::to_string(&blob)?;
        let signature = self.content.sign(payload.as_bytes());

        Ok(SignedIdentityKeys { payload, signature })
    }

    pub fn public_keys(&self) -> Result<ClientPublicKeys> {
        let signed = self.signed_identity_blob()?;
        Ok(ClientPublicKeys {
            primary_identity_public_keys: self.content.identity_keys(),
            notification_identity_public_keys: self.notifications.identity_keys(),
            blob_payload: signed.payload,
            signature: signed.signature,
        })
    }
}

impl std::fmt::Debug for AccountPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountPair")
            .field("content", &self.content.identity_keys().ed25519)
            .field("notifications", &self.notifications.identity_keys().ed25519)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gardien_shared::signing::{decode_b64, verify_signature};

    #[test]
    fn record_roundtrip_preserves_identity() {
        let account = DeviceAccount::create();
        let keys = account.identity_keys();

        let record = account.to_record();
        let restored = DeviceAccount::from_record(&record).unwrap();

        assert_eq!(restored.identity_keys(), keys);
        assert_eq!(restored.prekey().prekey, account.prekey().prekey);
    }

    #[test]
    fn prekey_signature_verifies_against_identity() {
        let account = DeviceAccount::create();
        let keys = account.identity_keys();
        let prekey = account.prekey();

        let prekey_bytes = decode_b64(&prekey.prekey).unwrap();
        assert!(verify_signature(&keys.ed25519, &prekey_bytes, &prekey.prekey_signature).is_ok());
    }

    #[test]
    fn rotation_waits_for_first_publication() {
        let mut pair = AccountPair::create();
        // The initial prekey is unpublished; nothing to rotate yet.
        assert!(!pair.rotate_prekeys_if_needed(i64::MAX / 2));
    }

    #[test]
    fn rotation_fires_in_lockstep_after_interval() {
        let mut pair = AccountPair::create();
        pair.mark_prekeys_published(0);

        let before_content = pair.content.prekey().prekey;
        let before_notif = pair.notifications.prekey().prekey;

        assert!(!pair.rotate_prekeys_if_needed(PREKEY_ROTATION_INTERVAL_MS - 1));
        assert!(pair.rotate_prekeys_if_needed(PREKEY_ROTATION_INTERVAL_MS));

        assert_ne!(pair.content.prekey().prekey, before_content);
        assert_ne!(pair.notifications.prekey().prekey, before_notif);
        assert!(pair.has_unpublished_prekey());
    }

    #[test]
    fn unpublished_prekey_blocks_further_rotation() {
        let mut pair = AccountPair::create();
        pair.mark_prekeys_published(0);
        assert!(pair.rotate_prekeys_if_needed(PREKEY_ROTATION_INTERVAL_MS));

        // Rotated but not yet uploaded: a second rotation would discard
        // the still-active previous prekey.
        assert!(!pair.rotate_prekeys_if_needed(10 * PREKEY_ROTATION_INTERVAL_MS));
    }

    #[test]
    fn one_time_keys_come_from_both_accounts() {
        let mut pair = AccountPair::create();
        let upload = pair.one_time_keys(5);

        assert_eq!(upload.content_one_time_keys.len(), 5);
        assert_eq!(upload.notification_one_time_keys.len(), 5);

        // Marked published: a second batch is entirely fresh.
        let again = pair.one_time_keys(5);
        for key in &again.content_one_time_keys {
            assert!(!upload.content_one_time_keys.contains(key));
        }
    }

    #[test]
    fn signed_blob_verifies() {
        let pair = AccountPair::create();
        let signed = pair.signed_identity_blob().unwrap();

        let ed25519 = pair.content.identity_keys().ed25519;
        assert!(verify_signature(&ed25519, signed.payload.as_bytes(), &signed.signature).is_ok());

        let blob: IdentityKeysBlob = serde_json::from_str(&signed.payload).unwrap();
        assert_eq!(
            blob.notification_identity_public_keys,
            pair.notifications.identity_keys()
        );
    }
}
