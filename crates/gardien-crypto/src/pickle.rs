//! Pickling helpers.
//!
//! Accounts and sessions are serialized through vodozemac's encrypted
//! pickle format. Pickling keys are random strings (UUIDs in practice);
//! the 32-byte key the pickle format wants is derived from them with a
//! domain-separated BLAKE3 KDF.

use vodozemac::olm::{Account, AccountPickle, Session, SessionPickle};

use gardien_shared::constants::KDF_CONTEXT_PICKLE_KEY;

use crate::error::SessionError;

/// Derive the 32-byte pickle key from a string pickling key.
pub fn pickle_key(pickling_key: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_PICKLE_KEY);
    hasher.update(pickling_key.as_bytes());
    let hash = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash.as_bytes()[..32]);
    key
}

pub fn pickle_account(account: &Account, pickling_key: &str) -> String {
    account.pickle().encrypt(&pickle_key(pickling_key))
}

pub fn unpickle_account(pickled: &str, pickling_key: &str) -> Result<Account, SessionError> {
    let pickle = AccountPickle::from_encrypted(pickled, &pickle_key(pickling_key))
        .map_err(|e| SessionError::Pickle(e.to_string()))?;
    Ok(Account::from_pickle(pickle))
}

pub fn pickle_session(session: &Session, pickling_key: &str) -> String {
    session.pickle().encrypt(&pickle_key(pickling_key))
}

pub fn unpickle_session(pickled: &str, pickling_key: &str) -> Result<Session, SessionError> {
    let pickle = SessionPickle::from_encrypted(pickled, &pickle_key(pickling_key))
        .map_err(|e| SessionError::Pickle(e.to_string()))?;
    Ok(Session::from_pickle(pickle))
}
