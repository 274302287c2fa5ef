//! Symmetric envelope for data at rest.
//!
//! Database snapshots and notification session blobs are sealed with a
//! 256-bit ChaCha20-Poly1305 key and a fresh 96-bit nonce per call.
//! Decryption fails closed: a wrong key or a flipped bit yields
//! [`SealedError::Decryption`], never partial plaintext.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::NONCE_SIZE;
use crate::error::SealedError;

/// A non-extractable 256-bit envelope key.
///
/// The raw bytes are deliberately inaccessible; hosts that cannot clone
/// native key handles go through the explicit [`SealedKey::export_jwk`] /
/// [`SealedKey::from_jwk`] pair, which round-trips byte-for-byte.
#[derive(Clone)]
pub struct SealedKey([u8; 32]);

impl std::fmt::Debug for SealedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedKey").finish_non_exhaustive()
    }
}

/// Output of [`SealedKey::seal`]: random nonce plus ciphertext (tag
/// appended by the AEAD). Serializes with base64 fields so it can live in
/// JSON blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// JSON Web Key representation of a symmetric key (`kty: "oct"`).
#[derive(Debug, Serialize, Deserialize)]
struct Jwk {
    kty: String,
    k: String,
}

impl SealedKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Encrypt `plaintext` under this key with a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedPayload, SealedError> {
        let cipher = ChaCha20Poly1305::new((&self.0).into());

        let mut iv = vec![0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| SealedError::Encryption)?;

        Ok(EncryptedPayload { iv, ciphertext })
    }

    /// Decrypt a payload produced by [`SealedKey::seal`].
    pub fn open(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, SealedError> {
        if payload.iv.len() != NONCE_SIZE {
            return Err(SealedError::Decryption);
        }

        let cipher = ChaCha20Poly1305::new((&self.0).into());
        let nonce = Nonce::from_slice(&payload.iv);

        cipher
            .decrypt(nonce, payload.ciphertext.as_slice())
            .map_err(|_| SealedError::Decryption)
    }

    /// Export as a portable JSON Web Key string.
    pub fn export_jwk(&self) -> Result<String, SealedError> {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let jwk = Jwk {
            kty: "oct".to_string(),
            k: URL_SAFE_NO_PAD.encode(self.0),
        };
        serde_json::to_string(&jwk).map_err(|e| SealedError::Jwk(e.to_string()))
    }

    /// Import a key previously exported with [`SealedKey::export_jwk`].
    pub fn from_jwk(jwk: &str) -> Result<Self, SealedError> {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let jwk: Jwk =
            serde_json::from_str(jwk).map_err(|e| SealedError::Jwk(e.to_string()))?;
        if jwk.kty != "oct" {
            return Err(SealedError::Jwk(format!("unsupported kty: {}", jwk.kty)));
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(&jwk.k)
            .map_err(|e| SealedError::Jwk(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SealedError::InvalidKeyLength)?;
        Ok(Self(key))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
