//! Detached ed25519 signature verification.
//!
//! Signing happens inside the Olm account; verification of peer material
//! (prekey signatures, identity blobs) only needs the public key, so it
//! lives here with no account in sight.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::error::SigningError;

/// Verify a detached signature.
///
/// `public_key` and `signature` are unpadded base64, the form peers
/// publish them in.
pub fn verify_signature(
    public_key: &str,
    message: &[u8],
    signature: &str,
) -> Result<(), SigningError> {
    let key_bytes: [u8; 32] = decode_b64(public_key)?
        .try_into()
        .map_err(|_| SigningError::InvalidKeyBytes)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| SigningError::InvalidKeyBytes)?;

    let sig_bytes = decode_b64(signature)?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| SigningError::InvalidSignature)?;

    verifying_key
        .verify(message, &signature)
        .map_err(|_| SigningError::VerificationFailed)
}

/// Decode base64 that may or may not carry padding.
pub fn decode_b64(input: &str) -> Result<Vec<u8>, SigningError> {
    STANDARD_NO_PAD
        .decode(input)
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(input))
        .map_err(|_| SigningError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    #[test]
    fn test_verify_valid_signature() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let message = b"prekey material";
        let signature = signing_key.sign(message);

        let pk = STANDARD_NO_PAD.encode(signing_key.verifying_key().to_bytes());
        let sig = STANDARD_NO_PAD.encode(signature.to_bytes());

        assert!(verify_signature(&pk, message, &sig).is_ok());
    }

    #[test]
    fn test_reject_wrong_message() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let signature = signing_key.sign(b"original");

        let pk = STANDARD_NO_PAD.encode(signing_key.verifying_key().to_bytes());
        let sig = STANDARD_NO_PAD.encode(signature.to_bytes());

        assert!(matches!(
            verify_signature(&pk, b"tampered", &sig),
            Err(SigningError::VerificationFailed)
        ));
    }

    #[test]
    fn test_reject_garbage_key() {
        assert!(verify_signature("!!!", b"m", "c2ln").is_err());
    }

    #[test]
    fn test_decode_padded_and_unpadded() {
        assert_eq!(decode_b64("dGVzdA").unwrap(), b"test");
        assert_eq!(decode_b64("dGVzdA==").unwrap(), b"test");
    }
}
