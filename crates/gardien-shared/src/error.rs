use thiserror::Error;

#[derive(Error, Debug)]
pub enum SealedError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    Decryption,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("JWK error: {0}")]
    Jwk(String),
}

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid signature encoding")]
    InvalidSignature,

    #[error("Signature verification failed")]
    VerificationFailed,
}
