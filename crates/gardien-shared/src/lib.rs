//! # gardien-shared
//!
//! Types and primitives shared by every layer of the Gardien trust core:
//! the symmetric envelope used to seal data at rest, identity-key blobs and
//! prekey bundles exchanged with peers, and the common error taxonomy.

pub mod constants;
pub mod sealed;
pub mod signing;
pub mod types;

mod error;

pub use error::{SealedError, SigningError};
pub use sealed::{EncryptedPayload, SealedKey};
