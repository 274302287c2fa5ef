use thiserror::Error;

use gardien_crypto::SessionError;
use gardien_shared::SealedError;
use gardien_store::StoreError;

use crate::services::ServiceError;

/// Errors surfaced to engine callers.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Sealed(#[from] SealedError),

    #[error("Remote service error: {0}")]
    Service(#[from] ServiceError),

    /// The backup's stored schema version is newer than this client
    /// supports. Fatal; the restore leaves no partial state live.
    #[error("Incompatible backup version: stored {stored}, supported up to {supported}")]
    IncompatibleBackupVersion { stored: u32, supported: u32 },

    /// A backup log entry failed to decode or apply. The whole restore
    /// aborts; replay must restart from the snapshot.
    #[error("Backup log replay failed: {0}")]
    BackupLog(String),

    /// A crypto operation was requested before `initialize_crypto_account`.
    #[error("Crypto account not initialized")]
    NotInitialized,

    /// The worker task is gone (shut down or panicked); no further
    /// requests can be served.
    #[error("Engine worker is no longer running")]
    WorkerGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
