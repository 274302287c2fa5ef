//! Traits for the remote collaborators this core consumes.
//!
//! Authentication is opaque: every call carries caller-supplied
//! [`AuthMetadata`] and this core never mints or refreshes tokens.

use std::future::Future;

use thiserror::Error;

use gardien_shared::types::{AuthMetadata, DeviceKeys, OneTimeKeyUpload, PrekeyUpload};

/// Errors from remote service implementations.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Unauthenticated")]
    Unauthenticated,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// The remote identity directory: receives this device's published key
/// material and serves other devices' bundles.
pub trait IdentityDirectory: Send + Sync + 'static {
    fn publish_prekeys(
        &self,
        auth: &AuthMetadata,
        upload: PrekeyUpload,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    fn publish_one_time_keys(
        &self,
        auth: &AuthMetadata,
        upload: OneTimeKeyUpload,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Fetch a peer device's identity keys and prekey bundles.
    fn fetch_device_keys(
        &self,
        auth: &AuthMetadata,
        device_id: &str,
    ) -> impl Future<Output = Result<DeviceKeys, ServiceError>> + Send;
}

/// The remote backup/log service: serves a compacted snapshot plus the
/// ordered log of incremental operations recorded after it.
pub trait BackupService: Send + Sync + 'static {
    fn download_snapshot(
        &self,
        auth: &AuthMetadata,
        backup_id: &str,
    ) -> impl Future<Output = Result<Vec<u8>, ServiceError>> + Send;

    fn download_logs(
        &self,
        auth: &AuthMetadata,
        backup_id: &str,
    ) -> impl Future<Output = Result<Vec<Vec<u8>>, ServiceError>> + Send;
}

/// Stand-in for deployments without remote services; every call fails
/// with a transport error.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRemote;

impl IdentityDirectory for NoRemote {
    async fn publish_prekeys(
        &self,
        _auth: &AuthMetadata,
        _upload: PrekeyUpload,
    ) -> Result<(), ServiceError> {
        Err(ServiceError::Transport("remote services disabled".into()))
    }

    async fn publish_one_time_keys(
        &self,
        _auth: &AuthMetadata,
        _upload: OneTimeKeyUpload,
    ) -> Result<(), ServiceError> {
        Err(ServiceError::Transport("remote services disabled".into()))
    }

    async fn fetch_device_keys(
        &self,
        _auth: &AuthMetadata,
        _device_id: &str,
    ) -> Result<DeviceKeys, ServiceError> {
        Err(ServiceError::Transport("remote services disabled".into()))
    }
}

impl BackupService for NoRemote {
    async fn download_snapshot(
        &self,
        _auth: &AuthMetadata,
        _backup_id: &str,
    ) -> Result<Vec<u8>, ServiceError> {
        Err(ServiceError::Transport("remote services disabled".into()))
    }

    async fn download_logs(
        &self,
        _auth: &AuthMetadata,
        _backup_id: &str,
    ) -> Result<Vec<Vec<u8>>, ServiceError> {
        Err(ServiceError::Transport("remote services disabled".into()))
    }
}
