//! # gardien-remote
//!
//! HTTP clients for the engine's remote collaborators: the identity
//! directory (prekey / one-time-key publication) and the backup/log
//! service (snapshot + ordered log download). Authentication is a
//! caller-supplied opaque bearer token; these clients never mint or
//! refresh credentials.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;

use gardien_engine::{BackupService, IdentityDirectory, ServiceError};
use gardien_shared::types::{AuthMetadata, DeviceKeys, OneTimeKeyUpload, PrekeyUpload};

/// Client for the remote backup/log service.
#[derive(Debug, Clone)]
pub struct BackupServiceClient {
    url: reqwest::Url,
    client: reqwest::Client,
}

impl BackupServiceClient {
    pub fn new(url: &str) -> Result<Self, ServiceError> {
        Ok(Self {
            url: parse_base_url(url)?,
            client: reqwest::Client::new(),
        })
    }
}

/// Wire form of the log listing: ordered, base64-encoded sealed entries.
#[derive(Debug, Deserialize)]
struct LogListing {
    entries: Vec<String>,
}

impl BackupService for BackupServiceClient {
    async fn download_snapshot(
        &self,
        auth: &AuthMetadata,
        backup_id: &str,
    ) -> Result<Vec<u8>, ServiceError> {
        let url = join_url(&self.url, &format!("backups/{backup_id}/snapshot"))?;
        tracing::debug!(%url, "downloading backup snapshot");

        let response = self
            .client
            .get(url)
            .bearer_auth(&auth.access_token)
            .send()
            .await
            .map_err(transport)?;

        let response = check_status(response, backup_id)?;
        let bytes = response.bytes().await.map_err(transport)?;
        Ok(bytes.to_vec())
    }

    async fn download_logs(
        &self,
        auth: &AuthMetadata,
        backup_id: &str,
    ) -> Result<Vec<Vec<u8>>, ServiceError> {
        let url = join_url(&self.url, &format!("backups/{backup_id}/logs"))?;
        tracing::debug!(%url, "downloading backup logs");

        let response = self
            .client
            .get(url)
            .bearer_auth(&auth.access_token)
            .send()
            .await
            .map_err(transport)?;

        let response = check_status(response, backup_id)?;
        let listing: LogListing = response.json().await.map_err(transport)?;
        decode_log_entries(&listing.entries)
    }
}

/// Client for the remote identity directory.
#[derive(Debug, Clone)]
pub struct IdentityDirectoryClient {
    url: reqwest::Url,
    client: reqwest::Client,
}

impl IdentityDirectoryClient {
    pub fn new(url: &str) -> Result<Self, ServiceError> {
        Ok(Self {
            url: parse_base_url(url)?,
            client: reqwest::Client::new(),
        })
    }
}

impl IdentityDirectory for IdentityDirectoryClient {
    async fn publish_prekeys(
        &self,
        auth: &AuthMetadata,
        upload: PrekeyUpload,
    ) -> Result<(), ServiceError> {
        let url = join_url(&self.url, "device_keys/prekeys")?;
        tracing::debug!(%url, "publishing prekeys");

        let response = self
            .client
            .post(url)
            .bearer_auth(&auth.access_token)
            .json(&upload)
            .send()
            .await
            .map_err(transport)?;

        check_status(response, &auth.device_id)?;
        Ok(())
    }

    async fn publish_one_time_keys(
        &self,
        auth: &AuthMetadata,
        upload: OneTimeKeyUpload,
    ) -> Result<(), ServiceError> {
        let url = join_url(&self.url, "device_keys/one_time_keys")?;
        tracing::debug!(
            %url,
            content = upload.content_one_time_keys.len(),
            notifications = upload.notification_one_time_keys.len(),
            "publishing one-time keys"
        );

        let response = self
            .client
            .post(url)
            .bearer_auth(&auth.access_token)
            .json(&upload)
            .send()
            .await
            .map_err(transport)?;

        check_status(response, &auth.device_id)?;
        Ok(())
    }

    async fn fetch_device_keys(
        &self,
        auth: &AuthMetadata,
        device_id: &str,
    ) -> Result<DeviceKeys, ServiceError> {
        let url = join_url(&self.url, &format!("device_keys/{device_id}"))?;
        tracing::debug!(%url, "fetching device keys");

        let response = self
            .client
            .get(url)
            .bearer_auth(&auth.access_token)
            .send()
            .await
            .map_err(transport)?;

        let response = check_status(response, device_id)?;
        response.json().await.map_err(transport)
    }
}

fn parse_base_url(url: &str) -> Result<reqwest::Url, ServiceError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ServiceError::Transport(format!("invalid base url: {e}")))?;
    if parsed.cannot_be_a_base() {
        return Err(ServiceError::Transport(format!(
            "invalid base url: {url}"
        )));
    }
    Ok(parsed)
}

fn join_url(base: &reqwest::Url, path: &str) -> Result<reqwest::Url, ServiceError> {
    base.join(path)
        .map_err(|e| ServiceError::Transport(format!("invalid url path: {e}")))
}

fn transport(e: reqwest::Error) -> ServiceError {
    ServiceError::Transport(e.to_string())
}

fn check_status(
    response: reqwest::Response,
    subject: &str,
) -> Result<reqwest::Response, ServiceError> {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ServiceError::Unauthenticated),
        StatusCode::NOT_FOUND => Err(ServiceError::NotFound(subject.to_string())),
        _ => response.error_for_status().map_err(transport),
    }
}

fn decode_log_entries(entries: &[String]) -> Result<Vec<Vec<u8>>, ServiceError> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            STANDARD
                .decode(entry)
                .map_err(|e| ServiceError::Transport(format!("log entry {index}: {e}")))
        })
        .collect()
}
