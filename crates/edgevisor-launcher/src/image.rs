// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service image download and unpacking.
//!
//! Images are gzip-compressed tar archives of an OCI bundle. They are fetched
//! over HTTP(S) or from a local `file://` path, verified against the expected
//! sha256, and unpacked into the install directory.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::ServiceInfoFromCloud;

/// Downloads and unpacks service images.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Fetch the image described by `info` and unpack it into `dest`.
    async fn fetch_image(&self, info: &ServiceInfoFromCloud, dest: &Path) -> Result<()>;
}

/// Compute the lowercase hex sha256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Verify `data` against an expected hex sha256.
///
/// Returns whether a digest was checked; an empty expectation is not
/// verified and returns `Ok(false)`.
pub fn verify_sha256(data: &[u8], expected: &str) -> Result<bool> {
    let expected = expected.trim();
    if expected.is_empty() {
        return Ok(false);
    }

    let actual = sha256_hex(data);
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::Image(format!(
            "checksum mismatch: expected {expected}, got {actual}"
        )));
    }
    Ok(true)
}

/// HTTP image provider unpacking with the system `tar`.
pub struct HttpImageProvider {
    client: reqwest::Client,
    tar: String,
}

impl HttpImageProvider {
    /// Create a provider with the given request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Image(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            tar: "tar".to_string(),
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(tokio::fs::read(path).await?);
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Image(format!("download of {url} failed: {e}")))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Image(format!("download of {url} failed: {e}")))?;

        Ok(bytes.to_vec())
    }

    async fn unpack(&self, archive: &Path, dest: &Path) -> Result<()> {
        let output = Command::new(&self.tar)
            .arg("-xzf")
            .arg(archive)
            .arg("-C")
            .arg(dest)
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::Image(format!(
                "unpack failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ImageProvider for HttpImageProvider {
    async fn fetch_image(&self, info: &ServiceInfoFromCloud, dest: &Path) -> Result<()> {
        info!(service_id = %info.id, version = info.version, url = %info.download_url, "Downloading service image");

        let data = self.download(&info.download_url).await?;
        if !verify_sha256(&data, &info.sha256)? {
            warn!(
                service_id = %info.id,
                version = info.version,
                "Image has no sha256, integrity not verified"
            );
        }

        tokio::fs::create_dir_all(dest).await?;
        let archive = dest.join(".image.tar.gz");
        tokio::fs::write(&archive, &data).await?;

        let result = self.unpack(&archive, dest).await;
        if let Err(e) = tokio::fs::remove_file(&archive).await {
            debug!(error = %e, "Failed to remove image archive");
        }
        result?;

        if !dest.join(crate::bundle::SPEC_FILE).exists() {
            return Err(Error::Image(format!(
                "image of {} has no {}",
                info.id,
                crate::bundle::SPEC_FILE
            )));
        }

        debug!(service_id = %info.id, dest = %dest.display(), "Service image unpacked");
        Ok(())
    }
}
