// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource monitoring hook.
//!
//! The launcher notifies an optional [`ServiceMonitor`] whenever a service
//! enters or leaves the running state. Monitoring failures never fail a
//! lifecycle action.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

/// File in the install directory holding the container PID.
pub const PID_FILE: &str = ".pid";
/// File in the install directory holding the container IP address.
pub const IP_FILE: &str = ".ip";

/// Parameters for monitoring a running service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringParams {
    /// Main process ID.
    pub pid: i32,
    /// Container IP address, empty if unknown.
    pub ip: String,
    /// Mounted storage folder.
    pub storage_folder: String,
    /// Upload bandwidth limit in bytes.
    pub upload_limit: u64,
    /// Download bandwidth limit in bytes.
    pub download_limit: u64,
    /// Serialized alert rules.
    pub alert_rules: String,
}

/// Service resource monitor.
#[async_trait]
pub trait ServiceMonitor: Send + Sync {
    /// Start monitoring a service.
    async fn start_monitoring(&self, service_id: &str, params: MonitoringParams) -> Result<()>;

    /// Stop monitoring a service.
    async fn stop_monitoring(&self, service_id: &str) -> Result<()>;
}

/// Read the container PID from `<service_path>/.pid`.
pub async fn read_pid(service_path: &Path) -> Result<i32> {
    let content = tokio::fs::read_to_string(service_path.join(PID_FILE)).await?;
    content
        .trim()
        .parse()
        .map_err(|_| crate::error::Error::Other(format!("invalid pid file content: {}", content.trim())))
}

/// Read the container IP from `<service_path>/.ip`, empty if absent.
pub async fn read_ip(service_path: &Path) -> String {
    tokio::fs::read_to_string(service_path.join(IP_FILE))
        .await
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}
