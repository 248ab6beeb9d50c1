// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data model for edgevisor-launcher.
//!
//! Persisted records ([`Service`], [`UsersService`]), the queued action
//! envelope ([`ServiceAction`]) and the value objects exchanged with the
//! messaging bridge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Persisted records
// ============================================================================

/// Lifecycle state of an installed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Installed but never started.
    Init,
    /// Unit is running.
    Running,
    /// Unit is stopped.
    Stopped,
}

impl ServiceState {
    /// Convert to the database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Init => "init",
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
        }
    }

    /// Parse from the database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "init" => Some(ServiceState::Init),
            "running" => Some(ServiceState::Running),
            "stopped" => Some(ServiceState::Stopped),
            _ => None,
        }
    }
}

/// Health status of an installed service, orthogonal to [`ServiceState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Unit is in its expected sub-state.
    Ok,
    /// Unit was reported outside its expected sub-state.
    Error,
}

impl ServiceStatus {
    /// Convert to the database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Ok => "ok",
            ServiceStatus::Error => "error",
        }
    }

    /// Parse from the database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(ServiceStatus::Ok),
            "error" => Some(ServiceStatus::Error),
            _ => None,
        }
    }
}

/// A provisioned workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Stable service identifier.
    pub id: String,
    /// Cloud-assigned version, only ever increases.
    pub version: u64,
    /// Install directory.
    pub path: String,
    /// Supervision unit name.
    pub unit_name: String,
    /// OS user the workload runs as.
    pub user_name: String,
    /// Serialized permissions.
    pub permissions: String,
    /// Serialized alert rules.
    pub alert_rules: String,
    /// Days until expiry once no active user set references the service.
    pub ttl: u64,
    /// Upload bandwidth limit in bytes.
    pub upload_limit: u64,
    /// Download bandwidth limit in bytes.
    pub download_limit: u64,
    /// Storage quota in bytes.
    pub storage_limit: u64,
    /// State blob size limit in bytes, 0 disables state.
    pub state_limit: u64,
    /// Lifecycle state.
    pub state: ServiceState,
    /// Health status.
    pub status: ServiceStatus,
    /// Time of the last successful start.
    pub start_at: DateTime<Utc>,
}

impl Service {
    /// Whether the service expired relative to `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        // A TTL beyond chrono's range never expires.
        let Some(ttl) = i64::try_from(self.ttl).ok().and_then(chrono::Duration::try_days) else {
            return false;
        };
        match self.start_at.checked_add_signed(ttl) {
            Some(expires_at) => expires_at < now,
            None => false,
        }
    }
}

/// Association between an active user set and a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsersService {
    /// Ordered user identifiers.
    pub users: Vec<String>,
    /// Associated service.
    pub service_id: String,
    /// Mounted storage folder, empty until first mount.
    pub storage_folder: String,
    /// Hex sha256 of the last accepted state.
    pub state_checksum: Vec<u8>,
}

// ============================================================================
// Cloud value objects
// ============================================================================

/// Install request for one service, as received from the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfoFromCloud {
    /// Service ID.
    pub id: String,
    /// Requested version.
    pub version: u64,
    /// Image location.
    #[serde(rename = "downloadUrl", alias = "url")]
    pub download_url: String,
    /// Expected sha256 of the image archive, hex encoded. Empty skips the check.
    #[serde(default)]
    pub sha256: String,
    /// Opaque monitoring configuration.
    #[serde(default)]
    pub service_monitoring: Option<serde_json::Value>,
}

/// Cloud-pushed replacement of a service state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateState {
    /// Service ID.
    pub service_id: String,
    /// New state content.
    pub state: Vec<u8>,
    /// sha256 of `state`.
    pub checksum: Vec<u8>,
}

/// Cloud verdict on a state previously proposed through [`NewState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateAcceptance {
    /// Service ID.
    pub service_id: String,
    /// Checksum of the state the verdict refers to.
    pub checksum: Vec<u8>,
    /// `"accepted"` or `"rejected"`.
    pub result: String,
    /// Rejection reason.
    #[serde(default)]
    pub reason: String,
}

impl StateAcceptance {
    /// Whether the cloud accepted the state.
    pub fn is_accepted(&self) -> bool {
        self.result.eq_ignore_ascii_case("accepted")
    }
}

/// Row of [`crate::Launcher::get_services_info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    /// Service ID.
    pub id: String,
    /// Installed version.
    pub version: u64,
    /// Health status.
    pub status: ServiceStatus,
    /// Checksum of the last accepted state.
    pub state_checksum: Vec<u8>,
}

/// Status string reported for a successful install.
pub const STATUS_INSTALLED: &str = "installed";
/// Status string reported for a removed service.
pub const STATUS_REMOVED: &str = "removed";
/// Status string reported for a failed action.
pub const STATUS_ERROR: &str = "error";

/// Service status message sent to the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusReport {
    /// Service ID.
    pub id: String,
    /// Version the status refers to.
    pub version: u64,
    /// One of [`STATUS_INSTALLED`], [`STATUS_REMOVED`], [`STATUS_ERROR`].
    pub status: String,
    /// Error message for failed actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Launcher output messages
// ============================================================================

/// Locally detected state change that must be proposed to the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewState {
    /// Correlation ID to match the later [`StateAcceptance`].
    pub correlation_id: String,
    /// Service ID.
    pub service_id: String,
    /// State content.
    pub state: Vec<u8>,
    /// sha256 of `state`.
    pub checksum: Vec<u8>,
}

/// Kind of lifecycle action reported on the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Install or update.
    Install,
    /// Uninstall or removal.
    Remove,
}

/// Terminal status of a queued lifecycle action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionStatus {
    /// What finished.
    pub action: ActionKind,
    /// Service ID.
    pub id: String,
    /// Version the status refers to.
    pub version: u64,
    /// `None` on success.
    pub error: Option<String>,
}

// ============================================================================
// Queued actions
// ============================================================================

/// Payload of a queued action.
#[derive(Debug, Clone)]
pub enum ActionPayload {
    /// Install, reinstall or update.
    Install(ServiceInfoFromCloud),
    /// Cloud-requested uninstall; requires users to be set.
    Uninstall,
    /// Full removal without a user check (TTL sweep).
    Remove,
    /// Start for the current users.
    Start,
    /// Stop.
    Stop,
    /// Replace the service state.
    UpdateState(UpdateState),
    /// Resolve a pending state proposal.
    StateAcceptance {
        /// Cloud verdict.
        acceptance: StateAcceptance,
        /// Correlation ID from [`NewState`].
        correlation_id: String,
    },
}

impl ActionPayload {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ActionPayload::Install(_) => "install",
            ActionPayload::Uninstall => "uninstall",
            ActionPayload::Remove => "remove",
            ActionPayload::Start => "start",
            ActionPayload::Stop => "stop",
            ActionPayload::UpdateState(_) => "update_state",
            ActionPayload::StateAcceptance { .. } => "state_acceptance",
        }
    }
}

/// A unit of lifecycle work for one service ID.
#[derive(Debug, Clone)]
pub struct ServiceAction {
    /// Service ID the action is serialized on.
    pub id: String,
    /// What to do.
    pub payload: ActionPayload,
}

impl ServiceAction {
    /// Create a new action.
    pub fn new(id: impl Into<String>, payload: ActionPayload) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}
