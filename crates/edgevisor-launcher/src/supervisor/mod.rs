// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process supervision backends.
//!
//! The launcher never starts processes itself. It drives supervision units
//! (one per installed service) through the [`UnitManager`] trait and learns
//! about unit state changes through a polling [`UnitSubscription`].

pub mod mock;
pub mod systemctl;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use mock::{MockUnitManager, UnitOp};
pub use systemctl::SystemctlUnitManager;

/// Sub-state reported by a unit whose main process is alive.
pub const SUB_STATE_RUNNING: &str = "running";

/// Errors from supervision operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// Supervision command exited unsuccessfully.
    #[error("{command} failed: {message}")]
    CommandFailed {
        /// Command that was run, e.g. `start edgevisor_svc.service`.
        command: String,
        /// Error output.
        message: String,
    },

    /// Round trip did not finish within the configured bound.
    #[error("Supervision call timed out: {0}")]
    Timeout(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for supervision operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Observed state of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    /// Unit name.
    pub name: String,
    /// High level state (`active`, `inactive`, `failed`, ...).
    pub active_state: String,
    /// Low level state (`running`, `dead`, `exited`, ...).
    pub sub_state: String,
}

impl UnitStatus {
    /// Create a status.
    pub fn new(
        name: impl Into<String>,
        active_state: impl Into<String>,
        sub_state: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            active_state: active_state.into(),
            sub_state: sub_state.into(),
        }
    }

    /// Whether the unit's main process is running.
    pub fn is_running(&self) -> bool {
        self.sub_state == SUB_STATE_RUNNING
    }
}

/// Predicate deciding whether a unit name is delivered to a subscriber.
pub type RelevanceFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Stream of unit state changes.
///
/// Only units accepted by the relevance filter whose status differs from the
/// previous observation are delivered. Dropping `statuses` ends the
/// subscription.
pub struct UnitSubscription {
    /// Unit state changes.
    pub statuses: mpsc::Receiver<UnitStatus>,
    /// Polling errors.
    pub errors: mpsc::Receiver<SupervisorError>,
}

/// Process supervision contract.
#[async_trait]
pub trait UnitManager: Send + Sync {
    /// Backend name for logging.
    fn manager_type(&self) -> &'static str;

    /// Start a unit and wait until the job finished.
    async fn start_unit(&self, name: &str) -> Result<()>;

    /// Stop a unit and wait until the job finished.
    async fn stop_unit(&self, name: &str) -> Result<()>;

    /// Restart a unit and wait until the job finished.
    async fn restart_unit(&self, name: &str) -> Result<()>;

    /// Link a unit file into the supervisor's search path.
    async fn link_unit_file(&self, path: &Path) -> Result<()>;

    /// Disable a unit, removing its link.
    async fn disable_unit(&self, name: &str) -> Result<()>;

    /// Reload unit definitions.
    async fn reload(&self) -> Result<()>;

    /// List loaded unit names starting with `prefix`.
    async fn list_units(&self, prefix: &str) -> Result<Vec<String>>;

    /// Subscribe to unit state changes, polling every `interval`.
    async fn subscribe_units(
        &self,
        interval: Duration,
        buffer: usize,
        relevance: RelevanceFilter,
    ) -> Result<UnitSubscription>;
}
