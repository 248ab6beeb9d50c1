// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for edgevisor-launcher.

use thiserror::Error;

/// Launcher errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Process supervision call failed or timed out.
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] crate::supervisor::SupervisorError),

    /// Requested service or association does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Install requested a version older than the installed one.
    #[error("Version mismatch for {id}: installed {installed}, requested {requested}")]
    VersionMismatch {
        /// Service ID.
        id: String,
        /// Installed version.
        installed: u64,
        /// Requested version.
        requested: u64,
    },

    /// Lifecycle operation attempted before a user set was established.
    #[error("Users are not set")]
    UsersNotSet,

    /// Image download or unpack failed.
    #[error("Image error: {0}")]
    Image(String),

    /// OS user provisioning or quota setup failed.
    #[error("Account error: {0}")]
    Account(String),

    /// Runtime spec or unit file preparation failed.
    #[error("Bundle error: {0}")]
    Bundle(String),

    /// Service state payload was rejected.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Returns true for errors describing a missing record.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Result type using launcher Error.
pub type Result<T> = std::result::Result<T, Error>;
