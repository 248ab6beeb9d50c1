// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for edgevisor-launcher.
//!
//! The schema holds two tables:
//! - `services` - one record per installed service
//! - `users_services` - per user set associations with storage folder and
//!   state checksum
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use edgevisor_launcher::migrations;
//!
//! let pool = SqlitePool::connect("sqlite:services.db?mode=rwc").await?;
//! migrations::run(&pool).await?;
//! ```

use sqlx::migrate::{MigrateError, Migrator};

/// Launcher migrations embedded at compile time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Run all migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
