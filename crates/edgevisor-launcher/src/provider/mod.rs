// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted record store for services and user associations.
//!
//! The launcher depends only on the [`ServiceProvider`] trait. Lookups return
//! `Ok(None)` for missing records; callers decide whether absence is an
//! error.

mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Service, ServiceState, ServiceStatus, UsersService};

pub use sqlite::SqliteServiceProvider;

/// CRUD contract over service records and user-set associations.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    // ========================================================================
    // Services
    // ========================================================================

    /// Insert a new service record.
    async fn add_service(&self, service: &Service) -> Result<()>;

    /// Replace the record with the same ID.
    async fn update_service(&self, service: &Service) -> Result<()>;

    /// Delete a service record.
    async fn remove_service(&self, id: &str) -> Result<()>;

    /// Get a service by ID.
    async fn get_service(&self, id: &str) -> Result<Option<Service>>;

    /// Get all services.
    async fn get_services(&self) -> Result<Vec<Service>>;

    /// Get a service by its supervision unit name.
    async fn get_service_by_unit_name(&self, unit_name: &str) -> Result<Option<Service>>;

    /// Set the health status.
    async fn set_service_status(&self, id: &str, status: ServiceStatus) -> Result<()>;

    /// Set the lifecycle state.
    async fn set_service_state(&self, id: &str, state: ServiceState) -> Result<()>;

    /// Set the last start time.
    async fn set_service_start_time(&self, id: &str, time: DateTime<Utc>) -> Result<()>;

    // ========================================================================
    // User associations
    // ========================================================================

    /// Associate a service with a user set. No-op if already associated.
    async fn add_service_to_users(&self, users: &[String], id: &str) -> Result<()>;

    /// Remove the association between a service and a user set.
    async fn remove_service_from_users(&self, users: &[String], id: &str) -> Result<()>;

    /// Get all services associated with a user set.
    async fn get_users_services(&self, users: &[String]) -> Result<Vec<Service>>;

    /// Remove every association of a service.
    async fn remove_service_from_all_users(&self, id: &str) -> Result<()>;

    /// Get one association.
    async fn get_users_service(&self, users: &[String], id: &str) -> Result<Option<UsersService>>;

    /// Get every association of a service.
    async fn get_users_services_by_service_id(&self, id: &str) -> Result<Vec<UsersService>>;

    /// Record the mounted storage folder of an association.
    async fn set_users_storage_folder(&self, users: &[String], id: &str, folder: &str) -> Result<()>;

    /// Record the checksum of the last accepted state of an association.
    async fn set_users_state_checksum(&self, users: &[String], id: &str, checksum: &[u8]) -> Result<()>;
}
