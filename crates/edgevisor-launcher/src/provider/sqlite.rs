// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed service provider.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::ServiceProvider;
use crate::error::{Error, Result};
use crate::migrations::MIGRATOR;
use crate::model::{Service, ServiceState, ServiceStatus, UsersService};

const SERVICE_COLUMNS: &str = "id, version, path, unit_name, user_name, permissions, alert_rules, \
                               ttl, upload_limit, download_limit, storage_limit, state_limit, \
                               state, status, start_at";

/// Raw `services` row. Unsigned fields are stored bit-cast into INTEGER.
#[derive(Debug, sqlx::FromRow)]
struct ServiceRow {
    id: String,
    version: i64,
    path: String,
    unit_name: String,
    user_name: String,
    permissions: String,
    alert_rules: String,
    ttl: i64,
    upload_limit: i64,
    download_limit: i64,
    storage_limit: i64,
    state_limit: i64,
    state: String,
    status: String,
    start_at: DateTime<Utc>,
}

impl TryFrom<ServiceRow> for Service {
    type Error = Error;

    fn try_from(row: ServiceRow) -> Result<Self> {
        let state = ServiceState::parse(&row.state)
            .ok_or_else(|| Error::Other(format!("invalid service state in database: {}", row.state)))?;
        let status = ServiceStatus::parse(&row.status)
            .ok_or_else(|| Error::Other(format!("invalid service status in database: {}", row.status)))?;

        Ok(Service {
            id: row.id,
            version: row.version as u64,
            path: row.path,
            unit_name: row.unit_name,
            user_name: row.user_name,
            permissions: row.permissions,
            alert_rules: row.alert_rules,
            ttl: row.ttl as u64,
            upload_limit: row.upload_limit as u64,
            download_limit: row.download_limit as u64,
            storage_limit: row.storage_limit as u64,
            state_limit: row.state_limit as u64,
            state,
            status,
            start_at: row.start_at,
        })
    }
}

/// Raw `users_services` row.
#[derive(Debug, sqlx::FromRow)]
struct UsersServiceRow {
    users: String,
    service_id: String,
    storage_folder: String,
    state_checksum: Vec<u8>,
}

impl TryFrom<UsersServiceRow> for UsersService {
    type Error = Error;

    fn try_from(row: UsersServiceRow) -> Result<Self> {
        Ok(UsersService {
            users: serde_json::from_str(&row.users)?,
            service_id: row.service_id,
            storage_folder: row.storage_folder,
            state_checksum: row.state_checksum,
        })
    }
}

fn users_key(users: &[String]) -> Result<String> {
    Ok(serde_json::to_string(users)?)
}

fn expect_affected(rows: u64, what: impl FnOnce() -> String) -> Result<()> {
    if rows == 0 {
        return Err(Error::NotFound(what()));
    }
    Ok(())
}

/// SQLite-backed [`ServiceProvider`].
#[derive(Clone)]
pub struct SqliteServiceProvider {
    pool: SqlitePool,
}

impl SqliteServiceProvider {
    /// Create a provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a provider from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ServiceProvider for SqliteServiceProvider {
    async fn add_service(&self, service: &Service) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO services ({SERVICE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&service.id)
        .bind(service.version as i64)
        .bind(&service.path)
        .bind(&service.unit_name)
        .bind(&service.user_name)
        .bind(&service.permissions)
        .bind(&service.alert_rules)
        .bind(service.ttl as i64)
        .bind(service.upload_limit as i64)
        .bind(service.download_limit as i64)
        .bind(service.storage_limit as i64)
        .bind(service.state_limit as i64)
        .bind(service.state.as_str())
        .bind(service.status.as_str())
        .bind(service.start_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_service(&self, service: &Service) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE services
            SET version = ?, path = ?, unit_name = ?, user_name = ?, permissions = ?,
                alert_rules = ?, ttl = ?, upload_limit = ?, download_limit = ?,
                storage_limit = ?, state_limit = ?, state = ?, status = ?, start_at = ?
            WHERE id = ?
            "#,
        )
        .bind(service.version as i64)
        .bind(&service.path)
        .bind(&service.unit_name)
        .bind(&service.user_name)
        .bind(&service.permissions)
        .bind(&service.alert_rules)
        .bind(service.ttl as i64)
        .bind(service.upload_limit as i64)
        .bind(service.download_limit as i64)
        .bind(service.storage_limit as i64)
        .bind(service.state_limit as i64)
        .bind(service.state.as_str())
        .bind(service.status.as_str())
        .bind(service.start_at)
        .bind(&service.id)
        .execute(&self.pool)
        .await?;

        expect_affected(result.rows_affected(), || format!("service {}", service.id))
    }

    async fn remove_service(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM services WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_service(&self, id: &str) -> Result<Option<Service>> {
        let row = sqlx::query_as::<_, ServiceRow>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Service::try_from).transpose()
    }

    async fn get_services(&self) -> Result<Vec<Service>> {
        let rows = sqlx::query_as::<_, ServiceRow>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Service::try_from).collect()
    }

    async fn get_service_by_unit_name(&self, unit_name: &str) -> Result<Option<Service>> {
        let row = sqlx::query_as::<_, ServiceRow>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services WHERE unit_name = ?"
        ))
        .bind(unit_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Service::try_from).transpose()
    }

    async fn set_service_status(&self, id: &str, status: ServiceStatus) -> Result<()> {
        let result = sqlx::query("UPDATE services SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        expect_affected(result.rows_affected(), || format!("service {id}"))
    }

    async fn set_service_state(&self, id: &str, state: ServiceState) -> Result<()> {
        let result = sqlx::query("UPDATE services SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        expect_affected(result.rows_affected(), || format!("service {id}"))
    }

    async fn set_service_start_time(&self, id: &str, time: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE services SET start_at = ? WHERE id = ?")
            .bind(time)
            .bind(id)
            .execute(&self.pool)
            .await?;

        expect_affected(result.rows_affected(), || format!("service {id}"))
    }

    async fn add_service_to_users(&self, users: &[String], id: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO users_services (users, service_id) VALUES (?, ?)")
            .bind(users_key(users)?)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn remove_service_from_users(&self, users: &[String], id: &str) -> Result<()> {
        sqlx::query("DELETE FROM users_services WHERE users = ? AND service_id = ?")
            .bind(users_key(users)?)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_users_services(&self, users: &[String]) -> Result<Vec<Service>> {
        let columns = SERVICE_COLUMNS
            .split(", ")
            .map(|c| format!("s.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");

        let rows = sqlx::query_as::<_, ServiceRow>(&format!(
            "SELECT {columns} FROM services s \
             JOIN users_services u ON u.service_id = s.id \
             WHERE u.users = ? ORDER BY s.id"
        ))
        .bind(users_key(users)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Service::try_from).collect()
    }

    async fn remove_service_from_all_users(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM users_services WHERE service_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_users_service(&self, users: &[String], id: &str) -> Result<Option<UsersService>> {
        let row = sqlx::query_as::<_, UsersServiceRow>(
            r#"
            SELECT users, service_id, storage_folder, state_checksum
            FROM users_services
            WHERE users = ? AND service_id = ?
            "#,
        )
        .bind(users_key(users)?)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UsersService::try_from).transpose()
    }

    async fn get_users_services_by_service_id(&self, id: &str) -> Result<Vec<UsersService>> {
        let rows = sqlx::query_as::<_, UsersServiceRow>(
            r#"
            SELECT users, service_id, storage_folder, state_checksum
            FROM users_services
            WHERE service_id = ?
            ORDER BY users
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UsersService::try_from).collect()
    }

    async fn set_users_storage_folder(&self, users: &[String], id: &str, folder: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users_services SET storage_folder = ? WHERE users = ? AND service_id = ?",
        )
        .bind(folder)
        .bind(users_key(users)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        expect_affected(result.rows_affected(), || format!("users service {id}"))
    }

    async fn set_users_state_checksum(&self, users: &[String], id: &str, checksum: &[u8]) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users_services SET state_checksum = ? WHERE users = ? AND service_id = ?",
        )
        .bind(checksum)
        .bind(users_key(users)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        expect_affected(result.rows_affected(), || format!("users service {id}"))
    }
}
