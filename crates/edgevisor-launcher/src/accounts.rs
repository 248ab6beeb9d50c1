// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OS user provisioning for services.
//!
//! Every service runs as its own system user. The user owns the service's
//! storage folders and carries the filesystem quota.

use std::path::Path;

use async_trait::async_trait;
use nix::unistd::User;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Prefix of generated user names.
pub const USER_PREFIX: &str = "edgevisor_";

/// Creates, looks up and removes service users.
#[async_trait]
pub trait UserProvisioner: Send + Sync {
    /// Create a fresh user for `service_id`. Returns the user name.
    async fn create_user(&self, service_id: &str) -> Result<String>;

    /// Delete a user. Deleting a missing user is not an error.
    async fn delete_user(&self, name: &str) -> Result<()>;

    /// Resolve `(uid, gid)` of a user.
    async fn user_ids(&self, name: &str) -> Result<(u32, u32)>;

    /// Limit disk usage of a user on the filesystem holding `path`.
    /// A zero limit removes the quota.
    async fn set_quota(&self, name: &str, limit_bytes: u64, path: &Path) -> Result<()>;
}

/// Provisioner backed by `useradd`, `userdel` and `setquota`.
#[derive(Debug, Default)]
pub struct SystemUserProvisioner;

impl SystemUserProvisioner {
    /// Create a new provisioner.
    pub fn new() -> Self {
        Self
    }

    async fn run(program: &str, args: &[&str]) -> Result<std::process::Output> {
        debug!(program, ?args, "Running account command");
        Ok(Command::new(program).args(args).output().await?)
    }
}

/// Generate a user name. System user names are capped at 32 characters, so
/// the service ID is not embedded.
pub fn generate_user_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{USER_PREFIX}{}", &id[..16])
}

#[async_trait]
impl UserProvisioner for SystemUserProvisioner {
    async fn create_user(&self, service_id: &str) -> Result<String> {
        let name = generate_user_name();

        let output = Self::run(
            "useradd",
            &["--system", "--no-create-home", "--shell", "/usr/sbin/nologin", &name],
        )
        .await?;

        if !output.status.success() {
            return Err(Error::Account(format!(
                "useradd {name} for {service_id} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(name)
    }

    async fn delete_user(&self, name: &str) -> Result<()> {
        if User::from_name(name)
            .map_err(|e| Error::Account(format!("lookup of {name} failed: {e}")))?
            .is_none()
        {
            return Ok(());
        }

        let output = Self::run("userdel", &[name]).await?;
        if !output.status.success() {
            return Err(Error::Account(format!(
                "userdel {name} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn user_ids(&self, name: &str) -> Result<(u32, u32)> {
        let user = User::from_name(name)
            .map_err(|e| Error::Account(format!("lookup of {name} failed: {e}")))?
            .ok_or_else(|| Error::Account(format!("user {name} does not exist")))?;
        Ok((user.uid.as_raw(), user.gid.as_raw()))
    }

    async fn set_quota(&self, name: &str, limit_bytes: u64, path: &Path) -> Result<()> {
        // setquota takes 1 KiB blocks
        let blocks = limit_bytes.div_ceil(1024).to_string();
        let path = path.to_string_lossy();

        let output = Self::run("setquota", &["-u", name, "0", &blocks, "0", "0", &path]).await?;
        if !output.status.success() {
            return Err(Error::Account(format!(
                "setquota for {name} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
