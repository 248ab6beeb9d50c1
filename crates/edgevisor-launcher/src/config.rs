// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for edgevisor-launcher.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the runc binary looked up on the host.
pub const RUNC_NAME: &str = "runc";
/// Name of the network namespace hook binary.
pub const NETNS_NAME: &str = "netns";
/// Name of the bandwidth shaping script.
pub const WONDERSHAPER_NAME: &str = "wondershaper";

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Launcher settings.
    pub launcher: LauncherConfig,
    /// User set to activate on startup (`None` leaves users unset).
    pub users: Option<Vec<String>>,
    /// Optional JSON file with the desired service list to apply on startup.
    pub desired_state_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = LauncherConfig::default();

        let working_dir = std::env::var("EDGEVISOR_WORKING_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.working_dir);

        let default_service_ttl = parse_env_u64("EDGEVISOR_DEFAULT_SERVICE_TTL_DAYS")?
            .unwrap_or(defaults.default_service_ttl);

        let max_concurrent_actions = match parse_env_u64("EDGEVISOR_MAX_CONCURRENT_ACTIONS")? {
            Some(0) => return Err(ConfigError::InvalidValue("EDGEVISOR_MAX_CONCURRENT_ACTIONS")),
            Some(n) => n as usize,
            None => defaults.max_concurrent_actions,
        };

        let unit_timeout = parse_env_u64("EDGEVISOR_UNIT_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.unit_timeout);

        let state_debounce = parse_env_u64("EDGEVISOR_STATE_DEBOUNCE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.state_debounce);

        let ttl_sweep_interval = parse_env_u64("EDGEVISOR_TTL_SWEEP_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.ttl_sweep_interval);

        let users = std::env::var("EDGEVISOR_USERS").ok().map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        });

        let desired_state_file = std::env::var("EDGEVISOR_DESIRED_STATE")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            launcher: LauncherConfig {
                working_dir,
                default_service_ttl,
                max_concurrent_actions,
                unit_timeout,
                state_debounce,
                ttl_sweep_interval,
            },
            users,
            desired_state_file,
        })
    }
}

fn parse_env_u64(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(var)),
        Err(_) => Ok(None),
    }
}

/// Launcher settings.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Root directory for installed services, storages and templates.
    pub working_dir: PathBuf,
    /// TTL in days applied when the image does not carry one.
    pub default_service_ttl: u64,
    /// Global cap on concurrently executing actions.
    pub max_concurrent_actions: usize,
    /// Upper bound on a single process-supervision round trip.
    pub unit_timeout: Duration,
    /// Debounce window for local state file changes.
    pub state_debounce: Duration,
    /// How often the TTL sweeper runs.
    pub ttl_sweep_interval: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("/var/lib/edgevisor"),
            default_service_ttl: 30,
            max_concurrent_actions: 10,
            unit_timeout: Duration::from_secs(30),
            state_debounce: Duration::from_secs(1),
            ttl_sweep_interval: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl LauncherConfig {
    /// Directory holding one sub-directory per installed service.
    pub fn services_dir(&self) -> PathBuf {
        self.working_dir.join("services")
    }

    /// Directory holding per-user storage folders.
    pub fn storages_dir(&self) -> PathBuf {
        self.working_dir.join("storages")
    }
}

/// Host binaries referenced from runtime specs and unit files.
#[derive(Debug, Clone)]
pub struct HostTools {
    /// Absolute path to runc.
    pub runc: PathBuf,
    /// Absolute path to the netns prestart hook.
    pub netns: PathBuf,
    /// Absolute path to wondershaper.
    pub wondershaper: PathBuf,
}

impl HostTools {
    /// Resolve host tools, preferring copies in the working directory and
    /// falling back to `PATH`. runc is only looked up in `PATH`.
    pub fn discover(working_dir: &Path) -> Result<Self, ConfigError> {
        let runc = lookup_path(RUNC_NAME).ok_or(ConfigError::ToolNotFound(RUNC_NAME))?;
        let netns = lookup_local_or_path(working_dir, NETNS_NAME)
            .ok_or(ConfigError::ToolNotFound(NETNS_NAME))?;
        let wondershaper = lookup_local_or_path(working_dir, WONDERSHAPER_NAME)
            .ok_or(ConfigError::ToolNotFound(WONDERSHAPER_NAME))?;

        Ok(Self {
            runc,
            netns,
            wondershaper,
        })
    }
}

fn lookup_local_or_path(working_dir: &Path, name: &str) -> Option<PathBuf> {
    let local = working_dir.join(name);
    if local.is_file() {
        return std::path::absolute(local).ok();
    }
    lookup_path(name)
}

fn lookup_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds a value that cannot be used.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
    /// A required host tool could not be located.
    #[error("Host tool not found: {0}")]
    ToolNotFound(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launcher_config_default() {
        let config = LauncherConfig::default();
        assert_eq!(config.default_service_ttl, 30);
        assert_eq!(config.max_concurrent_actions, 10);
        assert_eq!(config.unit_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_derived_dirs() {
        let config = LauncherConfig {
            working_dir: PathBuf::from("/tmp/edgevisor"),
            ..Default::default()
        };
        assert_eq!(config.services_dir(), PathBuf::from("/tmp/edgevisor/services"));
        assert_eq!(config.storages_dir(), PathBuf::from("/tmp/edgevisor/storages"));
    }

    #[test]
    fn test_lookup_prefers_working_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(NETNS_NAME), "#!/bin/sh\n").unwrap();

        let found = lookup_local_or_path(dir.path(), NETNS_NAME).unwrap();
        assert!(found.is_absolute());
        assert!(found.ends_with(NETNS_NAME));
    }
}
