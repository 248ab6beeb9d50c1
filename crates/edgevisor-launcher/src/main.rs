// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edgevisor Launcher - On-device Service Lifecycle Daemon
//!
//! Runs the launcher against systemd and the local SQLite record store:
//! - applies the initial user set and desired services from configuration
//! - logs proposed state changes and action statuses
//! - stops services on shutdown
//!
//! `edgevisor-launcher --reset` removes every launcher-managed unit, user,
//! record and directory and exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use edgevisor_launcher::Launcher;
use edgevisor_launcher::accounts::SystemUserProvisioner;
use edgevisor_launcher::config::Config;
use edgevisor_launcher::image::HttpImageProvider;
use edgevisor_launcher::model::ServiceInfoFromCloud;
use edgevisor_launcher::provider::SqliteServiceProvider;
use edgevisor_launcher::sender::LogSender;
use edgevisor_launcher::supervisor::{SystemctlUnitManager, UnitManager};

/// Record store file inside the working directory.
const DATABASE_FILE: &str = "services.db";
/// Image download timeout.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Default log filter when neither `--log-level` nor `RUST_LOG` is set.
const DEFAULT_LOG_FILTER: &str = "edgevisor_launcher=info";

/// Edgevisor launcher - on-device service lifecycle daemon
#[derive(Parser, Debug)]
#[command(name = "edgevisor-launcher", version, about, long_about = None)]
struct Args {
    /// Remove every launcher-managed unit, user, record and directory, then exit
    #[arg(long)]
    reset: bool,

    /// Log filter, e.g. `debug` or `edgevisor_launcher=trace`. Overrides RUST_LOG
    #[arg(short = 'l', long, env = "EDGEVISOR_LOG_LEVEL", value_name = "FILTER")]
    log_level: Option<String>,

    /// Environment file to load instead of `./.env`
    #[arg(short = 'e', long, value_name = "PATH")]
    env_file: Option<PathBuf>,
}

impl Args {
    fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        match &self.log_level {
            Some(level) => tracing_subscriber::EnvFilter::new(level),
            None => tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt().with_env_filter(args.env_filter()).init();

    // Load environment file
    match &args.env_file {
        Some(path) => {
            dotenvy::from_path(path)?;
            info!(path = %path.display(), "Loaded environment file");
        }
        None => {
            if let Err(e) = dotenvy::dotenv() {
                warn!("No .env file loaded: {}", e);
            }
        }
    }

    let config = Config::from_env()?;
    let working_dir = config.launcher.working_dir.clone();

    let provider = Arc::new(SqliteServiceProvider::from_path(working_dir.join(DATABASE_FILE)).await?);
    let units = Arc::new(SystemctlUnitManager::new());
    let accounts = Arc::new(SystemUserProvisioner::new());

    if args.reset {
        info!(working_dir = %working_dir.display(), "Resetting launcher");
        Launcher::reset(&working_dir, units.as_ref(), accounts.as_ref(), provider.as_ref()).await?;
        info!("Reset complete");
        return Ok(());
    }

    info!(
        working_dir = %working_dir.display(),
        manager = units.manager_type(),
        "Starting Edgevisor Launcher"
    );

    let (launcher, mut channels) = Launcher::builder()
        .config(config.launcher.clone())
        .provider(provider)
        .unit_manager(units)
        .image_provider(Arc::new(HttpImageProvider::new(DOWNLOAD_TIMEOUT)?))
        .user_provisioner(accounts)
        .sender(Arc::new(LogSender))
        .start()
        .await?;

    tokio::spawn(async move {
        while let Some(state) = channels.new_states.recv().await {
            info!(
                service_id = %state.service_id,
                correlation_id = %state.correlation_id,
                size = state.state.len(),
                checksum = %hex::encode(&state.checksum),
                "New state proposed"
            );
        }
    });

    tokio::spawn(async move {
        while let Some(status) = channels.statuses.recv().await {
            match &status.error {
                Some(e) => error!(service_id = %status.id, version = status.version, action = ?status.action, error = %e, "Action failed"),
                None => info!(service_id = %status.id, version = status.version, action = ?status.action, "Action completed"),
            }
        }
    });

    if let Some(users) = config.users {
        launcher.set_users(users).await?;
    }

    if let Some(path) = &config.desired_state_file {
        let desired: Vec<ServiceInfoFromCloud> =
            serde_json::from_str(&tokio::fs::read_to_string(path).await?)?;
        info!(path = %path.display(), services = desired.len(), "Applying desired services");

        for ticket in launcher.process_desired_services(&desired).await? {
            ticket.wait().await;
        }
    }

    info!("Edgevisor Launcher ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    launcher.close().await;

    info!("Edgevisor Launcher shut down");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["edgevisor-launcher"]).unwrap();
        assert!(!args.reset);
        assert!(args.env_file.is_none());
    }

    #[test]
    fn test_args_flags() {
        let args = Args::try_parse_from([
            "edgevisor-launcher",
            "--reset",
            "--log-level",
            "debug",
            "--env-file",
            "/etc/edgevisor/launcher.env",
        ])
        .unwrap();
        assert!(args.reset);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.env_file, Some(PathBuf::from("/etc/edgevisor/launcher.env")));

        let args = Args::try_parse_from(["edgevisor-launcher", "-l", "trace", "-e", "x.env"]).unwrap();
        assert_eq!(args.log_level.as_deref(), Some("trace"));
        assert_eq!(args.env_file, Some(PathBuf::from("x.env")));
    }

    #[test]
    fn test_args_reject_unknown_flags() {
        assert!(Args::try_parse_from(["edgevisor-launcher", "--rest"]).is_err());
        assert!(Args::try_parse_from(["edgevisor-launcher", "reset"]).is_err());
    }

    #[test]
    fn test_version_flag() {
        let err = Args::try_parse_from(["edgevisor-launcher", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_args_definition() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
