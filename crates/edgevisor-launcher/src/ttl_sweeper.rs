// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker removing expired services.
//!
//! A service expires when `start_at + ttl` days lies in the past and the
//! active user set no longer references it. Removal is queued per service
//! so it serializes with any other work on the same ID.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::launcher::WeakLauncher;

/// Periodic TTL sweep.
pub struct TtlSweeper {
    launcher: WeakLauncher,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl TtlSweeper {
    /// Create a sweeper for `launcher` running every `interval`.
    pub fn new(launcher: WeakLauncher, interval: Duration) -> Self {
        Self {
            launcher,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled or the launcher is gone.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "TTL sweeper started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("TTL sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    let Some(launcher) = self.launcher.upgrade() else {
                        debug!("Launcher dropped, stopping TTL sweeper");
                        break;
                    };

                    match launcher.sweep_expired().await {
                        Ok(0) => debug!("No expired services"),
                        Ok(removed) => info!(removed, "Expired services removed"),
                        Err(e) => error!(error = %e, "TTL sweep failed"),
                    }
                }
            }
        }

        info!("TTL sweeper stopped");
    }
}
