// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! systemd backend driven through the `systemctl` command line.
//!
//! `systemctl start|stop|restart` block until the queued job finished, which
//! gives the launcher the same round-trip semantics as waiting for a D-Bus
//! job completion signal. Unit state changes are observed by polling
//! `systemctl list-units` and diffing against the previous snapshot.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{RelevanceFilter, Result, SupervisorError, UnitManager, UnitStatus, UnitSubscription};

/// Default bound on one `systemctl` invocation.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// systemd unit manager.
pub struct SystemctlUnitManager {
    binary: String,
    command_timeout: Duration,
}

impl Default for SystemctlUnitManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemctlUnitManager {
    /// Create a manager using `systemctl` from `PATH`.
    pub fn new() -> Self {
        Self {
            binary: "systemctl".to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Override the bound on one `systemctl` invocation.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    async fn systemctl<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        run_systemctl(&self.binary, args, self.command_timeout).await
    }
}

async fn run_systemctl<S: AsRef<str>>(binary: &str, args: &[S], timeout: Duration) -> Result<String> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    let mut cmd = Command::new(binary);
    cmd.arg("--no-pager").args(&args).kill_on_drop(true);

    let command = args.join(" ");
    debug!(command = %command, "Running systemctl");

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| SupervisorError::Timeout(command.clone()))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(SupervisorError::CommandFailed {
            command,
            message: if stderr.is_empty() {
                output.status.to_string()
            } else {
                stderr
            },
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Arguments listing loaded service units, optionally restricted to a glob.
pub(crate) fn list_units_args(pattern: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = ["list-units", "--type=service", "--all", "--plain", "--no-legend", "--full"]
        .iter()
        .map(|a| a.to_string())
        .collect();
    args.extend(pattern.map(str::to_string));
    args
}

/// Arguments listing installed service unit files matching a glob.
pub(crate) fn list_unit_files_args(pattern: &str) -> Vec<String> {
    ["list-unit-files", "--type=service", "--plain", "--no-legend", "--full", pattern]
        .iter()
        .map(|a| a.to_string())
        .collect()
}

/// Parse `systemctl list-units --plain --no-legend` output.
///
/// Columns are `UNIT LOAD ACTIVE SUB DESCRIPTION...`. A leading status
/// marker (`●`) printed by some systemd versions is skipped.
pub(crate) fn parse_list_units(text: &str) -> Vec<UnitStatus> {
    text.lines()
        .filter_map(|line| {
            let mut columns = line.split_whitespace().skip_while(|c| *c == "●" || *c == "*");
            let name = columns.next()?;
            let _load = columns.next()?;
            let active = columns.next()?;
            let sub = columns.next()?;
            Some(UnitStatus::new(name, active, sub))
        })
        .collect()
}

/// Parse `systemctl list-unit-files --plain --no-legend` output into names.
pub(crate) fn parse_list_unit_files(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Compute the statuses to deliver given the previous and current snapshot.
///
/// Units that disappeared are reported as `inactive/dead`.
pub(crate) fn diff_snapshots(
    previous: &HashMap<String, UnitStatus>,
    current: &HashMap<String, UnitStatus>,
) -> Vec<UnitStatus> {
    let mut changes: Vec<UnitStatus> = current
        .values()
        .filter(|status| previous.get(&status.name) != Some(*status))
        .cloned()
        .collect();

    changes.extend(
        previous
            .keys()
            .filter(|name| !current.contains_key(*name))
            .map(|name| UnitStatus::new(name.clone(), "inactive", "dead")),
    );

    changes.sort_by(|a, b| a.name.cmp(&b.name));
    changes
}

#[async_trait]
impl UnitManager for SystemctlUnitManager {
    fn manager_type(&self) -> &'static str {
        "systemctl"
    }

    async fn start_unit(&self, name: &str) -> Result<()> {
        self.systemctl(&["start", name]).await.map(|_| ())
    }

    async fn stop_unit(&self, name: &str) -> Result<()> {
        self.systemctl(&["stop", name]).await.map(|_| ())
    }

    async fn restart_unit(&self, name: &str) -> Result<()> {
        self.systemctl(&["restart", name]).await.map(|_| ())
    }

    async fn link_unit_file(&self, path: &Path) -> Result<()> {
        let path = path
            .to_str()
            .ok_or_else(|| SupervisorError::Other(format!("non-UTF-8 unit path: {}", path.display())))?;
        self.systemctl(&["link", "--force", path]).await.map(|_| ())
    }

    async fn disable_unit(&self, name: &str) -> Result<()> {
        self.systemctl(&["disable", name]).await.map(|_| ())
    }

    async fn reload(&self) -> Result<()> {
        self.systemctl(&["daemon-reload"]).await.map(|_| ())
    }

    async fn list_units(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{prefix}*");

        // Linked but never loaded units only show up as unit files.
        let loaded = self.systemctl(&list_units_args(Some(&pattern))).await?;
        // Some systemd versions exit non-zero when no unit file matches.
        let files = match self.systemctl(&list_unit_files_args(&pattern)).await {
            Ok(files) => files,
            Err(SupervisorError::CommandFailed { message, .. }) => {
                debug!(pattern = %pattern, message = %message, "No unit files listed");
                String::new()
            }
            Err(e) => return Err(e),
        };

        let mut names: Vec<String> = parse_list_units(&loaded)
            .into_iter()
            .map(|u| u.name)
            .chain(parse_list_unit_files(&files))
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn subscribe_units(
        &self,
        interval: Duration,
        buffer: usize,
        relevance: RelevanceFilter,
    ) -> Result<UnitSubscription> {
        let (status_tx, status_rx) = mpsc::channel(buffer.max(1));
        let (error_tx, error_rx) = mpsc::channel(buffer.max(1));
        let binary = self.binary.clone();
        let command_timeout = self.command_timeout;
        let args = list_units_args(None);

        tokio::spawn(async move {
            let mut previous: HashMap<String, UnitStatus> = HashMap::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = status_tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                let text = match run_systemctl(&binary, &args, command_timeout).await {
                    Ok(text) => text,
                    Err(e) => {
                        if error_tx.try_send(e).is_err() {
                            warn!("Dropping unit subscription error, receiver is full");
                        }
                        continue;
                    }
                };

                let current: HashMap<String, UnitStatus> = parse_list_units(&text)
                    .into_iter()
                    .filter(|u| relevance(&u.name))
                    .map(|u| (u.name.clone(), u))
                    .collect();

                for change in diff_snapshots(&previous, &current) {
                    if status_tx.send(change).await.is_err() {
                        return;
                    }
                }
                previous = current;
            }

            debug!("Unit subscription closed");
        });

        Ok(UnitSubscription {
            statuses: status_rx,
            errors: error_rx,
        })
    }
}
