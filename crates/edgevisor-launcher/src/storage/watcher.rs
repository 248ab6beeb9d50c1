// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State file watcher.
//!
//! Watches one storage folder for changes to `state.dat`. Filesystem events
//! are debounced by `notify-debouncer-mini`, so a burst of writes within the
//! debounce window yields a single proposal carrying the latest content.
//! A change whose checksum equals the last proposed or accepted checksum is
//! dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use dashmap::DashMap;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, Debouncer, new_debouncer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{PendingState, STATE_FILE, checksum};
use crate::error::{Error, Result};
use crate::model::NewState;

/// Shared state the watcher reports into.
#[derive(Clone)]
pub(crate) struct WatchContext {
    pub new_state_tx: mpsc::Sender<NewState>,
    pub pending: Arc<DashMap<String, PendingState>>,
    pub last_checksums: Arc<DashMap<String, Vec<u8>>>,
}

/// Active watch on one storage folder. Dropping it stops the watch.
pub(crate) struct StateWatcher {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl Drop for StateWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl StateWatcher {
    pub fn start(
        service_id: String,
        users: Vec<String>,
        folder: PathBuf,
        debounce: Duration,
        ctx: WatchContext,
    ) -> Result<Self> {
        let (watcher_tx, watcher_rx) = std_mpsc::channel();
        let mut debouncer = new_debouncer(debounce, watcher_tx)
            .map_err(|e| Error::Other(format!("failed to create state watcher: {e}")))?;

        debouncer
            .watcher()
            .watch(&folder, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Other(format!("failed to watch {}: {e}", folder.display())))?;

        let (event_tx, mut event_rx) = mpsc::channel::<Vec<DebouncedEvent>>(8);

        // The std receiver disconnects when the debouncer is dropped.
        tokio::task::spawn_blocking(move || {
            loop {
                match watcher_rx.recv() {
                    Ok(Ok(events)) => {
                        if event_tx.blocking_send(events).is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) => warn!(error = %e, "State watcher error"),
                    Err(_) => break,
                }
            }
        });

        let state_file = folder.join(STATE_FILE);
        info!(service_id = %service_id, folder = %folder.display(), "State watching started");

        let task = tokio::spawn(async move {
            while let Some(events) = event_rx.recv().await {
                if !events.iter().any(|e| is_state_file(&e.path)) {
                    continue;
                }
                if let Err(e) = propose_state(&service_id, &users, &state_file, &ctx).await {
                    warn!(service_id = %service_id, error = %e, "Failed to propose new state");
                }
            }
            debug!(service_id = %service_id, "State watcher stopped");
        });

        Ok(Self {
            _debouncer: debouncer,
            task,
        })
    }
}

fn is_state_file(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == STATE_FILE)
}

async fn propose_state(
    service_id: &str,
    users: &[String],
    state_file: &Path,
    ctx: &WatchContext,
) -> Result<()> {
    let state = match tokio::fs::read(state_file).await {
        Ok(state) => state,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let sum = checksum(&state);

    if ctx
        .last_checksums
        .get(service_id)
        .is_some_and(|last| *last == sum)
    {
        debug!(service_id, "State unchanged, skipping proposal");
        return Ok(());
    }

    // Only the newest proposal per service and user set awaits a verdict.
    ctx.pending
        .retain(|_, pending| pending.service_id != service_id || pending.users != users);

    let correlation_id = uuid::Uuid::new_v4().to_string();
    ctx.pending.insert(
        correlation_id.clone(),
        PendingState {
            service_id: service_id.to_string(),
            users: users.to_vec(),
            checksum: sum.clone(),
        },
    );
    ctx.last_checksums.insert(service_id.to_string(), sum.clone());

    info!(service_id, correlation_id = %correlation_id, "Proposing new state");

    ctx.new_state_tx
        .send(NewState {
            correlation_id,
            service_id: service_id.to_string(),
            state,
            checksum: sum,
        })
        .await
        .map_err(|_| Error::Other("new state channel closed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_state_file() {
        assert!(is_state_file(Path::new("/storages/abc/state.dat")));
        assert!(!is_state_file(Path::new("/storages/abc/.state.dat.tmp")));
        assert!(!is_state_file(Path::new("/storages/abc")));
    }

    #[tokio::test]
    async fn test_propose_state_skips_known_checksum() {
        let dir = tempfile::TempDir::new().unwrap();
        let state_file = dir.path().join(STATE_FILE);
        std::fs::write(&state_file, b"hello").unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let ctx = WatchContext {
            new_state_tx: tx,
            pending: Arc::new(DashMap::new()),
            last_checksums: Arc::new(DashMap::new()),
        };
        let users = vec!["alice".to_string()];

        propose_state("svc", &users, &state_file, &ctx).await.unwrap();
        let proposal = rx.try_recv().unwrap();
        assert_eq!(proposal.state, b"hello");
        assert_eq!(proposal.checksum, checksum(b"hello"));
        assert!(ctx.pending.contains_key(&proposal.correlation_id));

        // same content again is dropped
        propose_state("svc", &users, &state_file, &ctx).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_newer_proposal_replaces_unanswered_one() {
        let dir = tempfile::TempDir::new().unwrap();
        let state_file = dir.path().join(STATE_FILE);

        let (tx, mut rx) = mpsc::channel(4);
        let ctx = WatchContext {
            new_state_tx: tx,
            pending: Arc::new(DashMap::new()),
            last_checksums: Arc::new(DashMap::new()),
        };
        let users = vec!["alice".to_string()];
        ctx.pending.insert(
            "other".to_string(),
            PendingState {
                service_id: "svc2".to_string(),
                users: users.clone(),
                checksum: checksum(b"x"),
            },
        );

        std::fs::write(&state_file, b"first").unwrap();
        propose_state("svc", &users, &state_file, &ctx).await.unwrap();
        let first = rx.try_recv().unwrap();

        std::fs::write(&state_file, b"second").unwrap();
        propose_state("svc", &users, &state_file, &ctx).await.unwrap();
        let second = rx.try_recv().unwrap();

        assert_eq!(ctx.pending.len(), 2);
        assert!(!ctx.pending.contains_key(&first.correlation_id));
        assert!(ctx.pending.contains_key(&second.correlation_id));
        assert!(ctx.pending.contains_key("other"));
    }
}
