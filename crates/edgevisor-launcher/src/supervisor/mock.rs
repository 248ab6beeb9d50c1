// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock unit manager for testing.
//!
//! Tracks linked and running units in memory, records every call, and
//! supports failure injection and artificial latency per operation. Unit
//! state changes are only delivered when a test calls [`MockUnitManager::emit`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{RelevanceFilter, Result, SupervisorError, UnitManager, UnitStatus, UnitSubscription};

/// Operation kinds for failure injection and call inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitOp {
    /// `start_unit`.
    Start,
    /// `stop_unit`.
    Stop,
    /// `restart_unit`.
    Restart,
    /// `link_unit_file`.
    Link,
    /// `disable_unit`.
    Disable,
    /// `reload`.
    Reload,
}

#[derive(Default)]
struct MockState {
    linked: HashMap<String, PathBuf>,
    running: HashSet<String>,
    calls: Vec<(UnitOp, String)>,
    fail_once: HashSet<UnitOp>,
    fail_always: HashSet<UnitOp>,
    delays: HashMap<UnitOp, Duration>,
    subscriber: Option<(mpsc::Sender<UnitStatus>, RelevanceFilter)>,
}

/// In-memory unit manager.
#[derive(Default)]
pub struct MockUnitManager {
    state: Mutex<MockState>,
}

impl MockUnitManager {
    /// Create a new mock manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call of `op`.
    pub fn fail_once(&self, op: UnitOp) {
        self.lock().fail_once.insert(op);
    }

    /// Fail every call of `op` until [`MockUnitManager::clear_failures`].
    pub fn fail_always(&self, op: UnitOp) {
        self.lock().fail_always.insert(op);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_once.clear();
        state.fail_always.clear();
    }

    /// Delay every call of `op`.
    pub fn set_delay(&self, op: UnitOp, delay: Duration) {
        self.lock().delays.insert(op, delay);
    }

    /// Whether a unit is currently running.
    pub fn is_running(&self, name: &str) -> bool {
        self.lock().running.contains(name)
    }

    /// Unit file currently linked under `name`.
    pub fn linked_path(&self, name: &str) -> Option<PathBuf> {
        self.lock().linked.get(name).cloned()
    }

    /// All recorded calls in order.
    pub fn calls(&self) -> Vec<(UnitOp, String)> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls of `op`.
    pub fn call_count(&self, op: UnitOp) -> usize {
        self.lock().calls.iter().filter(|(o, _)| *o == op).count()
    }

    /// Deliver a status change to the subscriber, if it is relevant.
    ///
    /// Returns true if the status was delivered.
    pub async fn emit(&self, status: UnitStatus) -> bool {
        let subscriber = self.lock().subscriber.clone();
        match subscriber {
            Some((tx, relevance)) if relevance(&status.name) => tx.send(status).await.is_ok(),
            _ => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A poisoned mock only happens after a test already panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self, op: UnitOp, target: &str) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            state.calls.push((op, target.to_string()));
            state.delays.get(&op).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.fail_always.contains(&op) || state.fail_once.remove(&op) {
            return Err(SupervisorError::CommandFailed {
                command: format!("{op:?} {target}"),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl UnitManager for MockUnitManager {
    fn manager_type(&self) -> &'static str {
        "mock"
    }

    async fn start_unit(&self, name: &str) -> Result<()> {
        self.enter(UnitOp::Start, name).await?;
        self.lock().running.insert(name.to_string());
        Ok(())
    }

    async fn stop_unit(&self, name: &str) -> Result<()> {
        self.enter(UnitOp::Stop, name).await?;
        self.lock().running.remove(name);
        Ok(())
    }

    async fn restart_unit(&self, name: &str) -> Result<()> {
        self.enter(UnitOp::Restart, name).await?;
        self.lock().running.insert(name.to_string());
        Ok(())
    }

    async fn link_unit_file(&self, path: &Path) -> Result<()> {
        self.enter(UnitOp::Link, &path.display().to_string()).await?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SupervisorError::Other(format!("invalid unit path: {}", path.display())))?
            .to_string();
        self.lock().linked.insert(name, path.to_path_buf());
        Ok(())
    }

    async fn disable_unit(&self, name: &str) -> Result<()> {
        self.enter(UnitOp::Disable, name).await?;
        self.lock().linked.remove(name);
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.enter(UnitOp::Reload, "").await
    }

    async fn list_units(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .linked
            .keys()
            .chain(state.running.iter())
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn subscribe_units(
        &self,
        _interval: Duration,
        buffer: usize,
        relevance: RelevanceFilter,
    ) -> Result<UnitSubscription> {
        let (status_tx, status_rx) = mpsc::channel(buffer.max(1));
        // Errors are never produced; the sender is dropped right away.
        let (_error_tx, error_rx) = mpsc::channel(1);
        self.lock().subscriber = Some((status_tx, relevance));
        Ok(UnitSubscription {
            statuses: status_rx,
            errors: error_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_start_stop_tracks_running() {
        let manager = MockUnitManager::new();
        manager.start_unit("a.service").await.unwrap();
        assert!(manager.is_running("a.service"));
        manager.stop_unit("a.service").await.unwrap();
        assert!(!manager.is_running("a.service"));
        assert_eq!(manager.call_count(UnitOp::Start), 1);
    }

    #[tokio::test]
    async fn test_fail_once_then_succeed() {
        let manager = MockUnitManager::new();
        manager.fail_once(UnitOp::Restart);
        assert!(manager.restart_unit("a.service").await.is_err());
        assert!(!manager.is_running("a.service"));
        manager.restart_unit("a.service").await.unwrap();
        assert!(manager.is_running("a.service"));
    }

    #[tokio::test]
    async fn test_link_and_list() {
        let manager = MockUnitManager::new();
        manager
            .link_unit_file(Path::new("/srv/svc/edgevisor_svc.service"))
            .await
            .unwrap();
        manager.start_unit("other.service").await.unwrap();

        let units = manager.list_units("edgevisor_").await.unwrap();
        assert_eq!(units, vec!["edgevisor_svc.service".to_string()]);
        assert_eq!(
            manager.linked_path("edgevisor_svc.service"),
            Some(PathBuf::from("/srv/svc/edgevisor_svc.service"))
        );
    }

    #[tokio::test]
    async fn test_emit_respects_relevance() {
        let manager = MockUnitManager::new();
        let relevance: RelevanceFilter = Arc::new(|name: &str| name.starts_with("edgevisor_"));
        let mut sub = manager
            .subscribe_units(Duration::from_secs(1), 8, relevance)
            .await
            .unwrap();

        assert!(!manager.emit(UnitStatus::new("sshd.service", "active", "running")).await);
        assert!(
            manager
                .emit(UnitStatus::new("edgevisor_a.service", "active", "running"))
                .await
        );

        let status = sub.statuses.recv().await.unwrap();
        assert_eq!(status.name, "edgevisor_a.service");
    }
}
