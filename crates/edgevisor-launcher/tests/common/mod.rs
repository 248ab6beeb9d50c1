// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for edgevisor-launcher integration tests.
//!
//! Provides TestContext wiring a launcher to a temporary working directory,
//! the SQLite provider, the mock unit manager and in-memory collaborators.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use edgevisor_launcher::accounts::UserProvisioner;
use edgevisor_launcher::bundle::{ANNOTATION_PREFIX, SPEC_FILE};
use edgevisor_launcher::config::HostTools;
use edgevisor_launcher::error::{Error, Result};
use edgevisor_launcher::image::ImageProvider;
use edgevisor_launcher::model::{ActionStatus, Service, ServiceInfoFromCloud};
use edgevisor_launcher::monitor::{IP_FILE, MonitoringParams, PID_FILE, ServiceMonitor};
use edgevisor_launcher::provider::{ServiceProvider, SqliteServiceProvider};
use edgevisor_launcher::sender::MemorySender;
use edgevisor_launcher::supervisor::MockUnitManager;
use edgevisor_launcher::{Launcher, LauncherChannels};

/// PID written into every unpacked test image.
pub const TEST_PID: i32 = 4242;
/// IP written into every unpacked test image.
pub const TEST_IP: &str = "10.0.0.2";

/// Build an install request.
pub fn service_info(id: &str, version: u64) -> ServiceInfoFromCloud {
    ServiceInfoFromCloud {
        id: id.to_string(),
        version,
        download_url: format!("file:///images/{id}-{version}.tar.gz"),
        sha256: String::new(),
        service_monitoring: None,
    }
}

/// Build a user set.
pub fn users(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

/// Poll `check` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// ============================================================================
// Stub collaborators
// ============================================================================

/// Image provider writing a minimal runtime spec instead of downloading.
#[derive(Default)]
pub struct StubImageProvider {
    annotations: Mutex<HashMap<String, BTreeMap<String, String>>>,
    failing: Mutex<HashSet<String>>,
    fetched: Mutex<Vec<(String, u64)>>,
}

impl StubImageProvider {
    /// Add an annotation (without prefix) to every image of `id`.
    pub fn set_annotation(&self, id: &str, key: &str, value: &str) {
        self.annotations
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .insert(format!("{ANNOTATION_PREFIX}{key}"), value.to_string());
    }

    /// Make every fetch of `id` fail.
    pub fn fail_for(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    /// Fetched (id, version) pairs in order.
    pub fn fetched(&self) -> Vec<(String, u64)> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageProvider for StubImageProvider {
    async fn fetch_image(&self, info: &ServiceInfoFromCloud, dest: &Path) -> Result<()> {
        self.fetched
            .lock()
            .unwrap()
            .push((info.id.clone(), info.version));

        if self.failing.lock().unwrap().contains(&info.id) {
            return Err(Error::Image(format!("download of {} failed", info.download_url)));
        }

        let annotations = self
            .annotations
            .lock()
            .unwrap()
            .get(&info.id)
            .cloned()
            .unwrap_or_default();

        let spec = json!({
            "ociVersion": "1.0.2",
            "process": {
                "terminal": true,
                "user": { "uid": 0, "gid": 0 },
                "args": ["/bin/app"],
                "cwd": "/"
            },
            "root": { "path": "rootfs" },
            "mounts": [
                { "destination": "/proc", "type": "proc", "source": "proc" }
            ],
            "annotations": annotations
        });

        std::fs::write(dest.join(SPEC_FILE), serde_json::to_string_pretty(&spec)?)?;
        std::fs::write(dest.join(PID_FILE), TEST_PID.to_string())?;
        std::fs::write(dest.join(IP_FILE), TEST_IP)?;
        Ok(())
    }
}

/// User provisioner tracking users in memory and mapping all of them to the
/// current process identity.
#[derive(Default)]
pub struct TestAccounts {
    users: Mutex<HashSet<String>>,
    quotas: Mutex<HashMap<String, u64>>,
    created: AtomicUsize,
}

impl TestAccounts {
    /// Whether `name` currently exists.
    pub fn exists(&self, name: &str) -> bool {
        self.users.lock().unwrap().contains(name)
    }

    /// Number of existing users.
    pub fn count(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    /// Number of users ever created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Last quota set for `name`.
    pub fn quota(&self, name: &str) -> Option<u64> {
        self.quotas.lock().unwrap().get(name).copied()
    }
}

#[async_trait]
impl UserProvisioner for TestAccounts {
    async fn create_user(&self, _service_id: &str) -> Result<String> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let name = format!("edgevisor_test{n}");
        self.users.lock().unwrap().insert(name.clone());
        Ok(name)
    }

    async fn delete_user(&self, name: &str) -> Result<()> {
        self.users.lock().unwrap().remove(name);
        Ok(())
    }

    async fn user_ids(&self, name: &str) -> Result<(u32, u32)> {
        if !self.exists(name) {
            return Err(Error::Account(format!("user {name} does not exist")));
        }
        Ok((nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw()))
    }

    async fn set_quota(&self, name: &str, limit_bytes: u64, _path: &Path) -> Result<()> {
        self.quotas
            .lock()
            .unwrap()
            .insert(name.to_string(), limit_bytes);
        Ok(())
    }
}

/// Monitoring call recorded by [`RecordingMonitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorCall {
    Start(String, MonitoringParams),
    Stop(String),
}

/// Monitor recording every call.
#[derive(Default)]
pub struct RecordingMonitor {
    calls: Mutex<Vec<MonitorCall>>,
}

impl RecordingMonitor {
    pub fn calls(&self) -> Vec<MonitorCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceMonitor for RecordingMonitor {
    async fn start_monitoring(&self, service_id: &str, params: MonitoringParams) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(MonitorCall::Start(service_id.to_string(), params));
        Ok(())
    }

    async fn stop_monitoring(&self, service_id: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(MonitorCall::Stop(service_id.to_string()));
        Ok(())
    }
}

// ============================================================================
// Test context
// ============================================================================

/// Options for [`TestContext::start`].
pub struct TestOptions {
    pub unit_timeout: Duration,
    pub monitor: Option<Arc<RecordingMonitor>>,
    pub users: Option<Vec<String>>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            unit_timeout: Duration::from_secs(5),
            monitor: None,
            users: Some(users(&["userA"])),
        }
    }
}

/// A running launcher on a temporary working directory.
pub struct TestContext {
    pub launcher: Launcher,
    pub channels: LauncherChannels,
    pub provider: Arc<SqliteServiceProvider>,
    pub units: Arc<MockUnitManager>,
    pub images: Arc<StubImageProvider>,
    pub accounts: Arc<TestAccounts>,
    pub sender: Arc<MemorySender>,
    pub working_dir: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Launcher with users `["userA"]` set.
    pub async fn new() -> Self {
        Self::start(TestOptions::default()).await
    }

    /// Launcher without any user set.
    pub async fn without_users() -> Self {
        Self::start(TestOptions {
            users: None,
            ..Default::default()
        })
        .await
    }

    pub async fn start(options: TestOptions) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let working_dir = temp_dir.path().to_path_buf();

        let provider = Arc::new(
            SqliteServiceProvider::from_path(working_dir.join("services.db"))
                .await
                .expect("Failed to open database"),
        );
        let units = Arc::new(MockUnitManager::new());
        let images = Arc::new(StubImageProvider::default());
        let accounts = Arc::new(TestAccounts::default());
        let sender = Arc::new(MemorySender::new());

        let mut builder = Launcher::builder()
            .working_dir(&working_dir)
            .provider(provider.clone())
            .unit_manager(units.clone())
            .image_provider(images.clone())
            .user_provisioner(accounts.clone())
            .sender(sender.clone())
            .host_tools(HostTools {
                runc: PathBuf::from("/usr/bin/runc"),
                netns: PathBuf::from("/usr/bin/netns"),
                wondershaper: PathBuf::from("/usr/bin/wondershaper"),
            })
            .unit_timeout(options.unit_timeout)
            .state_debounce(Duration::from_millis(50))
            .ttl_sweep_interval(Duration::ZERO);

        if let Some(monitor) = options.monitor {
            builder = builder.monitor(monitor);
        }

        let (launcher, channels) = builder.start().await.expect("Failed to start launcher");

        if let Some(users) = options.users {
            launcher.set_users(users).await.expect("Failed to set users");
        }

        Self {
            launcher,
            channels,
            provider,
            units,
            images,
            accounts,
            sender,
            working_dir,
            _temp_dir: temp_dir,
        }
    }

    /// Install a service and wait for the action to finish.
    pub async fn install(&self, id: &str, version: u64) {
        self.launcher
            .install_service(service_info(id, version))
            .wait()
            .await;
    }

    /// Persisted record of `id`.
    pub async fn service(&self, id: &str) -> Option<Service> {
        self.provider.get_service(id).await.expect("Failed to read service")
    }

    /// Install directories currently present.
    pub fn install_dirs(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.working_dir.join("services")) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Every status emitted so far.
    pub fn drain_statuses(&mut self) -> Vec<ActionStatus> {
        let mut statuses = Vec::new();
        while let Ok(status) = self.channels.statuses.try_recv() {
            statuses.push(status);
        }
        statuses
    }
}
