// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Launcher core.
//!
//! The [`Launcher`] converges installed services toward what the cloud
//! requests. Every mutating operation is queued on the [`ActionHandler`]
//! keyed by service ID, so work on one service is strictly serialized while
//! different services proceed in parallel.
//!
//! ```text
//! install_service ─┐
//! uninstall_service┤                 ┌─> image / bundle / accounts
//! update_state ────┼─> ActionHandler ┼─> UnitManager (bounded by unit_timeout)
//! state_acceptance ┤   (per-ID FIFO) ├─> StorageHandler
//! set_users ───────┘                 └─> ServiceProvider
//!
//! UnitManager subscription ─> unit event loop ─> (state, status) updates
//! ```
//!
//! Install of a new service unwinds every partial side effect on failure.
//! An update that fails restores the previous version and falls back to
//! removing the service when the restore fails too.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accounts::UserProvisioner;
use crate::action::{ActionExecutor, ActionHandler, ActionTicket};
use crate::bundle::{self, ServiceLimits, SpecOptions, UnitParams};
use crate::config::{HostTools, LauncherConfig};
use crate::desired::{self, PlannedAction};
use crate::error::{Error, Result};
use crate::image::ImageProvider;
use crate::model::{
    ActionKind, ActionPayload, ActionStatus, NewState, STATUS_ERROR, STATUS_INSTALLED,
    STATUS_REMOVED, Service, ServiceAction, ServiceInfo, ServiceInfoFromCloud, ServiceState,
    ServiceStatus, ServiceStatusReport, StateAcceptance, UpdateState,
};
use crate::monitor::{self, MonitoringParams, ServiceMonitor};
use crate::provider::ServiceProvider;
use crate::rollback::Rollback;
use crate::sender::Sender;
use crate::storage::StorageHandler;
use crate::supervisor::{self, SupervisorError, UnitManager, UnitStatus};
use crate::ttl_sweeper::TtlSweeper;

/// Poll interval of the unit state subscription.
const UNIT_SUBSCRIBE_INTERVAL: Duration = Duration::from_millis(500);
/// Buffer of the unit state subscription.
const UNIT_SUBSCRIBE_BUFFER: usize = 32;

// ============================================================================
// Builder
// ============================================================================

/// Builder for creating a [`Launcher`].
pub struct LauncherBuilder {
    config: LauncherConfig,
    provider: Option<Arc<dyn ServiceProvider>>,
    units: Option<Arc<dyn UnitManager>>,
    images: Option<Arc<dyn ImageProvider>>,
    accounts: Option<Arc<dyn UserProvisioner>>,
    sender: Option<Arc<dyn Sender>>,
    monitor: Option<Arc<dyn ServiceMonitor>>,
    host_tools: Option<HostTools>,
}

impl Default for LauncherBuilder {
    fn default() -> Self {
        Self {
            config: LauncherConfig::default(),
            provider: None,
            units: None,
            images: None,
            accounts: None,
            sender: None,
            monitor: None,
            host_tools: None,
        }
    }
}

impl LauncherBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all launcher settings.
    pub fn config(mut self, config: LauncherConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the working directory.
    ///
    /// Default: `/var/lib/edgevisor`
    pub fn working_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.working_dir = path.into();
        self
    }

    /// Set the persisted record store (required).
    pub fn provider(mut self, provider: Arc<dyn ServiceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the process supervisor (required).
    pub fn unit_manager(mut self, units: Arc<dyn UnitManager>) -> Self {
        self.units = Some(units);
        self
    }

    /// Set the image provider (required).
    pub fn image_provider(mut self, images: Arc<dyn ImageProvider>) -> Self {
        self.images = Some(images);
        self
    }

    /// Set the OS user provisioner (required).
    pub fn user_provisioner(mut self, accounts: Arc<dyn UserProvisioner>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    /// Set the messaging bridge (required).
    pub fn sender(mut self, sender: Arc<dyn Sender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Set a resource monitor.
    pub fn monitor(mut self, monitor: Arc<dyn ServiceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Set host tool paths instead of discovering them on start.
    pub fn host_tools(mut self, tools: HostTools) -> Self {
        self.host_tools = Some(tools);
        self
    }

    /// Set the bound on a single supervision call.
    ///
    /// Default: 30 seconds
    pub fn unit_timeout(mut self, timeout: Duration) -> Self {
        self.config.unit_timeout = timeout;
        self
    }

    /// Set the global cap on concurrently executing actions.
    ///
    /// Default: 10
    pub fn max_concurrent_actions(mut self, max: usize) -> Self {
        self.config.max_concurrent_actions = max;
        self
    }

    /// Set the TTL sweep interval. A zero interval disables the sweeper.
    ///
    /// Default: 1 hour
    pub fn ttl_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.ttl_sweep_interval = interval;
        self
    }

    /// Set the debounce window for state file changes.
    ///
    /// Default: 1 second
    pub fn state_debounce(mut self, debounce: Duration) -> Self {
        self.config.state_debounce = debounce;
        self
    }

    /// Start the launcher: prepare the working directory, subscribe to unit
    /// state changes and spawn the TTL sweeper.
    pub async fn start(self) -> Result<(Launcher, LauncherChannels)> {
        let provider = self
            .provider
            .ok_or_else(|| Error::Other("provider is required".to_string()))?;
        let units = self
            .units
            .ok_or_else(|| Error::Other("unit manager is required".to_string()))?;
        let images = self
            .images
            .ok_or_else(|| Error::Other("image provider is required".to_string()))?;
        let accounts = self
            .accounts
            .ok_or_else(|| Error::Other("user provisioner is required".to_string()))?;
        let sender = self
            .sender
            .ok_or_else(|| Error::Other("sender is required".to_string()))?;

        let config = self.config;
        let tools = match self.host_tools {
            Some(tools) => tools,
            None => HostTools::discover(&config.working_dir)?,
        };

        tokio::fs::create_dir_all(config.services_dir()).await?;
        let template = bundle::load_unit_template(&config.working_dir)?;

        let (storage, new_states) = StorageHandler::new(
            provider.clone(),
            accounts.clone(),
            sender.clone(),
            config.storages_dir(),
            config.state_debounce,
        )?;

        let (status_tx, statuses) = mpsc::unbounded_channel();
        let max_concurrent_actions = config.max_concurrent_actions;

        let inner = Arc::new_cyclic(|weak: &Weak<LauncherInner>| {
            let executor: Weak<dyn ActionExecutor> = weak.clone();
            LauncherInner {
                actions: ActionHandler::new(executor, max_concurrent_actions),
                config,
                tools,
                template,
                provider,
                units,
                images,
                accounts,
                sender,
                monitor: self.monitor,
                storage,
                users: RwLock::new(None),
                running_units: DashMap::new(),
                status_tx,
                background: Mutex::new(Vec::new()),
            }
        });

        let launcher = Launcher { inner };
        launcher.spawn_unit_events().await?;
        launcher.spawn_ttl_sweeper();

        info!(
            working_dir = %launcher.inner.config.working_dir.display(),
            manager = launcher.inner.units.manager_type(),
            max_concurrent_actions,
            "Launcher started"
        );

        Ok((
            launcher,
            LauncherChannels {
                new_states,
                statuses,
            },
        ))
    }
}

/// Output channels of a running launcher.
pub struct LauncherChannels {
    /// Locally changed state to propose to the cloud. Bounded; the producer
    /// blocks until the consumer drains it.
    pub new_states: mpsc::Receiver<NewState>,
    /// Terminal statuses of install and uninstall actions.
    pub statuses: mpsc::UnboundedReceiver<ActionStatus>,
}

// ============================================================================
// Launcher
// ============================================================================

/// Service lifecycle orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Launcher {
    inner: Arc<LauncherInner>,
}

/// Non-owning handle to a [`Launcher`], used by background workers.
#[derive(Clone)]
pub struct WeakLauncher(Weak<LauncherInner>);

impl WeakLauncher {
    /// The launcher, if it is still alive.
    pub fn upgrade(&self) -> Option<Launcher> {
        self.0.upgrade().map(|inner| Launcher { inner })
    }

    /// Handle that never upgrades.
    #[cfg(test)]
    pub(crate) fn dangling() -> Self {
        Self(Weak::new())
    }
}

impl Launcher {
    /// Create a builder.
    pub fn builder() -> LauncherBuilder {
        LauncherBuilder::new()
    }

    /// Non-owning handle to this launcher.
    pub fn downgrade(&self) -> WeakLauncher {
        WeakLauncher(Arc::downgrade(&self.inner))
    }

    /// Queue installation, reinstall or update of a service.
    pub fn install_service(&self, info: ServiceInfoFromCloud) -> ActionTicket {
        let id = info.id.clone();
        self.queue(&id, ActionPayload::Install(info))
    }

    /// Queue full removal of a service.
    pub fn uninstall_service(&self, id: &str) -> ActionTicket {
        self.queue(id, ActionPayload::Uninstall)
    }

    /// Queue a cloud verdict on a proposed state.
    pub fn state_acceptance(
        &self,
        acceptance: StateAcceptance,
        correlation_id: impl Into<String>,
    ) -> ActionTicket {
        let id = acceptance.service_id.clone();
        self.queue(
            &id,
            ActionPayload::StateAcceptance {
                acceptance,
                correlation_id: correlation_id.into(),
            },
        )
    }

    /// Queue replacement of a service's state. The service is stopped while
    /// the state is written and started again afterwards.
    pub fn update_state(&self, state: UpdateState) -> ActionTicket {
        let id = state.service_id.clone();
        self.queue(&id, ActionPayload::UpdateState(state))
    }

    /// Switch the active user set.
    ///
    /// Does nothing if `users` equals the current set (order-sensitive).
    /// Otherwise stops the old set's services, switches, starts the new
    /// set's services and runs the TTL sweep.
    pub async fn set_users(&self, users: Vec<String>) -> Result<()> {
        let old = self.inner.current_users();
        if old.as_deref() == Some(users.as_slice()) {
            return Ok(());
        }

        info!(old = ?old, new = ?users, "Switching users");

        self.inner.stop_services(old.as_deref()).await;

        *self
            .inner
            .users
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(users.clone());

        self.inner.start_services(&users).await;

        if let Err(e) = self.sweep_expired().await {
            error!(error = %e, "TTL sweep failed");
        }

        Ok(())
    }

    /// Currently active user set.
    pub fn users(&self) -> Option<Vec<String>> {
        self.inner.current_users()
    }

    /// Services associated with the current users.
    pub async fn get_services_info(&self) -> Result<Vec<ServiceInfo>> {
        let users = self.inner.current_users().ok_or(Error::UsersNotSet)?;
        let services = self.inner.provider.get_users_services(&users).await?;

        let mut info = Vec::with_capacity(services.len());
        for service in services {
            let state_checksum = self
                .inner
                .provider
                .get_users_service(&users, &service.id)
                .await?
                .map(|entry| entry.state_checksum)
                .unwrap_or_default();

            info.push(ServiceInfo {
                id: service.id,
                version: service.version,
                status: service.status,
                state_checksum,
            });
        }

        Ok(info)
    }

    /// Number of locally changed states awaiting a cloud verdict.
    pub fn pending_state_proposals(&self) -> usize {
        self.inner.storage.pending_proposals()
    }

    /// Installed version of a service.
    pub async fn get_service_version(&self, id: &str) -> Result<u64> {
        self.inner
            .provider
            .get_service(id)
            .await?
            .map(|service| service.version)
            .ok_or_else(|| Error::NotFound(format!("service {id}")))
    }

    /// Converge the current users' services to `desired`.
    ///
    /// Queues one action per difference and returns their tickets.
    pub async fn process_desired_services(
        &self,
        desired: &[ServiceInfoFromCloud],
    ) -> Result<Vec<ActionTicket>> {
        let current = self.get_services_info().await?;
        let plan = desired::plan(&current, desired);

        info!(actions = plan.len(), "Applying desired services");

        Ok(plan
            .into_iter()
            .map(|action| match action {
                PlannedAction::Install(info) => self.install_service(info),
                PlannedAction::Update { from, info } => {
                    debug!(service_id = %info.id, from, to = info.version, "Updating service");
                    self.install_service(info)
                }
                PlannedAction::Remove { id, .. } => self.uninstall_service(&id),
            })
            .collect())
    }

    /// Remove every expired service not associated with the current users.
    /// Waits for the removals and returns how many were queued.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let inner = &self.inner;

        let active: HashSet<String> = match inner.current_users() {
            Some(users) => inner
                .provider
                .get_users_services(&users)
                .await?
                .into_iter()
                .map(|service| service.id)
                .collect(),
            None => HashSet::new(),
        };

        let now = Utc::now();
        let tickets: Vec<ActionTicket> = inner
            .provider
            .get_services()
            .await?
            .into_iter()
            .filter(|service| !active.contains(&service.id) && service.is_expired(now))
            .map(|service| {
                info!(
                    service_id = %service.id,
                    start_at = %service.start_at,
                    ttl_days = service.ttl,
                    "Service expired"
                );
                self.queue(&service.id, ActionPayload::Remove)
            })
            .collect();

        let count = tickets.len();
        futures::future::join_all(tickets.into_iter().map(ActionTicket::wait)).await;

        Ok(count)
    }

    /// Stop the current users' services and all background work.
    pub async fn close(&self) {
        info!("Closing launcher");

        let users = self.inner.current_users();
        self.inner.stop_services(users.as_deref()).await;

        let background = std::mem::take(
            &mut *self
                .inner
                .background
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for (shutdown, handle) in background {
            shutdown.notify_one();
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.inner.storage.close();
        info!("Launcher closed");
    }

    /// Remove every launcher-managed unit, user, record and directory.
    ///
    /// Used for factory reset; no launcher may be running.
    pub async fn reset(
        working_dir: &Path,
        units: &dyn UnitManager,
        accounts: &dyn UserProvisioner,
        provider: &dyn ServiceProvider,
    ) -> Result<()> {
        info!(working_dir = %working_dir.display(), "Resetting launcher state");

        match units.list_units(bundle::UNIT_PREFIX).await {
            Ok(names) => {
                for name in names {
                    debug!(unit = %name, "Removing unit");
                    if let Err(e) = units.stop_unit(&name).await {
                        warn!(unit = %name, error = %e, "Failed to stop unit");
                    }
                    if let Err(e) = units.disable_unit(&name).await {
                        warn!(unit = %name, error = %e, "Failed to disable unit");
                    }
                }
            }
            Err(e) => error!(error = %e, "Failed to list units"),
        }

        if let Err(e) = units.reload().await {
            warn!(error = %e, "Failed to reload supervisor");
        }

        for service in provider.get_services().await? {
            if let Err(e) = accounts.delete_user(&service.user_name).await {
                warn!(service_id = %service.id, error = %e, "Failed to delete user");
            }
            provider.remove_service_from_all_users(&service.id).await?;
            provider.remove_service(&service.id).await?;
        }

        let config = LauncherConfig {
            working_dir: working_dir.to_path_buf(),
            ..LauncherConfig::default()
        };
        remove_dir(&config.services_dir()).await?;
        remove_dir(&config.storages_dir()).await?;

        Ok(())
    }

    fn queue(&self, id: &str, payload: ActionPayload) -> ActionTicket {
        self.inner
            .actions
            .put_in_queue(ServiceAction::new(id, payload))
    }

    async fn spawn_unit_events(&self) -> Result<()> {
        let relevance: supervisor::RelevanceFilter =
            Arc::new(|name: &str| name.starts_with(bundle::UNIT_PREFIX));
        let mut subscription = self
            .inner
            .units
            .subscribe_units(UNIT_SUBSCRIBE_INTERVAL, UNIT_SUBSCRIBE_BUFFER, relevance)
            .await?;

        let weak = Arc::downgrade(&self.inner);
        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = stop.notified() => break,

                    status = subscription.statuses.recv() => {
                        let Some(status) = status else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        inner.handle_unit_status(status).await;
                    }

                    Some(e) = subscription.errors.recv() => {
                        error!(error = %e, "Unit subscription error");
                    }
                }
            }
            debug!("Unit event loop stopped");
        });

        self.inner.track_background(shutdown, handle);
        Ok(())
    }

    fn spawn_ttl_sweeper(&self) {
        let interval = self.inner.config.ttl_sweep_interval;
        if interval.is_zero() {
            return;
        }

        let sweeper = TtlSweeper::new(self.downgrade(), interval);
        let shutdown = sweeper.shutdown_handle();
        let handle = tokio::spawn(async move { sweeper.run().await });
        self.inner.track_background(shutdown, handle);
    }
}

// ============================================================================
// Internals
// ============================================================================

pub(crate) struct LauncherInner {
    config: LauncherConfig,
    tools: HostTools,
    template: String,
    provider: Arc<dyn ServiceProvider>,
    units: Arc<dyn UnitManager>,
    images: Arc<dyn ImageProvider>,
    accounts: Arc<dyn UserProvisioner>,
    sender: Arc<dyn Sender>,
    monitor: Option<Arc<dyn ServiceMonitor>>,
    storage: StorageHandler,
    actions: ActionHandler,
    users: RwLock<Option<Vec<String>>>,
    /// Unit name to service ID of started services.
    running_units: DashMap<String, String>,
    status_tx: mpsc::UnboundedSender<ActionStatus>,
    background: Mutex<Vec<(Arc<Notify>, JoinHandle<()>)>>,
}

#[async_trait]
impl ActionExecutor for LauncherInner {
    async fn execute(&self, action: ServiceAction) {
        let ServiceAction { id, payload } = action;

        match payload {
            ActionPayload::Install(info) => {
                let version = info.version;
                let result = self.install(&info).await;
                self.report(ActionKind::Install, &id, version, result).await;
            }
            ActionPayload::Uninstall => {
                let (version, result) = self.uninstall(&id).await;
                self.report(ActionKind::Remove, &id, version, result).await;
            }
            ActionPayload::Remove => {
                if let Err(e) = self.remove_expired(&id).await {
                    error!(service_id = %id, error = %e, "Failed to remove expired service");
                }
            }
            ActionPayload::Start => {
                if let Err(e) = self.start(&id).await {
                    error!(service_id = %id, error = %e, "Failed to start service");
                }
            }
            ActionPayload::Stop => {
                if let Err(e) = self.stop(&id).await {
                    error!(service_id = %id, error = %e, "Failed to stop service");
                }
            }
            ActionPayload::UpdateState(state) => {
                if let Err(e) = self.update_state(&state).await {
                    error!(service_id = %id, error = %e, "Failed to update state");
                }
            }
            ActionPayload::StateAcceptance {
                acceptance,
                correlation_id,
            } => {
                match self
                    .storage
                    .state_acceptance(&acceptance, &correlation_id)
                    .await
                {
                    Ok(true) => {
                        info!(service_id = %id, correlation_id = %correlation_id, "State accepted");
                    }
                    Ok(false) => {
                        info!(
                            service_id = %id,
                            correlation_id = %correlation_id,
                            "State rejected, resync requested"
                        );
                    }
                    Err(e) => {
                        error!(
                            service_id = %id,
                            correlation_id = %correlation_id,
                            error = %e,
                            "Failed to process state acceptance"
                        );
                    }
                }
            }
        }
    }
}

impl LauncherInner {
    fn current_users(&self) -> Option<Vec<String>> {
        self.users
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn track_background(&self, shutdown: Arc<Notify>, handle: JoinHandle<()>) {
        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((shutdown, handle));
    }

    async fn get_service(&self, id: &str) -> Result<Service> {
        self.provider
            .get_service(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("service {id}")))
    }

    /// Run a supervision call bounded by the unit timeout.
    async fn unit_call<T>(
        &self,
        op: &str,
        unit: &str,
        call: impl Future<Output = supervisor::Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.unit_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SupervisorError::Timeout(format!(
                "{op} {unit} after {:?}",
                self.config.unit_timeout
            ))
            .into()),
        }
    }

    // ------------------------------------------------------------------------
    // Install / update
    // ------------------------------------------------------------------------

    async fn install(&self, info: &ServiceInfoFromCloud) -> Result<()> {
        let users = self.current_users().ok_or(Error::UsersNotSet)?;
        let existing = self.provider.get_service(&info.id).await?;

        if let Some(existing) = &existing {
            if info.version < existing.version {
                return Err(Error::VersionMismatch {
                    id: info.id.clone(),
                    installed: existing.version,
                    requested: info.version,
                });
            }

            if info.version == existing.version {
                debug!(service_id = %info.id, version = info.version, "Service already installed");
                self.provider.add_service_to_users(&users, &info.id).await?;
                return self.start_service(&users, existing).await;
            }
        }

        info!(
            service_id = %info.id,
            version = info.version,
            installed = ?existing.as_ref().map(|s| s.version),
            "Installing service"
        );

        let mut rollback = Rollback::new();
        let service = match self
            .prepare_service(info, existing.as_ref(), &mut rollback)
            .await
        {
            Ok(service) => service,
            Err(e) => {
                unwind(rollback, &info.id).await;
                return Err(e);
            }
        };

        match existing {
            None => self.install_new(&users, &service, rollback).await,
            Some(old) => self.update_service(&users, &old, &service, rollback).await,
        }
    }

    /// Download and prepare a new install directory. Nothing is persisted.
    async fn prepare_service(
        &self,
        info: &ServiceInfoFromCloud,
        existing: Option<&Service>,
        rollback: &mut Rollback,
    ) -> Result<Service> {
        let install_dir = std::path::absolute(
            self.config
                .services_dir()
                .join(uuid::Uuid::new_v4().to_string()),
        )?;
        tokio::fs::create_dir_all(&install_dir).await?;
        debug!(service_id = %info.id, dir = %install_dir.display(), "Install dir created");

        let dir = install_dir.clone();
        rollback.push("remove install dir", async move { remove_dir(&dir).await });

        self.images.fetch_image(info, &install_dir).await?;

        let user_name = match existing {
            Some(old) => old.user_name.clone(),
            None => {
                let name = self.accounts.create_user(&info.id).await?;
                let accounts = self.accounts.clone();
                let user = name.clone();
                rollback.push("delete user", async move { accounts.delete_user(&user).await });
                name
            }
        };

        let (uid, gid) = self.accounts.user_ids(&user_name).await?;
        let spec = bundle::prepare_runtime_spec(
            &install_dir,
            &SpecOptions {
                working_dir: &self.config.working_dir,
                netns: &self.tools.netns,
                uid,
                gid,
            },
        )?;
        let limits = ServiceLimits::from_spec(&spec, self.config.default_service_ttl)?;

        let (set_net_limit, clear_net_limit) =
            bundle::net_limit_commands(&spec, &self.tools.wondershaper);
        let unit_name = bundle::unit_name(&info.id);
        let unit = bundle::render_unit(
            &self.template,
            &UnitParams {
                id: &info.id,
                service_path: &install_dir,
                runc: &self.tools.runc,
                set_net_limit: &set_net_limit,
                clear_net_limit: &clear_net_limit,
            },
        );
        bundle::write_unit_file(&install_dir, &unit_name, &unit)?;

        Ok(Service {
            id: info.id.clone(),
            version: info.version,
            path: install_dir.to_string_lossy().into_owned(),
            unit_name,
            user_name,
            permissions: limits.permissions.clone(),
            alert_rules: info
                .service_monitoring
                .as_ref()
                .map(|rules| rules.to_string())
                .unwrap_or_default(),
            ttl: limits.ttl,
            upload_limit: limits.upload_limit,
            download_limit: limits.download_limit,
            storage_limit: limits.storage_limit,
            state_limit: limits.state_limit,
            state: ServiceState::Init,
            status: ServiceStatus::Ok,
            start_at: Utc::now(),
        })
    }

    async fn install_new(&self, users: &[String], service: &Service, rollback: Rollback) -> Result<()> {
        let persisted = async {
            self.accounts
                .set_quota(&service.user_name, quota(service), &self.config.working_dir)
                .await?;
            self.provider.add_service(service).await
        }
        .await;

        if let Err(e) = persisted {
            unwind(rollback, &service.id).await;
            return Err(e);
        }
        rollback.commit();

        // From here on the record exists; failures remove the whole service.
        let started = async {
            self.provider.add_service_to_users(users, &service.id).await?;
            self.restart_service(users, service).await
        }
        .await;

        if let Err(e) = started {
            error!(service_id = %service.id, error = %e, "Failed to start new service, removing it");
            if let Err(cleanup) = self.remove_service(service).await {
                warn!(service_id = %service.id, error = %cleanup, "Cleanup after failed install incomplete");
            }
            return Err(e);
        }

        info!(service_id = %service.id, version = service.version, "Service installed");
        Ok(())
    }

    async fn update_service(
        &self,
        users: &[String],
        old: &Service,
        new: &Service,
        rollback: Rollback,
    ) -> Result<()> {
        let Err(e) = self.apply_update(users, old, new).await else {
            rollback.commit();
            info!(service_id = %new.id, from = old.version, to = new.version, "Service updated");
            self.report(ActionKind::Remove, &old.id, old.version, Ok(())).await;
            return Ok(());
        };

        error!(service_id = %new.id, error = %e, "Update failed, restoring previous version");

        if let Err(restore) = self.restore_service(users, old).await {
            error!(service_id = %old.id, error = %restore, "Restore failed, removing service");
            if let Err(cleanup) = self.remove_service(old).await {
                warn!(service_id = %old.id, error = %cleanup, "Removal after failed restore incomplete");
            }
            self.report(ActionKind::Remove, &old.id, old.version, Ok(())).await;
        }

        unwind(rollback, &new.id).await;
        Err(e)
    }

    async fn apply_update(&self, users: &[String], old: &Service, new: &Service) -> Result<()> {
        self.stop_service(users, old).await?;
        self.accounts
            .set_quota(&new.user_name, quota(new), &self.config.working_dir)
            .await?;
        self.provider.update_service(new).await?;
        self.provider.add_service_to_users(users, &new.id).await?;
        self.restart_service(users, new).await?;
        remove_dir(Path::new(&old.path)).await
    }

    async fn restore_service(&self, users: &[String], old: &Service) -> Result<()> {
        warn!(service_id = %old.id, version = old.version, "Restoring previous service version");

        self.running_units.remove(&old.unit_name);
        self.storage.stop_state_watching(users, old);

        let mut errors = FirstError::default();
        errors.keep(&old.id, "restore record", self.provider.update_service(old).await);
        errors.keep(
            &old.id,
            "restore quota",
            self.accounts
                .set_quota(&old.user_name, quota(old), &self.config.working_dir)
                .await,
        );
        errors.keep(&old.id, "restart", self.restart_service(users, old).await);
        errors.into_result()
    }

    // ------------------------------------------------------------------------
    // Start / stop
    // ------------------------------------------------------------------------

    /// Link, reload, mount storage and restart. Used when the unit file is new.
    async fn restart_service(&self, users: &[String], service: &Service) -> Result<()> {
        let unit_file = std::path::absolute(Path::new(&service.path).join(&service.unit_name))?;

        self.unit_call("link", &service.unit_name, self.units.link_unit_file(&unit_file))
            .await?;
        self.unit_call("reload", &service.unit_name, self.units.reload())
            .await?;
        self.storage.mount_storage_folder(users, service).await?;
        self.unit_call("restart", &service.unit_name, self.units.restart_unit(&service.unit_name))
            .await?;

        debug!(service_id = %service.id, unit = %service.unit_name, "Service restarted");
        self.mark_started(service).await;
        Ok(())
    }

    async fn start_service(&self, users: &[String], service: &Service) -> Result<()> {
        self.storage.mount_storage_folder(users, service).await?;
        self.unit_call("start", &service.unit_name, self.units.start_unit(&service.unit_name))
            .await?;

        debug!(service_id = %service.id, unit = %service.unit_name, "Service started");
        self.mark_started(service).await;
        Ok(())
    }

    async fn mark_started(&self, service: &Service) {
        if let Err(e) = self
            .update_service_state(&service.id, ServiceState::Running, ServiceStatus::Ok)
            .await
        {
            warn!(service_id = %service.id, error = %e, "Failed to update service state");
        }
        if let Err(e) = self
            .provider
            .set_service_start_time(&service.id, Utc::now())
            .await
        {
            warn!(service_id = %service.id, error = %e, "Failed to set service start time");
        }
        self.running_units
            .insert(service.unit_name.clone(), service.id.clone());
    }

    /// Stop a service. Every step runs; the first error is returned.
    async fn stop_service(&self, users: &[String], service: &Service) -> Result<()> {
        self.running_units.remove(&service.unit_name);
        self.storage.stop_state_watching(users, service);

        let mut errors = FirstError::default();
        errors.keep(
            &service.id,
            "stop unit",
            self.unit_call("stop", &service.unit_name, self.units.stop_unit(&service.unit_name))
                .await,
        );
        errors.keep(
            &service.id,
            "update state",
            self.update_service_state(&service.id, ServiceState::Stopped, ServiceStatus::Ok)
                .await,
        );

        debug!(service_id = %service.id, unit = %service.unit_name, "Service stopped");
        errors.into_result()
    }

    async fn start(&self, id: &str) -> Result<()> {
        let users = self.current_users().ok_or(Error::UsersNotSet)?;
        let service = self.get_service(id).await?;
        self.start_service(&users, &service).await
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let users = self.current_users().unwrap_or_default();
        let service = self.get_service(id).await?;
        self.stop_service(&users, &service).await
    }

    /// Stop the services of `users`, or every service when no users are set.
    async fn stop_services(&self, users: Option<&[String]>) {
        let services = match users {
            Some(users) => self.provider.get_users_services(users).await,
            None => self.provider.get_services().await,
        };
        let services = match services {
            Ok(services) => services,
            Err(e) => {
                error!(error = %e, "Failed to list services to stop");
                return;
            }
        };

        debug!(count = services.len(), users = ?users, "Stopping services");
        self.fan_out(services, || ActionPayload::Stop).await;
    }

    async fn start_services(&self, users: &[String]) {
        let services = match self.provider.get_users_services(users).await {
            Ok(services) => services,
            Err(e) => {
                error!(error = %e, "Failed to list services to start");
                return;
            }
        };

        debug!(count = services.len(), users = ?users, "Starting services");
        self.fan_out(services, || ActionPayload::Start).await;
    }

    /// Queue one action per service and wait for all of them.
    async fn fan_out(&self, services: Vec<Service>, payload: impl Fn() -> ActionPayload) {
        let tickets: Vec<ActionTicket> = services
            .into_iter()
            .map(|service| self.actions.put_in_queue(ServiceAction::new(service.id, payload())))
            .collect();
        futures::future::join_all(tickets.into_iter().map(ActionTicket::wait)).await;
    }

    // ------------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------------

    async fn uninstall(&self, id: &str) -> (u64, Result<()>) {
        let service = match self.get_service(id).await {
            Ok(service) => service,
            Err(e) => return (0, Err(e)),
        };

        if self.current_users().is_none() {
            return (service.version, Err(Error::UsersNotSet));
        }

        info!(service_id = %id, version = service.version, "Uninstalling service");
        (service.version, self.remove_service(&service).await)
    }

    async fn remove_expired(&self, id: &str) -> Result<()> {
        let Some(service) = self.provider.get_service(id).await? else {
            debug!(service_id = %id, "Expired service already removed");
            return Ok(());
        };

        if let Some(users) = self.current_users() {
            if self.provider.get_users_service(&users, id).await?.is_some() {
                debug!(service_id = %id, "Service is in use again, skipping removal");
                return Ok(());
            }
        }

        self.remove_service(&service).await
    }

    /// Best-effort full removal of a service.
    async fn remove_service(&self, service: &Service) -> Result<()> {
        info!(service_id = %service.id, version = service.version, "Removing service");

        let id = service.id.as_str();
        let mut errors = FirstError::default();

        errors.keep(id, "stop", self.stop_service(&[], service).await);
        self.storage.forget_service(id);
        errors.keep(
            id,
            "disable unit",
            self.unit_call("disable", &service.unit_name, self.units.disable_unit(&service.unit_name))
                .await,
        );

        match self.provider.get_users_services_by_service_id(id).await {
            Ok(entries) => {
                for entry in &entries {
                    errors.keep(
                        id,
                        "remove storage folder",
                        self.storage.remove_storage_folder(entry).await,
                    );
                }
            }
            Err(e) => errors.keep(id, "list associations", Err(e)),
        }

        errors.keep(
            id,
            "remove associations",
            self.provider.remove_service_from_all_users(id).await,
        );
        errors.keep(id, "remove record", self.provider.remove_service(id).await);
        errors.keep(
            id,
            "remove install dir",
            remove_dir(Path::new(&service.path)).await,
        );
        errors.keep(
            id,
            "delete user",
            self.accounts.delete_user(&service.user_name).await,
        );

        errors.into_result()
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    async fn update_state(&self, state: &UpdateState) -> Result<()> {
        let users = self.current_users().ok_or(Error::UsersNotSet)?;
        let service = self.get_service(&state.service_id).await?;

        self.stop_service(&users, &service).await?;
        let written = self
            .storage
            .update_state(&users, &service, &state.state, &state.checksum)
            .await;
        let started = self.start_service(&users, &service).await;

        written.and(started)
    }

    /// Persist `(state, status)`, notifying the monitor on state changes.
    async fn update_service_state(
        &self,
        id: &str,
        state: ServiceState,
        status: ServiceStatus,
    ) -> Result<()> {
        let service = self.get_service(id).await?;

        if service.state != state {
            if let Some(monitor) = &self.monitor {
                if let Err(e) = self.update_monitoring(monitor.as_ref(), &service, state).await {
                    warn!(service_id = %id, error = %e, "Failed to update monitoring");
                }
            }

            debug!(service_id = %id, state = state.as_str(), "Set service state");
            self.provider.set_service_state(id, state).await?;
        }

        if service.status != status {
            debug!(service_id = %id, status = status.as_str(), "Set service status");
            self.provider.set_service_status(id, status).await?;
        }

        Ok(())
    }

    async fn update_monitoring(
        &self,
        monitor: &dyn ServiceMonitor,
        service: &Service,
        state: ServiceState,
    ) -> Result<()> {
        match state {
            ServiceState::Running => {
                let path = Path::new(&service.path);
                let storage_folder = match self.current_users() {
                    Some(users) => self
                        .provider
                        .get_users_service(&users, &service.id)
                        .await?
                        .map(|entry| entry.storage_folder)
                        .unwrap_or_default(),
                    None => String::new(),
                };

                monitor
                    .start_monitoring(
                        &service.id,
                        MonitoringParams {
                            pid: monitor::read_pid(path).await?,
                            ip: monitor::read_ip(path).await,
                            storage_folder,
                            upload_limit: service.upload_limit,
                            download_limit: service.download_limit,
                            alert_rules: service.alert_rules.clone(),
                        },
                    )
                    .await
            }
            ServiceState::Stopped => monitor.stop_monitoring(&service.id).await,
            ServiceState::Init => Ok(()),
        }
    }

    async fn handle_unit_status(&self, status: UnitStatus) {
        debug!(
            unit = %status.name,
            active_state = %status.active_state,
            sub_state = %status.sub_state,
            "Unit state changed"
        );

        let Some(id) = self
            .running_units
            .get(&status.name)
            .map(|entry| entry.value().clone())
        else {
            warn!(unit = %status.name, "Unit state change for unknown service");
            return;
        };

        let (state, health) = if status.is_running() {
            (ServiceState::Running, ServiceStatus::Ok)
        } else {
            (ServiceState::Stopped, ServiceStatus::Error)
        };

        if let Err(e) = self.update_service_state(&id, state, health).await {
            error!(service_id = %id, error = %e, "Failed to update service state");
        }
    }

    // ------------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------------

    async fn report(&self, action: ActionKind, id: &str, version: u64, result: Result<()>) {
        let error = match result {
            Ok(()) => {
                debug!(service_id = id, version, action = ?action, "Action succeeded");
                None
            }
            Err(e) => {
                error!(service_id = id, version, action = ?action, error = %e, "Action failed");
                Some(e.to_string())
            }
        };

        let status = match (action, &error) {
            (_, Some(_)) => STATUS_ERROR,
            (ActionKind::Install, None) => STATUS_INSTALLED,
            (ActionKind::Remove, None) => STATUS_REMOVED,
        };

        if self
            .status_tx
            .send(ActionStatus {
                action,
                id: id.to_string(),
                version,
                error: error.clone(),
            })
            .is_err()
        {
            debug!(service_id = id, "Status receiver dropped");
        }

        if let Err(e) = self
            .sender
            .send_service_status(ServiceStatusReport {
                id: id.to_string(),
                version,
                status: status.to_string(),
                error,
            })
            .await
        {
            warn!(service_id = id, error = %e, "Failed to send service status");
        }
    }
}

/// First error of a best-effort sequence; later errors are only logged.
#[derive(Default)]
struct FirstError(Option<Error>);

impl FirstError {
    fn keep(&mut self, service_id: &str, step: &'static str, result: Result<()>) {
        if let Err(e) = result {
            warn!(service_id, step, error = %e, "Step failed, continuing");
            self.0.get_or_insert(e);
        }
    }

    fn into_result(self) -> Result<()> {
        self.0.map_or(Ok(()), Err)
    }
}

/// Filesystem quota of a service user.
fn quota(service: &Service) -> u64 {
    service.storage_limit.saturating_add(service.state_limit)
}

async fn unwind(rollback: Rollback, service_id: &str) {
    if let Err(e) = rollback.unwind().await {
        warn!(service_id, error = %e, "Rollback incomplete");
    }
}

async fn remove_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_keeps_first() {
        let mut errors = FirstError::default();
        errors.keep("svc", "one", Ok(()));
        errors.keep("svc", "two", Err(Error::Other("first".to_string())));
        errors.keep("svc", "three", Err(Error::Other("second".to_string())));

        match errors.into_result() {
            Err(Error::Other(message)) => assert_eq!(message, "first"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_quota_adds_storage_and_state() {
        let service = Service {
            id: "svc".to_string(),
            version: 1,
            path: String::new(),
            unit_name: bundle::unit_name("svc"),
            user_name: String::new(),
            permissions: String::new(),
            alert_rules: String::new(),
            ttl: 30,
            upload_limit: 0,
            download_limit: 0,
            storage_limit: 1024,
            state_limit: 256,
            state: ServiceState::Init,
            status: ServiceStatus::Ok,
            start_at: Utc::now(),
        };
        assert_eq!(quota(&service), 1280);
    }

    #[tokio::test]
    async fn test_remove_dir_ignores_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("gone");
        remove_dir(&target).await.unwrap();

        std::fs::create_dir_all(target.join("nested")).unwrap();
        remove_dir(&target).await.unwrap();
        assert!(!target.exists());
    }
}
