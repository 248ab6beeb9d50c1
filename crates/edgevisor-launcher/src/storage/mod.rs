// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-user service storage and state exchange.
//!
//! Every (user set, service) association gets its own storage folder,
//! bind-mounted into the service at [`STORAGE_MOUNT_POINT`]. Services with a
//! non-zero state limit also keep a state blob in `state.dat` inside that
//! folder. The handler:
//!
//! - proposes locally changed state to the cloud ([`NewState`]),
//! - commits or discards proposals on the cloud's verdict,
//! - writes cloud-pushed state,
//! - asks the cloud for state when the local copy is out of sync.
//!
//! Folder and mount setup is idempotent; the launcher calls
//! [`StorageHandler::mount_storage_folder`] on every start.

mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::accounts::UserProvisioner;
use crate::bundle;
use crate::error::{Error, Result};
use crate::model::{NewState, Service, StateAcceptance, UsersService};
use crate::provider::ServiceProvider;
use crate::sender::Sender;

use watcher::{StateWatcher, WatchContext};

/// State file name inside a storage folder.
pub const STATE_FILE: &str = "state.dat";
/// Path of the storage folder inside the service.
pub const STORAGE_MOUNT_POINT: &str = "/home/service/storage";
/// Capacity of the [`NewState`] channel.
pub const NEW_STATE_CHANNEL_SIZE: usize = 32;

/// sha256 of a state blob.
pub fn checksum(state: &[u8]) -> Vec<u8> {
    Sha256::digest(state).to_vec()
}

/// Deterministic storage folder for a user set and service.
pub fn storage_folder_path(storages_dir: &Path, users: &[String], service_id: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    for user in users {
        hasher.update(user.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(service_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    storages_dir.join(&digest[..16])
}

/// A state proposal awaiting the cloud's verdict.
#[derive(Debug, Clone)]
pub(crate) struct PendingState {
    pub service_id: String,
    pub users: Vec<String>,
    pub checksum: Vec<u8>,
}

/// Storage and state handler.
pub struct StorageHandler {
    provider: Arc<dyn ServiceProvider>,
    accounts: Arc<dyn UserProvisioner>,
    sender: Arc<dyn Sender>,
    storages_dir: PathBuf,
    debounce: Duration,
    watchers: DashMap<String, StateWatcher>,
    ctx: WatchContext,
}

impl StorageHandler {
    /// Create a handler. Returns the receiving end of the [`NewState`] channel.
    pub fn new(
        provider: Arc<dyn ServiceProvider>,
        accounts: Arc<dyn UserProvisioner>,
        sender: Arc<dyn Sender>,
        storages_dir: PathBuf,
        debounce: Duration,
    ) -> Result<(Self, mpsc::Receiver<NewState>)> {
        std::fs::create_dir_all(&storages_dir)?;
        let (new_state_tx, new_state_rx) = mpsc::channel(NEW_STATE_CHANNEL_SIZE);

        Ok((
            Self {
                provider,
                accounts,
                sender,
                storages_dir,
                debounce,
                watchers: DashMap::new(),
                ctx: WatchContext {
                    new_state_tx,
                    pending: Arc::new(DashMap::new()),
                    last_checksums: Arc::new(DashMap::new()),
                },
            },
            new_state_rx,
        ))
    }

    /// Make sure the association's storage folder exists and is mounted into
    /// the service, then start state watching if the service keeps state.
    ///
    /// Calling this for an already mounted and watched service does nothing.
    pub async fn mount_storage_folder(&self, users: &[String], service: &Service) -> Result<()> {
        if self.watchers.contains_key(&service.id) {
            return Ok(());
        }

        let entry = self
            .provider
            .get_users_service(users, &service.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("users service {}", service.id)))?;

        let folder = if entry.storage_folder.is_empty() {
            storage_folder_path(&self.storages_dir, users, &service.id)
        } else {
            PathBuf::from(&entry.storage_folder)
        };

        if !folder.exists() {
            tokio::fs::create_dir_all(&folder).await?;
            let (uid, gid) = self.accounts.user_ids(&service.user_name).await?;
            nix::unistd::chown(
                &folder,
                Some(nix::unistd::Uid::from_raw(uid)),
                Some(nix::unistd::Gid::from_raw(gid)),
            )
            .map_err(|e| Error::Other(format!("chown of {} failed: {e}", folder.display())))?;
            debug!(service_id = %service.id, folder = %folder.display(), "Storage folder created");
        }

        if bundle::ensure_bind_mount(Path::new(&service.path), &folder, STORAGE_MOUNT_POINT)? {
            debug!(service_id = %service.id, "Storage mount added to runtime spec");
        }

        if entry.storage_folder.is_empty() {
            self.provider
                .set_users_storage_folder(users, &service.id, &folder.to_string_lossy())
                .await?;
        }

        if service.state_limit == 0 {
            return Ok(());
        }

        self.check_state(users, service, &entry, &folder).await?;

        let watcher = StateWatcher::start(
            service.id.clone(),
            users.to_vec(),
            folder,
            self.debounce,
            self.ctx.clone(),
        )?;
        self.watchers.insert(service.id.clone(), watcher);

        Ok(())
    }

    /// Request state from the cloud if no state was ever accepted or the
    /// local state does not match the last accepted checksum.
    async fn check_state(
        &self,
        users: &[String],
        service: &Service,
        entry: &UsersService,
        folder: &Path,
    ) -> Result<()> {
        let local = match tokio::fs::read(folder.join(STATE_FILE)).await {
            Ok(state) => checksum(&state),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        self.ctx
            .last_checksums
            .insert(service.id.clone(), entry.state_checksum.clone());

        // Nothing accepted yet: the cloud holds the default state.
        let use_default = entry.state_checksum.is_empty();
        if use_default || local != entry.state_checksum {
            info!(
                service_id = %service.id,
                users = ?users,
                use_default,
                "Local state out of sync, requesting state"
            );
            self.sender.send_state_request(&service.id, use_default).await?;
        }

        Ok(())
    }

    /// Stop watching the service's state. Safe to call when not watching.
    pub fn stop_state_watching(&self, users: &[String], service: &Service) {
        // Remounting reloads the accepted checksum.
        self.ctx.last_checksums.remove(&service.id);
        if self.watchers.remove(&service.id).is_some() {
            debug!(service_id = %service.id, users = ?users, "State watching stopped");
        }
    }

    /// Replace the service state with a cloud-provided blob.
    ///
    /// The service must be stopped; the caller restarts it afterwards.
    pub async fn update_state(
        &self,
        users: &[String],
        service: &Service,
        state: &[u8],
        expected_checksum: &[u8],
    ) -> Result<()> {
        if service.state_limit == 0 {
            return Err(Error::InvalidState(format!("service {} has no state", service.id)));
        }
        if state.len() as u64 > service.state_limit {
            return Err(Error::InvalidState(format!(
                "state of {} bytes exceeds limit of {}",
                state.len(),
                service.state_limit
            )));
        }
        let sum = checksum(state);
        if sum != expected_checksum {
            return Err(Error::InvalidState("checksum mismatch".to_string()));
        }

        let entry = self
            .provider
            .get_users_service(users, &service.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("users service {}", service.id)))?;
        if entry.storage_folder.is_empty() {
            return Err(Error::InvalidState(format!(
                "storage of {} is not mounted",
                service.id
            )));
        }

        let folder = Path::new(&entry.storage_folder);
        let tmp = folder.join(format!(".{STATE_FILE}.tmp"));
        tokio::fs::write(&tmp, state).await?;
        tokio::fs::rename(&tmp, folder.join(STATE_FILE)).await?;

        self.ctx.last_checksums.insert(service.id.clone(), sum.clone());
        self.provider
            .set_users_state_checksum(users, &service.id, &sum)
            .await?;

        info!(service_id = %service.id, size = state.len(), "State updated");
        Ok(())
    }

    /// Drop proposals and checksum history of a removed service.
    ///
    /// Verdicts arriving later for its proposals resolve as not found.
    pub fn forget_service(&self, service_id: &str) {
        self.watchers.remove(service_id);
        self.ctx.last_checksums.remove(service_id);

        let before = self.ctx.pending.len();
        self.ctx.pending.retain(|_, pending| pending.service_id != service_id);
        let dropped = before.saturating_sub(self.ctx.pending.len());
        if dropped > 0 {
            debug!(service_id, dropped, "Dropped pending state proposals");
        }
    }

    /// Resolve a pending proposal. Returns whether the state was accepted.
    ///
    /// Accepted proposals commit their checksum; rejected ones leave storage
    /// untouched and ask the cloud for the last accepted state.
    pub async fn state_acceptance(
        &self,
        acceptance: &StateAcceptance,
        correlation_id: &str,
    ) -> Result<bool> {
        let (_, pending) = self
            .ctx
            .pending
            .remove(correlation_id)
            .ok_or_else(|| Error::NotFound(format!("state proposal {correlation_id}")))?;

        if pending.service_id != acceptance.service_id {
            return Err(Error::InvalidState(format!(
                "proposal {correlation_id} belongs to {}, not {}",
                pending.service_id, acceptance.service_id
            )));
        }

        if !acceptance.is_accepted() {
            warn!(
                service_id = %pending.service_id,
                correlation_id,
                reason = %acceptance.reason,
                "State rejected"
            );
            self.ctx.last_checksums.remove(&pending.service_id);
            self.sender
                .send_state_request(&pending.service_id, false)
                .await?;
            return Ok(false);
        }

        self.provider
            .set_users_state_checksum(&pending.users, &pending.service_id, &pending.checksum)
            .await?;
        Ok(true)
    }

    /// Delete an association's storage folder.
    pub async fn remove_storage_folder(&self, entry: &UsersService) -> Result<()> {
        if entry.storage_folder.is_empty() {
            return Ok(());
        }

        debug!(service_id = %entry.service_id, folder = %entry.storage_folder, "Removing storage folder");
        match tokio::fs::remove_dir_all(&entry.storage_folder).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the service's state is being watched.
    pub fn is_watching(&self, service_id: &str) -> bool {
        self.watchers.contains_key(service_id)
    }

    /// Number of proposals awaiting a verdict.
    pub fn pending_proposals(&self) -> usize {
        self.ctx.pending.len()
    }

    /// Stop every watcher.
    pub fn close(&self) {
        self.watchers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServiceState, ServiceStatus};
    use crate::provider::SqliteServiceProvider;
    use crate::sender::MemorySender;
    use async_trait::async_trait;
    use chrono::Utc;
    use tempfile::TempDir;

    struct CurrentUser;

    #[async_trait]
    impl UserProvisioner for CurrentUser {
        async fn create_user(&self, _service_id: &str) -> Result<String> {
            Ok("current".to_string())
        }
        async fn delete_user(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn user_ids(&self, _name: &str) -> Result<(u32, u32)> {
            Ok((nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw()))
        }
        async fn set_quota(&self, _name: &str, _limit: u64, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        handler: StorageHandler,
        new_states: mpsc::Receiver<NewState>,
        provider: Arc<SqliteServiceProvider>,
        sender: Arc<MemorySender>,
        service: Service,
        users: Vec<String>,
    }

    async fn fixture(state_limit: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(
            SqliteServiceProvider::from_path(dir.path().join("services.db"))
                .await
                .unwrap(),
        );
        let sender = Arc::new(MemorySender::new());

        let service_dir = dir.path().join("services/svc1");
        std::fs::create_dir_all(&service_dir).unwrap();
        std::fs::write(service_dir.join(bundle::SPEC_FILE), "{}").unwrap();

        let service = Service {
            id: "svc1".to_string(),
            version: 1,
            path: service_dir.to_string_lossy().into_owned(),
            unit_name: bundle::unit_name("svc1"),
            user_name: "current".to_string(),
            permissions: String::new(),
            alert_rules: String::new(),
            ttl: 30,
            upload_limit: 0,
            download_limit: 0,
            storage_limit: 0,
            state_limit,
            state: ServiceState::Init,
            status: ServiceStatus::Ok,
            start_at: Utc::now(),
        };
        let users = vec!["alice".to_string()];
        provider.add_service(&service).await.unwrap();
        provider.add_service_to_users(&users, "svc1").await.unwrap();

        let (handler, new_states) = StorageHandler::new(
            provider.clone(),
            Arc::new(CurrentUser),
            sender.clone(),
            dir.path().join("storages"),
            Duration::from_millis(50),
        )
        .unwrap();

        Fixture {
            _dir: dir,
            handler,
            new_states,
            provider,
            sender,
            service,
            users,
        }
    }

    #[test]
    fn test_storage_folder_path_is_deterministic() {
        let base = Path::new("/storages");
        let users = vec!["a".to_string(), "b".to_string()];
        let first = storage_folder_path(base, &users, "svc");
        assert_eq!(first, storage_folder_path(base, &users, "svc"));
        assert_eq!(first.file_name().unwrap().len(), 16);

        let reversed = vec!["b".to_string(), "a".to_string()];
        assert_ne!(first, storage_folder_path(base, &reversed, "svc"));
        assert_ne!(first, storage_folder_path(base, &users, "other"));
    }

    #[tokio::test]
    async fn test_mount_is_idempotent() {
        let f = fixture(0).await;

        f.handler.mount_storage_folder(&f.users, &f.service).await.unwrap();
        let entry = f.provider.get_users_service(&f.users, "svc1").await.unwrap().unwrap();
        assert!(!entry.storage_folder.is_empty());
        assert!(Path::new(&entry.storage_folder).is_dir());

        f.handler.mount_storage_folder(&f.users, &f.service).await.unwrap();
        let spec = bundle::RuntimeSpec::load(Path::new(&f.service.path)).unwrap();
        let mounts: Vec<_> = spec
            .mounts
            .iter()
            .filter(|m| m.destination == STORAGE_MOUNT_POINT)
            .collect();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].source, entry.storage_folder);
        // no state, no watcher
        assert!(!f.handler.is_watching("svc1"));
    }

    #[tokio::test]
    async fn test_mount_without_association_is_not_found() {
        let f = fixture(0).await;
        let err = f
            .handler
            .mount_storage_folder(&["bob".to_string()], &f.service)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_mount_requests_default_state_when_never_accepted() {
        let f = fixture(1024).await;

        f.handler.mount_storage_folder(&f.users, &f.service).await.unwrap();
        assert!(f.handler.is_watching("svc1"));
        assert_eq!(f.sender.state_requests_for("svc1"), vec![true]);

        f.handler.stop_state_watching(&f.users, &f.service);
        assert!(!f.handler.is_watching("svc1"));
        // stopping twice is fine
        f.handler.stop_state_watching(&f.users, &f.service);
    }

    #[tokio::test]
    async fn test_update_state_validates_and_persists() {
        let f = fixture(8).await;
        f.handler.mount_storage_folder(&f.users, &f.service).await.unwrap();
        f.handler.stop_state_watching(&f.users, &f.service);

        let state = b"abc".to_vec();
        let sum = checksum(&state);

        let err = f
            .handler
            .update_state(&f.users, &f.service, &state, &checksum(b"other"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let too_big = b"0123456789".to_vec();
        let err = f
            .handler
            .update_state(&f.users, &f.service, &too_big, &checksum(&too_big))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        f.handler
            .update_state(&f.users, &f.service, &state, &sum)
            .await
            .unwrap();

        let entry = f.provider.get_users_service(&f.users, "svc1").await.unwrap().unwrap();
        assert_eq!(entry.state_checksum, sum);
        let on_disk = std::fs::read(Path::new(&entry.storage_folder).join(STATE_FILE)).unwrap();
        assert_eq!(on_disk, state);

        // in sync now: remount sends no further request
        f.handler.mount_storage_folder(&f.users, &f.service).await.unwrap();
        assert_eq!(f.sender.state_requests_for("svc1"), vec![true]);
    }

    #[tokio::test]
    async fn test_local_change_is_proposed_and_accepted() {
        let mut f = fixture(1024).await;
        f.handler.mount_storage_folder(&f.users, &f.service).await.unwrap();
        let entry = f.provider.get_users_service(&f.users, "svc1").await.unwrap().unwrap();

        std::fs::write(Path::new(&entry.storage_folder).join(STATE_FILE), b"local").unwrap();

        let proposal = tokio::time::timeout(Duration::from_secs(5), f.new_states.recv())
            .await
            .expect("no state proposal")
            .unwrap();
        assert_eq!(proposal.service_id, "svc1");
        assert_eq!(proposal.state, b"local");
        assert_eq!(f.handler.pending_proposals(), 1);

        let acceptance = StateAcceptance {
            service_id: "svc1".to_string(),
            checksum: proposal.checksum.clone(),
            result: "accepted".to_string(),
            reason: String::new(),
        };
        assert!(
            f.handler
                .state_acceptance(&acceptance, &proposal.correlation_id)
                .await
                .unwrap()
        );

        let entry = f.provider.get_users_service(&f.users, "svc1").await.unwrap().unwrap();
        assert_eq!(entry.state_checksum, checksum(b"local"));
        assert_eq!(f.handler.pending_proposals(), 0);

        f.handler.stop_state_watching(&f.users, &f.service);
        assert!(!f.handler.is_watching("svc1"));
        assert!(!f.handler.ctx.last_checksums.contains_key("svc1"));

        f.handler.mount_storage_folder(&f.users, &f.service).await.unwrap();
        assert!(f.handler.is_watching("svc1"));
        f.handler.close();
        assert!(!f.handler.is_watching("svc1"));
    }

    #[tokio::test]
    async fn test_rejected_state_requests_resync() {
        let f = fixture(1024).await;
        f.handler.ctx.pending.insert(
            "corr-1".to_string(),
            PendingState {
                service_id: "svc1".to_string(),
                users: f.users.clone(),
                checksum: checksum(b"bad"),
            },
        );

        let acceptance = StateAcceptance {
            service_id: "svc1".to_string(),
            checksum: checksum(b"bad"),
            result: "rejected".to_string(),
            reason: "too old".to_string(),
        };
        assert!(!f.handler.state_acceptance(&acceptance, "corr-1").await.unwrap());

        let entry = f.provider.get_users_service(&f.users, "svc1").await.unwrap().unwrap();
        assert!(entry.state_checksum.is_empty());
        assert_eq!(f.sender.state_requests_for("svc1"), vec![false]);
    }

    #[tokio::test]
    async fn test_forget_service_drops_pending_proposals() {
        let f = fixture(1024).await;
        f.handler.mount_storage_folder(&f.users, &f.service).await.unwrap();
        for (correlation_id, service_id) in [("corr-1", "svc1"), ("corr-2", "svc2")] {
            f.handler.ctx.pending.insert(
                correlation_id.to_string(),
                PendingState {
                    service_id: service_id.to_string(),
                    users: f.users.clone(),
                    checksum: checksum(b"local"),
                },
            );
        }
        f.handler.ctx.last_checksums.insert("svc2".to_string(), checksum(b"local"));
        assert!(f.handler.ctx.last_checksums.contains_key("svc1"));

        f.handler.forget_service("svc1");

        assert_eq!(f.handler.pending_proposals(), 1);
        assert!(!f.handler.is_watching("svc1"));
        assert!(!f.handler.ctx.last_checksums.contains_key("svc1"));
        assert!(f.handler.ctx.last_checksums.contains_key("svc2"));

        let acceptance = StateAcceptance {
            service_id: "svc1".to_string(),
            checksum: checksum(b"local"),
            result: "accepted".to_string(),
            reason: String::new(),
        };
        let err = f.handler.state_acceptance(&acceptance, "corr-1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_unknown_correlation_is_not_found() {
        let f = fixture(1024).await;
        let acceptance = StateAcceptance {
            service_id: "svc1".to_string(),
            checksum: vec![],
            result: "accepted".to_string(),
            reason: String::new(),
        };
        let err = f.handler.state_acceptance(&acceptance, "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_storage_folder() {
        let f = fixture(0).await;
        f.handler.mount_storage_folder(&f.users, &f.service).await.unwrap();
        let entry = f.provider.get_users_service(&f.users, "svc1").await.unwrap().unwrap();

        f.handler.remove_storage_folder(&entry).await.unwrap();
        assert!(!Path::new(&entry.storage_folder).exists());
        // already gone
        f.handler.remove_storage_folder(&entry).await.unwrap();
    }
}
