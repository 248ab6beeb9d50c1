// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edgevisor Launcher - On-device Service Lifecycle Management
//!
//! This crate installs, updates, starts, stops and removes isolated
//! workloads ("services") on an edge device, driven by a cloud-issued
//! desired state and by the set of users currently active on the device.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Boundary layer (messaging)                         │
//! │   ServiceInfoFromCloud / UpdateState / StateAcceptance / users change    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      edgevisor-launcher (This Crate)                     │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │   Action    │  │  Launcher   │  │   Storage   │  │     TTL     │     │
//! │  │   Handler   │─▶│ (reconciler)│─▶│   Handler   │  │   Sweeper   │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                 │                  │
//!           ▼                 ▼                  ▼
//! ┌──────────────────┐ ┌──────────────┐ ┌────────────────────────────────┐
//! │  SQLite records  │ │   systemd    │ │ image download / OS users /    │
//! │ (ServiceProvider)│ │ (UnitManager)│ │ storage folders / state files  │
//! └──────────────────┘ └──────────────┘ └────────────────────────────────┘
//! ```
//!
//! # Service State Machine
//!
//! ```text
//!   ┌──────┐  start   ┌─────────┐  stop   ┌─────────┐
//!   │ INIT │─────────▶│ RUNNING │────────▶│ STOPPED │
//!   └──────┘          └─────────┘◀────────└─────────┘
//!                                  start
//! ```
//!
//! Status (`ok` / `error`) is orthogonal to state: it turns `error` whenever
//! the supervisor reports a tracked unit outside its running sub-state.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `EDGEVISOR_WORKING_DIR` | No | `/var/lib/edgevisor` | Services, storages, database, unit template |
//! | `EDGEVISOR_DEFAULT_SERVICE_TTL_DAYS` | No | `30` | TTL when the image carries none |
//! | `EDGEVISOR_MAX_CONCURRENT_ACTIONS` | No | `10` | Global action concurrency cap |
//! | `EDGEVISOR_UNIT_TIMEOUT_SECS` | No | `30` | Bound on one supervisor call |
//! | `EDGEVISOR_STATE_DEBOUNCE_MS` | No | `1000` | State file change debounce |
//! | `EDGEVISOR_TTL_SWEEP_INTERVAL_SECS` | No | `3600` | TTL sweep period |
//! | `EDGEVISOR_USERS` | No | - | Comma-separated initial user set |
//! | `EDGEVISOR_DESIRED_STATE` | No | - | JSON file with the desired services |
//!
//! # Modules
//!
//! - [`action`]: Per-service serializing action queue
//! - [`launcher`]: Reconciler and public API
//! - [`storage`]: Storage folders and state exchange
//! - [`ttl_sweeper`]: Periodic removal of expired services
//! - [`provider`]: Persisted service records
//! - [`supervisor`]: Process supervision backends
//! - [`bundle`]: Runtime spec and unit file preparation

#![deny(missing_docs)]

/// Database migrations for edgevisor-launcher.
///
/// ```ignore
/// use edgevisor_launcher::migrations;
///
/// let pool = SqlitePool::connect("sqlite:services.db?mode=rwc").await?;
/// migrations::run(&pool).await?;
/// ```
pub mod migrations;

/// Launcher configuration loaded from environment variables.
pub mod config;

/// Error types for launcher operations.
pub mod error;

/// Data model and message value objects.
pub mod model;

/// Per-service serializing action queue.
pub mod action;

/// Ordered compensation stack.
pub mod rollback;

/// Persisted service and association records.
pub mod provider;

/// Process supervision backends.
pub mod supervisor;

/// Runtime spec, limits and unit file preparation.
pub mod bundle;

/// Image download and unpacking.
pub mod image;

/// OS user provisioning and filesystem quotas.
pub mod accounts;

/// Messaging bridge towards the cloud.
pub mod sender;

/// Resource monitoring hook.
pub mod monitor;

/// Storage folders and service state exchange.
pub mod storage;

/// Desired-state diff.
pub mod desired;

/// Reconciler and public launcher API.
pub mod launcher;

/// Background worker removing expired services.
pub mod ttl_sweeper;

pub use error::{Error, Result};
pub use launcher::{Launcher, LauncherBuilder, LauncherChannels};
