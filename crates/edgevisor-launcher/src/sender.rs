// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outgoing messages to the cloud.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::model::ServiceStatusReport;

/// Messaging bridge used by the launcher.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Report a service status.
    async fn send_service_status(&self, status: ServiceStatusReport) -> Result<()>;

    /// Ask the cloud for the last accepted state, or the default state when
    /// `use_default` is set.
    async fn send_state_request(&self, service_id: &str, use_default: bool) -> Result<()>;
}

/// Sender that only logs outgoing messages.
#[derive(Debug, Default)]
pub struct LogSender;

#[async_trait]
impl Sender for LogSender {
    async fn send_service_status(&self, status: ServiceStatusReport) -> Result<()> {
        info!(
            service_id = %status.id,
            version = status.version,
            status = %status.status,
            error = ?status.error,
            "Service status"
        );
        Ok(())
    }

    async fn send_state_request(&self, service_id: &str, use_default: bool) -> Result<()> {
        info!(service_id, use_default, "State request");
        Ok(())
    }
}

/// Message captured by [`MemorySender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentMessage {
    /// A service status report.
    ServiceStatus(ServiceStatusReport),
    /// A state request.
    StateRequest {
        /// Service ID.
        service_id: String,
        /// Whether the default state was requested.
        use_default: bool,
    },
}

/// Sender that keeps every message in memory.
#[derive(Debug, Default)]
pub struct MemorySender {
    messages: Mutex<Vec<SentMessage>>,
}

impl MemorySender {
    /// Create an empty sender.
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages sent so far.
    pub fn messages(&self) -> Vec<SentMessage> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Status reports sent for `id`.
    pub fn statuses_for(&self, id: &str) -> Vec<ServiceStatusReport> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                SentMessage::ServiceStatus(s) if s.id == id => Some(s),
                _ => None,
            })
            .collect()
    }

    /// State requests sent for `id`, as their `use_default` flags.
    pub fn state_requests_for(&self, id: &str) -> Vec<bool> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                SentMessage::StateRequest {
                    service_id,
                    use_default,
                } if service_id == id => Some(use_default),
                _ => None,
            })
            .collect()
    }

    fn push(&self, message: SentMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }
}

#[async_trait]
impl Sender for MemorySender {
    async fn send_service_status(&self, status: ServiceStatusReport) -> Result<()> {
        self.push(SentMessage::ServiceStatus(status));
        Ok(())
    }

    async fn send_state_request(&self, service_id: &str, use_default: bool) -> Result<()> {
        self.push(SentMessage::StateRequest {
            service_id: service_id.to_string(),
            use_default,
        });
        Ok(())
    }
}
