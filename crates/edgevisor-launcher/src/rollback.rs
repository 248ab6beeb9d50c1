// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ordered compensation stack for multi-step lifecycle sequences.
//!
//! Each completed forward step may register a compensation. When a later
//! step fails, [`Rollback::unwind`] runs the registered compensations in
//! reverse order of registration (last step is compensated first). A
//! sequence that succeeds calls [`Rollback::commit`] to drop them.

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::Result;

struct Compensation {
    name: &'static str,
    action: BoxFuture<'static, Result<()>>,
}

/// Stack of pending compensations.
#[derive(Default)]
pub struct Rollback {
    steps: Vec<Compensation>,
}

impl Rollback {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compensation for a step that just completed.
    pub fn push<F>(&mut self, name: &'static str, action: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.steps.push(Compensation {
            name,
            action: Box::pin(action),
        });
    }

    /// Number of pending compensations.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Drop every pending compensation.
    pub fn commit(mut self) {
        self.steps.clear();
    }

    /// Run all compensations in reverse order.
    ///
    /// Every compensation runs even if an earlier one fails; failures are
    /// logged and the first one is returned.
    pub async fn unwind(mut self) -> Result<()> {
        let mut first_error = None;

        while let Some(step) = self.steps.pop() {
            debug!(step = step.name, "Running compensation");
            if let Err(e) = step.action.await {
                warn!(step = step.name, error = %e, "Compensation failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            warn!(
                pending = self.steps.len(),
                "Rollback dropped with pending compensations"
            );
        }
    }
}
