// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Desired-state diff.
//!
//! Compares the services installed for the current users with the list the
//! cloud wants and produces the lifecycle actions that converge the two.

use std::collections::BTreeMap;

use crate::model::{ServiceInfo, ServiceInfoFromCloud};

/// One step of a reconciliation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    /// Service is not installed yet.
    Install(ServiceInfoFromCloud),
    /// Service is installed with an older version.
    Update {
        /// Installed version.
        from: u64,
        /// Desired service.
        info: ServiceInfoFromCloud,
    },
    /// Service is installed but no longer desired.
    Remove {
        /// Service ID.
        id: String,
        /// Installed version.
        version: u64,
    },
}

impl PlannedAction {
    /// Service ID the step applies to.
    pub fn id(&self) -> &str {
        match self {
            PlannedAction::Install(info) | PlannedAction::Update { info, .. } => &info.id,
            PlannedAction::Remove { id, .. } => id,
        }
    }
}

/// Compute the actions turning `current` into `desired`, ordered by service ID.
///
/// Installed services with an equal or newer version than desired are left
/// alone; downgrades are never planned.
pub fn plan(current: &[ServiceInfo], desired: &[ServiceInfoFromCloud]) -> Vec<PlannedAction> {
    let installed: BTreeMap<&str, &ServiceInfo> =
        current.iter().map(|s| (s.id.as_str(), s)).collect();
    let wanted: BTreeMap<&str, &ServiceInfoFromCloud> =
        desired.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut actions = Vec::new();

    for (id, info) in &wanted {
        match installed.get(id) {
            None => actions.push(PlannedAction::Install((*info).clone())),
            Some(existing) if info.version > existing.version => actions.push(PlannedAction::Update {
                from: existing.version,
                info: (*info).clone(),
            }),
            Some(_) => {}
        }
    }

    for (id, existing) in &installed {
        if !wanted.contains_key(id) {
            actions.push(PlannedAction::Remove {
                id: id.to_string(),
                version: existing.version,
            });
        }
    }

    actions.sort_by(|a, b| a.id().cmp(b.id()));
    actions
}
