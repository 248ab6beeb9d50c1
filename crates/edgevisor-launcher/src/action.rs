// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-service serializing action queue.
//!
//! Actions are keyed by service ID. Actions sharing an ID run one at a time
//! in submission order; actions for different IDs run concurrently, bounded
//! by a global semaphore.
//!
//! Each ID with pending work has exactly one drain task. The task is spawned
//! when the first action for an idle ID arrives and exits once that ID's
//! queue is empty. The queue map entry exists for as long as the drain task
//! runs, so the presence of a key means "this ID is active".
//!
//! Actions are never retried or cancelled. A panicking action is logged and
//! the queue keeps draining.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, error, warn};

use crate::model::ServiceAction;

/// Executes dequeued actions.
///
/// Implementations resolve success and failure internally (status reports);
/// the queue only cares that the call returns.
#[async_trait]
pub trait ActionExecutor: Send + Sync + 'static {
    /// Run one action to completion.
    async fn execute(&self, action: ServiceAction);
}

/// Completion handle of a queued action.
///
/// Dropping the ticket does not affect the action.
#[derive(Debug)]
pub struct ActionTicket {
    done: oneshot::Receiver<()>,
}

impl ActionTicket {
    /// Wait until the action finished.
    pub async fn wait(self) {
        // The sender is dropped without sending only if the executor is gone,
        // which also means the action will never run.
        let _ = self.done.await;
    }
}

struct QueuedAction {
    action: ServiceAction,
    done: oneshot::Sender<()>,
}

struct Inner {
    executor: Weak<dyn ActionExecutor>,
    queues: Mutex<HashMap<String, VecDeque<QueuedAction>>>,
    semaphore: Arc<Semaphore>,
}

impl Inner {
    fn queues(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<QueuedAction>>> {
        // Never held across an await and never panics while held.
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pop the next action for `id`, removing the entry if the queue is empty.
    fn next(&self, id: &str) -> Option<QueuedAction> {
        let mut queues = self.queues();
        let queue = queues.get_mut(id)?;
        match queue.pop_front() {
            Some(item) => Some(item),
            None => {
                queues.remove(id);
                None
            }
        }
    }
}

/// Per-ID serializing action queue.
#[derive(Clone)]
pub struct ActionHandler {
    inner: Arc<Inner>,
}

impl ActionHandler {
    /// Create a handler dispatching to `executor` with at most
    /// `max_concurrent` actions in flight.
    pub fn new(executor: Weak<dyn ActionExecutor>, max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                queues: Mutex::new(HashMap::new()),
                semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            }),
        }
    }

    /// Enqueue an action. Never blocks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn put_in_queue(&self, action: ServiceAction) -> ActionTicket {
        let (done_tx, done_rx) = oneshot::channel();
        let id = action.id.clone();

        debug!(service_id = %id, action = action.payload.name(), "Queueing action");

        let item = QueuedAction {
            action,
            done: done_tx,
        };

        let spawn_worker = {
            let mut queues = self.inner.queues();
            match queues.get_mut(&id) {
                Some(queue) => {
                    queue.push_back(item);
                    false
                }
                None => {
                    queues.insert(id.clone(), VecDeque::from([item]));
                    true
                }
            }
        };

        if spawn_worker {
            tokio::spawn(Self::drain(self.inner.clone(), id));
        }

        ActionTicket { done: done_rx }
    }

    /// Number of service IDs with queued or running actions.
    pub fn active_ids(&self) -> usize {
        self.inner.queues().len()
    }

    async fn drain(inner: Arc<Inner>, id: String) {
        while let Some(item) = inner.next(&id) {
            let name = item.action.payload.name();

            let Ok(_permit) = inner.semaphore.clone().acquire_owned().await else {
                error!(service_id = %id, "Action semaphore closed");
                return;
            };

            match inner.executor.upgrade() {
                Some(executor) => {
                    let result = AssertUnwindSafe(executor.execute(item.action))
                        .catch_unwind()
                        .await;
                    if result.is_err() {
                        error!(service_id = %id, action = name, "Action panicked");
                    }
                }
                None => {
                    warn!(service_id = %id, action = name, "Executor dropped, discarding action");
                }
            }

            let _ = item.done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActionPayload;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records start/end events and tracks concurrency.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, &'static str)>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
        delay_ms: u64,
    }

    #[async_trait]
    impl ActionExecutor for Recorder {
        async fn execute(&self, action: ServiceAction) {
            let tag = match &action.payload {
                ActionPayload::Start => "start",
                ActionPayload::Stop => "stop",
                ActionPayload::Remove => panic!("remove panics in tests"),
                _ => "other",
            };

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.events
                .lock()
                .unwrap()
                .push((format!("{}:begin", action.id), tag));

            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;

            self.events
                .lock()
                .unwrap()
                .push((format!("{}:end", action.id), tag));
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn handler(recorder: &Arc<Recorder>, max: usize) -> ActionHandler {
        let executor: Arc<dyn ActionExecutor> = recorder.clone();
        ActionHandler::new(Arc::downgrade(&executor), max)
    }

    #[tokio::test]
    async fn test_same_id_runs_in_submission_order() {
        let recorder = Arc::new(Recorder {
            delay_ms: 20,
            ..Default::default()
        });
        let actions = handler(&recorder, 10);

        let tickets = vec![
            actions.put_in_queue(ServiceAction::new("svc", ActionPayload::Start)),
            actions.put_in_queue(ServiceAction::new("svc", ActionPayload::Stop)),
            actions.put_in_queue(ServiceAction::new("svc", ActionPayload::Start)),
        ];
        for ticket in tickets {
            ticket.wait().await;
        }

        let events = recorder.events.lock().unwrap().clone();
        let expected: Vec<(String, &str)> = vec![
            ("svc:begin".into(), "start"),
            ("svc:end".into(), "start"),
            ("svc:begin".into(), "stop"),
            ("svc:end".into(), "stop"),
            ("svc:begin".into(), "start"),
            ("svc:end".into(), "start"),
        ];
        assert_eq!(events, expected);
        assert_eq!(recorder.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(actions.active_ids(), 0);
    }

    #[tokio::test]
    async fn test_distinct_ids_overlap() {
        let recorder = Arc::new(Recorder {
            delay_ms: 100,
            ..Default::default()
        });
        let actions = handler(&recorder, 10);

        let a = actions.put_in_queue(ServiceAction::new("a", ActionPayload::Start));
        let b = actions.put_in_queue(ServiceAction::new("b", ActionPayload::Start));
        a.wait().await;
        b.wait().await;

        assert_eq!(recorder.max_running.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let recorder = Arc::new(Recorder {
            delay_ms: 30,
            ..Default::default()
        });
        let actions = handler(&recorder, 2);

        let tickets: Vec<_> = (0..6)
            .map(|i| actions.put_in_queue(ServiceAction::new(format!("svc{i}"), ActionPayload::Start)))
            .collect();
        for ticket in tickets {
            ticket.wait().await;
        }

        assert_eq!(recorder.max_running.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.events.lock().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_panicking_action_does_not_stall_queue() {
        let recorder = Arc::new(Recorder::default());
        let actions = handler(&recorder, 4);

        let first = actions.put_in_queue(ServiceAction::new("svc", ActionPayload::Remove));
        let second = actions.put_in_queue(ServiceAction::new("svc", ActionPayload::Start));
        first.wait().await;
        second.wait().await;

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events.last().unwrap(), &("svc:end".to_string(), "start"));
        assert_eq!(actions.active_ids(), 0);
    }

    #[tokio::test]
    async fn test_dropped_executor_discards_actions() {
        let recorder = Arc::new(Recorder::default());
        let actions = handler(&recorder, 1);
        drop(recorder);

        // ticket still resolves so callers never hang
        actions
            .put_in_queue(ServiceAction::new("svc", ActionPayload::Start))
            .wait()
            .await;
        assert_eq!(actions.active_ids(), 0);
    }
}
