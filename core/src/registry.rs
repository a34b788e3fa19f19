//! Delivery id to running simulation.
//!
//! The registry is owned by the reconciliation loop and mutated only from
//! it, so every check-then-act below runs without interleaving. A task is
//! *live* while its tokio task has not finished; finished entries linger
//! until the next prune or until a new dispatch replaces them.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::task::{AbortReason, TaskOutcome, TaskProgress};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("delivery {delivery_id} already has a live simulation")]
    AlreadyLive { delivery_id: String },
}

/// Handle to one spawned simulation.
#[derive(Debug)]
pub struct TaskHandle {
    courier: String,
    join: JoinHandle<TaskOutcome>,
    cancel: CancellationToken,
    progress: watch::Receiver<TaskProgress>,
    started_at: Instant,
}

impl TaskHandle {
    pub fn new(
        courier: impl Into<String>,
        join: JoinHandle<TaskOutcome>,
        cancel: CancellationToken,
        progress: watch::Receiver<TaskProgress>,
    ) -> Self {
        Self {
            courier: courier.into(),
            join,
            cancel,
            progress,
            started_at: Instant::now(),
        }
    }

    pub fn courier(&self) -> &str {
        &self.courier
    }

    pub fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    pub fn progress(&self) -> TaskProgress {
        *self.progress.borrow()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task and turn its join result into an outcome.
    async fn harvest(self, delivery_id: String) -> FinishedTask {
        let cursor = self.progress().cursor;
        let joined = self.join.await;
        FinishedTask::from_join(delivery_id, self.courier, self.started_at, cursor, joined)
    }

    /// Like [`Self::harvest`], but abort the task if it outlives `grace`.
    async fn harvest_within(mut self, delivery_id: String, grace: Duration) -> FinishedTask {
        let joined = tokio::time::timeout(grace, &mut self.join).await;
        let cursor = self.progress().cursor;
        match joined {
            Ok(joined) => {
                FinishedTask::from_join(delivery_id, self.courier, self.started_at, cursor, joined)
            }
            Err(_) => {
                tracing::warn!(
                    delivery_id = %delivery_id,
                    "Simulation ignored cancellation, aborting"
                );
                self.join.abort();
                FinishedTask {
                    delivery_id,
                    courier: self.courier,
                    started_at: self.started_at,
                    outcome: TaskOutcome::Cancelled { cursor },
                }
            }
        }
    }
}

/// A removed registry entry with its final outcome.
#[derive(Debug, Clone)]
pub struct FinishedTask {
    pub delivery_id: String,
    pub courier: String,
    pub started_at: Instant,
    pub outcome: TaskOutcome,
}

impl FinishedTask {
    fn from_join(
        delivery_id: String,
        courier: String,
        started_at: Instant,
        cursor: usize,
        joined: Result<TaskOutcome, JoinError>,
    ) -> Self {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => TaskOutcome::Cancelled { cursor },
            Err(err) => TaskOutcome::Aborted {
                cursor,
                reason: AbortReason::Crashed(err.to_string()),
            },
        };
        Self {
            delivery_id,
            courier,
            started_at,
            outcome,
        }
    }
}

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub delivery_id: String,
    pub courier: String,
    pub alive: bool,
    pub progress: TaskProgress,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    entries: HashMap<String, TaskHandle>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries currently held, finished or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|h| h.is_alive()).count()
    }

    pub fn contains(&self, delivery_id: &str) -> bool {
        self.entries.contains_key(delivery_id)
    }

    pub fn is_live(&self, delivery_id: &str) -> bool {
        self.entries
            .get(delivery_id)
            .is_some_and(TaskHandle::is_alive)
    }

    pub fn get(&self, delivery_id: &str) -> Option<&TaskHandle> {
        self.entries.get(delivery_id)
    }

    /// Start a task for `delivery_id` unless one is already live.
    ///
    /// `spawn` runs only when the slot is free. A finished entry occupying
    /// the slot is replaced and returned with its outcome.
    pub async fn dispatch<F>(
        &mut self,
        delivery_id: &str,
        spawn: F,
    ) -> Result<Option<FinishedTask>, RegistryError>
    where
        F: FnOnce() -> TaskHandle,
    {
        if self.is_live(delivery_id) {
            return Err(RegistryError::AlreadyLive {
                delivery_id: delivery_id.to_string(),
            });
        }
        let previous = self.entries.insert(delivery_id.to_string(), spawn());
        match previous {
            Some(old) => Ok(Some(old.harvest(delivery_id.to_string()).await)),
            None => Ok(None),
        }
    }

    /// Remove every entry that is not alive and whose delivery is absent
    /// from `active`. Live entries are never removed here.
    pub async fn prune(&mut self, active: &HashSet<String>) -> Vec<FinishedTask> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(id, handle)| !handle.is_alive() && !active.contains(id.as_str()))
            .map(|(id, _)| id.clone())
            .collect();

        let mut finished = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(handle) = self.entries.remove(&id) {
                finished.push(handle.harvest(id).await);
            }
        }
        finished
    }

    /// Remove the entry for `delivery_id` if its task has finished.
    pub async fn take_if_finished(&mut self, delivery_id: &str) -> Option<FinishedTask> {
        if self.entries.get(delivery_id)?.is_alive() {
            return None;
        }
        let handle = self.entries.remove(delivery_id)?;
        Some(handle.harvest(delivery_id.to_string()).await)
    }

    /// Remove finished entries regardless of the snapshot.
    pub async fn take_finished(&mut self) -> Vec<FinishedTask> {
        self.prune(&HashSet::new()).await
    }

    /// Signal one task to stop. Returns whether a live task was signalled.
    pub fn cancel(&self, delivery_id: &str) -> bool {
        match self.entries.get(delivery_id) {
            Some(handle) if handle.is_alive() => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&self) {
        for handle in self.entries.values() {
            handle.cancel();
        }
    }

    /// Cancel every task and wait up to `grace` for them to stop. Tasks
    /// still running after that are aborted. Leaves the registry empty.
    pub async fn shutdown(&mut self, grace: Duration) -> Vec<FinishedTask> {
        self.cancel_all();
        let mut finished = join_all(
            self.entries
                .drain()
                .map(|(id, handle)| handle.harvest_within(id, grace)),
        )
        .await;
        finished.sort_by(|a, b| a.delivery_id.cmp(&b.delivery_id));
        finished
    }

    /// Every entry, sorted by delivery id.
    pub fn statuses(&self) -> Vec<TaskStatus> {
        let mut statuses: Vec<TaskStatus> = self
            .entries
            .iter()
            .map(|(id, handle)| TaskStatus {
                delivery_id: id.clone(),
                courier: handle.courier.clone(),
                alive: handle.is_alive(),
                progress: handle.progress(),
                elapsed: handle.started_at.elapsed(),
            })
            .collect();
        statuses.sort_by(|a, b| a.delivery_id.cmp(&b.delivery_id));
        statuses
    }
}
