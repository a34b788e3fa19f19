//! The reconciliation loop.
//!
//! Every poll interval the [`Reconciler`] fetches the delivery snapshot,
//! prunes registry entries whose task has ended and whose delivery left the
//! active set, stops tasks whose delivery reached a terminal status, and
//! starts a task for every assigned or in-transit delivery of a configured
//! courier that has no live task yet. A sweep is idempotent: running it twice
//! against an unchanged snapshot starts nothing the second time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{CourierCredential, SimulatorConfig};
use crate::delivery::{DeliveryRecord, DeliverySnapshot, DeliveryStatus};
use crate::geo::GeoError;
use crate::registry::{FinishedTask, TaskHandle, TaskRegistry};
use crate::session::{AuthError, CourierSession, FetchError, TrackingApi};
use crate::task::{AbortReason, SimulationTask, TaskOutcome, TaskSettings};

/// Counters describing one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Records in the snapshot.
    pub fetched: usize,
    /// Assigned/in-transit records whose courier is configured.
    pub eligible: usize,
    pub dispatched: usize,
    /// Eligible records already backed by a live task.
    pub already_live: usize,
    pub pruned: usize,
    /// Live tasks signalled to stop.
    pub cancelled: usize,
    /// Pending records, left alone.
    pub pending: usize,
    /// Assigned/in-transit records that could not be simulated.
    pub skipped: usize,
}

pub struct Reconciler {
    api: Arc<dyn TrackingApi>,
    config: SimulatorConfig,
    settings: TaskSettings,
    sessions: HashMap<String, Arc<CourierSession>>,
    registry: TaskRegistry,
    /// Deliveries already warned about, so each warning is logged once.
    warned: HashSet<String>,
    tasks_cancel: CancellationToken,
}

impl Reconciler {
    pub fn new(api: Arc<dyn TrackingApi>, config: SimulatorConfig) -> Self {
        let settings = TaskSettings::from(&config);
        Self {
            api,
            config,
            settings,
            sessions: HashMap::new(),
            registry: TaskRegistry::new(),
            warned: HashSet::new(),
            tasks_cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn has_session(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Log in every configured courier that has no session. Failures are
    /// logged and retried on the next call. Returns the number of sessions
    /// held afterwards.
    pub async fn authenticate_all(&mut self) -> usize {
        for credential in &self.config.couriers {
            if self.sessions.contains_key(&credential.identity) {
                continue;
            }
            match CourierSession::authenticate(Arc::clone(&self.api), credential).await {
                Ok(session) => {
                    self.sessions
                        .insert(credential.identity.clone(), Arc::new(session));
                }
                Err(err) => tracing::warn!(
                    courier = %credential.identity,
                    "Login failed, courier unavailable until next sweep: {err}"
                ),
            }
        }
        self.sessions.len()
    }

    /// Run one poll/prune/dispatch cycle.
    ///
    /// A failed fetch skips the sweep and leaves the registry untouched.
    pub async fn sweep(&mut self) -> Result<SweepSummary, FetchError> {
        self.authenticate_all().await;
        let snapshot = self.fetch_snapshot().await?;
        let mut summary = SweepSummary {
            fetched: snapshot.len(),
            ..SweepSummary::default()
        };

        let active = snapshot.active_ids();
        for finished in self.registry.prune(&active).await {
            tracing::info!(
                delivery_id = %finished.delivery_id,
                courier = %finished.courier,
                "Pruned finished simulation: {}",
                finished.outcome
            );
            self.absorb(&finished);
            summary.pruned += 1;
        }
        self.warned.retain(|id| active.contains(id));

        for record in snapshot.records() {
            match record.status {
                DeliveryStatus::Delivered | DeliveryStatus::Cancelled => {
                    if self.config.cancel_terminal && self.registry.cancel(&record.id) {
                        tracing::info!(
                            delivery_id = %record.id,
                            status = %record.status,
                            "Delivery closed, stopping its simulation"
                        );
                        summary.cancelled += 1;
                    }
                }
                DeliveryStatus::Pending => {
                    tracing::debug!(delivery_id = %record.id, "Awaiting courier assignment");
                    summary.pending += 1;
                }
                DeliveryStatus::Assigned | DeliveryStatus::InTransit => {
                    self.reconcile_record(record, &mut summary).await;
                }
            }
        }

        Ok(summary)
    }

    /// Sweep every poll interval until `shutdown` fires, then stop every
    /// task and return their outcomes.
    pub async fn run(mut self, shutdown: CancellationToken) -> Vec<FinishedTask> {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            couriers = self.config.couriers.len(),
            "Reconciliation loop started, polling every {:?}",
            self.config.poll_interval()
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.sweep() => result,
            };
            match result {
                Ok(summary)
                    if summary.dispatched > 0 || summary.pruned > 0 || summary.cancelled > 0 =>
                {
                    tracing::info!(?summary, live = self.registry.live_count(), "Sweep finished");
                }
                Ok(summary) => {
                    tracing::debug!(?summary, live = self.registry.live_count(), "Sweep finished");
                }
                Err(err) => tracing::error!("Delivery poll failed, skipping sweep: {err}"),
            }
            for status in self.registry.statuses() {
                tracing::debug!(
                    delivery_id = %status.delivery_id,
                    courier = %status.courier,
                    alive = status.alive,
                    state = ?status.progress.state,
                    cursor = status.progress.cursor,
                    total = status.progress.total,
                    elapsed = ?status.elapsed,
                    "Task status"
                );
            }
        }

        self.shutdown().await
    }

    /// Cancel every task and wait for them within the configured grace.
    pub async fn shutdown(&mut self) -> Vec<FinishedTask> {
        tracing::info!(
            live = self.registry.live_count(),
            "Stopping simulations"
        );
        self.tasks_cancel.cancel();
        let finished = self.registry.shutdown(self.config.shutdown_grace()).await;
        for task in &finished {
            tracing::info!(
                delivery_id = %task.delivery_id,
                courier = %task.courier,
                "Simulation stopped: {}",
                task.outcome
            );
        }
        finished
    }

    /// Fetch with the first session that works. A session answered with 401
    /// is dropped and the next one is tried.
    async fn fetch_snapshot(&mut self) -> Result<DeliverySnapshot, FetchError> {
        let identities: Vec<String> = self
            .config
            .couriers
            .iter()
            .map(|c| c.identity.clone())
            .collect();

        for identity in identities {
            let Some(session) = self.sessions.get(&identity).cloned() else {
                continue;
            };
            match session.fetch_active_deliveries().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(FetchError::Unauthorized) => {
                    tracing::warn!(
                        courier = %identity,
                        "Session rejected while polling, dropping it"
                    );
                    self.sessions.remove(&identity);
                }
                Err(err) => return Err(err),
            }
        }
        Err(FetchError::NoSession)
    }

    async fn reconcile_record(&mut self, record: &DeliveryRecord, summary: &mut SweepSummary) {
        let Some(identity) = record.courier_identity() else {
            self.warn_once(&record.id, || {
                tracing::warn!(
                    delivery_id = %record.id,
                    status = %record.status,
                    "Delivery has no courier identity, skipping"
                );
            });
            summary.skipped += 1;
            return;
        };
        if self.config.credential(identity).is_none() {
            self.warn_once(&record.id, || {
                tracing::warn!(
                    delivery_id = %record.id,
                    courier = %identity,
                    "Assigned courier has no configured credential, skipping"
                );
            });
            summary.skipped += 1;
            return;
        }
        summary.eligible += 1;

        if let Some(handle) = self.registry.get(&record.id)
            && handle.is_alive()
        {
            if handle.courier() == identity {
                summary.already_live += 1;
            } else {
                tracing::info!(
                    delivery_id = %record.id,
                    from = %handle.courier(),
                    to = %identity,
                    "Delivery reassigned, stopping previous courier's simulation"
                );
                self.registry.cancel(&record.id);
                summary.cancelled += 1;
            }
            return;
        }

        if let Some(finished) = self.registry.take_if_finished(&record.id).await {
            tracing::info!(
                delivery_id = %finished.delivery_id,
                courier = %finished.courier,
                "Previous simulation ended: {}",
                finished.outcome
            );
            self.absorb(&finished);
        }

        let Some(session) = self.sessions.get(identity).cloned() else {
            tracing::warn!(
                delivery_id = %record.id,
                courier = %identity,
                "No session for courier, will retry next sweep"
            );
            summary.skipped += 1;
            return;
        };

        let task = match SimulationTask::prepare(record, session, &self.settings) {
            Ok(task) => task,
            Err(err) => {
                self.warn_once(&record.id, || {
                    tracing::warn!(delivery_id = %record.id, "Cannot build a path: {err}");
                });
                summary.skipped += 1;
                return;
            }
        };

        let cancel = self.tasks_cancel.child_token();
        let progress = task.subscribe();
        let courier = identity.to_string();
        let dispatched = self
            .registry
            .dispatch(&record.id, move || {
                let join = task.spawn(cancel.clone());
                TaskHandle::new(courier, join, cancel, progress)
            })
            .await;

        match dispatched {
            Ok(_) => {
                tracing::info!(
                    delivery_id = %record.id,
                    courier = %record.courier_label(),
                    status = %record.status,
                    "Dispatched simulation"
                );
                summary.dispatched += 1;
            }
            Err(err) => {
                tracing::debug!("{err}");
                summary.already_live += 1;
            }
        }
    }

    /// React to a task's end. An expired session is dropped so the next
    /// sweep logs the courier in again, unless it was already replaced.
    fn absorb(&mut self, finished: &FinishedTask) {
        if !matches!(
            finished.outcome,
            TaskOutcome::Aborted {
                reason: AbortReason::SessionExpired,
                ..
            }
        ) {
            return;
        }
        let stale = self
            .sessions
            .get(&finished.courier)
            .is_some_and(|s| s.acquired_at() <= finished.started_at);
        if stale {
            tracing::warn!(
                courier = %finished.courier,
                "Session expired, logging in again next sweep"
            );
            self.sessions.remove(&finished.courier);
        }
    }

    fn warn_once(&mut self, delivery_id: &str, log: impl FnOnce()) {
        if self.warned.insert(delivery_id.to_string()) {
            log();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SimulateError {
    #[error("login failed: {0}")]
    Auth(#[from] AuthError),

    #[error("delivery fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("delivery {0} not found")]
    NotFound(String),

    #[error("delivery {delivery_id} is {status}, nothing to simulate")]
    NotSimulatable {
        delivery_id: String,
        status: DeliveryStatus,
    },

    #[error(transparent)]
    Path(#[from] GeoError),
}

/// Drive one delivery in the foreground until its task ends.
pub async fn simulate_delivery(
    api: Arc<dyn TrackingApi>,
    config: &SimulatorConfig,
    credential: &CourierCredential,
    delivery_id: &str,
    cancel: CancellationToken,
) -> Result<TaskOutcome, SimulateError> {
    let session = Arc::new(CourierSession::authenticate(api, credential).await?);
    let snapshot = session.fetch_active_deliveries().await?;
    let record = snapshot
        .get(delivery_id)
        .ok_or_else(|| SimulateError::NotFound(delivery_id.to_string()))?;
    if !record.status.is_simulatable() {
        return Err(SimulateError::NotSimulatable {
            delivery_id: delivery_id.to_string(),
            status: record.status,
        });
    }
    if record.courier_identity() != Some(credential.identity.as_str()) {
        tracing::warn!(
            delivery_id,
            courier = %credential.identity,
            assigned = record.courier_identity().unwrap_or("nobody"),
            "Delivery is assigned to another courier, the service may reject reports"
        );
    }

    let task = SimulationTask::prepare(record, session, &TaskSettings::from(config))?;
    Ok(task.run(cancel).await)
}

