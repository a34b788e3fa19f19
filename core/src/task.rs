//! One delivery's simulated trip.
//!
//! A [`SimulationTask`] generates its path once, then reports waypoints in
//! order through its courier's session, pausing between reports. It stops on
//! its own when the path is exhausted (Completed), when the service rejects a
//! report (Rejected), on an unrecoverable failure (Aborted), or when its
//! cancellation token fires (Cancelled).
//!
//! Progress is published on a `watch` channel; the final [`TaskOutcome`] is
//! the output of the spawned task's `JoinHandle`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cancel::sleep_or_cancel;
use crate::config::{PacingConfig, SimulatorConfig};
use crate::delivery::DeliveryRecord;
use crate::geo::{self, GeoError, GeoPath, GeoPoint};
use crate::retry::{RetryError, RetryPolicy};
use crate::session::{CourierSession, ReportError};

/// Lower bound of the proximity scale factor applied to pacing delays.
const MIN_PROXIMITY_SCALE: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Initializing,
    Streaming,
    Completed,
    Rejected,
    Aborted,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Initializing | Self::Streaming)
    }
}

/// Snapshot published after every state change and every consumed waypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskProgress {
    pub state: TaskState,
    /// Waypoints successfully reported so far.
    pub cursor: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// A waypoint kept failing transiently past the retry budget.
    RetriesExhausted { attempts: usize, last_error: String },
    /// The courier's token was refused; the session must be replaced.
    SessionExpired,
    /// The service refused the payload itself.
    InvalidReport { status: u16, body: String },
    /// The task's execution unit panicked or was aborted.
    Crashed(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} attempts: {last_error}"),
            Self::SessionExpired => f.write_str("session expired"),
            Self::InvalidReport { status, body } => {
                write!(f, "report refused (HTTP {status}): {body}")
            }
            Self::Crashed(msg) => write!(f, "task crashed: {msg}"),
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed { reported: usize },
    Rejected { cursor: usize, status: u16 },
    Aborted { cursor: usize, reason: AbortReason },
    Cancelled { cursor: usize },
}

impl TaskOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            Self::Completed { .. } => TaskState::Completed,
            Self::Rejected { .. } => TaskState::Rejected,
            Self::Aborted { .. } => TaskState::Aborted,
            Self::Cancelled { .. } => TaskState::Cancelled,
        }
    }

    /// Waypoints reported before the task ended.
    pub fn cursor(&self) -> usize {
        match self {
            Self::Completed { reported } => *reported,
            Self::Rejected { cursor, .. }
            | Self::Aborted { cursor, .. }
            | Self::Cancelled { cursor } => *cursor,
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { reported } => write!(f, "completed ({reported} waypoints)"),
            Self::Rejected { cursor, status } => {
                write!(f, "rejected with HTTP {status} after {cursor} waypoints")
            }
            Self::Aborted { cursor, reason } => {
                write!(f, "aborted after {cursor} waypoints: {reason}")
            }
            Self::Cancelled { cursor } => write!(f, "cancelled after {cursor} waypoints"),
        }
    }
}

/// Randomized delay between two reports.
#[derive(Debug, Clone, PartialEq)]
pub struct Pacing {
    pub min: Duration,
    pub max: Duration,
    /// Scale the delay down as the remaining distance shrinks.
    pub proximity_scaling: bool,
}

impl From<&PacingConfig> for Pacing {
    fn from(config: &PacingConfig) -> Self {
        Self {
            min: Duration::from_millis(config.min_ms),
            max: Duration::from_millis(config.max_ms),
            proximity_scaling: config.proximity_scaling,
        }
    }
}

impl Pacing {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            min: delay,
            max: delay,
            proximity_scaling: false,
        }
    }

    /// Delay before the next report. `remaining` is the fraction of the
    /// path still ahead, in `0.0..=1.0`.
    pub fn delay(&self, remaining: f64) -> Duration {
        let (lo, hi) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };
        let base = if lo == hi {
            lo
        } else {
            let ms = rand::rng().random_range(lo.as_millis()..=hi.as_millis());
            Duration::from_millis(u64::try_from(ms).unwrap_or(u64::MAX))
        };
        if self.proximity_scaling {
            let remaining = remaining.clamp(0.0, 1.0);
            base.mul_f64(MIN_PROXIMITY_SCALE + (1.0 - MIN_PROXIMITY_SCALE) * remaining)
        } else {
            base
        }
    }
}

/// Knobs shared by every task the reconciler starts.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSettings {
    pub point_count: usize,
    pub jitter_degrees: f64,
    pub cold_start_offset_degrees: f64,
    pub pacing: Pacing,
    pub retry: RetryPolicy,
}

impl From<&SimulatorConfig> for TaskSettings {
    fn from(config: &SimulatorConfig) -> Self {
        Self {
            point_count: config.path.point_count,
            jitter_degrees: config.path.jitter_degrees,
            cold_start_offset_degrees: config.path.cold_start_offset_degrees,
            pacing: Pacing::from(&config.pacing),
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

pub struct SimulationTask {
    delivery_id: String,
    courier_label: String,
    path: GeoPath,
    cursor: usize,
    session: Arc<CourierSession>,
    pacing: Pacing,
    retry: RetryPolicy,
    progress: watch::Sender<TaskProgress>,
}

impl fmt::Debug for SimulationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationTask")
            .field("delivery_id", &self.delivery_id)
            .field("courier", &self.session.identity())
            .field("cursor", &self.cursor)
            .field("total", &self.path.len())
            .finish_non_exhaustive()
    }
}

impl SimulationTask {
    /// Pick an origin and generate the path for `record`.
    ///
    /// The origin is the delivery's last known location when the service
    /// has one, otherwise a random point near the destination.
    pub fn prepare(
        record: &DeliveryRecord,
        session: Arc<CourierSession>,
        settings: &TaskSettings,
    ) -> Result<Self, GeoError> {
        let destination = record.destination.validate()?;
        let cold_start = || {
            geo::random_origin_near(
                destination,
                settings.cold_start_offset_degrees,
                &mut rand::rng(),
            )
        };
        let start = match record.last_known_location.map(GeoPoint::validate) {
            Some(Ok(point)) => point,
            Some(Err(err)) => {
                tracing::warn!(
                    delivery_id = %record.id,
                    "Ignoring invalid last known location: {err}"
                );
                cold_start()?
            }
            None => cold_start()?,
        };
        let path = geo::generate(
            start,
            destination,
            settings.point_count,
            settings.jitter_degrees,
        )?;

        let mut task = Self::with_path(record.id.clone(), path, session, settings);
        task.courier_label = record.courier_label().to_string();
        Ok(task)
    }

    /// Build a task around an already generated path.
    pub fn with_path(
        delivery_id: String,
        path: GeoPath,
        session: Arc<CourierSession>,
        settings: &TaskSettings,
    ) -> Self {
        let (progress, _) = watch::channel(TaskProgress {
            state: TaskState::Initializing,
            cursor: 0,
            total: path.len(),
        });
        Self {
            courier_label: session.identity().to_string(),
            delivery_id,
            path,
            cursor: 0,
            session,
            pacing: settings.pacing.clone(),
            retry: settings.retry.clone(),
            progress,
        }
    }

    pub fn delivery_id(&self) -> &str {
        &self.delivery_id
    }

    pub fn courier(&self) -> &str {
        self.session.identity()
    }

    pub fn path(&self) -> &GeoPath {
        &self.path
    }

    /// Index of the next waypoint to report.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskProgress> {
        self.progress.subscribe()
    }

    /// Run on its own tokio task.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<TaskOutcome> {
        tokio::spawn(self.run(cancel))
    }

    /// Stream the path until a terminal state is reached.
    pub async fn run(mut self, cancel: CancellationToken) -> TaskOutcome {
        let session = Arc::clone(&self.session);
        let delivery_id = self.delivery_id.clone();
        let total = self.path.len();

        tracing::info!(
            delivery_id = %delivery_id,
            courier = %self.courier_label,
            total,
            "Starting trip from {} to {}",
            self.path.start(),
            self.path.destination()
        );
        self.publish(TaskState::Streaming);

        while let Some(point) = self.path.get(self.cursor) {
            if cancel.is_cancelled() {
                let cursor = self.cursor;
                return self.finish(TaskOutcome::Cancelled { cursor });
            }

            let attempt = self
                .retry
                .run(
                    || session.report_location(&delivery_id, point),
                    &cancel,
                    |err: &ReportError, delay| {
                        tracing::warn!(
                            delivery_id = %delivery_id,
                            "Location report failed, retrying in {delay:?}: {err}"
                        );
                    },
                )
                .await;

            if let Err(err) = attempt {
                let outcome = self.failure_outcome(err);
                return self.finish(outcome);
            }

            self.cursor += 1;
            self.publish(TaskState::Streaming);
            tracing::debug!(
                delivery_id = %delivery_id,
                cursor = self.cursor,
                total,
                "Position reported {point}"
            );

            if self.cursor < total {
                let remaining = (total - self.cursor) as f64 / total as f64;
                if sleep_or_cancel(self.pacing.delay(remaining), &cancel)
                    .await
                    .is_err()
                {
                    let cursor = self.cursor;
                    return self.finish(TaskOutcome::Cancelled { cursor });
                }
            }
        }

        let reported = self.cursor;
        self.finish(TaskOutcome::Completed { reported })
    }

    fn failure_outcome(&self, err: RetryError<ReportError>) -> TaskOutcome {
        let cursor = self.cursor;
        match err {
            RetryError::Cancelled => TaskOutcome::Cancelled { cursor },
            RetryError::Exhausted { attempts, last } => TaskOutcome::Aborted {
                cursor,
                reason: AbortReason::RetriesExhausted {
                    attempts,
                    last_error: last.to_string(),
                },
            },
            RetryError::Permanent(err) => match err {
                ReportError::Rejected { status } => TaskOutcome::Rejected { cursor, status },
                ReportError::Unauthorized => TaskOutcome::Aborted {
                    cursor,
                    reason: AbortReason::SessionExpired,
                },
                ReportError::Invalid { status, body } => TaskOutcome::Aborted {
                    cursor,
                    reason: AbortReason::InvalidReport { status, body },
                },
                // Retryable errors always surface as `Exhausted`.
                ReportError::Transient(msg) => TaskOutcome::Aborted {
                    cursor,
                    reason: AbortReason::RetriesExhausted {
                        attempts: 1,
                        last_error: msg,
                    },
                },
            },
        }
    }

    fn publish(&self, state: TaskState) {
        self.progress.send_replace(TaskProgress {
            state,
            cursor: self.cursor,
            total: self.path.len(),
        });
    }

    fn finish(self, outcome: TaskOutcome) -> TaskOutcome {
        self.publish(outcome.state());
        match &outcome {
            TaskOutcome::Completed { .. } => tracing::info!(
                delivery_id = %self.delivery_id,
                courier = %self.courier_label,
                "Trip finished, last waypoint sent"
            ),
            TaskOutcome::Rejected { status, .. } => tracing::warn!(
                delivery_id = %self.delivery_id,
                courier = %self.courier_label,
                status,
                "Service rejected the report, stopping simulation"
            ),
            TaskOutcome::Aborted { reason, .. } => tracing::warn!(
                delivery_id = %self.delivery_id,
                courier = %self.courier_label,
                "Simulation aborted: {reason}"
            ),
            TaskOutcome::Cancelled { .. } => tracing::info!(
                delivery_id = %self.delivery_id,
                courier = %self.courier_label,
                "Simulation cancelled"
            ),
        }
        outcome
    }
}
