//! Courier trajectory simulation and reconciliation engine.
//!
//! Simulates couriers moving toward their delivery destinations and streams
//! synthetic location pings to a remote tracking service. A reconciliation
//! loop keeps the set of running simulations in sync with the service's view
//! of which deliveries are in progress.
//!
//! The pieces, leaves first:
//! - [`geo`]: waypoint generation between two coordinates.
//! - [`session`]: one authenticated courier identity against the service.
//! - [`task`]: one delivery's simulated trip, paced and terminating on
//!   completion, rejection, or cancellation.
//! - [`reconcile`]: the periodic poll/diff/dispatch/prune controller, which
//!   owns the [`registry`] of running tasks.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod cancel;
pub mod config;
pub mod delivery;
pub mod geo;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod session;
pub mod task;

pub use config::{ConfigError, ConfigLoader, CourierCredential, SimulatorConfig};
pub use delivery::{DeliveryRecord, DeliverySnapshot, DeliveryStatus};
pub use geo::{GeoError, GeoPath, GeoPoint};
pub use reconcile::{Reconciler, SimulateError, SweepSummary, simulate_delivery};
pub use registry::{FinishedTask, RegistryError, TaskRegistry};
pub use session::{CourierSession, HttpTrackingApi, TrackingApi};
pub use task::{SimulationTask, TaskOutcome, TaskSettings, TaskState};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
