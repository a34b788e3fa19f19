//! Command-line surface of `tracksim`.
//!
//! ## Commands
//!
//! - `tracksim run`: reconcile against the service until interrupted
//! - `tracksim simulate --delivery-id <ID> --courier <IDENTITY>`
//! - `tracksim path --from LAT,LNG --to LAT,LNG [--points N]`
//! - `tracksim config`: print the effective configuration, secrets masked

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracksim_core::GeoPoint;
use tracksim_core::geo;

#[derive(Debug, Parser)]
#[command(name = "tracksim", version, about = "Courier trajectory simulator")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Config file (defaults to ./tracksim.toml, then the user config dir).
    #[arg(long = "config", short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Override the tracking service base URL.
    #[arg(long = "base-url", global = true)]
    pub base_url: Option<String>,

    /// Override the seconds between reconciliation sweeps.
    #[arg(long = "poll-interval-secs", global = true)]
    pub poll_interval_secs: Option<u64>,

    /// Log output format.
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Keep every assigned delivery of the configured couriers moving.
    Run,
    /// Drive a single delivery to its destination in the foreground.
    Simulate(SimulateArgs),
    /// Print a generated path as JSON without contacting the service.
    Path(PathArgs),
    /// Print the effective configuration with secrets masked.
    Config,
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Delivery to simulate.
    #[arg(long = "delivery-id", short = 'd')]
    pub delivery_id: String,

    /// Configured courier identity to report as.
    #[arg(long = "courier")]
    pub courier: String,
}

#[derive(Debug, Args)]
pub struct PathArgs {
    /// Start coordinate as LAT,LNG.
    #[arg(long = "from", allow_hyphen_values = true)]
    pub from: GeoPoint,

    /// Destination coordinate as LAT,LNG.
    #[arg(long = "to", allow_hyphen_values = true)]
    pub to: GeoPoint,

    /// Number of waypoints, endpoints included (defaults to path.point_count).
    #[arg(long = "points", short = 'n')]
    pub points: Option<usize>,

    /// Interior jitter bound in degrees (defaults to path.jitter_degrees).
    #[arg(long = "jitter", value_parser = parse_jitter)]
    pub jitter: Option<f64>,
}

fn parse_jitter(raw: &str) -> Result<f64, String> {
    let value = raw.parse::<f64>().map_err(|err| err.to_string())?;
    geo::check_spread("jitter", value).map_err(|err| err.to_string())
}
