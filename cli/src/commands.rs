use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;
use tracksim_core::{
    ConfigLoader, HttpTrackingApi, Reconciler, SimulatorConfig, TaskOutcome, geo,
    simulate_delivery,
};

use crate::args::{GlobalArgs, PathArgs, SimulateArgs};

/// Load the layered configuration and apply command-line overrides.
pub fn load_config(global: &GlobalArgs) -> anyhow::Result<SimulatorConfig> {
    let mut config = match &global.config {
        Some(path) => ConfigLoader::new().with_file(path).load(),
        None => ConfigLoader::load_default(),
    }
    .context("loading configuration")?;

    if let Some(base_url) = &global.base_url {
        config.base_url = base_url.clone();
    }
    if let Some(secs) = global.poll_interval_secs {
        config.poll_interval_secs = secs;
    }
    config.validate().context("invalid command-line override")?;
    Ok(config)
}

/// A token cancelled on Ctrl+C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Signal received, shutting down");
                trigger.cancel();
            }
            Err(err) => tracing::warn!("Cannot listen for Ctrl+C: {err}"),
        }
    });
    token
}

pub async fn run(config: SimulatorConfig) -> anyhow::Result<ExitCode> {
    if config.couriers.is_empty() {
        bail!("no couriers configured; add [[couriers]] entries with identity and secret");
    }
    let api = HttpTrackingApi::from_config(&config).context("building HTTP client")?;
    tracing::info!(
        base_url = %api.base_url(),
        "tracksim v{} starting",
        tracksim_core::VERSION
    );

    let mut reconciler = Reconciler::new(Arc::new(api), config);
    if reconciler.authenticate_all().await == 0 {
        bail!("no courier could log in, cannot poll deliveries");
    }

    let shutdown = cancel_on_ctrl_c();
    let finished = reconciler.run(shutdown).await;
    tracing::info!(stopped = finished.len(), "tracksim exiting cleanly");
    Ok(ExitCode::SUCCESS)
}

pub async fn simulate(config: SimulatorConfig, args: SimulateArgs) -> anyhow::Result<ExitCode> {
    let credential = config
        .credential(&args.courier)
        .with_context(|| format!("courier {} is not configured", args.courier))?
        .clone();
    let api = HttpTrackingApi::from_config(&config).context("building HTTP client")?;

    let outcome = simulate_delivery(
        Arc::new(api),
        &config,
        &credential,
        &args.delivery_id,
        cancel_on_ctrl_c(),
    )
    .await?;

    println!("{}: {outcome}", args.delivery_id);
    Ok(ExitCode::from(exit_status(&outcome)))
}

pub fn path(config: &SimulatorConfig, args: &PathArgs) -> anyhow::Result<ExitCode> {
    let points = args.points.unwrap_or(config.path.point_count);
    let jitter = args.jitter.unwrap_or(config.path.jitter_degrees);
    let path = geo::generate(args.from, args.to, points, jitter)?;
    println!("{}", serde_json::to_string_pretty(&path)?);
    Ok(ExitCode::SUCCESS)
}

pub fn show_config(config: &SimulatorConfig) -> anyhow::Result<ExitCode> {
    print!("{}", config.to_toml_redacted()?);
    Ok(ExitCode::SUCCESS)
}

fn exit_status(outcome: &TaskOutcome) -> u8 {
    match outcome {
        TaskOutcome::Completed { .. } => 0,
        TaskOutcome::Rejected { .. } => 2,
        TaskOutcome::Aborted { .. } => 3,
        TaskOutcome::Cancelled { .. } => 130,
    }
}
