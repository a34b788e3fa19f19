//! `tracksim` entry point.
//!
//! Streams simulated courier positions to the tracking service. Logs go to
//! stderr; command output (paths, configuration, outcomes) goes to stdout.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod args;
mod commands;

use args::{Cli, Command, LogFormat};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.global.log_format);

    let config = commands::load_config(&cli.global)?;
    match cli.command {
        Command::Run => commands::run(config).await,
        Command::Simulate(args) => commands::simulate(config, args).await,
        Command::Path(args) => commands::path(&config, &args),
        Command::Config => commands::show_config(&config),
    }
}
