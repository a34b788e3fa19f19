//! Layered simulator configuration.
//!
//! Sources, lowest precedence first:
//! 1. Defaults (from code)
//! 2. Config file (`tracksim.toml`)
//! 3. Environment variables (`TRACKSIM_*`, `__` for nesting)
//!
//! Command-line overrides are applied by the binary on top of the result.
//!
//! ```no_run
//! use tracksim_core::config::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .with_file("./tracksim.toml")
//!     .load()
//!     .expect("Failed to load config");
//! ```

pub mod error;
pub mod loader;

pub use error::{ConfigError, Result};
pub use loader::{
    ConfigLoader, CourierCredential, PacingConfig, PathConfig, RetryConfig, SimulatorConfig,
};
