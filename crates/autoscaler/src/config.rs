//! Settings loading
//!
//! Built-in defaults, then an optional TOML file, then `AUTOSCALER_*`
//! environment variables with `__` between nested keys
//! (`AUTOSCALER_PROXMOX__PASSWORD`).

use anyhow::{Context, Result};
use autoscaler_lib::AutoscalerSettings;
use config::{Config, Environment, File, FileFormat};
use std::path::Path;

const ENV_PREFIX: &str = "AUTOSCALER";

/// Load settings from `path` (if any) and the process environment
pub fn load(path: Option<&Path>) -> Result<AutoscalerSettings> {
    load_with_env(path, environment())
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn load_with_env(path: Option<&Path>, env: Environment) -> Result<AutoscalerSettings> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
    }

    let settings: AutoscalerSettings = builder
        .add_source(env)
        .build()
        .context("failed to read autoscaler settings")?
        .try_deserialize()
        .context("invalid autoscaler settings")?;

    settings.validate().context("autoscaler settings rejected")?;
    Ok(settings)
}
