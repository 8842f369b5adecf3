//! Process-wide logger setup
//!
//! The crate logs through the `log` facade. Hosts that already install a
//! logger can skip this; `init` is for hosts that just want the configured
//! level and destination. `RUST_LOG` takes precedence over the config.
//!
//! Key material, seeds and session keys are never logged.

use std::fs::OpenOptions;
use std::str::FromStr;

use log::LevelFilter;
use thiserror::Error;

use crate::config::LogConfig;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Cannot open log file {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("A logger is already installed")]
    AlreadyInitialized,
}

/// Level named in the config, or `Info` if unrecognised.
pub fn level_filter(conf: &LogConfig) -> LevelFilter {
    LevelFilter::from_str(conf.level.trim()).unwrap_or(LevelFilter::Info)
}

/// Install `env_logger` according to `conf`.
pub fn init(conf: &LogConfig) -> Result<(), LoggingError> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level_filter(conf)).parse_default_env();

    if let Some(path) = &conf.path {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| LoggingError::OpenFailed {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    if LevelFilter::from_str(conf.level.trim()).is_err() {
        log::warn!("Unknown log level {:?}, using info", conf.level);
    }
    Ok(())
}
