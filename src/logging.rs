#![forbid(unsafe_code)]

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Result, SombraError};

/// Installs a global fmt subscriber filtered by `level`.
///
/// `level` accepts any `EnvFilter` directive, e.g. `info` or
/// `sombra_pagelog::cache=trace`. Fails if a subscriber is already set.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level).map_err(|_| SombraError::Invalid("invalid log level"))?,
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|_| SombraError::Invalid("logging already initialized"))
}
