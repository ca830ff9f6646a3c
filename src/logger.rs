use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*};

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("Invalid log level '{level}'")]
    InvalidLevel {
        level: String,
        #[source]
        source: ParseError,
    },

    #[error("Failed to install the global logger")]
    Init(#[from] TryInitError),
}

/// Builds the filter: `RUST_LOG` wins, else `level`.
pub fn env_filter(level: &str) -> Result<EnvFilter, LoggerError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|source| LoggerError::InvalidLevel {
        level: level.to_string(),
        source,
    })
}

pub fn init_logger(level: &str, with_timestamp: bool) -> Result<(), LoggerError> {
    let filter = env_filter(level)?;
    let layer = fmt::layer().with_target(true);

    // both arms box to the same type
    let layer = if with_timestamp {
        layer.boxed()
    } else {
        layer.without_time().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()?;
    Ok(())
}
