//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once per process
//! - Honour `RUST_LOG`, falling back to the configured level
//!
//! # Design Decisions
//! - JSON format for production, pretty format for development

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, ObservabilityConfig};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter {directive:?}: {source}")]
    Filter {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("failed to install tracing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Build the filter: `RUST_LOG` when present, the configured level otherwise.
pub fn build_filter(config: &ObservabilityConfig) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|source| LoggingError::Filter {
            directive: config.log_level.clone(),
            source,
        }),
    }
}

/// Install the global tracing subscriber.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), LoggingError> {
    let registry = tracing_subscriber::registry().with(build_filter(config)?);

    match config.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true).with_current_span(false))
            .try_init()?,
        LogFormat::Pretty => registry.with(fmt::layer()).try_init()?,
    }

    tracing::debug!(level = %config.log_level, format = ?config.log_format, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_directive() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = ObservabilityConfig {
            log_level: "info,proxy=loud".to_string(),
            ..ObservabilityConfig::default()
        };
        assert!(matches!(build_filter(&config), Err(LoggingError::Filter { .. })));
    }

    #[test]
    fn subscriber_installs_once() {
        let config = ObservabilityConfig {
            log_format: LogFormat::Json,
            log_level: "warn".to_string(),
            ..ObservabilityConfig::default()
        };

        // Nothing else in this binary installs a global subscriber.
        assert!(init_logging(&config).is_ok());
        assert!(matches!(init_logging(&config), Err(LoggingError::Init(_))));
    }

    #[test]
    fn accepts_module_directives() {
        let config = ObservabilityConfig {
            log_level: "forwarder_metrics=debug,info".to_string(),
            ..ObservabilityConfig::default()
        };
        assert!(build_filter(&config).is_ok());
    }
}
