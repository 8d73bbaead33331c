//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges and address formats
//! - Detect conflicting listeners
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::schema::ForwarderConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &ForwarderConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listeners.is_empty() {
        errors.push(ValidationError::new("listeners", "at least one listener is required"));
    }

    let mut bound = HashSet::new();
    for (i, listener) in config.listeners.iter().enumerate() {
        let field = |name: &str| format!("listeners[{i}].{name}");

        match listener.bind_address.parse::<SocketAddr>() {
            Ok(addr) => {
                if !bound.insert(addr) {
                    errors.push(ValidationError::new(field("bind_address"), format!("{addr} is used twice")));
                }
            }
            Err(e) => errors.push(ValidationError::new(
                field("bind_address"),
                format!("{:?} is not a socket address: {e}", listener.bind_address),
            )),
        }

        if listener.scheme.trim().is_empty() {
            errors.push(ValidationError::new(field("scheme"), "must not be empty"));
        }

        if listener.max_connections == 0 {
            errors.push(ValidationError::new(field("max_connections"), "must be greater than 0"));
        }
    }

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("{:?} is not a socket address", observability.metrics_address),
        ));
    }

    if let Err(e) = EnvFilter::try_new(&observability.log_level) {
        errors.push(ValidationError::new("observability.log_level", e.to_string()));
    }

    let buckets = &observability.duration_buckets;
    if buckets.is_empty() {
        errors.push(ValidationError::new("observability.duration_buckets", "must not be empty"));
    } else if buckets.iter().any(|b| !b.is_finite()) {
        errors.push(ValidationError::new("observability.duration_buckets", "must be finite"));
    } else if buckets.windows(2).any(|pair| pair[0] >= pair[1]) {
        errors.push(ValidationError::new("observability.duration_buckets", "must be strictly increasing"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ListenerConfig;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&ForwarderConfig::default()), Ok(()));
    }

    #[test]
    fn reports_every_problem() {
        let mut config = ForwarderConfig::default();
        config.listeners = vec![
            ListenerConfig {
                bind_address: "127.0.0.1:8080".into(),
                scheme: "http".into(),
                max_connections: 0,
            },
            ListenerConfig {
                bind_address: "127.0.0.1:8080".into(),
                scheme: " ".into(),
                max_connections: 10,
            },
        ];
        config.observability.metrics_address = "metrics".into();
        config.observability.duration_buckets = vec![0.5, 0.1];

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "listeners[0].max_connections",
                "listeners[1].bind_address",
                "listeners[1].scheme",
                "observability.metrics_address",
                "observability.duration_buckets",
            ]
        );
    }

    #[test]
    fn metrics_address_ignored_when_disabled() {
        let mut config = ForwarderConfig::default();
        config.observability.metrics_enabled = false;
        config.observability.metrics_address = String::new();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn requires_a_listener() {
        let config = ForwarderConfig {
            listeners: Vec::new(),
            ..ForwarderConfig::default()
        };
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "listeners");
    }

    #[test]
    fn rejects_non_finite_buckets() {
        let mut config = ForwarderConfig::default();
        config.observability.duration_buckets = vec![0.1, f64::INFINITY];
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].to_string(), "observability.duration_buckets: must be finite");
    }
}
