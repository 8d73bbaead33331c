//! Metrics collection.
//!
//! # Responsibilities
//! - Declare the connection metrics and their label schemas
//! - Reject duplicate registration at startup
//! - Validate label sets when resolving a series
//! - Offer typed recording helpers to the connection wrappers
//!
//! # Metrics
//! - `proxy_request_duration` (histogram): handling time by request_type, hostname
//! - `proxy_number_of_live_connections` (gauge): open connections by request_type, hostname
//! - `proxy_number_of_processed_connections` (counter): finished connections by request_type, hostname
//! - `proxy_number_of_incomming_connections` (counter): every accepted connection, unlabeled
//! - `proxy_request_data` (counter): bytes by request_type, direction, hostname
//!
//! # Design Decisions
//! - The recorder is owned by the composition root and passed in; nothing
//!   here touches the global `metrics` recorder
//! - Runtime update failures are logged and dropped, never returned to I/O paths
//! - Registration needs `&mut`, so the definitions are frozen once the
//!   registry is shared and lookups take no lock
//! - Per-connection traffic resolves its two counters once; every read and
//!   write after that is a single atomic add

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::{Counter, Gauge, Histogram, Key, Label, Level, Metadata, Recorder, Unit};
use thiserror::Error;

/// Kind of a metric series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// Static description of a metric and its label schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDef {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub unit: Option<Unit>,
    /// Label names, in the order values must be supplied.
    pub labels: &'static [&'static str],
}

pub const REQUEST_TYPE: &str = "request_type";
pub const HOSTNAME: &str = "hostname";
pub const DIRECTION: &str = "direction";

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "proxy_request_duration",
    help: "Proxy request duration in seconds",
    kind: MetricKind::Histogram,
    unit: Some(Unit::Seconds),
    labels: &[REQUEST_TYPE, HOSTNAME],
};

pub const LIVE_CONNECTIONS: MetricDef = MetricDef {
    name: "proxy_number_of_live_connections",
    help: "Number of currently live connections",
    kind: MetricKind::Gauge,
    unit: None,
    labels: &[REQUEST_TYPE, HOSTNAME],
};

pub const PROCESSED_CONNECTIONS: MetricDef = MetricDef {
    name: "proxy_number_of_processed_connections",
    help: "Number of incoming connections which were successfully assigned and processed",
    kind: MetricKind::Counter,
    unit: None,
    labels: &[REQUEST_TYPE, HOSTNAME],
};

pub const INCOMING_CONNECTIONS: MetricDef = MetricDef {
    name: "proxy_number_of_incomming_connections",
    help: "Number of incomming connections (failed and successful)",
    kind: MetricKind::Counter,
    unit: None,
    labels: &[],
};

pub const REQUEST_DATA: MetricDef = MetricDef {
    name: "proxy_request_data",
    help: "Proxy request data in bytes",
    kind: MetricKind::Counter,
    unit: Some(Unit::Bytes),
    labels: &[REQUEST_TYPE, DIRECTION, HOSTNAME],
};

/// Every metric registered by [`ProxyMetrics`].
pub const CATALOG: [&MetricDef; 5] = [
    &REQUEST_DURATION,
    &LIVE_CONNECTIONS,
    &PROCESSED_CONNECTIONS,
    &INCOMING_CONNECTIONS,
    &REQUEST_DATA,
];

/// Traffic direction, from the proxy's point of view on the client socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    /// Every direction, in the order used by [`ProxyMetrics::traffic_counters`].
    pub const ALL: [Direction; 2] = [Direction::Sent, Direction::Received];

    pub fn index(&self) -> usize {
        match self {
            Direction::Sent => 0,
            Direction::Received => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the metrics layer.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric {0} is already registered")]
    DuplicateMetric(&'static str),

    #[error("metric {0} is not registered")]
    UnknownMetric(&'static str),

    #[error("metric {name} is a {actual}, not a {requested}")]
    KindMismatch {
        name: &'static str,
        actual: MetricKind,
        requested: MetricKind,
    },

    #[error("metric {name} expects labels {expected:?}, got {actual:?}")]
    LabelMismatch {
        name: &'static str,
        expected: &'static [&'static str],
        actual: Vec<&'static str>,
    },

    #[error("invalid metrics address {0:?}")]
    InvalidAddress(String),

    #[error("the metrics endpoint must be started from within a Tokio runtime")]
    NoRuntime,

    #[error("failed to build Prometheus exporter: {0}")]
    Exporter(#[from] metrics_exporter_prometheus::BuildError),
}

/// Label-validating front of a metrics recorder.
pub struct MetricsRegistry {
    recorder: Arc<dyn Recorder + Send + Sync>,
    registered: HashMap<&'static str, &'static MetricDef>,
}

impl MetricsRegistry {
    pub fn new(recorder: Arc<dyn Recorder + Send + Sync>) -> Self {
        Self {
            recorder,
            registered: HashMap::new(),
        }
    }

    /// Declare a metric. Registering the same name twice is an error.
    pub fn register(&mut self, def: &'static MetricDef) -> Result<(), MetricsError> {
        if self.registered.contains_key(def.name) {
            return Err(MetricsError::DuplicateMetric(def.name));
        }
        self.registered.insert(def.name, def);

        let name = def.name.into();
        let help = def.help.into();
        match def.kind {
            MetricKind::Counter => self.recorder.describe_counter(name, def.unit, help),
            MetricKind::Gauge => self.recorder.describe_gauge(name, def.unit, help),
            MetricKind::Histogram => self.recorder.describe_histogram(name, def.unit, help),
        }

        tracing::debug!(metric = def.name, kind = %def.kind, labels = ?def.labels, "Metric registered");
        Ok(())
    }

    pub fn counter(&self, def: &MetricDef, labels: &[(&'static str, &str)]) -> Result<Counter, MetricsError> {
        let key = self.key(def, MetricKind::Counter, labels)?;
        Ok(self.recorder.register_counter(&key, &metadata()))
    }

    pub fn gauge(&self, def: &MetricDef, labels: &[(&'static str, &str)]) -> Result<Gauge, MetricsError> {
        let key = self.key(def, MetricKind::Gauge, labels)?;
        Ok(self.recorder.register_gauge(&key, &metadata()))
    }

    pub fn histogram(&self, def: &MetricDef, labels: &[(&'static str, &str)]) -> Result<Histogram, MetricsError> {
        let key = self.key(def, MetricKind::Histogram, labels)?;
        Ok(self.recorder.register_histogram(&key, &metadata()))
    }

    /// Build the series key after checking the request against the declared schema.
    fn key(
        &self,
        def: &MetricDef,
        requested: MetricKind,
        labels: &[(&'static str, &str)],
    ) -> Result<Key, MetricsError> {
        let declared = self
            .registered
            .get(def.name)
            .copied()
            .ok_or(MetricsError::UnknownMetric(def.name))?;

        if declared.kind != requested {
            return Err(MetricsError::KindMismatch {
                name: declared.name,
                actual: declared.kind,
                requested,
            });
        }

        let names_match = declared.labels.len() == labels.len()
            && declared.labels.iter().zip(labels).all(|(expected, (name, _))| expected == name);
        if !names_match {
            return Err(MetricsError::LabelMismatch {
                name: declared.name,
                expected: declared.labels,
                actual: labels.iter().map(|(name, _)| *name).collect(),
            });
        }

        let labels: Vec<Label> = labels
            .iter()
            .map(|(name, value)| Label::new(*name, value.to_string()))
            .collect();
        Ok(Key::from_parts(declared.name, labels))
    }
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("registered", &self.registered.len())
            .finish_non_exhaustive()
    }
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

/// Typed recording API for the connection metrics.
///
/// Cheap to clone; every clone records into the same registry.
#[derive(Debug, Clone)]
pub struct ProxyMetrics {
    registry: Arc<MetricsRegistry>,
}

impl ProxyMetrics {
    /// Register the connection metrics and freeze the registry. Failure here
    /// leaves metrics unusable and should abort startup.
    pub fn new(mut registry: MetricsRegistry) -> Result<Self, MetricsError> {
        for def in CATALOG {
            registry.register(def)?;
        }
        Ok(Self {
            registry: Arc::new(registry),
        })
    }

    /// Count an accepted connection, before anything is known about it.
    pub fn incoming_connection(&self) {
        match self.registry.counter(&INCOMING_CONNECTIONS, &[]) {
            Ok(counter) => counter.increment(1),
            Err(error) => dropped(&INCOMING_CONNECTIONS, error),
        }
    }

    /// Resolve the `proxy_request_data` series of one connection, indexed by
    /// [`Direction::index`]. A series that cannot be resolved becomes a no-op.
    pub fn traffic_counters(&self, request_type: &str, hostname: &str) -> [Counter; 2] {
        Direction::ALL.map(|direction| {
            let labels = [
                (REQUEST_TYPE, request_type),
                (DIRECTION, direction.as_str()),
                (HOSTNAME, hostname),
            ];
            self.registry.counter(&REQUEST_DATA, &labels).unwrap_or_else(|error| {
                dropped(&REQUEST_DATA, error);
                Counter::noop()
            })
        })
    }

    pub fn live_connection_opened(&self, request_type: &str, hostname: &str) {
        match self.registry.gauge(&LIVE_CONNECTIONS, &[(REQUEST_TYPE, request_type), (HOSTNAME, hostname)]) {
            Ok(gauge) => gauge.increment(1.0),
            Err(error) => dropped(&LIVE_CONNECTIONS, error),
        }
    }

    pub fn live_connection_closed(&self, request_type: &str, hostname: &str) {
        match self.registry.gauge(&LIVE_CONNECTIONS, &[(REQUEST_TYPE, request_type), (HOSTNAME, hostname)]) {
            Ok(gauge) => gauge.decrement(1.0),
            Err(error) => dropped(&LIVE_CONNECTIONS, error),
        }
    }

    pub fn observe_duration(&self, request_type: &str, hostname: &str, elapsed: Duration) {
        match self.registry.histogram(&REQUEST_DURATION, &[(REQUEST_TYPE, request_type), (HOSTNAME, hostname)]) {
            Ok(histogram) => histogram.record(elapsed.as_secs_f64()),
            Err(error) => dropped(&REQUEST_DURATION, error),
        }
    }

    pub fn processed_connection(&self, request_type: &str, hostname: &str) {
        match self.registry.counter(&PROCESSED_CONNECTIONS, &[(REQUEST_TYPE, request_type), (HOSTNAME, hostname)]) {
            Ok(counter) => counter.increment(1),
            Err(error) => dropped(&PROCESSED_CONNECTIONS, error),
        }
    }
}

fn dropped(def: &MetricDef, error: MetricsError) {
    tracing::warn!(metric = def.name, %error, "Dropping metric update");
}

/// Run a metric update in the background.
///
/// Outside a Tokio runtime the update is dropped with a warning.
pub fn spawn_detached<F>(task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(task);
        }
        Err(_) => tracing::warn!("No Tokio runtime available, dropping background metric update"),
    }
}
