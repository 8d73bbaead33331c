//! Connection-level observability for a forwarding proxy.
//!
//! A proxy learns where a connection is going only after inspecting its first
//! bytes (HTTP `Host`, TLS SNI). This crate records per-connection metrics
//! across that gap:
//!
//! ```text
//! accept ──▶ RequestContext ──▶ InstrumentedConnection ──▶ ConnectionMetrics ──▶ handler
//!                 ▲                  (bytes sent/received)     (live, duration,      │
//!                 │                                              processed)          │
//!                 └────────────────── set_destination(host) ◀────────────────────────┘
//! ```
//!
//! Metrics that need the destination label wait for it in the background;
//! nothing on the I/O path ever blocks on it.

pub mod config;
pub mod lifecycle;
pub mod middleware;
pub mod net;
pub mod observability;
pub mod server;

pub use config::ForwarderConfig;
pub use lifecycle::Shutdown;
pub use middleware::{ConnectionMetrics, ConnectionMetricsLayer, ConnectionRequest};
pub use net::{InstrumentedConnection, RequestContext};
pub use observability::metrics::{MetricsError, ProxyMetrics};
pub use observability::Telemetry;
pub use server::{AcceptedConnection, ConnectionServer};
