//! Handler middleware.
//!
//! # Data Flow
//! ```text
//! AcceptedConnection
//!     → metrics.rs (live gauge, duration, processed counter)
//!     → connection handler (external: framing, forwarding)
//! ```
//!
//! # Design Decisions
//! - Middleware are tower layers so handlers stay plain `Service`s
//! - No middleware here changes the handler's control flow or result

pub mod metrics;

pub use self::metrics::{ConnectionMetrics, ConnectionMetricsLayer, ConnectionRequest};
