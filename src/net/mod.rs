//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bounded accept, connection limits)
//!     → context.rs (RequestContext: scheme, destination, one-shot signal)
//!     → connection.rs (InstrumentedConnection: byte accounting)
//!     → Hand off to the connection handler
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - The destination is unknown at accept time; everything that needs it
//!   either waits on the context or records once it is set

pub mod connection;
pub mod context;
pub mod listener;

pub use connection::InstrumentedConnection;
pub use context::{normalize_hostname, ConnectionId, HostnameWaiter, RequestContext};
pub use listener::{ConnectionPermit, Listener, ListenerError};
