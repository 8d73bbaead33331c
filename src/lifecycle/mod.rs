//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Ctrl+C / embedding application
//!     → Shutdown::trigger
//!     → every ConnectionServer stops accepting
//!     → in-flight connections finish on their own
//! ```

pub mod shutdown;

pub use shutdown::Shutdown;
