//! Per-connection request context.
//!
//! # Responsibilities
//! - Carry the connection's scheme (the `request_type` label)
//! - Hold the destination host once protocol parsing discovers it
//! - Let any number of waiters suspend until the destination is known
//!
//! # Design Decisions
//! - The destination lives in a `watch` channel used as a write-once cell:
//!   `None` until set, `Some(host)` forever after
//! - Detached waiters hold only a receiver, so they resolve to `None` once
//!   the context itself is dropped without a destination
//! - Hostnames are normalized on every access, never stored normalized

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use regex::Regex;
use tokio::sync::watch;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough: only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Context of a single proxied connection.
///
/// Created by the accept loop, shared via `Arc` between the handler and the
/// instrumentation wrappers, dropped with the connection.
#[derive(Debug)]
pub struct RequestContext {
    id: ConnectionId,
    scheme: String,
    peer_addr: Option<SocketAddr>,
    /// Raw destination host, written at most once.
    destination: watch::Sender<Option<String>>,
}

impl RequestContext {
    /// Create a context for a connection handled under `scheme` (e.g. "http", "https").
    pub fn new(scheme: impl Into<String>) -> Self {
        let (destination, _) = watch::channel(None);
        Self {
            id: ConnectionId::new(),
            scheme: scheme.into(),
            peer_addr: None,
            destination,
        }
    }

    /// Attach the client's address.
    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The protocol tag this connection is handled under. Never blocks.
    pub fn request_type(&self) -> &str {
        &self.scheme
    }

    /// Record the destination host and release every waiter.
    ///
    /// Must be called at most once per connection. Later calls keep the first
    /// value, log a warning and return `false`.
    pub fn set_destination(&self, host: impl Into<String>) -> bool {
        let host = host.into();
        let stored = self.destination.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(host.clone());
            true
        });

        if stored {
            tracing::debug!(connection_id = %self.id, destination = %host, "Destination resolved");
        } else {
            tracing::warn!(
                connection_id = %self.id,
                ignored = %host,
                current = ?self.destination(),
                "Destination already set, ignoring"
            );
        }
        stored
    }

    /// The raw destination host, if it has been set.
    pub fn destination(&self) -> Option<String> {
        self.destination.borrow().clone()
    }

    /// Whether `set_destination` has happened.
    pub fn is_destination_set(&self) -> bool {
        self.destination.borrow().is_some()
    }

    /// Wait until the destination is set, then return the normalized hostname.
    ///
    /// Pends forever if the destination is never set. Callers that need a
    /// deadline must race this against their own cancellation.
    pub async fn wait_hostname(&self) -> String {
        match self.hostname_waiter().wait().await {
            Some(hostname) => hostname,
            // `self` keeps the sender alive, so the waiter cannot observe a close.
            None => std::future::pending().await,
        }
    }

    /// A waiter that does not keep this context alive.
    pub fn hostname_waiter(&self) -> HostnameWaiter {
        HostnameWaiter {
            rx: self.destination.subscribe(),
        }
    }

    /// Normalized hostname of whatever destination is currently stored.
    ///
    /// Empty until the destination is set. Meant for call sites that run
    /// after the handler is done.
    pub fn hostname(&self) -> String {
        self.try_hostname().unwrap_or_default()
    }

    /// Normalized hostname, or `None` while the destination is unknown.
    pub fn try_hostname(&self) -> Option<String> {
        self.destination.borrow().as_deref().map(normalize_hostname)
    }
}

/// Detached handle that resolves once a context's destination is known.
#[derive(Debug)]
pub struct HostnameWaiter {
    rx: watch::Receiver<Option<String>>,
}

impl HostnameWaiter {
    /// Resolves to the normalized hostname, or `None` if the context was
    /// dropped before any destination was set.
    pub async fn wait(mut self) -> Option<String> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(destination) => destination.as_deref().map(normalize_hostname),
            Err(_) => None,
        }
    }
}

fn hostname_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[0-9A-Za-z_]+\.[0-9A-Za-z_]+$").expect("hostname pattern is a valid regex")
    })
}

/// Reduce a raw host to its last two dot-separated labels, lowercased.
///
/// Known limitation: ports (`example.com:443`), IPv6 literals and single-label
/// hosts yield `""`, and dotted IPv4 addresses keep only their last two octets.
pub fn normalize_hostname(host: &str) -> String {
    let lowered = host.to_lowercase();
    hostname_pattern()
        .find(&lowered)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}
