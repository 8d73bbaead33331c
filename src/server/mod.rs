//! Accept loop wiring connections through the instrumentation.
//!
//! # Responsibilities
//! - Create a `RequestContext` per accepted socket
//! - Wrap the socket in an `InstrumentedConnection`
//! - Drive the handler through the metrics middleware, one task per connection
//! - Stop accepting when shutdown is signalled
//!
//! # Design Decisions
//! - The handler is any cloneable tower `Service<AcceptedConnection>`
//! - Handler failures are logged and stay local to their connection

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tower::{Layer, Service, ServiceExt};
use tracing::Instrument;

use crate::middleware::{ConnectionMetricsLayer, ConnectionRequest};
use crate::net::connection::InstrumentedConnection;
use crate::net::context::RequestContext;
use crate::net::listener::{Listener, ListenerError};
use crate::observability::metrics::ProxyMetrics;
use crate::observability::tracing::connection_span;

/// An accepted connection handed to the handler.
#[derive(Debug)]
pub struct AcceptedConnection<S = TcpStream> {
    pub context: Arc<RequestContext>,
    pub stream: InstrumentedConnection<S>,
}

impl<S> AcceptedConnection<S> {
    /// Build the context and instrumented stream for a freshly accepted socket.
    pub fn new(stream: S, scheme: &str, peer_addr: Option<SocketAddr>, metrics: &ProxyMetrics) -> Self {
        let mut context = RequestContext::new(scheme);
        if let Some(peer_addr) = peer_addr {
            context = context.with_peer_addr(peer_addr);
        }
        let context = Arc::new(context);
        let stream = InstrumentedConnection::new(stream, context.clone(), metrics);
        Self { context, stream }
    }
}

impl<S> ConnectionRequest for AcceptedConnection<S> {
    fn request_context(&self) -> &Arc<RequestContext> {
        &self.context
    }
}

/// Serves one listener: every connection runs `handler` under the metrics middleware.
pub struct ConnectionServer<H> {
    listener: Listener,
    scheme: String,
    metrics: ProxyMetrics,
    handler: H,
}

impl<H> ConnectionServer<H>
where
    H: Service<AcceptedConnection> + Clone + Send + 'static,
    H::Future: Send + 'static,
    H::Error: Display + Send + 'static,
{
    pub fn new(listener: Listener, scheme: impl Into<String>, metrics: ProxyMetrics, handler: H) -> Self {
        Self {
            listener,
            scheme: scheme.into(),
            metrics,
            handler,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// Connections already running keep going; their tasks end on their own.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ListenerError> {
        let service = ConnectionMetricsLayer::new(self.metrics.clone()).layer(self.handler);

        tracing::info!(
            scheme = %self.scheme,
            max_connections = self.listener.max_connections(),
            "Accepting connections"
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(scheme = %self.scheme, "Shutdown signal received, no longer accepting");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Accept(error)) => {
                    tracing::warn!(%error, "Accept failed");
                    continue;
                }
                Err(error) => return Err(error),
            };

            if let Err(error) = stream.set_nodelay(true) {
                tracing::debug!(%error, "Failed to set TCP_NODELAY");
            }

            let connection = AcceptedConnection::new(stream, &self.scheme, Some(peer_addr), &self.metrics);
            let span = connection_span(&connection.context);
            let service = service.clone();

            tokio::spawn(
                async move {
                    let _permit = permit;
                    if let Err(error) = service.oneshot(connection).await {
                        tracing::debug!(%error, "Connection handler failed");
                    }
                }
                .instrument(span),
            );
        }
    }
}
