//! Connection metrics middleware.
//!
//! Wraps the per-connection handler service. While the handler runs the
//! connection counts as live; once it finishes (or is dropped) the live gauge
//! is released, the handling time observed and the connection counted as
//! processed.
//!
//! ```text
//! ACCEPTED ──call──▶ LIVE ──handler done / dropped──▶ COMPLETED
//!                     │
//!                     └─ gauge +1 once the hostname is known (background)
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use pin_project_lite::pin_project;
use tower::{Layer, Service};

use crate::net::context::RequestContext;
use crate::observability::metrics::{spawn_detached, ProxyMetrics};

/// A request that belongs to a proxied connection.
pub trait ConnectionRequest {
    fn request_context(&self) -> &Arc<RequestContext>;
}

impl ConnectionRequest for Arc<RequestContext> {
    fn request_context(&self) -> &Arc<RequestContext> {
        self
    }
}

/// Layer applying [`ConnectionMetrics`] to a connection handler.
#[derive(Debug, Clone)]
pub struct ConnectionMetricsLayer {
    metrics: ProxyMetrics,
}

impl ConnectionMetricsLayer {
    pub fn new(metrics: ProxyMetrics) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for ConnectionMetricsLayer {
    type Service = ConnectionMetrics<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConnectionMetrics {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

/// Middleware recording connection lifecycle metrics around a handler.
///
/// The handler's output, errors included, is returned untouched.
#[derive(Debug, Clone)]
pub struct ConnectionMetrics<S> {
    inner: S,
    metrics: ProxyMetrics,
}

impl<S, R> Service<R> for ConnectionMetrics<S>
where
    S: Service<R>,
    R: ConnectionRequest,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: R) -> Self::Future {
        let live = LiveConnection::open(request.request_context().clone(), self.metrics.clone());
        ResponseFuture {
            inner: self.inner.call(request),
            live: Some(live),
        }
    }
}

pin_project! {
    /// Future returned by [`ConnectionMetrics`].
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        live: Option<LiveConnection>,
    }
}

impl<F: Future> Future for ResponseFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let output = ready!(this.inner.poll(cx));
        // Finalize before handing the result back.
        this.live.take();
        Poll::Ready(output)
    }
}

/// Progress of the live-gauge accounting for one connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiveState {
    /// Waiting for the hostname; gauge untouched.
    Pending = 0,
    /// Gauge incremented.
    Counted = 1,
    /// Handler finished.
    Completed = 2,
}

impl From<u8> for LiveState {
    fn from(val: u8) -> Self {
        match val {
            1 => LiveState::Counted,
            2 => LiveState::Completed,
            _ => LiveState::Pending,
        }
    }
}

/// Guard finalizing a connection's metrics when dropped.
///
/// The gauge is only decremented if the increment already landed, and a late
/// increment reverts itself, so the gauge never dips below its baseline.
struct LiveConnection {
    context: Arc<RequestContext>,
    metrics: ProxyMetrics,
    state: Arc<AtomicU8>,
    started: Instant,
}

impl LiveConnection {
    fn open(context: Arc<RequestContext>, metrics: ProxyMetrics) -> Self {
        let state = Arc::new(AtomicU8::new(LiveState::Pending as u8));

        let waiter = context.hostname_waiter();
        let request_type = context.request_type().to_string();
        let task_metrics = metrics.clone();
        let task_state = state.clone();
        spawn_detached(async move {
            let Some(hostname) = waiter.wait().await else {
                return;
            };
            task_metrics.live_connection_opened(&request_type, &hostname);
            let counted = task_state.compare_exchange(
                LiveState::Pending as u8,
                LiveState::Counted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if counted.is_err() {
                task_metrics.live_connection_closed(&request_type, &hostname);
            }
        });

        Self {
            context,
            metrics,
            state,
            started: Instant::now(),
        }
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        let request_type = self.context.request_type();
        if !self.context.is_destination_set() {
            tracing::warn!(
                connection_id = %self.context.id(),
                request_type,
                "Handler finished without setting a destination"
            );
        }
        let hostname = self.context.hostname();

        let previous = LiveState::from(self.state.swap(LiveState::Completed as u8, Ordering::AcqRel));
        if previous == LiveState::Counted {
            self.metrics.live_connection_closed(request_type, &hostname);
        }
        self.metrics.observe_duration(request_type, &hostname, elapsed);
        self.metrics.processed_connection(request_type, &hostname);

        tracing::trace!(
            connection_id = %self.context.id(),
            hostname = %hostname,
            elapsed_ms = elapsed.as_millis() as u64,
            "Connection completed"
        );
    }
}
