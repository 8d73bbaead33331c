//! Byte-counting connection wrapper.
//!
//! # Responsibilities
//! - Pass reads and writes through to the underlying stream untouched
//! - Attribute transferred bytes to `proxy_request_data` by direction
//! - Count every wrapped connection as incoming
//!
//! # Design Decisions
//! - Bytes can flow before the destination is known (TLS ClientHello,
//!   CONNECT line), so attribution never waits on the I/O path
//! - Until the hostname is known, bytes accumulate per connection and a
//!   single background flusher publishes them once it is; afterwards they
//!   go straight to the connection's resolved counters
//! - The flusher holds a detached waiter, so it ends with the connection
//!   even if no destination is ever set

use std::fmt;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use metrics::Counter;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::net::context::RequestContext;
use crate::observability::metrics::{spawn_detached, Direction, ProxyMetrics};

pin_project! {
    /// A stream whose traffic is counted against its connection's labels.
    #[derive(Debug)]
    pub struct InstrumentedConnection<S> {
        #[pin]
        inner: S,
        meter: TrafficMeter,
    }
}

impl<S> InstrumentedConnection<S> {
    /// Wrap an accepted stream. Counts one incoming connection.
    pub fn new(inner: S, context: Arc<RequestContext>, metrics: &ProxyMetrics) -> Self {
        metrics.incoming_connection();
        Self {
            inner,
            meter: TrafficMeter::new(context, metrics.clone()),
        }
    }

    pub fn context(&self) -> &Arc<RequestContext> {
        &self.meter.context
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead> AsyncRead for InstrumentedConnection<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if result.is_ready() {
            let read = buf.filled().len().saturating_sub(before);
            this.meter.record(Direction::Received, read);
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for InstrumentedConnection<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(outcome) = &result {
            let written = outcome.as_ref().copied().unwrap_or(0);
            this.meter.record(Direction::Sent, written);
        }
        result
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write_vectored(cx, bufs);
        if let Poll::Ready(outcome) = &result {
            let written = outcome.as_ref().copied().unwrap_or(0);
            this.meter.record(Direction::Sent, written);
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Per-connection byte attribution.
#[derive(Debug)]
struct TrafficMeter {
    context: Arc<RequestContext>,
    metrics: ProxyMetrics,
    state: Arc<TrafficState>,
}

/// Traffic state shared between the stream and its background flusher.
#[derive(Default)]
struct TrafficState {
    /// `proxy_request_data` series, resolved once the hostname is known.
    counters: OnceLock<[Counter; 2]>,
    /// Bytes seen before the hostname was known.
    pending: [AtomicU64; 2],
    flusher_started: AtomicBool,
}

impl TrafficState {
    fn counters(&self, metrics: &ProxyMetrics, request_type: &str, hostname: &str) -> &[Counter; 2] {
        self.counters
            .get_or_init(|| metrics.traffic_counters(request_type, hostname))
    }

    /// Publish everything accumulated so far. Safe to race: each byte is
    /// taken by exactly one drain.
    fn drain(&self, counters: &[Counter; 2]) {
        for direction in Direction::ALL {
            let bytes = self.pending[direction.index()].swap(0, Ordering::AcqRel);
            if bytes > 0 {
                counters[direction.index()].increment(bytes);
            }
        }
    }
}

impl fmt::Debug for TrafficState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrafficState")
            .field("resolved", &self.counters.get().is_some())
            .field("pending", &self.pending)
            .field("flusher_started", &self.flusher_started)
            .finish()
    }
}

impl TrafficMeter {
    fn new(context: Arc<RequestContext>, metrics: ProxyMetrics) -> Self {
        Self {
            context,
            metrics,
            state: Arc::new(TrafficState::default()),
        }
    }

    fn record(&self, direction: Direction, bytes: usize) {
        // Zero-length transfers carry nothing to attribute.
        if bytes == 0 {
            return;
        }
        let bytes = bytes as u64;

        if let Some(counters) = self.resolved() {
            counters[direction.index()].increment(bytes);
            return;
        }

        self.state.pending[direction.index()].fetch_add(bytes, Ordering::AcqRel);
        if !self.state.flusher_started.swap(true, Ordering::AcqRel) {
            self.spawn_flusher();
        }

        // The destination may have landed after the check above, in which
        // case the flusher could already have drained.
        if let Some(counters) = self.resolved() {
            self.state.drain(counters);
        }
    }

    /// The traffic counters, once the hostname is known.
    fn resolved(&self) -> Option<&[Counter; 2]> {
        if let Some(counters) = self.state.counters.get() {
            return Some(counters);
        }
        let hostname = self.context.try_hostname()?;
        Some(
            self.state
                .counters(&self.metrics, self.context.request_type(), &hostname),
        )
    }

    fn spawn_flusher(&self) {
        let waiter = self.context.hostname_waiter();
        let state = self.state.clone();
        let metrics = self.metrics.clone();
        let request_type = self.context.request_type().to_string();
        let connection_id = self.context.id();

        spawn_detached(async move {
            match waiter.wait().await {
                Some(hostname) => state.drain(state.counters(&metrics, &request_type, &hostname)),
                None => tracing::debug!(
                    connection_id = %connection_id,
                    sent = state.pending[Direction::Sent.index()].load(Ordering::Acquire),
                    received = state.pending[Direction::Received.index()].load(Ordering::Acquire),
                    "Connection closed before destination was known, traffic not attributed"
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::MetricsRegistry;
    use crate::observability::testing::{sample, test_recorder};
    use metrics_exporter_prometheus::PrometheusHandle;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn metrics() -> (ProxyMetrics, PrometheusHandle) {
        let (recorder, handle) = test_recorder();
        let metrics = ProxyMetrics::new(MetricsRegistry::new(recorder)).unwrap();
        (metrics, handle)
    }

    fn traffic(handle: &PrometheusHandle, scheme: &str, direction: &str, hostname: &str) -> Option<f64> {
        sample(
            &handle.render(),
            "proxy_request_data",
            &[("request_type", scheme), ("direction", direction), ("hostname", hostname)],
        )
    }

    async fn eventually(handle: &PrometheusHandle, scheme: &str, direction: &str, hostname: &str, expected: f64) {
        for _ in 0..100 {
            if traffic(handle, scheme, direction, hostname) == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "{direction} traffic for {hostname} never reached {expected}, last value {:?}",
            traffic(handle, scheme, direction, hostname)
        );
    }

    #[tokio::test]
    async fn counts_incoming_connection() {
        let (metrics, handle) = metrics();
        let (stream, _peer) = tokio::io::duplex(64);

        let _conn = InstrumentedConnection::new(stream, Arc::new(RequestContext::new("http")), &metrics);

        assert_eq!(
            sample(&handle.render(), "proxy_number_of_incomming_connections", &[]),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn sent_bytes_accumulate_across_writes() {
        let (metrics, handle) = metrics();
        let (stream, mut peer) = tokio::io::duplex(1024);
        let ctx = Arc::new(RequestContext::new("https"));
        ctx.set_destination("api.example.com");

        let mut conn = InstrumentedConnection::new(stream, ctx, &metrics);
        let chunks: [&[u8]; 4] = [b"hello", b" ", b"world", b"!!"];
        for chunk in chunks {
            conn.write_all(chunk).await.unwrap();
        }

        let mut buf = [0u8; 13];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world!!");

        eventually(&handle, "https", "sent", "example.com", 13.0).await;
    }

    #[tokio::test]
    async fn counters_resolve_once_destination_is_known() {
        let (metrics, handle) = metrics();
        let (stream, mut peer) = tokio::io::duplex(1024);
        let ctx = Arc::new(RequestContext::new("https"));
        ctx.set_destination("cdn.example.net");

        let mut conn = InstrumentedConnection::new(stream, ctx, &metrics);
        assert!(conn.meter.state.counters.get().is_none());

        conn.write_all(b"ping").await.unwrap();
        assert!(conn.meter.state.counters.get().is_some());
        assert!(!conn.meter.state.flusher_started.load(Ordering::Acquire));

        conn.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 8];
        peer.read_exact(&mut buf).await.unwrap();

        assert_eq!(traffic(&handle, "https", "sent", "example.net"), Some(8.0));
    }

    #[tokio::test]
    async fn vectored_writes_reach_inner_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = tokio::net::TcpStream::connect(listener.local_addr().unwrap());
        let (client, accepted) = tokio::join!(client, listener.accept());
        let mut client = client.unwrap();
        let (server, _) = accepted.unwrap();

        let (metrics, handle) = metrics();
        let ctx = Arc::new(RequestContext::new("http"));
        ctx.set_destination("example.com");
        let mut conn = InstrumentedConnection::new(server, ctx, &metrics);
        assert_eq!(conn.is_write_vectored(), conn.get_ref().is_write_vectored());

        let bufs = [IoSlice::new(b"HTTP/1.1 "), IoSlice::new(b"204\r\n\r\n")];
        let written = conn.write_vectored(&bufs).await.unwrap();
        assert!(written > 0);

        let mut received = vec![0u8; written];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(traffic(&handle, "http", "sent", "example.com"), Some(written as f64));
    }

    #[tokio::test]
    async fn bytes_before_destination_are_attributed_later() {
        let (metrics, handle) = metrics();
        let (stream, mut peer) = tokio::io::duplex(1024);
        let ctx = Arc::new(RequestContext::new("http"));
        let mut conn = InstrumentedConnection::new(stream, ctx.clone(), &metrics);

        peer.write_all(b"CONNECT shop.example.org:443\r\n").await.unwrap();
        let mut line = vec![0u8; 30];
        conn.read_exact(&mut line).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(traffic(&handle, "http", "received", "example.org"), None);

        ctx.set_destination("shop.example.org");
        eventually(&handle, "http", "received", "example.org", 30.0).await;

        peer.write_all(b"more").await.unwrap();
        let mut rest = [0u8; 4];
        conn.read_exact(&mut rest).await.unwrap();
        eventually(&handle, "http", "received", "example.org", 34.0).await;

        conn.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        eventually(&handle, "http", "sent", "example.org", 19.0).await;
    }

    #[tokio::test]
    async fn read_returns_before_destination_is_known() {
        let (metrics, _handle) = metrics();
        let (stream, mut peer) = tokio::io::duplex(64);
        let ctx = Arc::new(RequestContext::new("https"));
        let mut conn = InstrumentedConnection::new(stream, ctx, &metrics);

        peer.write_all(b"client hello").await.unwrap();
        let mut buf = [0u8; 12];
        let read = tokio::time::timeout(Duration::from_millis(500), conn.read_exact(&mut buf)).await;
        assert!(read.is_ok(), "read must not wait for the destination");
    }

    #[tokio::test]
    async fn errors_pass_through() {
        let (metrics, _handle) = metrics();
        let (stream, peer) = tokio::io::duplex(64);
        drop(peer);

        let ctx = Arc::new(RequestContext::new("http"));
        ctx.set_destination("example.com");
        let mut conn = InstrumentedConnection::new(stream, ctx, &metrics);

        let err = conn.write_all(b"data").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn flusher_abandoned_with_connection() {
        let (metrics, handle) = metrics();
        let (stream, mut peer) = tokio::io::duplex(64);
        let ctx = Arc::new(RequestContext::new("http"));
        let mut conn = InstrumentedConnection::new(stream, ctx.clone(), &metrics);

        peer.write_all(b"partial").await.unwrap();
        let mut buf = [0u8; 7];
        conn.read_exact(&mut buf).await.unwrap();

        let waiter = ctx.hostname_waiter();
        drop(conn);
        drop(ctx);

        assert_eq!(waiter.wait().await, None);
        assert!(!handle.render().contains("direction=\"received\""));
    }
}
