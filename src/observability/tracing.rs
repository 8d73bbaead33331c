//! Per-connection spans.
//!
//! Every connection task runs inside a `connection` span so that log lines
//! from handlers and metric warnings carry the connection ID, scheme and peer.

use tracing::Span;

use crate::net::context::RequestContext;

/// Span covering the whole lifetime of one connection.
pub fn connection_span(context: &RequestContext) -> Span {
    match context.peer_addr() {
        Some(peer) => tracing::info_span!(
            "connection",
            id = %context.id(),
            scheme = context.request_type(),
            peer = %peer,
        ),
        None => tracing::info_span!(
            "connection",
            id = %context.id(),
            scheme = context.request_type(),
        ),
    }
}
