//! Collaborator interface for the CONNECT round trip
//!
//! The negotiator is transport-agnostic: anything that can carry one HTTP
//! request/response exchange with a streaming request body and a readable
//! response body can back a tunnel.
//! [`HttpTunnelTransport`](crate::HttpTunnelTransport) is the default
//! implementation; tests inject scripted ones.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use http::HeaderMap;
use tokio::io::AsyncRead;
use url::Url;

use crate::error::Result;

/// A boxed readable byte stream: one half-duplex leg of a tunnel.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin + 'static>;

/// Transport-level addresses observed when the leg to the relay came up.
#[derive(Debug, Clone, Copy)]
pub struct GotConn {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

/// Hook invoked once the transport connection to the relay is established.
pub type ConnTrace = Arc<dyn Fn(GotConn) + Send + Sync>;

/// One CONNECT request, ready for a single round trip against the relay.
///
/// The request target is the destination authority, not the relay's own
/// address; that is the defining characteristic of the CONNECT method.
pub struct ConnectRequest {
    pub relay: Url,
    /// Destination `host:port` the relay should open a raw pipe to.
    pub authority: String,
    /// Headers to send with the CONNECT request, e.g. `Proxy-Authorization`.
    pub headers: HeaderMap,
    /// Streaming request body; becomes the outbound half of the tunnel once
    /// the relay accepts. No body data may reach the relay before then.
    pub body: ByteStream,
    /// Invoked with the socket addresses of the relay leg, if set.
    pub trace: Option<ConnTrace>,
}

/// The relay's answer: the status portion of its status line plus the
/// readable response body, which becomes the inbound half of the tunnel.
pub struct ConnectResponse {
    /// Code and reason phrase, e.g. `200 Connection established` or
    /// `403 Forbidden`.
    pub status: String,
    pub body: ByteStream,
}

/// Performs one request/response round trip carrying a CONNECT exchange.
///
/// Implementations propagate transport-level failures (DNS, connect, TLS)
/// unchanged and add no retry behavior. Cancellation is cooperative: the
/// returned future aborts the exchange when dropped.
pub trait TunnelTransport: Send + Sync {
    fn round_trip(&self, request: ConnectRequest) -> BoxFuture<'static, Result<ConnectResponse>>;
}
