//! Tunnel negotiation: the CONNECT handshake
//!
//! Builds the CONNECT request, runs it through a [`TunnelTransport`], and
//! classifies the outcome. On success the response body and the request
//! body pipe become the two halves of a [`TunnelConn`].

pub mod tcp;
pub mod transport;

use std::sync::{Arc, OnceLock};

use http::HeaderMap;
use url::Url;

use crate::conn::TunnelConn;
use crate::error::{Error, Result};

use transport::{ConnTrace, ConnectRequest, GotConn, TunnelTransport};

/// Capacity of the in-memory pipe feeding the outbound tunnel leg.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Perform the CONNECT handshake for `address` through `relay`.
///
/// Rejects non-TCP networks before any network activity. The returned
/// connection only exists after the relay answered with status 200; no
/// application data flows earlier.
pub(crate) async fn establish(
    relay: &Url,
    headers: HeaderMap,
    transport: &dyn TunnelTransport,
    network: &str,
    address: &str,
) -> Result<TunnelConn> {
    match network {
        "tcp" | "tcp4" | "tcp6" => {}
        other => return Err(Error::UnsupportedNetwork(other.to_string())),
    }

    let (body_reader, sink_writer) = tokio::io::simplex(PIPE_CAPACITY);

    let addrs: Arc<OnceLock<GotConn>> = Arc::new(OnceLock::new());
    let trace: ConnTrace = {
        let addrs = Arc::clone(&addrs);
        Arc::new(move |got: GotConn| {
            let _ = addrs.set(got);
        })
    };

    tracing::debug!(relay = %relay, authority = %address, "starting CONNECT handshake");

    let response = transport
        .round_trip(ConnectRequest {
            relay: relay.clone(),
            authority: address.to_string(),
            headers,
            body: Box::new(body_reader),
            trace: Some(trace),
        })
        .await?;

    let (code, reason) = parse_status(&response.status)?;
    if code != 200 {
        let reason = reason.ok_or(Error::MalformedResponse)?;
        tracing::warn!(code, reason, "relay rejected CONNECT");
        return Err(Error::TunnelRejected(reason.to_string()));
    }

    tracing::debug!(authority = %address, "tunnel established");

    let got = addrs.get().copied();
    Ok(TunnelConn::new(
        sink_writer,
        response.body,
        got.map(|g| g.local_addr),
        got.map(|g| g.remote_addr),
    ))
}

/// Split a status portion like `403 Forbidden` into code and reason phrase.
/// A status with an unparseable code is malformed; a bare `200` is still a
/// success, so the reason is optional here and callers decide whether its
/// absence matters.
fn parse_status(status: &str) -> Result<(u16, Option<&str>)> {
    let (code, reason) = match status.split_once(' ') {
        Some((code, reason)) => (code, Some(reason)),
        None => (status, None),
    };
    let code = code.parse::<u16>().map_err(|_| Error::MalformedResponse)?;
    Ok((code, reason))
}
