//! Dialer facade: dial a destination through an HTTP CONNECT relay
//!
//! A [`Dialer`] is immutable once built; concurrent dials on the same
//! instance do not interfere with each other.

pub mod registry;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::header::PROXY_AUTHORIZATION;
use http::{HeaderMap, HeaderValue};
use percent_encoding::percent_decode_str;
use url::Url;

use crate::auth::basic_auth;
use crate::conn::TunnelConn;
use crate::connect;
use crate::connect::tcp::HttpTunnelTransport;
use crate::connect::transport::TunnelTransport;
use crate::error::{Error, Result};

/// Dials TCP destinations through an HTTP(S) CONNECT relay.
///
/// Credentials embedded in the relay URL become a pre-formed
/// `Proxy-Authorization: Basic …` header on every CONNECT request.
#[derive(Clone)]
pub struct Dialer {
    relay: Url,
    headers: HeaderMap,
    transport: Arc<dyn TunnelTransport>,
}

impl Dialer {
    /// Build a dialer using the built-in TCP/TLS transport.
    ///
    /// Fails with [`Error::UnsupportedScheme`] unless the relay URL scheme
    /// is `http` or `https`.
    pub fn new(relay: Url) -> Result<Self> {
        Self::with_transport(relay, Arc::new(HttpTunnelTransport::new()))
    }

    /// Build a dialer that reaches the relay through a caller-supplied
    /// transport.
    pub fn with_transport(relay: Url, transport: Arc<dyn TunnelTransport>) -> Result<Self> {
        match relay.scheme() {
            "http" | "https" => {}
            other => return Err(Error::UnsupportedScheme(other.to_string())),
        }
        if relay.host_str().is_none() {
            return Err(Error::MissingProxyHost);
        }

        let mut headers = HeaderMap::new();
        if !relay.username().is_empty() {
            // The URL keeps userinfo percent-encoded; the credentials the
            // relay expects are the decoded ones.
            let username = percent_decode_str(relay.username()).decode_utf8_lossy();
            let password = relay
                .password()
                .map(|password| percent_decode_str(password).decode_utf8_lossy());
            headers.insert(PROXY_AUTHORIZATION, basic_auth(username, password));
        }

        Ok(Dialer {
            relay,
            headers,
            transport,
        })
    }

    /// Replace the proxy credentials, overriding any embedded in the URL.
    #[must_use]
    pub fn basic_auth(mut self, username: &str, password: &str) -> Self {
        self.headers
            .insert(PROXY_AUTHORIZATION, basic_auth(username, Some(password)));
        self
    }

    /// Set the `Proxy-Authorization` header to a custom value.
    #[must_use]
    pub fn custom_auth(mut self, value: HeaderValue) -> Self {
        self.headers.insert(PROXY_AUTHORIZATION, value);
        self
    }

    /// Merge extra headers into every CONNECT request.
    #[must_use]
    pub fn custom_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    /// The relay this dialer tunnels through.
    pub fn proxy_url(&self) -> &Url {
        &self.relay
    }

    /// Open a tunnel to `address` (`host:port`) on `network`, which must be
    /// in the TCP family (`tcp`, `tcp4`, `tcp6`).
    ///
    /// Cancellation is cooperative: dropping the returned future aborts the
    /// handshake.
    pub async fn dial(&self, network: &str, address: &str) -> Result<TunnelConn> {
        connect::establish(
            &self.relay,
            self.headers.clone(),
            self.transport.as_ref(),
            network,
            address,
        )
        .await
    }

    /// [`dial`](Self::dial), bounded by `timeout`. Expiry surfaces as
    /// [`Error::DeadlineExceeded`].
    pub async fn dial_timeout(
        &self,
        network: &str,
        address: &str,
        timeout: Duration,
    ) -> Result<TunnelConn> {
        tokio::time::timeout(timeout, self.dial(network, address))
            .await
            .map_err(|_| Error::DeadlineExceeded)?
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Credentials embedded in the URL must not leak into logs.
        f.debug_struct("Dialer")
            .field("scheme", &self.relay.scheme())
            .field("host", &self.relay.host_str())
            .field("port", &self.relay.port_or_known_default())
            .field("headers", &self.headers)
            .finish()
    }
}
