//! Default transport: the CONNECT exchange over TCP, with TLS for `https`
//! relays
//!
//! Writes the CONNECT head by hand and parses the relay's response head up
//! to the blank line. Bytes the relay sends after its head already belong to
//! the tunnel and are preserved in front of the inbound leg. The outbound
//! body pump only starts once a 200 head has been parsed.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use http::HeaderMap;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

use super::transport::{ByteStream, ConnectRequest, ConnectResponse, GotConn, TunnelTransport};

/// Relays should answer a CONNECT with a short head; anything larger is not
/// a CONNECT response.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// The built-in [`TunnelTransport`]: one TCP (or TLS-over-TCP) leg to the
/// relay per round trip. No connection reuse, no redirects, no retries.
#[derive(Clone)]
pub struct HttpTunnelTransport {
    connect_timeout: Option<Duration>,
    nodelay: bool,
    tls: OnceLock<Arc<rustls::ClientConfig>>,
}

impl HttpTunnelTransport {
    pub fn new() -> Self {
        HttpTunnelTransport {
            connect_timeout: None,
            nodelay: true,
            tls: OnceLock::new(),
        }
    }

    /// Cap the time spent establishing the TCP leg to the relay.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set `TCP_NODELAY` on the relay leg (on by default).
    #[must_use]
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    fn tls_config(&self) -> Arc<rustls::ClientConfig> {
        self.tls
            .get_or_init(|| {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                Arc::new(
                    rustls::ClientConfig::builder()
                        .with_root_certificates(roots)
                        .with_no_client_auth(),
                )
            })
            .clone()
    }

    async fn run(self, request: ConnectRequest) -> Result<ConnectResponse> {
        let relay = &request.relay;
        let host = relay.host_str().ok_or(Error::MissingProxyHost)?;
        // url keeps the brackets on IPv6 hosts; the socket address does not
        // want them.
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let port = relay.port_or_known_default().unwrap_or(80);

        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)))
                .await
                .map_err(|_| {
                    Error::Io(io::Error::new(io::ErrorKind::TimedOut, "proxy connect timed out"))
                })??,
            None => TcpStream::connect((host.as_str(), port)).await?,
        };
        if self.nodelay {
            let _ = stream.set_nodelay(true);
        }

        if let Some(trace) = &request.trace {
            if let (Ok(local_addr), Ok(remote_addr)) = (stream.local_addr(), stream.peer_addr()) {
                trace(GotConn { local_addr, remote_addr });
            }
        }

        let head = encode_connect_head(&request.authority, &request.headers);
        if relay.scheme() == "https" {
            let connector = TlsConnector::from(self.tls_config());
            let name = ServerName::try_from(host).map_err(|_| {
                Error::Io(io::Error::new(io::ErrorKind::InvalidInput, "invalid relay host name"))
            })?;
            let stream = connector.connect(name, stream).await?;
            exchange(stream, head, request.body).await
        } else {
            exchange(stream, head, request.body).await
        }
    }
}

impl Default for HttpTunnelTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelTransport for HttpTunnelTransport {
    fn round_trip(&self, request: ConnectRequest) -> BoxFuture<'static, Result<ConnectResponse>> {
        let transport = self.clone();
        Box::pin(transport.run(request))
    }
}

/// Write the head, parse the response head, and wire up the two tunnel legs.
async fn exchange<S>(mut stream: S, head: Vec<u8>, body: ByteStream) -> Result<ConnectResponse>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    stream.write_all(&head).await?;
    stream.flush().await?;

    let (status, leftover) = read_response_head(&mut stream).await?;
    let (read_half, write_half) = tokio::io::split(stream);

    if status_code(&status) == Some(200) {
        tokio::spawn(pump(body, write_half));
    }

    Ok(ConnectResponse {
        status,
        body: Box::new(PrefixedReader::new(leftover, read_half)),
    })
}

/// Copy the streaming request body into the relay leg until it ends, then
/// half-close the leg.
async fn pump<W>(mut body: ByteStream, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(err) = tokio::io::copy(&mut body, &mut writer).await {
        tracing::trace!(%err, "outbound tunnel pump ended");
    }
    let _ = writer.shutdown().await;
}

fn encode_connect_head(authority: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut head = Vec::with_capacity(128);
    head.extend_from_slice(format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n").as_bytes());
    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Read up to the blank line terminating the response head. Returns the
/// status portion of the status line (text after the HTTP version) and any
/// bytes received past the head, which already belong to the tunnel.
async fn read_response_head<S>(stream: &mut S) -> Result<(String, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(Error::MalformedResponse);
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "relay closed the connection during the CONNECT response",
            )));
        }
    };

    let head = &buf[..head_end];
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end]).map_err(|_| Error::MalformedResponse)?;
    let (version, status) = line.split_once(' ').ok_or(Error::MalformedResponse)?;
    if !version.starts_with("HTTP/") {
        return Err(Error::MalformedResponse);
    }
    let status = status.to_string();

    let mut leftover = buf;
    let _head = leftover.split_to(head_end + 4);
    Ok((status, leftover.freeze()))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn status_code(status: &str) -> Option<u16> {
    let code = status.split(' ').next()?;
    code.parse().ok()
}

/// Serves buffered head-overrun bytes before reading from the socket.
struct PrefixedReader<R> {
    prefix: Bytes,
    inner: R,
}

impl<R> PrefixedReader<R> {
    fn new(prefix: Bytes, inner: R) -> Self {
        PrefixedReader { prefix, inner }
    }
}

impl<R> AsyncRead for PrefixedReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}
