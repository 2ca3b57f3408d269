//! Shared test infrastructure: a real TCP mock relay speaking the CONNECT
//! head, and a scripted in-memory transport for handshake-level tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::HeaderMap;
use httpconnect::{ConnectRequest, ConnectResponse, GotConn, Result, TunnelTransport};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

/// What the mock relay does after reading a CONNECT head.
#[derive(Clone)]
pub enum RelayBehavior {
    /// Answer 200 and echo every tunnel byte back.
    EchoTunnel,
    /// Answer with the given status line and close.
    Reject(&'static str),
    /// Write raw bytes and close.
    Raw(&'static [u8]),
}

pub struct MockRelay {
    pub addr: SocketAddr,
    heads: Arc<Mutex<Vec<String>>>,
}

impl MockRelay {
    pub async fn spawn(behavior: RelayBehavior) -> MockRelay {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
        let addr = listener.local_addr().expect("relay addr");
        let heads = Arc::new(Mutex::new(Vec::new()));

        let captured = Arc::clone(&heads);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let behavior = behavior.clone();
                let captured = Arc::clone(&captured);
                tokio::spawn(async move {
                    serve(stream, behavior, captured).await;
                });
            }
        });

        MockRelay { addr, heads }
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).expect("relay url")
    }

    pub fn url_with_credentials(&self, username: &str, password: &str) -> Url {
        Url::parse(&format!("http://{username}:{password}@{}", self.addr)).expect("relay url")
    }

    /// Request heads seen so far, one string per connection.
    pub fn heads(&self) -> Vec<String> {
        self.heads.lock().expect("heads lock").clone()
    }
}

async fn serve(mut stream: TcpStream, behavior: RelayBehavior, captured: Arc<Mutex<Vec<String>>>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return,
            Ok(_) => head.push(byte[0]),
        }
    }
    captured
        .lock()
        .expect("heads lock")
        .push(String::from_utf8_lossy(&head).into_owned());

    match behavior {
        RelayBehavior::EchoTunnel => {
            if stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .is_err()
            {
                return;
            }
            let (mut reader, mut writer) = stream.split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        }
        RelayBehavior::Reject(status_line) => {
            let _ = stream
                .write_all(format!("{status_line}\r\n\r\n").as_bytes())
                .await;
        }
        RelayBehavior::Raw(bytes) => {
            let _ = stream.write_all(bytes).await;
        }
    }
}

/// The request the scripted transport saw.
pub struct SeenRequest {
    pub authority: String,
    pub headers: HeaderMap,
}

/// An in-memory [`TunnelTransport`] wired to a [`DuplexStream`] the test
/// drives directly: bytes written to the handle appear on the tunnel's
/// inbound leg, bytes the connection writes appear on the handle, and
/// dropping the handle is end of stream.
pub struct ScriptedTransport {
    status: String,
    near: Mutex<Option<DuplexStream>>,
    addrs: Option<(SocketAddr, SocketAddr)>,
    stall: bool,
    seen: Arc<Mutex<Option<SeenRequest>>>,
    reads: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    /// A transport answering `status`, plus the far end of the tunnel.
    pub fn manual(status: &str) -> (Arc<ScriptedTransport>, DuplexStream) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let transport = Arc::new(ScriptedTransport {
            status: status.to_string(),
            near: Mutex::new(Some(near)),
            addrs: Some((
                "127.0.0.1:40000".parse().expect("addr"),
                "127.0.0.1:8080".parse().expect("addr"),
            )),
            stall: false,
            seen: Arc::new(Mutex::new(None)),
            reads: Arc::new(AtomicUsize::new(0)),
        });
        (transport, far)
    }

    /// A transport whose round trip never completes.
    pub fn stalled() -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport {
            status: String::new(),
            near: Mutex::new(None),
            addrs: None,
            stall: true,
            seen: Arc::new(Mutex::new(None)),
            reads: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Drop the recorded socket addresses so the trace hook never fires.
    pub fn without_addrs(self: Arc<Self>) -> Arc<Self> {
        let mut transport = Arc::try_unwrap(self).ok().expect("unshared transport");
        transport.addrs = None;
        Arc::new(transport)
    }

    pub fn seen(&self) -> Option<SeenRequest> {
        self.seen.lock().expect("seen lock").take()
    }

    pub fn was_called(&self) -> bool {
        self.seen.lock().expect("seen lock").is_some()
    }

    /// Completed underlying reads on the tunnel's inbound leg.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl TunnelTransport for ScriptedTransport {
    fn round_trip(&self, request: ConnectRequest) -> BoxFuture<'static, Result<ConnectResponse>> {
        *self.seen.lock().expect("seen lock") = Some(SeenRequest {
            authority: request.authority.clone(),
            headers: request.headers.clone(),
        });

        if self.stall {
            return Box::pin(futures::future::pending::<Result<ConnectResponse>>());
        }

        if let (Some((local_addr, remote_addr)), Some(trace)) = (self.addrs, &request.trace) {
            trace(GotConn {
                local_addr,
                remote_addr,
            });
        }

        let near = self
            .near
            .lock()
            .expect("near lock")
            .take()
            .expect("scripted transport supports a single round trip");
        let (near_read, mut near_write) = tokio::io::split(near);

        // Pump the streaming request body toward the far end of the pipe.
        let mut body = request.body;
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut body, &mut near_write).await;
            let _ = near_write.shutdown().await;
        });

        let status = self.status.clone();
        let body = Box::new(CountingReader {
            inner: near_read,
            reads: Arc::clone(&self.reads),
        });
        Box::pin(async move { Ok(ConnectResponse { status, body }) })
    }
}

/// Counts completed non-empty reads, to prove concurrent callers collapse
/// onto a single underlying read.
struct CountingReader<R> {
    inner: R,
    reads: Arc<AtomicUsize>,
}

impl<R> AsyncRead for CountingReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.reads.fetch_add(1, Ordering::SeqCst);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
