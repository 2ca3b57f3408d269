//! Duplex stream adapter over an established tunnel
//!
//! [`TunnelConn`] wraps the two half-duplex legs returned by a successful
//! CONNECT handshake (the response body for reading, the request body pipe
//! for writing) into one connection with independent read/write deadlines,
//! single-in-flight read semantics, and idempotent close. All operations
//! take `&self` and are safe to invoke from concurrent tasks.

mod read;
mod sink;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{SimplexStream, WriteHalf};
use tokio::time::Instant;

use crate::connect::transport::ByteStream;
use crate::deadline::Signal;
use crate::error::Result;

use read::ReadShared;
use sink::TunnelSink;

/// A bidirectional, deadline-aware stream tunneled through an HTTP CONNECT
/// relay.
///
/// Closing is idempotent; once closed, every pending or subsequent operation
/// fails with [`Error::Closed`](crate::Error::Closed). An expired deadline
/// fails the corresponding direction with
/// [`Error::DeadlineExceeded`](crate::Error::DeadlineExceeded) until it is
/// re-armed or cleared.
pub struct TunnelConn {
    read: ReadShared,
    sink: TunnelSink,
    done: Arc<Signal>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl TunnelConn {
    pub(crate) fn new(
        writer: WriteHalf<SimplexStream>,
        source: ByteStream,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        TunnelConn {
            read: ReadShared::new(source),
            sink: TunnelSink::new(writer),
            done: Arc::new(Signal::new()),
            local_addr,
            remote_addr,
        }
    }

    /// Read bytes from the tunnel into `buf`, returning the number of bytes
    /// read. `Ok(0)` means end of stream.
    ///
    /// Concurrent callers share a single underlying read; each one still
    /// observes its own deadline and the close signal independently.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.read.read(&self.done, buf).await
    }

    /// Write bytes to the tunnel, returning the number of bytes accepted.
    /// No internal buffering; short writes are possible when the pipe to the
    /// transport is full.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.sink.write(&self.done, buf).await
    }

    /// Close both directions. Pending reads and writes unblock promptly with
    /// a closed classification. Safe to call repeatedly and concurrently.
    pub async fn close(&self) {
        // Fire the done signal before touching the sink so a blocked write
        // holding the sink lock unblocks and releases it.
        self.done.set();
        self.sink.shutdown().await;
        tracing::debug!("tunnel connection closed");
    }

    /// Arm or clear both the read and write deadlines. `None` means no
    /// deadline; an instant in the past expires immediately.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.sink.deadline.set(deadline);
        self.read.deadline.set(deadline);
    }

    /// Arm or clear the read deadline.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.read.deadline.set(deadline);
    }

    /// Arm or clear the write deadline.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.sink.deadline.set(deadline);
    }

    /// Local address of the transport leg to the relay, if it was captured
    /// during the handshake.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Remote address of the transport leg to the relay, if it was captured
    /// during the handshake.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

impl fmt::Debug for TunnelConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConn")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.done.is_set())
            .finish()
    }
}
