//! Outbound half of an established tunnel

use tokio::io::{AsyncWriteExt, SimplexStream, WriteHalf};
use tokio::sync::Mutex;

use crate::deadline::{Deadline, Signal};
use crate::error::{Error, Result};

/// Write end of the tunnel pipe. Enforces its own write deadline; the
/// connection delegates `set_write_deadline` here.
pub(crate) struct TunnelSink {
    writer: Mutex<WriteHalf<SimplexStream>>,
    pub(crate) deadline: Deadline,
}

impl TunnelSink {
    pub(crate) fn new(writer: WriteHalf<SimplexStream>) -> Self {
        TunnelSink {
            writer: Mutex::new(writer),
            deadline: Deadline::new(),
        }
    }

    /// Forward one write to the pipe, racing the write deadline and the
    /// connection's done signal. Returns the number of bytes accepted.
    pub(crate) async fn write(&self, done: &Signal, buf: &[u8]) -> Result<usize> {
        if done.is_set() {
            return Err(Error::Closed);
        }
        let expiry = self.deadline.expired();
        if expiry.is_set() {
            return Err(Error::DeadlineExceeded);
        }

        tokio::select! {
            written = async {
                let mut writer = self.writer.lock().await;
                writer.write(buf).await
            } => Ok(written?),
            () = expiry.wait() => Err(Error::DeadlineExceeded),
            () = done.wait() => Err(Error::Closed),
        }
    }

    /// Shut the pipe down so the transport's body pump observes end of
    /// stream. Safe to call more than once.
    pub(crate) async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}
