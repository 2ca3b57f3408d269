//! Inbound half of an established tunnel
//!
//! Concurrent `read` callers collapse onto a single in-flight underlying
//! read: the first caller starts a shared, lazily polled future; callers
//! that arrive while it is pending attach to the same future, and every
//! waiter independently races it against the read deadline and the
//! connection's done signal. Bytes a completed cycle delivered but no
//! caller consumed stay buffered as residue and are drained, in order,
//! before any new underlying read starts.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::io::AsyncReadExt;

use crate::connect::transport::ByteStream;
use crate::deadline::{Deadline, Signal};
use crate::error::{Error, Result};

/// Result of one underlying read cycle, shared by every caller that joined
/// the cycle.
struct ReadOutcome {
    bytes: Bytes,
    err: Option<(io::ErrorKind, String)>,
}

type SharedRead = Shared<BoxFuture<'static, Arc<ReadOutcome>>>;

struct ReadState {
    /// The in-flight (or completed but unconsumed) read cycle.
    pending: Option<SharedRead>,
    /// Bytes a completed cycle produced that no caller has taken yet.
    residue: Bytes,
}

/// What a caller holds after checking the shared state.
enum Claimed {
    /// Bytes were already available and have been copied into the buffer.
    Copied(usize),
    /// An unconsumed cycle had failed; the error belongs to this caller.
    Failed(io::Error),
    /// A cycle to await, newly started or joined.
    Pending(SharedRead),
}

pub(crate) struct ReadShared {
    /// The underlying byte source. Held in its own `Arc` so the in-flight
    /// future does not keep the whole connection alive.
    source: Arc<tokio::sync::Mutex<ByteStream>>,
    state: Mutex<ReadState>,
    pub(crate) deadline: Deadline,
}

fn lock(state: &Mutex<ReadState>) -> MutexGuard<'_, ReadState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ReadShared {
    pub(crate) fn new(source: ByteStream) -> Self {
        ReadShared {
            source: Arc::new(tokio::sync::Mutex::new(source)),
            state: Mutex::new(ReadState {
                pending: None,
                residue: Bytes::new(),
            }),
            deadline: Deadline::new(),
        }
    }

    pub(crate) async fn read(&self, done: &Signal, buf: &mut [u8]) -> Result<usize> {
        if done.is_set() {
            return Err(Error::Closed);
        }
        let expiry = self.deadline.expired();
        if expiry.is_set() {
            return Err(Error::DeadlineExceeded);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let pending = match self.claim(buf) {
            Claimed::Copied(n) => return Ok(n),
            Claimed::Failed(err) => return Err(Error::Io(err)),
            Claimed::Pending(pending) => pending,
        };

        tokio::select! {
            outcome = pending => {
                match &outcome.err {
                    Some((kind, message)) => {
                        self.settle(&outcome, 0);
                        Err(Error::Io(io::Error::new(*kind, message.clone())))
                    }
                    None => {
                        let n = outcome.bytes.len().min(buf.len());
                        buf[..n].copy_from_slice(&outcome.bytes[..n]);
                        self.settle(&outcome, n);
                        Ok(n)
                    }
                }
            }
            () = expiry.wait() => Err(Error::DeadlineExceeded),
            () = done.wait() => Err(Error::Closed),
        }
    }

    /// Take buffered residue, join the in-flight cycle, or start a new one
    /// sized to the caller's buffer.
    fn claim(&self, buf: &mut [u8]) -> Claimed {
        let mut state = lock(&self.state);

        if !state.residue.is_empty() {
            let take = state.residue.len().min(buf.len());
            let chunk = state.residue.split_to(take);
            buf[..chunk.len()].copy_from_slice(&chunk);
            return Claimed::Copied(chunk.len());
        }

        let completed = match state.pending.as_ref() {
            Some(pending) => match pending.peek() {
                None => return Claimed::Pending(pending.clone()),
                // A cycle that finished while its waiters all timed out or
                // saw the connection close; its bytes still belong to the
                // stream.
                Some(outcome) => Arc::clone(outcome),
            },
            None => {
                return Claimed::Pending(self.start_cycle(&mut state, buf.len()));
            }
        };

        state.pending = None;
        match &completed.err {
            Some((kind, message)) => Claimed::Failed(io::Error::new(*kind, message.clone())),
            None => {
                let n = completed.bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&completed.bytes[..n]);
                state.residue = completed.bytes.slice(n..);
                Claimed::Copied(n)
            }
        }
    }

    fn start_cycle(&self, state: &mut ReadState, cap: usize) -> SharedRead {
        let source = Arc::clone(&self.source);
        let started: SharedRead = async move {
            let mut source = source.lock().await;
            let mut chunk = vec![0u8; cap];
            match source.read(&mut chunk).await {
                Ok(n) => Arc::new(ReadOutcome {
                    bytes: Bytes::copy_from_slice(&chunk[..n]),
                    err: None,
                }),
                Err(err) => Arc::new(ReadOutcome {
                    bytes: Bytes::new(),
                    err: Some((err.kind(), err.to_string())),
                }),
            }
        }
        .boxed()
        .shared();

        state.pending = Some(started.clone());
        started
    }

    /// Retire a completed cycle, keeping whatever the consuming caller did
    /// not fit in its buffer as residue for the next read.
    fn settle(&self, outcome: &Arc<ReadOutcome>, consumed: usize) {
        let mut state = lock(&self.state);
        let retired = match state.pending.as_ref() {
            Some(pending) => matches!(pending.peek(), Some(stored) if Arc::ptr_eq(stored, outcome)),
            None => false,
        };
        if !retired {
            return;
        }
        state.pending = None;
        if outcome.err.is_none() && consumed < outcome.bytes.len() {
            state.residue = outcome.bytes.slice(consumed..);
        }
    }
}
