//! In-memory listener and stream used by the unit tests.
use std::{
    future::{ready, Future},
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::Instant,
};

use crate::io::Accept;

/// Asserts that `expected` virtual time has passed since `start`, give or take timer
/// granularity.
#[track_caller]
pub(crate) fn assert_elapsed(start: Instant, expected: Duration) {
    let elapsed = start.elapsed();
    let slack = Duration::from_millis(20);
    assert!(
        elapsed + slack >= expected && elapsed <= expected + slack,
        "elapsed {elapsed:?}, expected {expected:?}"
    );
}

/// Counts how often the wrapped stream was actually polled.
#[derive(Debug, Default, Clone)]
pub(crate) struct Calls {
    reads: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl Calls {
    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

/// Stream that fills every read buffer with zeroes and swallows every write, like
/// `tokio::io::repeat(0)` joined with `tokio::io::sink()`.
#[derive(Debug, Default)]
pub(crate) struct MockStream {
    calls: Calls,
    fail_with: Option<io::ErrorKind>,
    max_write: Option<usize>,
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.calls.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.fail_with {
            return Poll::Ready(Err(kind.into()));
        }

        let zeroes = vec![0u8; buf.remaining()];
        buf.put_slice(&zeroes);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.calls.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.fail_with {
            return Poll::Ready(Err(kind.into()));
        }

        let n = self.max_write.map_or(buf.len(), |max| buf.len().min(max));
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Listener handing out [`MockStream`]s that share one [`Calls`] counter.
#[derive(Debug, Default)]
pub(crate) struct MockListener {
    pub(crate) calls: Calls,
    pub(crate) fail_accept: Option<io::ErrorKind>,
    pub(crate) stream_error: Option<io::ErrorKind>,
    pub(crate) max_write: Option<usize>,
}

impl Accept for MockListener {
    type Stream = MockStream;
    type Addr = &'static str;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, Self::Addr)>> + Send {
        let res = match self.fail_accept {
            Some(kind) => Err(kind.into()),
            None => Ok((
                MockStream {
                    calls: self.calls.clone(),
                    fail_with: self.stream_error,
                    max_write: self.max_write,
                },
                "mock-peer",
            )),
        };
        ready(res)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok("mock-listener")
    }
}
