//! Bandwidth-limited connections.
//!
//! [`BandwidthConnection`] wraps a stream accepted by a
//! [`BandwidthListener`](crate::BandwidthListener) and implements the same Tokio I/O traits,
//! so call sites cannot tell it apart from the bare stream. Every read and write runs the
//! same admission sequence for its [`Direction`] before touching the stream:
//!
//! 1. **Resync**: if the listener retired the [`ConfigEpoch`] this direction last saw, fetch
//!    the current per-connection quota and apply it to the private limiter.
//! 2. **Local wait**: the connection's own limiter admits `buf.len()` bytes.
//! 3. **Global wait**: the listener's shared limiter admits the same count.
//! 4. **I/O**: the wrapped stream is polled and its result returned unchanged.
//!
//! The local wait comes first so a connection stuck on its own quota never holds shared
//! budget that other connections could use. A failure in steps 1–3 yields
//! `io::Error::other(LimitError)` with zero bytes transferred and the stream is not polled.
//! Limiting only delays a call. The one exception is a read or write abandoned while
//! waiting (for example by a `timeout`): its admission is kept, and the next call in that
//! direction resumes it and transfers at most the bytes it was admitted for.
//!
//! Read and write resync independently: a connection that only writes keeps its read
//! limiter at the accept-time quota until it reads.
use std::{
    fmt,
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    epoch::ConfigEpoch,
    error::LimitError,
    limiter::RateLimiter,
    quota::{Direction, Quota},
};

/// The part of the listener a connection is allowed to reach.
pub(crate) trait GlobalLimitController: Send + Sync {
    /// Current per-connection quotas as `(epoch, write, read)`.
    fn conn_limits_and_epoch(&self) -> (Arc<ConfigEpoch>, Quota, Quota);

    /// Waits on the shared limiter for `direction`.
    fn wait_global<'a>(
        &'a self,
        direction: Direction,
        n: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), LimitError>>;
}

struct DirectionLimiter {
    limiter: RateLimiter,
    epoch: Mutex<Arc<ConfigEpoch>>,
}

impl DirectionLimiter {
    fn new(quota: Quota, epoch: Arc<ConfigEpoch>) -> Self {
        Self {
            limiter: quota.rate_limiter(),
            epoch: Mutex::new(epoch),
        }
    }
}

/// Limiting state of one connection: private limiters per direction plus the route to
/// the listener's shared limiters.
///
/// Shared by reference, so several tasks can push traffic for the same connection through
/// [`admit`](Self::admit) concurrently.
pub struct ConnectionLimiter {
    read: DirectionLimiter,
    write: DirectionLimiter,
    controller: Arc<dyn GlobalLimitController>,
    cancel: CancellationToken,
}

impl ConnectionLimiter {
    pub(crate) fn new(
        cancel: CancellationToken,
        controller: Arc<dyn GlobalLimitController>,
        epoch: Arc<ConfigEpoch>,
        write: Quota,
        read: Quota,
    ) -> Self {
        Self {
            read: DirectionLimiter::new(read, epoch.clone()),
            write: DirectionLimiter::new(write, epoch),
            controller,
            cancel,
        }
    }

    /// Quota the private limiter for `direction` currently enforces.
    pub fn quota(&self, direction: Direction) -> Quota {
        self.direction(direction).limiter.quota()
    }

    /// Runs resync, local wait and global wait for `n` bytes in `direction`.
    pub async fn admit(&self, direction: Direction, n: usize) -> Result<(), LimitError> {
        let local = self.resync(direction);
        local.limiter.acquire(n, &self.cancel).await?;

        self.controller
            .wait_global(direction, n, &self.cancel)
            .await
    }

    fn direction(&self, direction: Direction) -> &DirectionLimiter {
        match direction {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    fn resync(&self, direction: Direction) -> &DirectionLimiter {
        let state = self.direction(direction);

        // held across the fetch so concurrent calls apply one snapshot, newest last
        let mut current = state.epoch.lock();
        if !current.is_retired() {
            return state;
        }

        let (epoch, write, read) = self.controller.conn_limits_and_epoch();
        let quota = match direction {
            Direction::Read => read,
            Direction::Write => write,
        };

        *current = epoch;
        if state.limiter.quota() != quota {
            state.limiter.set_quota(quota);
            trace!(%direction, %quota, "connection limiter resynced");
        }

        state
    }
}

impl fmt::Debug for ConnectionLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLimiter")
            .field("read", &self.read.limiter)
            .field("write", &self.write.limiter)
            .finish()
    }
}

type Admission = BoxFuture<'static, Result<(), LimitError>>;

/// Admission state of one direction of a polled connection.
///
/// Once admitted, the call stays admitted until the wrapped stream completes it, so a
/// `Pending` from the stream does not charge the limiters twice. An admission, pending
/// or granted, also outlives a dropped read or write future: the next call in the same
/// direction resumes it and transfers at most the admitted byte count.
#[derive(Default)]
struct Gate {
    pending: Option<(usize, Admission)>,
    admitted: Option<usize>,
}

impl Gate {
    /// Resolves to the number of bytes the current call may transfer.
    fn poll_admit(
        &mut self,
        cx: &mut Context<'_>,
        limiter: &Arc<ConnectionLimiter>,
        direction: Direction,
        want: usize,
    ) -> Poll<io::Result<usize>> {
        if let Some(admitted) = self.admitted {
            return Poll::Ready(Ok(admitted.min(want)));
        }

        let (admitting, admission) = self.pending.get_or_insert_with(|| {
            let limiter = limiter.clone();
            let admission: Admission =
                Box::pin(async move { limiter.admit(direction, want).await });
            (want, admission)
        });
        let admitting = *admitting;

        let res = ready!(admission.as_mut().poll(cx));
        self.pending = None;
        res?;

        self.admitted = Some(admitting);
        Poll::Ready(Ok(admitting.min(want)))
    }

    fn complete(&mut self) {
        self.admitted = None;
    }
}

/// A bandwidth-limited stream produced by
/// [`BandwidthListener::accept`](crate::BandwidthListener::accept).
///
/// Implements `AsyncRead`/`AsyncWrite` whenever the wrapped stream does. `flush` and
/// `shutdown` are pass-through; empty buffers skip limiting.
///
/// # Examples
/// ```no_run
/// use tokio::io::{self, copy_bidirectional};
/// use tokio::net::{TcpListener, TcpStream};
/// use tokio_bwlimit::{LimitBandwidthExt, Quota};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> io::Result<()> {
/// let listener = TcpListener::bind("127.0.0.1:8080")
///     .await?
///     .limit_bandwidth(CancellationToken::new());
/// listener.set_conn_limits(Quota::new(32.0 * 1024.0, None), Quota::new(32.0 * 1024.0, None));
///
/// let (mut downstream, _) = listener.accept().await?;
/// let mut upstream = TcpStream::connect("127.0.0.1:9090").await?;
/// copy_bidirectional(&mut downstream, &mut upstream).await?;
/// # Ok(()) }
/// ```
#[pin_project]
pub struct BandwidthConnection<S> {
    #[pin]
    inner: S,
    limiter: Arc<ConnectionLimiter>,
    read_gate: Gate,
    write_gate: Gate,
}

impl<S> BandwidthConnection<S> {
    pub(crate) fn new(inner: S, limiter: Arc<ConnectionLimiter>) -> Self {
        Self {
            inner,
            limiter,
            read_gate: Gate::default(),
            write_gate: Gate::default(),
        }
    }

    /// Limiting state of this connection.
    pub fn limiter(&self) -> &Arc<ConnectionLimiter> {
        &self.limiter
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn get_pin_mut(self: Pin<&mut Self>) -> Pin<&mut S> {
        self.project().inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl BandwidthConnection<TcpStream> {
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.inner.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }
}

impl<R: AsyncRead> AsyncRead for BandwidthConnection<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();

        let want = buf.remaining();
        if want == 0 {
            return this.inner.poll_read(cx, buf);
        }

        let admitted = ready!(this
            .read_gate
            .poll_admit(cx, this.limiter, Direction::Read, want))?;

        if admitted == want {
            let res = ready!(this.inner.poll_read(cx, buf));
            this.read_gate.complete();
            return Poll::Ready(res);
        }

        // a smaller admission left over from an abandoned read
        let mut chunk = vec![0u8; admitted];
        let mut capped = ReadBuf::new(&mut chunk);
        let res = ready!(this.inner.poll_read(cx, &mut capped));
        buf.put_slice(capped.filled());
        this.read_gate.complete();
        Poll::Ready(res)
    }
}

impl<W: AsyncWrite> AsyncWrite for BandwidthConnection<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();

        let want = buf.len();
        if want == 0 {
            return this.inner.poll_write(cx, buf);
        }

        let admitted = ready!(this
            .write_gate
            .poll_admit(cx, this.limiter, Direction::Write, want))?;

        let res = ready!(this.inner.poll_write(cx, &buf[..admitted]));
        this.write_gate.complete();
        Poll::Ready(res)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();

        let want: usize = bufs.iter().map(|b| b.len()).sum();
        if want == 0 {
            return this.inner.poll_write_vectored(cx, bufs);
        }

        let admitted = ready!(this
            .write_gate
            .poll_admit(cx, this.limiter, Direction::Write, want))?;

        let res = if admitted == want {
            ready!(this.inner.poll_write_vectored(cx, bufs))
        } else {
            let first = bufs.iter().find(|b| !b.is_empty()).map_or(&[][..], |b| &b[..]);
            ready!(this.inner.poll_write(cx, &first[..admitted.min(first.len())]))
        };
        this.write_gate.complete();
        Poll::Ready(res)
    }
}

impl<S: fmt::Debug> fmt::Debug for BandwidthConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BandwidthConnection")
            .field("inner", &self.inner)
            .field("limiter", &self.limiter)
            .finish()
    }
}
