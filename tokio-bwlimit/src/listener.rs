//! Bandwidth-shaping listener.
//!
//! [`BandwidthListener`] decorates any [`Accept`] and owns two layers of quotas per
//! [`Direction`]:
//! - **Global** quotas back two shared [`RateLimiter`]s. Every connection accepted from the
//!   listener waits on them, so together the connections never exceed the global rate.
//!   Changing a global quota mutates the shared limiters in place and takes effect for all
//!   connections at once.
//! - **Per-connection** quotas are templates. Each accepted connection gets private
//!   limiters built from the quotas current at accept time. Changing them retires the
//!   current [`ConfigEpoch`]; live connections notice on their next read or write in the
//!   affected direction and adopt the new quota.
//!
//! All listener-owned state sits behind one `RwLock`: accepting and snapshotting take the
//! shared side, reconfiguration takes the exclusive side. The epoch is retired and replaced
//! in the same exclusive section that stores the new quotas, so no connection can miss a
//! configuration change.
//!
//! Reconfiguration is also available through a cloneable [`LimitsHandle`], handy when the
//! accept loop and an admin endpoint live in different tasks.
use std::{fmt, io, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    connection::{BandwidthConnection, ConnectionLimiter, GlobalLimitController},
    epoch::ConfigEpoch,
    error::LimitError,
    io::Accept,
    limiter::RateLimiter,
    quota::{Direction, Quota},
};

#[derive(Debug)]
struct Limits {
    global_write: Quota,
    global_read: Quota,
    conn_write: Quota,
    conn_read: Quota,
    epoch: Arc<ConfigEpoch>,
}

struct Shared {
    cancel: CancellationToken,
    limits: RwLock<Limits>,
    global_write: RateLimiter,
    global_read: RateLimiter,
}

impl Shared {
    fn global_limiter(&self, direction: Direction) -> &RateLimiter {
        match direction {
            Direction::Read => &self.global_read,
            Direction::Write => &self.global_write,
        }
    }
}

impl GlobalLimitController for Shared {
    fn conn_limits_and_epoch(&self) -> (Arc<ConfigEpoch>, Quota, Quota) {
        let limits = self.limits.read();
        (limits.epoch.clone(), limits.conn_write, limits.conn_read)
    }

    fn wait_global<'a>(
        &'a self,
        direction: Direction,
        n: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), LimitError>> {
        self.global_limiter(direction).acquire(n, cancel).boxed()
    }
}

/// Cloneable handle to a listener's quotas.
///
/// Every clone reconfigures the same listener; connections already accepted observe the
/// changes too.
#[derive(Clone)]
pub struct LimitsHandle {
    shared: Arc<Shared>,
}

impl LimitsHandle {
    fn new(cancel: CancellationToken) -> Self {
        let unlimited = Quota::unlimited();
        Self {
            shared: Arc::new(Shared {
                cancel,
                limits: RwLock::new(Limits {
                    global_write: unlimited,
                    global_read: unlimited,
                    conn_write: unlimited,
                    conn_read: unlimited,
                    epoch: Arc::new(ConfigEpoch::new()),
                }),
                global_write: unlimited.rate_limiter(),
                global_read: unlimited.rate_limiter(),
            }),
        }
    }

    /// Current global quotas as `(write, read)`.
    pub fn global_limits(&self) -> (Quota, Quota) {
        let limits = self.shared.limits.read();
        (limits.global_write, limits.global_read)
    }

    /// Replaces the global quotas and reconfigures the shared limiters in place.
    pub fn set_global_limits(&self, write: Quota, read: Quota) {
        let mut limits = self.shared.limits.write();
        limits.global_write = write;
        limits.global_read = read;
        self.shared.global_write.set_quota(write);
        self.shared.global_read.set_quota(read);
        drop(limits);

        debug!(%write, %read, "global bandwidth limits set");
    }

    /// Current per-connection quotas as `(write, read)`.
    pub fn conn_limits(&self) -> (Quota, Quota) {
        let limits = self.shared.limits.read();
        (limits.conn_write, limits.conn_read)
    }

    /// Replaces the per-connection quotas.
    ///
    /// Does nothing if both quotas equal the current ones. Otherwise the current
    /// [`ConfigEpoch`] is retired so live connections resync on their next operation.
    pub fn set_conn_limits(&self, write: Quota, read: Quota) {
        let mut limits = self.shared.limits.write();
        if limits.conn_write == write && limits.conn_read == read {
            return;
        }

        limits.epoch.retire();
        limits.epoch = Arc::new(ConfigEpoch::new());
        limits.conn_write = write;
        limits.conn_read = read;
        drop(limits);

        debug!(%write, %read, "per-connection bandwidth limits set");
    }

    /// Snapshot of the per-connection quotas as `(epoch, write, read)`.
    ///
    /// The epoch is retired as soon as the returned quotas stop being current.
    pub fn conn_limits_and_epoch(&self) -> (Arc<ConfigEpoch>, Quota, Quota) {
        self.shared.conn_limits_and_epoch()
    }

    /// Waits until the global limiter for `direction` admits `n` bytes.
    pub async fn wait_global(&self, direction: Direction, n: usize) -> Result<(), LimitError> {
        self.shared
            .global_limiter(direction)
            .acquire(n, &self.shared.cancel)
            .await
    }

    /// Token that cancels every bandwidth wait of this listener.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    fn new_connection_limiter(&self) -> ConnectionLimiter {
        let limits = self.shared.limits.read();
        ConnectionLimiter::new(
            self.shared.cancel.clone(),
            self.shared.clone(),
            limits.epoch.clone(),
            limits.conn_write,
            limits.conn_read,
        )
    }
}

impl fmt::Debug for LimitsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitsHandle")
            .field("limits", &*self.shared.limits.read())
            .finish()
    }
}

/// A listener whose accepted connections are bandwidth-limited.
///
/// Starts with unlimited global and per-connection quotas. Dropping the listener closes
/// the underlying one; connections already accepted keep working.
pub struct BandwidthListener<L> {
    inner: L,
    handle: LimitsHandle,
}

impl<L> BandwidthListener<L> {
    /// Decorates `inner`. Firing `cancel` aborts all bandwidth waits, pending and future,
    /// on every connection accepted from this listener.
    pub fn new(cancel: CancellationToken, inner: L) -> Self {
        Self {
            inner,
            handle: LimitsHandle::new(cancel),
        }
    }

    /// Cloneable handle reconfiguring this listener.
    pub fn handle(&self) -> LimitsHandle {
        self.handle.clone()
    }

    /// Current global quotas as `(write, read)`.
    pub fn global_limits(&self) -> (Quota, Quota) {
        self.handle.global_limits()
    }

    /// See [`LimitsHandle::set_global_limits`].
    pub fn set_global_limits(&self, write: Quota, read: Quota) {
        self.handle.set_global_limits(write, read)
    }

    /// Current per-connection quotas as `(write, read)`.
    pub fn conn_limits(&self) -> (Quota, Quota) {
        self.handle.conn_limits()
    }

    /// See [`LimitsHandle::set_conn_limits`].
    pub fn set_conn_limits(&self, write: Quota, read: Quota) {
        self.handle.set_conn_limits(write, read)
    }

    /// See [`LimitsHandle::conn_limits_and_epoch`].
    pub fn conn_limits_and_epoch(&self) -> (Arc<ConfigEpoch>, Quota, Quota) {
        self.handle.conn_limits_and_epoch()
    }

    /// See [`LimitsHandle::wait_global`].
    pub async fn wait_global(&self, direction: Direction, n: usize) -> Result<(), LimitError> {
        self.handle.wait_global(direction, n).await
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

impl<L: Accept> BandwidthListener<L> {
    /// Accepts the next connection from the underlying listener and decorates it with
    /// private limiters built from the current per-connection quotas.
    ///
    /// Errors from the underlying listener are returned unchanged.
    pub async fn accept(&self) -> io::Result<(BandwidthConnection<L::Stream>, L::Addr)> {
        let (stream, addr) = self.inner.accept().await?;
        let limiter = self.handle.new_connection_limiter();

        Ok((BandwidthConnection::new(stream, Arc::new(limiter)), addr))
    }

    pub fn local_addr(&self) -> io::Result<L::Addr> {
        self.inner.local_addr()
    }
}

impl<L: fmt::Debug> fmt::Debug for BandwidthListener<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BandwidthListener")
            .field("inner", &self.inner)
            .field("handle", &self.handle)
            .finish()
    }
}
