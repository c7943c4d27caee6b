//! Bandwidth shaping for Tokio listeners and the connections they accept.
//!
//! Wrap a listener with [`LimitBandwidthExt::limit_bandwidth`] and every accepted stream
//! comes back as a [`BandwidthConnection`] that waits on two token buckets per direction
//! before each read or write:
//! - a private bucket built from the listener's **per-connection** quota, and
//! - a **global** bucket shared by all connections of the listener.
//!
//! Both layers can be changed at runtime through the listener or a cloneable
//! [`LimitsHandle`]. Global changes are visible immediately; per-connection changes are
//! published through a [`ConfigEpoch`] and picked up by each connection on its next
//! operation in the affected direction.
//!
//! A single [`CancellationToken`](tokio_util::sync::CancellationToken) passed at wrap time
//! aborts every pending and future bandwidth wait. Waits fail with [`LimitError`], carried
//! inside an `io::Error` on the I/O paths.
//!
//! ```no_run
//! use tokio::io::{self, copy_bidirectional_with_sizes};
//! use tokio::net::{TcpListener, TcpStream};
//! use tokio_bwlimit::{LimitBandwidthExt, Quota};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let listener = TcpListener::bind("127.0.0.1:8080")
//!     .await?
//!     .limit_bandwidth(CancellationToken::new());
//! listener.set_global_limits(Quota::new(1024.0 * 1024.0, None), Quota::new(1024.0 * 1024.0, None));
//!
//! loop {
//!     let (mut conn, _) = listener.accept().await?;
//!     tokio::spawn(async move {
//!         let mut upstream = TcpStream::connect("127.0.0.1:9090").await?;
//!         // keep copy chunks within the configured bursts
//!         copy_bidirectional_with_sizes(&mut conn, &mut upstream, 8 * 1024, 8 * 1024).await
//!     });
//! }
//! # }
//! ```
pub mod connection;
pub mod epoch;
pub mod error;
pub mod io;
pub mod limiter;
pub mod listener;
pub mod quota;

#[cfg(test)]
mod testing;

pub use connection::{BandwidthConnection, ConnectionLimiter};
pub use epoch::ConfigEpoch;
pub use error::LimitError;
pub use io::{Accept, LimitBandwidthExt};
pub use limiter::RateLimiter;
pub use listener::{BandwidthListener, LimitsHandle};
pub use quota::{Direction, Quota, UNLIMITED};
