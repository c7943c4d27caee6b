//! Listener plumbing and extension traits.
//!
//! [`Accept`] is the capability set a listener needs to be decorated: hand out accepted
//! streams and report its own address. It is implemented for Tokio's TCP and Unix
//! listeners; implement it yourself to shape traffic from any other stream source.
//!
//! [`LimitBandwidthExt`] is blanket-implemented for every [`Accept`] so decoration reads
//! like the rest of a Tokio pipeline:
//!
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::TcpListener;
//! use tokio_bwlimit::{LimitBandwidthExt, Quota};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let shutdown = CancellationToken::new();
//! let listener = TcpListener::bind("127.0.0.1:8080")
//!     .await?
//!     .limit_bandwidth(shutdown.clone());
//!
//! // 64 KiB/s per connection outbound, 1 MiB/s shared inbound.
//! let (_, read) = listener.conn_limits();
//! listener.set_conn_limits(Quota::new(64.0 * 1024.0, None), read);
//! let (write, _) = listener.global_limits();
//! listener.set_global_limits(write, Quota::new(1024.0 * 1024.0, None));
//!
//! let (mut conn, _peer) = listener.accept().await?;
//! conn.write_all(b"hello").await?;
//! # Ok(()) }
//! ```
use std::{future::Future, io};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::listener::BandwidthListener;

/// A source of accepted streams.
pub trait Accept {
    /// Stream produced for each accepted connection.
    type Stream;
    /// Address type of the listener and of accepted peers.
    type Addr;

    /// Waits for the next inbound connection.
    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, Self::Addr)>> + Send;

    /// Address this listener is bound to.
    fn local_addr(&self) -> io::Result<Self::Addr>;
}

impl Accept for TcpListener {
    type Stream = TcpStream;
    type Addr = std::net::SocketAddr;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, Self::Addr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        TcpListener::local_addr(self)
    }
}

#[cfg(unix)]
impl Accept for tokio::net::UnixListener {
    type Stream = tokio::net::UnixStream;
    type Addr = tokio::net::unix::SocketAddr;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, Self::Addr)>> + Send {
        tokio::net::UnixListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        tokio::net::UnixListener::local_addr(self)
    }
}

/// Ergonomic bandwidth decoration for any [`Accept`].
pub trait LimitBandwidthExt: Accept {
    /// Wrap this listener in a [`BandwidthListener`] with unlimited quotas.
    ///
    /// Firing `cancel` aborts every pending and future bandwidth wait on connections
    /// accepted through the returned listener.
    #[must_use]
    fn limit_bandwidth(self, cancel: CancellationToken) -> BandwidthListener<Self>
    where
        Self: Sized,
    {
        BandwidthListener::new(cancel, self)
    }
}

impl<T: Accept> LimitBandwidthExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LimitError, Quota};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn tcp_listener_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .limit_bandwidth(CancellationToken::new());
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.unwrap();
            buf
        });

        let (mut conn, peer) = listener.accept().await.unwrap();
        assert_eq!(conn.peer_addr().unwrap(), peer);
        assert_eq!(conn.local_addr().unwrap(), addr);

        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        conn.write_all(b"pong").await.unwrap();
        conn.flush().await.unwrap();

        assert_eq!(&client.await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn tcp_read_larger_than_burst_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .limit_bandwidth(CancellationToken::new());
        let addr = listener.local_addr().unwrap();
        let (write, _) = listener.conn_limits();
        listener.set_conn_limits(write, Quota::new(10.0, Some(4)));

        let _client = TcpStream::connect(addr).await.unwrap();
        let (mut conn, _) = listener.accept().await.unwrap();

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(
            LimitError::from_io(&err),
            Some(&LimitError::CapacityExceeded {
                requested: 8,
                burst: 4
            })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_listener_is_acceptable() {
        let dir = std::env::temp_dir().join(format!("tokio-bwlimit-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sock");
        let _ = std::fs::remove_file(&path);

        let listener = tokio::net::UnixListener::bind(&path)
            .unwrap()
            .limit_bandwidth(CancellationToken::new());

        let client = tokio::spawn({
            let path = path.clone();
            async move {
                let mut client = tokio::net::UnixStream::connect(path).await.unwrap();
                client.write_all(b"hi").await.unwrap();
            }
        });

        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        client.await.unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
