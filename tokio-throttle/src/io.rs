//! Extension traits and helpers for throttled streams.
//!
//! [`ThrottleExt`] is blanket-implemented for every `AsyncRead + AsyncWrite` type so a transport
//! can be wrapped in place:
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::TcpStream;
//! use tokio_throttle::{bucket::Bucket, hierarchy::Hierarchy, io::ThrottleExt};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! // Own limit only.
//! let mut a = TcpStream::connect("127.0.0.1:12345").await?.throttle(16 * 1024);
//! a.write_all(b"ping").await?;
//!
//! // Own limit under a shared root.
//! let root = Arc::new(Bucket::new(64 * 1024));
//! let hierarchy = Arc::new(Hierarchy::new(Some(root)));
//! hierarchy.set_capacity(16 * 1024);
//! let mut b = TcpStream::connect("127.0.0.1:12345").await?.throttle_with(hierarchy);
//! b.write_all(b"pong").await?;
//! # Ok(()) }
//! ```
use std::{io, sync::Arc, time};

use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufStream, BufWriter, DuplexStream};

use crate::{hierarchy::Hierarchy, stream::ThrottledStream};

/// Request abortive close (RST-on-close) semantics where supported.
///
/// On TCP, setting `SO_LINGER{on=1, linger=0}` makes the kernel send a **RST** when the socket is
/// closed instead of a graceful FIN/ACK shutdown. The proxy uses it to cut connections that hit
/// their time limit.
///
/// Types where linger is meaningless implement this as a no-op returning `Ok(())`.
pub trait ResetLinger {
    fn set_reset_linger(&mut self) -> io::Result<()>;
}

impl ResetLinger for tokio::net::TcpStream {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        tokio::net::TcpStream::set_linger(self, Some(time::Duration::from_secs(0)))
    }
}

#[cfg(unix)]
impl ResetLinger for tokio::net::UnixStream {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<RW> ResetLinger for BufStream<RW> {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<R: AsyncRead> ResetLinger for BufReader<R> {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: AsyncWrite> ResetLinger for BufWriter<W> {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ResetLinger for DuplexStream {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Wrap any duplex stream in a [`ThrottledStream`].
pub trait ThrottleExt: AsyncRead + AsyncWrite {
    /// Limit this stream to `capacity` bytes/second (reads and writes combined).
    ///
    /// `0` disables throttling (pass-through) until [`ThrottledStream::set_capacity`] is called.
    #[must_use]
    fn throttle(self, capacity: u64) -> ThrottledStream<Self>
    where
        Self: Sized,
    {
        ThrottledStream::standalone(self, capacity)
    }

    /// Charge this stream's traffic to an existing, possibly shared, [`Hierarchy`].
    #[must_use]
    fn throttle_with(self, hierarchy: Arc<Hierarchy>) -> ThrottledStream<Self>
    where
        Self: Sized,
    {
        ThrottledStream::new(self, hierarchy)
    }
}

impl<T: AsyncRead + AsyncWrite> ThrottleExt for T {}
