//! Throttled listener that puts every accepted connection under a shared root bucket.
//!
//! A [`ThrottledListener`] owns one root [`Bucket`] (the aggregate limit for all of its
//! connections) and a per-connection capacity. Each accepted transport is wrapped in a
//! [`ThrottledStream`] whose [`Hierarchy`] has a fresh leaf with that capacity and the listener's
//! root above it.
//!
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::TcpListener;
//! use tokio_throttle::listener::ThrottledListener;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let mut listener = ThrottledListener::new(TcpListener::bind("127.0.0.1:0").await?);
//! listener.set_capacity(1024 * 1024);    // 1 MB/s for all connections together
//! listener.set_conn_capacity(64 * 1024); // 64 KB/s for each of them
//!
//! loop {
//!     let (mut stream, _addr) = listener.accept().await?;
//!     tokio::spawn(async move {
//!         let _ = stream.write_all(b"hello").await;
//!     });
//! }
//! # }
//! ```
//!
//! Capacities can be changed at any time; the root applies immediately to existing connections,
//! the per-connection capacity to connections accepted afterwards.
use std::{
    future::poll_fn,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll, ready},
};

use tracing::debug;

use crate::{
    bucket::Bucket,
    hierarchy::{DEFAULT_FAN_OUT, Hierarchy},
    stream::ThrottledStream,
};

/// Source of incoming connections.
///
/// Implemented for Tokio's TCP and Unix listeners; implement it for anything else that hands out
/// streams (TLS acceptors, in-memory test transports, ...).
pub trait Accept {
    type Stream;
    type Addr;

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Stream, Self::Addr)>>;
}

impl Accept for tokio::net::TcpListener {
    type Stream = tokio::net::TcpStream;
    type Addr = std::net::SocketAddr;

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Stream, Self::Addr)>> {
        tokio::net::TcpListener::poll_accept(self, cx)
    }
}

#[cfg(unix)]
impl Accept for tokio::net::UnixListener {
    type Stream = tokio::net::UnixStream;
    type Addr = tokio::net::unix::SocketAddr;

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Stream, Self::Addr)>> {
        tokio::net::UnixListener::poll_accept(self, cx)
    }
}

/// Listener-side limits: the shared root and the capacity given to each new leaf.
#[derive(Debug)]
pub struct Shaper {
    root: Arc<Bucket>,
    conn_capacity: AtomicU64,
    fan_out: u64,
}

impl Shaper {
    pub fn new(capacity: u64, conn_capacity: u64) -> Self {
        Self::with_fan_out(capacity, conn_capacity, DEFAULT_FAN_OUT)
    }

    pub fn with_fan_out(capacity: u64, conn_capacity: u64, fan_out: u64) -> Self {
        Self {
            root: Arc::new(Bucket::new(capacity)),
            conn_capacity: AtomicU64::new(conn_capacity),
            fan_out: fan_out.max(1),
        }
    }

    /// A fresh hierarchy for one connection.
    pub fn hierarchy(&self) -> Arc<Hierarchy> {
        let hierarchy = Hierarchy::with_fan_out(Some(self.root.clone()), self.fan_out);
        hierarchy.set_capacity(self.conn_capacity());
        Arc::new(hierarchy)
    }

    pub fn root(&self) -> &Arc<Bucket> {
        &self.root
    }

    pub fn capacity(&self) -> u64 {
        self.root.capacity()
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.root.set_capacity(capacity);
    }

    pub fn conn_capacity(&self) -> u64 {
        self.conn_capacity.load(Ordering::Acquire)
    }

    pub fn set_conn_capacity(&self, capacity: u64) {
        self.conn_capacity.store(capacity, Ordering::Release);
    }

    pub fn fan_out(&self) -> u64 {
        self.fan_out
    }
}

impl Default for Shaper {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

/// Listener returning throttled connections with a 2-level bucket hierarchy.
#[derive(Debug)]
pub struct ThrottledListener<L> {
    inner: L,
    shaper: Arc<Shaper>,
}

impl<L> ThrottledListener<L> {
    /// Wrap `inner` with no limits; configure them with the setters.
    pub fn new(inner: L) -> Self {
        Self::with_shaper(inner, Arc::default())
    }

    pub fn with_shaper(inner: L, shaper: Arc<Shaper>) -> Self {
        Self { inner, shaper }
    }

    /// Aggregate limit shared by every connection from this listener. `0` = unlimited.
    pub fn set_capacity(&self, capacity: u64) {
        self.shaper.set_capacity(capacity);
    }

    pub fn capacity(&self) -> u64 {
        self.shaper.capacity()
    }

    /// Limit given to each connection accepted from now on. `0` = unlimited.
    pub fn set_conn_capacity(&self, capacity: u64) {
        self.shaper.set_conn_capacity(capacity);
    }

    pub fn conn_capacity(&self) -> u64 {
        self.shaper.conn_capacity()
    }

    pub fn root(&self) -> &Arc<Bucket> {
        self.shaper.root()
    }

    pub fn shaper(&self) -> &Arc<Shaper> {
        &self.shaper
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

impl<L: Accept> ThrottledListener<L> {
    /// Accept the next connection and wrap it in a throttled stream.
    pub async fn accept(&mut self) -> io::Result<(ThrottledStream<L::Stream>, L::Addr)> {
        poll_fn(|cx| self.poll_accept(cx)).await
    }

    pub fn poll_accept(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<(ThrottledStream<L::Stream>, L::Addr)>> {
        let (stream, addr) = ready!(self.inner.poll_accept(cx))?;
        let hierarchy = self.shaper.hierarchy();
        debug!(
            capacity = self.shaper.capacity(),
            conn_capacity = hierarchy.leaf().capacity(),
            "accepted throttled connection"
        );
        Poll::Ready(Ok((ThrottledStream::new(stream, hierarchy), addr)))
    }
}
