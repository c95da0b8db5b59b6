//! Blocking adapters for `std::io` transports.
//!
//! These mirror [`ThrottledStream`](crate::stream::ThrottledStream) and
//! [`ThrottledListener`](crate::listener::ThrottledListener) for code that runs on plain threads.
//! Waiting for tokens sleeps the calling thread, so never use them from inside an async task.
//!
//! ```no_run
//! use std::io::{self, Write};
//! use std::net::TcpListener;
//! use tokio_throttle::blocking::BlockingListener;
//!
//! # fn main() -> io::Result<()> {
//! let listener = BlockingListener::new(TcpListener::bind("127.0.0.1:0")?);
//! listener.set_capacity(1024 * 1024);
//! listener.set_conn_capacity(64 * 1024);
//!
//! let (mut stream, _addr) = listener.accept()?;
//! stream.write_all(&[0u8; 256 * 1024])?; // takes ~4s at 64 KB/s
//! # Ok(()) }
//! ```
use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
};

use tracing::{debug, warn};

use crate::{error::ThrottleError, hierarchy::Hierarchy, listener::Shaper};

/// A `Read`/`Write` transport throttled by a [`Hierarchy`].
#[derive(Debug)]
pub struct BlockingStream<T> {
    inner: T,
    hierarchy: Arc<Hierarchy>,
}

impl<T> BlockingStream<T> {
    pub fn new(inner: T, hierarchy: Arc<Hierarchy>) -> Self {
        Self { inner, hierarchy }
    }

    pub fn standalone(inner: T, capacity: u64) -> Self {
        let hierarchy = Hierarchy::new(None);
        hierarchy.set_capacity(capacity);
        Self::new(inner, Arc::new(hierarchy))
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.hierarchy.set_capacity(capacity);
    }

    pub fn hierarchy(&self) -> &Arc<Hierarchy> {
        &self.hierarchy
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read> Read for BlockingStream<T> {
    /// Reserves `min(buf.len(), capacity)` and reads into that much of `buf`.
    ///
    /// The utilization of the buffer is unknown in advance, so the whole reservation is spent even
    /// when the transport returns fewer bytes.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let requested = buf.len() as u64;
        let reserved = usize::try_from(self.hierarchy.consume(requested))
            .unwrap_or(usize::MAX)
            .min(buf.len());
        if reserved == 0 {
            warn!(requested, "zero grant on read");
            return Err(ThrottleError::ZeroGrant { requested }.into());
        }

        self.inner.read(&mut buf[..reserved])
    }
}

impl<T: Write> Write for BlockingStream<T> {
    /// Writes the whole of `buf`, one grant at a time.
    ///
    /// An error after some bytes went out ends the call early with `Ok(written)`; an error that
    /// persists surfaces on the next call.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;

        while written < buf.len() {
            let remaining = &buf[written..];
            let requested = remaining.len() as u64;
            let reserved = usize::try_from(self.hierarchy.consume(requested))
                .unwrap_or(usize::MAX)
                .min(remaining.len());
            if reserved == 0 {
                warn!(requested, written, "zero grant on write");
                if written > 0 {
                    break;
                }
                return Err(ThrottleError::ZeroGrant { requested }.into());
            }

            match self.inner.write(&remaining[..reserved]) {
                Ok(0) if written > 0 => break,
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(_) if written > 0 => break,
                Err(e) => return Err(e),
            }
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Throttled wrapper around a `std::net::TcpListener`.
#[derive(Debug)]
pub struct BlockingListener {
    inner: TcpListener,
    shaper: Arc<Shaper>,
}

impl BlockingListener {
    pub fn new(inner: TcpListener) -> Self {
        Self::with_shaper(inner, Arc::default())
    }

    pub fn with_shaper(inner: TcpListener, shaper: Arc<Shaper>) -> Self {
        Self { inner, shaper }
    }

    pub fn accept(&self) -> io::Result<(BlockingStream<TcpStream>, SocketAddr)> {
        let (stream, addr) = self.inner.accept()?;
        let hierarchy = self.shaper.hierarchy();
        debug!(%addr, conn_capacity = hierarchy.leaf().capacity(), "accepted throttled connection");
        Ok((BlockingStream::new(stream, hierarchy), addr))
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.shaper.set_capacity(capacity);
    }

    pub fn capacity(&self) -> u64 {
        self.shaper.capacity()
    }

    pub fn set_conn_capacity(&self, capacity: u64) {
        self.shaper.set_conn_capacity(capacity);
    }

    pub fn conn_capacity(&self) -> u64 {
        self.shaper.conn_capacity()
    }

    pub fn shaper(&self) -> &Arc<Shaper> {
        &self.shaper
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn get_ref(&self) -> &TcpListener {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::Cursor,
        thread,
        time::{Duration, Instant},
    };

    use crate::bucket::Bucket;

    /// Accepts at most `limit` bytes per call.
    struct Trickle {
        out: Vec<u8>,
        limit: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.limit);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Accepts `chunk` bytes per call and fails call number `fail_on` once.
    struct Flaky {
        out: Vec<u8>,
        chunk: usize,
        calls: usize,
        fail_on: usize,
    }

    impl Write for Flaky {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls == self.fail_on {
                return Err(io::ErrorKind::Interrupted.into());
            }
            let n = buf.len().min(self.chunk);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn flaky() -> Flaky {
        Flaky { out: Vec::new(), chunk: 4, calls: 0, fail_on: 2 }
    }

    #[test]
    fn failure_after_partial_write_reports_progress() {
        let mut s = BlockingStream::standalone(flaky(), 0);
        assert_eq!(s.write(b"abcdefgh").unwrap(), 4);
        assert_eq!(s.get_ref().out, b"abcd");

        assert_eq!(s.write(b"efgh").unwrap(), 4);
        assert_eq!(s.get_ref().out, b"abcdefgh");
    }

    #[test]
    fn write_all_never_repeats_bytes() {
        let mut s = BlockingStream::standalone(flaky(), 0);
        s.write_all(b"abcdefgh").unwrap();
        assert_eq!(s.get_ref().out, b"abcdefgh");

        let mut s = BlockingStream::standalone(flaky(), 1000);
        s.write_all(b"abcdefgh").unwrap();
        assert_eq!(s.get_ref().out, b"abcdefgh");
    }

    #[test]
    fn unlimited_write_passes_through() {
        let mut s = BlockingStream::standalone(Vec::new(), 0);
        assert_eq!(s.write(b"hello").unwrap(), 5);
        assert_eq!(s.into_inner(), b"hello");
    }

    #[test]
    fn write_loops_until_payload_is_sent() {
        let mut s = BlockingStream::standalone(Trickle { out: Vec::new(), limit: 3 }, 1000);
        assert_eq!(s.write(&[9u8; 20]).unwrap(), 20);
        assert_eq!(s.get_ref().out, vec![9u8; 20]);
        // Unused parts of each grant are spent.
        assert!(s.hierarchy().leaf().fill() > 20);
    }

    #[test]
    fn write_is_paced_by_capacity() {
        let mut s = BlockingStream::standalone(Vec::new(), 100);
        let start = Instant::now();
        s.write_all(&[1u8; 150]).unwrap();
        let elapsed = start.elapsed();
        // 100 at once, 50 more need ~500ms.
        assert!(elapsed >= Duration::from_millis(450), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1200), "elapsed {elapsed:?}");
        assert_eq!(s.get_ref().len(), 150);
    }

    #[test]
    fn transport_errors_pass_through() {
        let mut s = BlockingStream::standalone(Broken, 100);
        let err = s.write(b"abc").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn read_shrinks_buffer_to_grant() {
        let mut s = BlockingStream::standalone(Cursor::new(vec![5u8; 64]), 16);
        let mut buf = [0u8; 64];
        assert_eq!(s.read(&mut buf).unwrap(), 16);
        assert_eq!(&buf[..16], &[5u8; 16]);
        assert_eq!(&buf[16..], &[0u8; 48]);
        assert_eq!(s.read(&mut []).unwrap(), 0);
    }

    #[test]
    fn shared_root_applies_to_blocking_streams() {
        let root = Arc::new(Bucket::new(1600));
        let mut a = BlockingStream::new(Vec::new(), Arc::new(Hierarchy::new(Some(root.clone()))));
        assert_eq!(a.write(&[0u8; 50]).unwrap(), 50);
        assert_eq!(root.fill(), 50);
    }

    #[test]
    fn listener_hands_out_throttled_tcp_streams() {
        let listener = BlockingListener::with_shaper(
            TcpListener::bind("127.0.0.1:0").unwrap(),
            Arc::new(Shaper::new(10_000, 1_000)),
        );
        let addr = listener.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut c = TcpStream::connect(addr).unwrap();
            c.write_all(b"ping").unwrap();
        });

        let (mut server, _) = listener.accept().unwrap();
        assert_eq!(server.hierarchy().leaf().capacity(), 1_000);
        assert!(Arc::ptr_eq(
            server.hierarchy().root().unwrap(),
            listener.shaper().root()
        ));

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        client.join().unwrap();
    }
}
