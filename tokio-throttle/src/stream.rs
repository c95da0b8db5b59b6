//! Throttled duplex stream for Tokio `AsyncRead + AsyncWrite` transports.
//!
//! [`ThrottledStream`] asks its [`Hierarchy`] how many bytes it may move before every read or
//! write, then performs a short transfer of at most that many bytes. Reads and writes share the
//! same hierarchy, so the configured capacity bounds the **combined** traffic of the connection.
//!
//! ## Standalone limit
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::TcpStream;
//! use tokio_throttle::stream::ThrottledStream;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:12345").await?;
//! let mut stream = ThrottledStream::standalone(stream, 32 * 1024); // 32 KB/s
//!
//! stream.write_all(b"hello").await?;
//! stream.set_capacity(1024); // tighten at runtime
//! # Ok(()) }
//! ```
//!
//! ## Under a shared root
//! ```no_run
//! use std::sync::Arc;
//! use tokio::io::{self, AsyncReadExt};
//! use tokio::net::TcpStream;
//! use tokio_throttle::{bucket::Bucket, hierarchy::Hierarchy, stream::ThrottledStream};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let root = Arc::new(Bucket::new(1024 * 1024)); // 1 MB/s across every stream
//! let hierarchy = Arc::new(Hierarchy::new(Some(root.clone())));
//! hierarchy.set_capacity(64 * 1024); // 64 KB/s for this one
//!
//! let stream = TcpStream::connect("127.0.0.1:12345").await?;
//! let mut stream = ThrottledStream::new(stream, hierarchy);
//! let mut buf = [0u8; 4096];
//! let _n = stream.read(&mut buf).await?;
//! # Ok(()) }
//! ```
//!
//! ## Under the hood
//! - Reads cannot know in advance how much of the buffer the transport will fill, so a read
//!   reserves `min(buf.remaining(), capacity)` and hands the transport a buffer of exactly that
//!   size. Size your read buffers with the throttled bandwidth in mind.
//! - Writes reserve for the whole slice and forward at most the grant; `write_all` loops.
//! - A grant is kept across `Poll::Pending` from the transport and reused by the next poll, so a
//!   transport that is not ready never gets charged twice. Tokens a transfer leaves unused stay
//!   with that direction for its next transfer.
//! - Each direction has its own pacing state (pending grant + reusable `Sleep`), so a split stream
//!   can be driven from two tasks.
//! - An unlimited hierarchy short-circuits to the inner transport.
use std::{
    fmt, io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use futures::FutureExt;
use pin_project::pin_project;
use smallvec::SmallVec;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{Instant, Sleep, sleep_until},
};
use tracing::warn;

use crate::{
    error::ThrottleError,
    hierarchy::{Acquire, Hierarchy},
    io::ResetLinger,
};

/// Inline `IoSlice` capacity for zero-allocation vectored writes in the common path.
const INLINE_IOVEC: usize = 16;

/// Per-direction pacing state.
#[derive(Default)]
struct Pacer {
    acquire: Acquire,
    granted: Option<u64>,
    sleep: Option<Pin<Box<Sleep>>>,
    sleeping: bool,
}

impl Pacer {
    fn poll_acquire(&mut self, cx: &mut Context<'_>, hierarchy: &Hierarchy, want: u64) -> Poll<u64> {
        loop {
            if let Some(granted) = self.granted {
                return Poll::Ready(granted.min(want));
            }

            if self.sleeping {
                if let Some(sleep) = self.sleep.as_mut() {
                    ready!(sleep.poll_unpin(cx));
                }
                self.sleeping = false;
            }

            match hierarchy.try_consume(&mut self.acquire, want) {
                Ok(granted) => self.granted = Some(granted),
                Err(wait) => {
                    let deadline = Instant::now() + wait;
                    match self.sleep.as_mut() {
                        Some(sleep) => sleep.as_mut().reset(deadline),
                        None => self.sleep = Some(Box::pin(sleep_until(deadline))),
                    }
                    self.sleeping = true;
                }
            }
        }
    }

    /// A transfer moved `used` bytes; whatever is left of the grant backs the next one.
    #[inline]
    fn spend(&mut self, used: u64) {
        self.granted = self
            .granted
            .map(|granted| granted.saturating_sub(used))
            .filter(|&left| left > 0);
    }

    /// Drops the current grant; its tokens are spent.
    #[inline]
    fn release(&mut self) {
        self.granted = None;
    }
}

/// A duplex stream whose reads and writes are paced by a [`Hierarchy`].
#[pin_project]
pub struct ThrottledStream<T> {
    #[pin]
    inner: T,
    hierarchy: Arc<Hierarchy>,
    read: Pacer,
    write: Pacer,
}

impl<T> ThrottledStream<T> {
    /// Wrap `inner`, charging every transfer to `hierarchy`.
    pub fn new(inner: T, hierarchy: Arc<Hierarchy>) -> Self {
        Self {
            inner,
            hierarchy,
            read: Pacer::default(),
            write: Pacer::default(),
        }
    }

    /// Wrap `inner` with its own limit of `capacity` bytes/sec and no shared root.
    pub fn standalone(inner: T, capacity: u64) -> Self {
        let hierarchy = Hierarchy::new(None);
        hierarchy.set_capacity(capacity);
        Self::new(inner, Arc::new(hierarchy))
    }

    /// Change this stream's own limit. `0` removes it (a shared root still applies).
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

impl<T: ResetLinger> ResetLinger for ThrottledStream<T> {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        self.inner.set_reset_linger()
    }
}

impl<T: AsyncRead> AsyncRead for ThrottledStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if this.hierarchy.unlimited() {
            this.read.release();
            return this.inner.poll_read(cx, buf);
        }

        let want = to_u64(buf.remaining());
        let grant = ready!(this.read.poll_acquire(cx, this.hierarchy, want));
        let grant = to_usize(grant).min(buf.remaining());
        if grant == 0 {
            this.read.release();
            warn!(requested = want, "zero grant on read");
            return Poll::Ready(Err(ThrottleError::ZeroGrant { requested: want }.into()));
        }

        let mut limited = ReadBuf::new(buf.initialize_unfilled_to(grant));
        match this.inner.poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let n = limited.filled().len();
                this.read.spend(to_u64(n));
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.read.release();
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: AsyncWrite> AsyncWrite for ThrottledStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if this.hierarchy.unlimited() {
            this.write.release();
            return this.inner.poll_write(cx, buf);
        }

        let want = to_u64(buf.len());
        let grant = ready!(this.write.poll_acquire(cx, this.hierarchy, want));
        let grant = to_usize(grant).min(buf.len());
        if grant == 0 {
            this.write.release();
            warn!(requested = want, "zero grant on write");
            return Poll::Ready(Err(ThrottleError::ZeroGrant { requested: want }.into()));
        }

        match this.inner.poll_write(cx, &buf[..grant]) {
            Poll::Ready(Ok(n)) => {
                this.write.spend(to_u64(n));
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                this.write.release();
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
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

        if this.hierarchy.unlimited() {
            this.write.release();
            return this.inner.poll_write_vectored(cx, bufs);
        }

        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 {
            return Poll::Ready(Ok(0));
        }

        let want = to_u64(total);
        let grant = ready!(this.write.poll_acquire(cx, this.hierarchy, want));
        let grant = to_usize(grant).min(total);
        if grant == 0 {
            this.write.release();
            warn!(requested = want, "zero grant on vectored write");
            return Poll::Ready(Err(ThrottleError::ZeroGrant { requested: want }.into()));
        }

        // Build a view truncated to the grant without heap allocs in the common case.
        let mut remaining = grant;
        let mut slices: SmallVec<[io::IoSlice<'_>; INLINE_IOVEC]> = SmallVec::new();
        for s in bufs {
            if remaining == 0 {
                break;
            }
            let take = s.len().min(remaining);
            slices.push(io::IoSlice::new(&s[..take]));
            remaining -= take;
        }

        match this.inner.poll_write_vectored(cx, &slices) {
            Poll::Ready(Ok(n)) => {
                this.write.spend(to_u64(n));
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                this.write.release();
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ThrottledStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledStream")
            .field("inner", &self.inner)
            .field("hierarchy", &self.hierarchy)
            .finish()
    }
}

#[inline]
fn to_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

#[inline]
fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Bucket;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio::time::{self, Duration, Instant};

    #[tokio::test(start_paused = true)]
    async fn write_passes_through_when_unlimited() {
        let (w, mut r) = duplex(64);
        let mut tw = ThrottledStream::standalone(w, 0);
        tw.write_all(b"hello").await.unwrap();
        tw.flush().await.unwrap();

        let mut buf = vec![0u8; 5];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test(start_paused = true)]
    async fn write_is_rate_limited_over_time() {
        let (w, mut r) = duplex(1024);
        let mut tw = ThrottledStream::standalone(w, 10); // 10 B/s

        let data = vec![b'a'; 30];
        let start = Instant::now();
        let write_fut = tw.write_all(&data);
        tokio::pin!(write_fut);

        tokio::select! {
            _ = &mut write_fut => panic!("write completed immediately despite throttling"),
            _ = time::sleep(Duration::from_millis(10)) => {}
        }

        // 10 bytes go at once, the remaining 20 need two more seconds.
        time::sleep(Duration::from_secs(2)).await;
        write_fut.await.unwrap();
        tw.flush().await.unwrap();

        let mut buf = vec![0u8; data.len()];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, data);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn single_write_is_capped_to_capacity() {
        let (w, mut r) = duplex(1024);
        let mut tw = ThrottledStream::standalone(w, 10);

        let n = tw.write(&[b'z'; 100]).await.unwrap();
        assert_eq!(n, 10);

        let mut got = vec![0u8; n];
        r.read_exact(&mut got).await.unwrap();
        assert_eq!(got, vec![b'z'; 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn write_vectored_respects_grant() {
        let (w, mut r) = duplex(128);
        let mut tw = ThrottledStream::standalone(w, 8);

        let a = io::IoSlice::new(b"hello ");
        let b = io::IoSlice::new(b"world");
        let n = tw.write_vectored(&[a, b]).await.unwrap();
        assert!((1..=8).contains(&n), "wrote {n}");
        tw.flush().await.unwrap();

        let mut buf = vec![0u8; n];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &b"hello world"[..n]);
    }

    #[tokio::test(start_paused = true)]
    async fn write_vectored_many_slices_truncates_to_grant() {
        let (w, mut r) = duplex(256);
        let mut tw = ThrottledStream::standalone(w, 10);

        // More slices than INLINE_IOVEC.
        let src = [b'a'; 20];
        let slices: Vec<io::IoSlice<'_>> =
            (0..src.len()).map(|i| io::IoSlice::new(&src[i..i + 1])).collect();

        let n = tw.write_vectored(&slices).await.unwrap();
        assert!((1..=10).contains(&n), "wrote {n}");
        tw.flush().await.unwrap();

        let mut got = vec![0u8; n];
        r.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, &src[..n]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_writes_return_immediately() {
        let (w, _r) = duplex(64);
        let mut tw = ThrottledStream::standalone(w, 5);
        let start = Instant::now();
        assert_eq!(tw.write(&[]).await.unwrap(), 0);
        assert_eq!(tw.write_vectored(&[]).await.unwrap(), 0);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(tw.hierarchy().leaf().fill(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reader_is_rate_limited() {
        let (mut w, r) = duplex(256);
        let mut tr = ThrottledStream::standalone(r, 16);

        tokio::spawn(async move {
            let _ = w.write_all(&[b'x'; 48]).await;
        });

        let start = Instant::now();
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        while out.len() < 48 {
            let n = tr.read(&mut buf).await.unwrap();
            assert!(n <= 16, "read {n} above capacity");
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out.len(), 48);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn reader_unlimited_is_pass_through_without_sleep() {
        let (mut w, r) = duplex(256);
        let data = vec![42u8; 50];
        tokio::spawn({
            let data = data.clone();
            async move {
                let _ = w.write_all(&data).await;
            }
        });

        let mut tr = ThrottledStream::standalone(r, 0);
        let start = Instant::now();
        let mut out = Vec::new();
        tr.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn reads_within_budget_do_not_sleep() {
        let (mut w, r) = duplex(128);
        let mut tr = ThrottledStream::standalone(r, 10);
        tokio::spawn(async move {
            let _ = w.write_all(b"abcdefghij").await;
        });

        let start = Instant::now();
        let mut tmp = [0u8; 5];
        tr.read_exact(&mut tmp).await.unwrap();
        assert_eq!(&tmp, b"abcde");
        tr.read_exact(&mut tmp).await.unwrap();
        assert_eq!(&tmp, b"fghij");
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_read_keeps_its_grant() {
        let (mut w, r) = duplex(128);
        let mut tr = ThrottledStream::standalone(r, 10);

        // Nothing to read yet: the first poll reserves 10 bytes and parks on the transport.
        let mut buf = [0u8; 10];
        tokio::select! {
            _ = tr.read(&mut buf) => panic!("read completed without data"),
            _ = time::sleep(Duration::from_millis(10)) => {}
        }
        assert_eq!(tr.hierarchy().leaf().fill(), 10);

        w.write_all(b"0123456789").await.unwrap();
        let start = Instant::now();
        let n = tr.read(&mut buf).await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(start.elapsed(), Duration::ZERO, "held grant must be reused");
        assert_eq!(tr.hierarchy().leaf().fill(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn unused_part_of_held_grant_backs_next_read() {
        let (mut w, r) = duplex(128);
        let mut tr = ThrottledStream::standalone(r, 10);

        let mut big = [0u8; 10];
        tokio::select! {
            _ = tr.read(&mut big) => panic!("read completed without data"),
            _ = time::sleep(Duration::from_millis(10)) => {}
        }
        assert_eq!(tr.hierarchy().leaf().fill(), 10);

        w.write_all(b"0123456789").await.unwrap();
        let start = Instant::now();

        let mut small = [0u8; 2];
        assert_eq!(tr.read(&mut small).await.unwrap(), 2);
        assert_eq!(&small, b"01");

        let mut rest = [0u8; 8];
        tr.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"23456789");
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(tr.hierarchy().leaf().fill(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn short_write_keeps_rest_of_grant() {
        let (w, mut r) = duplex(4);
        let mut tw = ThrottledStream::standalone(w, 10);

        // The pipe takes 4 of the 10 granted bytes.
        assert_eq!(tw.write(&[7u8; 10]).await.unwrap(), 4);
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).await.unwrap();

        let start = Instant::now();
        assert_eq!(tw.write(&[8u8; 6]).await.unwrap(), 4);
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(tw.write(&[8u8; 2]).await.unwrap(), 2);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(tw.hierarchy().leaf().fill(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn reads_and_writes_share_one_budget() {
        let (a, mut b) = duplex(256);
        let mut ta = ThrottledStream::standalone(a, 10);

        ta.write_all(&[1u8; 6]).await.unwrap();
        b.write_all(&[2u8; 6]).await.unwrap();

        let start = Instant::now();
        let mut got = [0u8; 6];
        ta.read_exact(&mut got).await.unwrap();
        assert_eq!(got, [2u8; 6]);
        assert!(start.elapsed() > Duration::ZERO, "read must wait for write's tokens");
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_update_applies_at_runtime() {
        let (w, mut r) = duplex(256);
        let mut tw = ThrottledStream::standalone(w, 0);

        tw.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        tw.set_capacity(1);
        let start = Instant::now();
        tw.write_all(b"xyz").await.unwrap();
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"xyz");
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn streams_under_one_root_share_its_rate() {
        let root = Arc::new(Bucket::new(1600));
        let (a, mut ra) = duplex(64 * 1024);
        let (b, mut rb) = duplex(64 * 1024);
        let mut ta = ThrottledStream::new(a, Arc::new(Hierarchy::new(Some(root.clone()))));
        let mut tb = ThrottledStream::new(b, Arc::new(Hierarchy::new(Some(root.clone()))));

        let start = Instant::now();
        let (wa, wb) = tokio::join!(ta.write_all(&[0u8; 2400]), tb.write_all(&[1u8; 2400]));
        wa.unwrap();
        wb.unwrap();

        // 4800 bytes through a 1600 B/s root: 1600 at once, 3200 over two seconds.
        assert!(start.elapsed() >= Duration::from_secs(2));

        let mut buf = vec![0u8; 2400];
        ra.read_exact(&mut buf).await.unwrap();
        rb.read_exact(&mut buf).await.unwrap();
    }

    // Helper wrapper to verify ResetLinger delegation.
    struct RlWrapper<W> {
        inner: W,
        hits: Arc<AtomicUsize>,
    }

    impl<W> ResetLinger for RlWrapper<W> {
        fn set_reset_linger(&mut self) -> io::Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn set_reset_linger_delegates_to_inner() {
        let hits = Arc::new(AtomicUsize::new(0));
        let wrapped = RlWrapper {
            inner: (),
            hits: hits.clone(),
        };

        let mut ts = ThrottledStream::standalone(wrapped, 0);
        ts.set_reset_linger().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let () = ts.into_inner().inner;
    }
}
