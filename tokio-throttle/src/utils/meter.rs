//! Bandwidth metering for throttled transports.
//!
//! A [`Meter`] is a shared, lock-free byte counter with a start time; [`MeteredStream`] wraps any
//! async stream and adds every byte it reads or writes to one. Several streams may feed the same
//! meter to observe their aggregate rate.
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use tokio::io::{self, AsyncWriteExt, duplex};
//! use tokio_throttle::{io::ThrottleExt, utils::meter::{Meter, MeteredStream}};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let (a, _b) = duplex(64 * 1024);
//! let meter = Arc::new(Meter::new());
//! let mut stream = MeteredStream::new(a.throttle(1000), meter.clone());
//!
//! stream.write_all(&[0u8; 3000]).await?;
//! println!("{:?} B/s, off by {:?}", meter.rate_bps(), meter.accuracy(1000.0));
//! # Ok(()) }
//! ```
use std::{
    fmt, io,
    io::IoSlice,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll, ready},
    time::Duration,
};

use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::Instant,
};

use crate::io::ResetLinger;

const NOT_STARTED: u64 = u64::MAX;

/// Counts bytes and reports the average rate since the first non-zero [`Meter::add`].
pub struct Meter {
    total: AtomicU64,
    /// Nanoseconds from `origin` to the first counted byte.
    started: AtomicU64,
    origin: Instant,
}

impl Meter {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            started: AtomicU64::new(NOT_STARTED),
            origin: Instant::now(),
        }
    }

    /// Record `n` transferred bytes. The clock starts on the first non-zero call.
    pub fn add(&self, n: u64) {
        if n == 0 {
            return;
        }
        let now = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(NOT_STARTED - 1);
        // Fails once the clock is already running.
        self.started
            .compare_exchange(NOT_STARTED, now, Ordering::AcqRel, Ordering::Acquire)
            .ok();
        self.total.fetch_add(n, Ordering::AcqRel);
    }

    /// Bytes counted so far.
    #[inline]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Time since the first counted byte, zero before that.
    pub fn elapsed(&self) -> Duration {
        match self.started.load(Ordering::Acquire) {
            NOT_STARTED => Duration::ZERO,
            started => self
                .origin
                .elapsed()
                .saturating_sub(Duration::from_nanos(started)),
        }
    }

    /// Average rate in bytes per second, `None` until a byte has been counted.
    pub fn rate_bps(&self) -> Option<f64> {
        if self.started.load(Ordering::Acquire) == NOT_STARTED {
            return None;
        }
        let elapsed = self.elapsed().as_secs_f64().max(1e-6);
        Some(self.total() as f64 / elapsed)
    }

    /// Relative error of the measured rate against `expected_bps`: `measured / expected - 1`.
    pub fn accuracy(&self, expected_bps: f64) -> Option<f64> {
        if expected_bps <= 0.0 {
            return None;
        }
        self.rate_bps().map(|rate| rate / expected_bps - 1.0)
    }

    /// Clear the counter and the start time.
    pub fn reset(&self) {
        self.started.store(NOT_STARTED, Ordering::Release);
        self.total.store(0, Ordering::Release);
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meter")
            .field("total", &self.total())
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

/// Adds every byte read from or written to `inner` to a shared [`Meter`].
#[pin_project]
pub struct MeteredStream<T> {
    #[pin]
    inner: T,
    meter: Arc<Meter>,
}

impl<T> MeteredStream<T> {
    pub fn new(inner: T, meter: Arc<Meter>) -> Self {
        Self { inner, meter }
    }

    #[inline]
    pub fn meter(&self) -> &Arc<Meter> {
        &self.meter
    }

    #[inline]
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: fmt::Debug> fmt::Debug for MeteredStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeteredStream")
            .field("inner", &self.inner)
            .field("meter", &self.meter)
            .finish()
    }
}

impl<T: ResetLinger> ResetLinger for MeteredStream<T> {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        self.inner.set_reset_linger()
    }
}

impl<T: AsyncRead> AsyncRead for MeteredStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        this.meter
            .add(buf.filled().len().saturating_sub(before) as u64);
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite> AsyncWrite for MeteredStream<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        let n = ready!(this.inner.poll_write(cx, buf))?;
        this.meter.add(n as u64);
        Poll::Ready(Ok(n))
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    #[inline]
    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let n = ready!(this.inner.poll_write_vectored(cx, bufs))?;
        this.meter.add(n as u64);
        Poll::Ready(Ok(n))
    }
}
