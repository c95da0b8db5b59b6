//! Lock-free token bucket whose burst equals one second of throughput.
//!
//! A [`Bucket`] with capacity `C` refills at `C` tokens per second and never holds more than `C`
//! unspent tokens, so a single grant never waits longer than about one second. A capacity of `0`
//! means **unlimited**: every request is granted in full, immediately, without touching state.
//!
//! ## Blocking and async consumers
//! ```no_run
//! use tokio_throttle::bucket::Bucket;
//!
//! # async fn demo() {
//! let bucket = Bucket::new(1000); // 1000 B/s
//!
//! // Blocking: sleeps the calling thread until tokens exist.
//! let granted = bucket.consume(4096);
//! assert_eq!(granted, 1000);
//!
//! // Async: suspends the task on the Tokio timer instead.
//! let granted = bucket.consume_async(4096).await;
//! assert_eq!(granted, 1000);
//! # }
//! ```
//!
//! ## Under the hood
//! - `fill`, `capacity` and `timestamp` are independent `AtomicU64`s. Nothing ever updates two of
//!   them jointly; every transition is a compare-and-swap retry loop on one field.
//! - A refill pass commits by advancing `timestamp`. That CAS is the serialization point: a caller
//!   that loses it throws its computed delta away and starts the pass again, so refilled tokens
//!   are never counted twice.
//! - The timestamp advances only by the whole milliseconds that paid for the issued tokens, so the
//!   sub-millisecond remainder (and fractional-token time on slow buckets) carries over.
//! - On shortfall the caller sleeps `max(1ms, deficit / rate)` and retries. There is no queue and
//!   no wakeup signalling; waiters race.
//! - Readings come from [`tokio::time::Instant`], which is the std monotonic clock outside a
//!   runtime and the (pausable) runtime clock inside one.
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::Duration,
};

use tokio::time::Instant;
use tracing::trace;

const NANOS_PER_MILLI: u64 = 1_000_000;
const NANOS_PER_SEC: u64 = 1_000_000_000;
const MILLIS_PER_SEC: u128 = 1_000;

/// A token bucket where bucket size does not exceed output speed
/// (`R = capacity/sec`, `B = R * 1 sec = capacity`).
pub struct Bucket {
    fill: AtomicU64,
    capacity: AtomicU64,
    timestamp: AtomicU64,
    origin: Instant,
}

impl Bucket {
    /// Creates an empty bucket refilling at `capacity` bytes per second. `0` disables throttling.
    pub fn new(capacity: u64) -> Self {
        Self {
            fill: AtomicU64::new(0),
            capacity: AtomicU64::new(capacity),
            timestamp: AtomicU64::new(0),
            origin: Instant::now(),
        }
    }

    /// Reserves up to `request` tokens, sleeping the current thread until they exist.
    ///
    /// Returns `min(request, capacity)`, or `request` unchanged for an unlimited bucket.
    ///
    /// Do not call this from an async task; use [`consume_async`](Self::consume_async) instead.
    pub fn consume(&self, request: u64) -> u64 {
        loop {
            match self.try_consume(request) {
                Ok(granted) => return granted,
                Err(wait) => thread::sleep(wait),
            }
        }
    }

    /// Async flavour of [`consume`](Self::consume) that waits on the Tokio timer.
    pub async fn consume_async(&self, request: u64) -> u64 {
        loop {
            match self.try_consume(request) {
                Ok(granted) => return granted,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Runs a single refill-and-reserve pass.
    ///
    /// Returns the grant on success, or how long to sleep before trying again. Nothing is
    /// reserved when this returns `Err`.
    pub fn try_consume(&self, request: u64) -> Result<u64, Duration> {
        let capacity = self.capacity.load(Ordering::Acquire);
        if capacity == 0 {
            return Ok(request);
        }

        let request = request.min(capacity);
        self.refill(capacity);

        let mut fill = self.fill.load(Ordering::Acquire);
        loop {
            match fill.checked_add(request) {
                Some(next) if next <= capacity => {
                    match self.fill.compare_exchange_weak(
                        fill,
                        next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Ok(request),
                        Err(actual) => fill = actual,
                    }
                }
                _ => break,
            }
        }

        let deficit = request.saturating_sub(capacity.saturating_sub(fill));
        let wait = wait_for(deficit, capacity);
        trace!(request, fill, capacity, ?wait, "bucket exhausted");
        Err(wait)
    }

    /// Returns tokens generated since the last committed refill back to the bucket.
    fn refill(&self, capacity: u64) {
        loop {
            let prev = self.timestamp.load(Ordering::Acquire);
            let now = self.now();
            let since = now.saturating_sub(prev);

            if since >= NANOS_PER_SEC {
                // Idle for a whole second: everything has regenerated.
                if self
                    .timestamp
                    .compare_exchange(prev, now, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                self.fill.store(0, Ordering::Release);
                return;
            }

            let elapsed_ms = since / NANOS_PER_MILLI;
            let tokens = tokens_for(elapsed_ms, capacity);
            if tokens == 0 {
                return;
            }

            let accounted = millis_for(tokens, capacity).min(elapsed_ms) * NANOS_PER_MILLI;
            if self
                .timestamp
                .compare_exchange(prev, prev + accounted, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            // Only the timestamp winner gets here, so `tokens` are returned exactly once.
            self.update_fill(|fill| fill.saturating_sub(tokens));
            return;
        }
    }

    /// Tokens currently reserved.
    pub fn fill(&self) -> u64 {
        self.fill.load(Ordering::Acquire)
    }

    /// Rate in bytes per second, which is also the burst size. `0` means unlimited.
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Nanoseconds since the bucket was created at which refill was last accounted.
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Tokens that can be reserved without waiting, ignoring pending refill.
    pub fn available(&self) -> u64 {
        self.capacity().saturating_sub(self.fill())
    }

    pub fn unlimited(&self) -> bool {
        self.capacity() == 0
    }

    /// Changes the rate. `0` disables throttling and forgets the current fill; a lower limit
    /// clamps the fill to the new capacity.
    pub fn set_capacity(&self, capacity: u64) {
        self.capacity.store(capacity, Ordering::Release);
        self.update_fill(|fill| fill.min(capacity));
    }

    /// Seeds the fill level and restarts refill accounting from now.
    ///
    /// `set_fill(capacity)` makes the bucket start "full" (next bytes wait), `set_fill(0)` makes
    /// one second of burst available at once.
    pub fn set_fill(&self, fill: u64) {
        self.fill.store(fill.min(self.capacity()), Ordering::Release);
        self.timestamp.store(self.now(), Ordering::Release);
    }

    pub fn reset(&self) {
        self.set_fill(0);
    }

    /// Applies `f` to the fill level with a CAS retry loop.
    fn update_fill(&self, f: impl Fn(u64) -> u64) {
        let mut fill = self.fill.load(Ordering::Acquire);
        loop {
            match self
                .fill
                .compare_exchange_weak(fill, f(fill), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => fill = actual,
            }
        }
    }

    fn now(&self) -> u64 {
        let nanos = Instant::now().saturating_duration_since(self.origin).as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("fill", &self.fill())
            .field("capacity", &self.capacity())
            .field("timestamp", &self.timestamp())
            .finish()
    }
}

/// Tokens regenerated by `capacity` bytes/sec over `elapsed_ms`.
#[inline]
fn tokens_for(elapsed_ms: u64, capacity: u64) -> u64 {
    let tokens = u128::from(capacity) * u128::from(elapsed_ms) / MILLIS_PER_SEC;
    u64::try_from(tokens).unwrap_or(u64::MAX)
}

/// Whole milliseconds needed to regenerate `tokens`, rounded up.
#[inline]
fn millis_for(tokens: u64, capacity: u64) -> u64 {
    let ms = (u128::from(tokens) * MILLIS_PER_SEC).div_ceil(u128::from(capacity));
    u64::try_from(ms).unwrap_or(u64::MAX)
}

/// Sleep needed for `deficit` tokens to regenerate, never less than 1ms.
#[inline]
fn wait_for(deficit: u64, capacity: u64) -> Duration {
    Duration::from_millis(millis_for(deficit, capacity).max(1))
}
