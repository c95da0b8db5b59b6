//! Two-level bucket hierarchy: a private leaf under a shared root.
//!
//! Every [`Hierarchy`] owns one leaf [`Bucket`] (for example one connection's limit) and may
//! reference a root `Arc<Bucket>` shared by many hierarchies (for example all connections of one
//! listener). A request is granted only when both levels have room: the leaf is charged first,
//! then the same amount is forwarded to the root.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_throttle::{bucket::Bucket, hierarchy::Hierarchy};
//!
//! let root = Arc::new(Bucket::new(100_000)); // 100 KB/s for everyone
//! let a = Hierarchy::new(Some(root.clone()));
//! let b = Hierarchy::new(Some(root.clone()));
//! a.set_capacity(60_000); // each connection may use at most 60 KB/s
//! b.set_capacity(60_000);
//!
//! let granted = a.consume(16 * 1024);
//! assert!(granted <= 100_000 / 16);
//! ```
//!
//! ## Fan-out projection
//! Before competing for a limited root, a request is capped to `root.capacity() / fan_out` (at
//! least 1 byte). Leaves never coordinate with each other; keeping each claim small relative to
//! the shared rate lets many leaves interleave roughly evenly instead of one leaf draining the
//! whole root per round. The divisor defaults to [`DEFAULT_FAN_OUT`] and is tunable through
//! [`Hierarchy::with_fan_out`].
use std::{sync::Arc, thread, time::Duration};

use crate::bucket::Bucket;

/// Default divisor of the root capacity used by [`Hierarchy::project`].
pub const DEFAULT_FAN_OUT: u64 = 16;

/// Progress of one two-phase grant through a [`Hierarchy`].
///
/// Holds the leaf reservation while the caller waits for the root, so a retry does not charge the
/// leaf again. Poll-based callers keep one per direction; blocking and async `consume` keep one on
/// the stack.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Acquire {
    leaf_granted: Option<u64>,
}

impl Acquire {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leaf tokens already reserved and waiting for the root, if any.
    pub fn pending(&self) -> Option<u64> {
        self.leaf_granted
    }
}

/// Hierarchy of buckets, 2 levels.
#[derive(Debug)]
pub struct Hierarchy {
    leaf: Bucket,
    root: Option<Arc<Bucket>>,
    fan_out: u64,
}

impl Hierarchy {
    /// Creates an unlimited leaf under `root`. `None` means no aggregate limit.
    pub fn new(root: Option<Arc<Bucket>>) -> Self {
        Self::with_fan_out(root, DEFAULT_FAN_OUT)
    }

    /// Like [`new`](Self::new) with a custom projection divisor (clamped to at least 1).
    pub fn with_fan_out(root: Option<Arc<Bucket>>, fan_out: u64) -> Self {
        Self {
            leaf: Bucket::new(0),
            root,
            fan_out: fan_out.max(1),
        }
    }

    /// Consumes at the leaf first and then requests the same amount from the root, blocking the
    /// current thread while either level is exhausted.
    pub fn consume(&self, request: u64) -> u64 {
        let mut acquire = Acquire::new();
        loop {
            match self.try_consume(&mut acquire, request) {
                Ok(granted) => return granted,
                Err(wait) => thread::sleep(wait),
            }
        }
    }

    /// Async flavour of [`consume`](Self::consume).
    pub async fn consume_async(&self, request: u64) -> u64 {
        let mut acquire = Acquire::new();
        loop {
            match self.try_consume(&mut acquire, request) {
                Ok(granted) => return granted,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Runs one pass of the two-phase grant.
    ///
    /// On `Err(wait)` the caller sleeps and calls again with the same `acquire`; a leaf
    /// reservation made by an earlier pass is forwarded to the root instead of being re-requested.
    pub fn try_consume(&self, acquire: &mut Acquire, request: u64) -> Result<u64, Duration> {
        let Some(root) = self.limited_root() else {
            if let Some(granted) = acquire.leaf_granted.take() {
                return Ok(granted);
            }
            return self.leaf.try_consume(request);
        };

        let granted = match acquire.leaf_granted {
            Some(granted) => granted,
            None => {
                let granted = self.leaf.try_consume(self.project(request))?;
                acquire.leaf_granted = Some(granted);
                granted
            }
        };

        let granted = root.try_consume(granted)?;
        acquire.leaf_granted = None;
        Ok(granted)
    }

    /// Best estimate of the reservation a single request may claim at the root.
    pub fn project(&self, request: u64) -> u64 {
        match self.limited_root() {
            Some(root) => request.min((root.capacity() / self.fan_out).max(1)),
            None => request,
        }
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.leaf.set_capacity(capacity);
    }

    pub fn reset(&self) {
        self.leaf.reset();
    }

    pub fn leaf(&self) -> &Bucket {
        &self.leaf
    }

    pub fn root(&self) -> Option<&Arc<Bucket>> {
        self.root.as_ref()
    }

    pub fn fan_out(&self) -> u64 {
        self.fan_out
    }

    /// `true` when neither level currently limits anything.
    pub fn unlimited(&self) -> bool {
        self.leaf.unlimited() && self.limited_root().is_none()
    }

    fn limited_root(&self) -> Option<&Bucket> {
        self.root.as_deref().filter(|root| !root.unlimited())
    }
}

impl Default for Hierarchy {
    fn default() -> Self {
        Self::new(None)
    }
}
