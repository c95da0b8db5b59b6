//! Lock-free token-bucket bandwidth throttling for byte streams.
//!
//! - [`bucket::Bucket`]: a single atomic token bucket refilled at `capacity` bytes/second.
//! - [`hierarchy::Hierarchy`]: a per-connection leaf bucket under an optional shared root.
//! - [`stream::ThrottledStream`]: Tokio `AsyncRead + AsyncWrite` adapter paced by a hierarchy.
//! - [`listener::ThrottledListener`]: hands out throttled streams that share the listener's root.
//! - [`blocking`]: the same for `std::io` transports on plain threads.
//! - [`utils::meter`]: byte counters for checking the resulting rates.
//!
//! A capacity of `0` means unlimited everywhere.
pub mod blocking;
pub mod bucket;
pub mod error;
pub mod hierarchy;
pub mod io;
pub mod listener;
pub mod stream;
pub mod utils;

pub use bucket::Bucket;
pub use error::ThrottleError;
pub use hierarchy::{Acquire, DEFAULT_FAN_OUT, Hierarchy};
pub use io::{ResetLinger, ThrottleExt};
pub use listener::{Accept, Shaper, ThrottledListener};
pub use stream::ThrottledStream;
