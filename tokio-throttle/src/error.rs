use std::io;

use thiserror::Error;

/// Errors surfaced by the stream adapters.
///
/// The buckets themselves never fail; the only error-shaped condition is an adapter receiving a
/// zero grant for a non-empty transfer, which means the limits were reconfigured mid-transfer in
/// a way the throttle cannot honour. It is reported, never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ThrottleError {
    #[error("consumed 0 bytes, requested {requested}")]
    ZeroGrant { requested: u64 },
}

impl From<ThrottleError> for io::Error {
    fn from(err: ThrottleError) -> Self {
        io::Error::other(err)
    }
}
