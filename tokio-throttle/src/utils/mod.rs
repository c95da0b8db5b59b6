//! Helpers for observing throttled traffic.
pub mod meter;
