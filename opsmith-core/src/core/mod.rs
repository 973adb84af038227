//! Core runtime primitives: token counting, turn state, retry discipline.

pub mod retry;
pub mod state;
pub mod telemetry;
pub mod token_counter;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in fractional seconds.
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
