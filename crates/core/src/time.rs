//! Millisecond clock shared by every component.
//!
//! Arrival times, bucket due times and wakeup deadlines are all plain
//! [`Millis`] values on a single monotonic timeline, so scheduling decisions
//! stay simple integer comparisons and tests can drive the engine with
//! synthetic timestamps.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Milliseconds on the relay's monotonic timeline.
pub type Millis = i64;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current time on the monotonic timeline.
///
/// The timeline starts at 0 the first time any component asks for the time.
pub fn milliseconds() -> Millis {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as Millis
}

/// Convert a configuration duration into timeline milliseconds.
pub fn duration_ms(duration: Duration) -> Millis {
    duration.as_millis().min(Millis::MAX as u128) as Millis
}
