//! Monotonic microsecond clock shared by the transport state machines.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Microseconds since the process-wide clock origin.
pub type Mics = i64;

/// Microseconds per millisecond.
pub const MICS_PER_MILLI: Mics = 1_000;

/// Microseconds per second.
pub const MICS_PER_SECOND: Mics = 1_000_000;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Current monotonic time.
#[must_use]
pub fn now_mics() -> Mics {
    let origin = ORIGIN.get_or_init(Instant::now);
    to_mics(origin.elapsed())
}

/// Convert a duration, saturating at `Mics::MAX`.
#[must_use]
pub fn to_mics(duration: Duration) -> Mics {
    Mics::try_from(duration.as_micros()).unwrap_or(Mics::MAX)
}

/// Convert a (non-negative) microsecond count into a duration.
#[must_use]
pub fn to_duration(mics: Mics) -> Duration {
    Duration::from_micros(u64::try_from(mics).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let first = now_mics();
        let second = now_mics();
        assert!(second >= first);
        assert!(first >= 0);
    }

    #[test]
    fn conversions() {
        assert_eq!(to_mics(Duration::from_millis(3)), 3 * MICS_PER_MILLI);
        assert_eq!(to_duration(MICS_PER_SECOND), Duration::from_secs(1));
        assert_eq!(to_duration(-5), Duration::ZERO);
    }
}
