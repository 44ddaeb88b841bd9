//! Round-trip time estimation.

use super::clock::{MICS_PER_MILLI, Mics};

/// Lower clamp for RTT samples.
pub const MIN_RTT_MICS: Mics = 5 * MICS_PER_MILLI;

/// Upper clamp for RTT samples.
pub const MAX_RTT_MICS: Mics = 1_000 * MICS_PER_MILLI;

/// Smoothed RTT assumed before the first sample.
pub const INITIAL_RTT_MICS: Mics = 100 * MICS_PER_MILLI;

/// RTT estimator using the RFC 6298 moving averages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttStats {
    latest: Mics,
    minimum: Mics,
    smoothed: Mics,
    variance: Mics,
    samples: u32,
}

impl Default for RttStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RttStats {
    /// Create an estimator with no samples.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            latest: 0,
            minimum: 0,
            smoothed: INITIAL_RTT_MICS,
            variance: INITIAL_RTT_MICS / 2,
            samples: 0,
        }
    }

    /// Feed a measured round trip.
    pub fn add_sample(&mut self, sample: Mics) {
        let latest = sample.clamp(MIN_RTT_MICS, MAX_RTT_MICS);
        self.latest = latest;

        if self.samples == 0 {
            self.minimum = latest;
            self.smoothed = latest;
            self.variance = latest / 2;
        } else {
            self.minimum = self.minimum.min(latest);
            let abs_err = (self.smoothed - latest).abs();
            self.variance = ((3 * self.variance) + abs_err) / 4;
            self.smoothed = ((7 * self.smoothed) + latest) / 8;
        }
        self.samples = self.samples.saturating_add(1);
    }

    /// Seed the estimate from the peer's smoothed RTT until a local sample exists.
    pub fn add_hint(&mut self, hint: Mics) {
        if self.samples == 0 && hint > 0 {
            let hint = hint.clamp(MIN_RTT_MICS, MAX_RTT_MICS);
            self.smoothed = hint;
            self.variance = hint / 2;
        }
    }

    /// Latest sample (0 before any sample).
    #[must_use]
    pub const fn latest(&self) -> Mics {
        self.latest
    }

    /// Minimum observed sample (0 before any sample).
    #[must_use]
    pub const fn minimum(&self) -> Mics {
        self.minimum
    }

    /// Smoothed RTT.
    #[must_use]
    pub const fn smoothed(&self) -> Mics {
        self.smoothed
    }

    /// RTT variation.
    #[must_use]
    pub const fn variance(&self) -> Mics {
        self.variance
    }

    /// Number of samples observed.
    #[must_use]
    pub const fn samples(&self) -> u32 {
        self.samples
    }

    /// Retransmission timeout, floored at `floor`.
    #[must_use]
    pub fn retransmission_timeout(&self, floor: Mics) -> Mics {
        (self.smoothed + 4 * self.variance).max(floor)
    }
}
