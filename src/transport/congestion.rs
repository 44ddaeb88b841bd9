//! Congestion control strategies.
//!
//! Windows are counted in genes. A connection starts out on the terminal's shared
//! [`NoCongestion`] and switches to its own [`CubicCongestion`] once it carries enough
//! concurrent transmissions to matter.

use core::fmt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::clock::{MICS_PER_SECOND, Mics};
use super::rtt::{INITIAL_RTT_MICS, MAX_RTT_MICS};

/// Identifies one gene of one send transmission on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeneKey {
    /// Transmission id
    pub transmission_id: u32,
    /// Gene position
    pub position: i32,
}

/// Strategy deciding how many genes a connection may keep in flight.
pub trait CongestionControl: Send + Sync + fmt::Debug {
    /// A gene left the socket; `hint` is its packet size.
    fn add_in_flight(&self, key: GeneKey, hint: usize, now: Mics);

    /// A gene was acknowledged (`acked`) or disposed without acknowledgment.
    fn remove_in_flight(&self, key: GeneKey, acked: bool, now: Mics);

    /// A gene was declared lost.
    fn loss_detected(&self, key: GeneKey, now: Mics);

    /// A fresh RTT sample.
    fn add_rtt(&self, sample: Mics);

    /// Whether the connection must stop sending new genes.
    fn is_congested(&self) -> bool;

    /// Periodic tick. Returns `false` once the strategy can be dropped from the tick list.
    fn process(&self, now: Mics, elapsed: Mics) -> bool;

    /// Genes currently in flight.
    fn in_flight(&self) -> usize {
        0
    }
}

/// Strategy that never throttles.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCongestion;

impl CongestionControl for NoCongestion {
    fn add_in_flight(&self, _key: GeneKey, _hint: usize, _now: Mics) {}

    fn remove_in_flight(&self, _key: GeneKey, _acked: bool, _now: Mics) {}

    fn loss_detected(&self, _key: GeneKey, _now: Mics) {}

    fn add_rtt(&self, _sample: Mics) {}

    fn is_congested(&self) -> bool {
        false
    }

    fn process(&self, _now: Mics, _elapsed: Mics) -> bool {
        true
    }
}

/// Configurable parameters for congestion control.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CongestionConfig {
    /// Initial congestion window in genes.
    pub initial_window: f64,
    /// Minimum congestion window in genes.
    pub min_window: f64,
    /// Maximum congestion window in genes.
    pub max_window: f64,
    /// Concurrent send transmissions at which a connection switches to Cubic.
    pub transmission_threshold: usize,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            initial_window: 32.0,
            min_window: 4.0,
            max_window: 16_384.0,
            transmission_threshold: 5,
        }
    }
}

/// Cubic scaling constant
const CUBIC_C: f64 = 0.4;

/// Cubic multiplicative decrease factor
const CUBIC_BETA: f64 = 0.7;

#[derive(Debug, Clone, Copy)]
struct InFlight {
    sent_mics: Mics,
}

#[derive(Debug)]
struct CubicState {
    window: f64,
    ssthresh: f64,
    w_max: f64,
    k: f64,
    origin_point: f64,
    epoch_start: Option<Mics>,
    recovery_start: Mics,
    smoothed_rtt: Mics,
    in_flight: HashMap<GeneKey, InFlight>,
    congestion_events: u64,
}

/// Cubic congestion control (RFC 8312) over gene counts.
#[derive(Debug)]
pub struct CubicCongestion {
    config: CongestionConfig,
    state: Mutex<CubicState>,
    disposed: AtomicBool,
}

impl CubicCongestion {
    /// Create a controller with the configured initial window.
    #[must_use]
    pub fn new(config: CongestionConfig) -> Self {
        Self {
            state: Mutex::new(CubicState {
                window: config.initial_window,
                ssthresh: f64::INFINITY,
                w_max: 0.0,
                k: 0.0,
                origin_point: 0.0,
                epoch_start: None,
                recovery_start: Mics::MIN,
                smoothed_rtt: INITIAL_RTT_MICS,
                in_flight: HashMap::new(),
                congestion_events: 0,
            }),
            config,
            disposed: AtomicBool::new(false),
        }
    }

    /// Current window in genes.
    #[must_use]
    pub fn window(&self) -> f64 {
        self.state.lock().window
    }

    /// Loss events that reduced the window.
    #[must_use]
    pub fn congestion_events(&self) -> u64 {
        self.state.lock().congestion_events
    }

    /// Stop ticking; the next `process` call reports `false`.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Relaxed);
        self.state.lock().in_flight.clear();
    }

    fn on_congestion_event(&self, state: &mut CubicState, sent_mics: Mics, now: Mics) {
        // One reduction per round trip: genes sent before recovery started are already counted.
        if sent_mics <= state.recovery_start {
            return;
        }
        state.congestion_events += 1;
        state.w_max = state.window;
        state.window = (state.window * CUBIC_BETA).max(self.config.min_window);
        state.ssthresh = state.window;
        state.origin_point = state.window;
        state.epoch_start = Some(now);
        state.recovery_start = now;
        state.k = ((state.w_max - state.window) / CUBIC_C).cbrt();
        debug!(
            window = state.window,
            w_max = state.w_max,
            "congestion window reduced"
        );
    }

    fn on_ack(&self, state: &mut CubicState, now: Mics) {
        if state.window < state.ssthresh {
            state.window += 1.0;
        } else {
            let epoch_start = *state.epoch_start.get_or_insert(now);
            #[allow(clippy::cast_precision_loss)]
            let t = (now - epoch_start) as f64 / MICS_PER_SECOND as f64;
            let w_cubic = CUBIC_C * (t - state.k).powi(3) + state.origin_point;
            let w_est = state.origin_point + 3.0 * CUBIC_BETA / (2.0 - CUBIC_BETA);
            let target = w_cubic.max(w_est);
            if target > state.window {
                state.window += ((target - state.window) / state.window).max(0.01);
            }
        }
        state.window = state.window.min(self.config.max_window);
    }
}

impl CongestionControl for CubicCongestion {
    fn add_in_flight(&self, key: GeneKey, _hint: usize, now: Mics) {
        self.state
            .lock()
            .in_flight
            .insert(key, InFlight { sent_mics: now });
    }

    fn remove_in_flight(&self, key: GeneKey, acked: bool, now: Mics) {
        let mut state = self.state.lock();
        if state.in_flight.remove(&key).is_some() && acked {
            self.on_ack(&mut state, now);
        }
    }

    fn loss_detected(&self, key: GeneKey, now: Mics) {
        let mut state = self.state.lock();
        if let Some(entry) = state.in_flight.remove(&key) {
            trace!(
                transmission_id = key.transmission_id,
                position = key.position,
                "gene loss reported to congestion control"
            );
            self.on_congestion_event(&mut state, entry.sent_mics, now);
        }
    }

    fn add_rtt(&self, sample: Mics) {
        let mut state = self.state.lock();
        state.smoothed_rtt = (7 * state.smoothed_rtt + sample) / 8;
    }

    fn is_congested(&self) -> bool {
        let state = self.state.lock();
        #[allow(clippy::cast_precision_loss)]
        let in_flight = state.in_flight.len() as f64;
        in_flight >= state.window
    }

    fn process(&self, now: Mics, _elapsed: Mics) -> bool {
        if self.disposed.load(Ordering::Relaxed) {
            return false;
        }

        let mut state = self.state.lock();
        let timeout = (state.smoothed_rtt * 4).max(MAX_RTT_MICS);
        let mut oldest_expired = None;
        state.in_flight.retain(|_, entry| {
            let expired = now - entry.sent_mics > timeout;
            if expired {
                oldest_expired = Some(oldest_expired.map_or(entry.sent_mics, |oldest: Mics| {
                    oldest.min(entry.sent_mics)
                }));
            }
            !expired
        });
        if let Some(sent_mics) = oldest_expired {
            self.on_congestion_event(&mut state, sent_mics, now);
        }
        true
    }

    fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}
