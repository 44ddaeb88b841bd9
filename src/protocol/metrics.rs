use std::sync::atomic::{AtomicU64, Ordering};

/// Per-terminal protocol counters.
#[derive(Debug, Default)]
pub struct TerminalMetrics {
    packets_sent: AtomicU64,
    packets_resent: AtomicU64,
    packets_received: AtomicU64,
    datagrams_dropped: AtomicU64,
    acks_sent: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    transmissions_completed: AtomicU64,
    transmissions_failed: AtomicU64,
}

impl TerminalMetrics {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_gene_send(&self, resend: bool) {
        if resend {
            self.packets_resent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.packets_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_ack_frame(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_connection_open(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_connection_close(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_transmission(&self, completed: bool) {
        if completed {
            self.transmissions_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transmissions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Capture the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_resent: self.packets_resent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            transmissions_completed: self.transmissions_completed.load(Ordering::Relaxed),
            transmissions_failed: self.transmissions_failed.load(Ordering::Relaxed),
        }
    }
}

/// Lightweight snapshot of terminal counters.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub packets_sent: u64,
    pub packets_resent: u64,
    pub packets_received: u64,
    pub datagrams_dropped: u64,
    pub acks_sent: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub transmissions_completed: u64,
    pub transmissions_failed: u64,
}

impl MetricsSnapshot {
    /// Share of gene transmissions that were first sends, `None` before any send.
    #[must_use]
    pub fn delivery_ratio(&self) -> Option<f64> {
        let total = self.packets_sent + self.packets_resent;
        if total == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some(self.packets_sent as f64 / total as f64)
    }

    /// Connections opened and not yet closed.
    #[must_use]
    pub fn active_connections(&self) -> u64 {
        self.connections_opened
            .saturating_sub(self.connections_closed)
    }
}
