//! Fair round-robin send list across connections.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use super::clock::Mics;

/// Result of one send attempt on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    /// A gene left; the connection may have more.
    Sent,
    /// Nothing to send.
    Idle,
    /// Throttled by congestion control.
    Congested,
}

/// A connection as seen by the send list.
pub(crate) trait Schedulable: Send + Sync {
    /// Membership flag, only changed while the send list is locked.
    fn membership(&self) -> &AtomicBool;

    fn is_congested(&self) -> bool;

    fn send_one(self: &Arc<Self>, now: Mics) -> SendOutcome;
}

/// Connections with pending genes, plus a wait list of congested ones.
pub(crate) struct SendList<T> {
    active: VecDeque<Arc<T>>,
    congested: Vec<Arc<T>>,
}

impl<T: Schedulable> SendList<T> {
    pub(crate) fn new() -> Self {
        Self {
            active: VecDeque::new(),
            congested: Vec::new(),
        }
    }

    /// Add `item` unless it is already listed.
    pub(crate) fn push(&mut self, item: &Arc<T>) {
        if !item.membership().swap(true, Ordering::AcqRel) {
            self.active.push_back(item.clone());
        }
    }

    pub(crate) fn active_len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn congested_len(&self) -> usize {
        self.congested.len()
    }

    /// Promote connections whose congestion cleared, then give every active connection one
    /// send attempt. Returns the number of genes sent.
    pub(crate) fn process(&mut self, now: Mics) -> usize {
        let mut index = 0;
        while index < self.congested.len() {
            if self.congested[index].is_congested() {
                index += 1;
            } else {
                let item = self.congested.swap_remove(index);
                self.active.push_back(item);
            }
        }

        let mut sent = 0;
        for _ in 0..self.active.len() {
            let Some(item) = self.active.pop_front() else {
                break;
            };
            match item.send_one(now) {
                SendOutcome::Sent => {
                    sent += 1;
                    self.active.push_back(item);
                }
                SendOutcome::Congested => self.congested.push(item),
                SendOutcome::Idle => item.membership().store(false, Ordering::Release),
            }
        }
        if sent > 0 {
            trace!(
                sent,
                active = self.active.len(),
                congested = self.congested.len(),
                "send pass"
            );
        }
        sent
    }

    /// Drop every entry, clearing membership flags.
    pub(crate) fn clear(&mut self) {
        for item in self.active.drain(..).chain(self.congested.drain(..)) {
            item.membership().store(false, Ordering::Release);
        }
    }
}
