//! Session metrics
//!
//! Cheap atomic counters shared between the session engine and whoever wants
//! to observe it. Cloning the handle clones the `Arc`s, so all clones see the
//! same counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters tracked by an IKE session
#[derive(Debug, Clone, Default)]
pub struct IkeMetrics {
    handshakes_started: Arc<AtomicU64>,
    handshakes_completed: Arc<AtomicU64>,
    handshakes_failed: Arc<AtomicU64>,
    ike_rekeys: Arc<AtomicU64>,
    child_rekeys: Arc<AtomicU64>,
    children_created: Arc<AtomicU64>,
    children_deleted: Arc<AtomicU64>,
    retransmissions: Arc<AtomicU64>,
    exchanges_timed_out: Arc<AtomicU64>,
    dpd_checks: Arc<AtomicU64>,
    fragments_sent: Arc<AtomicU64>,
    fragments_received: Arc<AtomicU64>,
    proposal_failures: Arc<AtomicU64>,
    auth_failures: Arc<AtomicU64>,
}

impl IkeMetrics {
    /// Create a fresh set of counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_handshake_started(&self) {
        self.handshakes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handshake_completed(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ike_rekey(&self) {
        self.ike_rekeys.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_child_rekey(&self) {
        self.child_rekeys.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_child_created(&self) {
        self.children_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_child_deleted(&self) {
        self.children_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exchange_timed_out(&self) {
        self.exchanges_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dpd_check(&self) {
        self.dpd_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fragments_sent(&self, count: u64) {
        self.fragments_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_fragment_received(&self) {
        self.fragments_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_proposal_failure(&self) {
        self.proposal_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            handshakes_started: self.handshakes_started.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            ike_rekeys: self.ike_rekeys.load(Ordering::Relaxed),
            child_rekeys: self.child_rekeys.load(Ordering::Relaxed),
            children_created: self.children_created.load(Ordering::Relaxed),
            children_deleted: self.children_deleted.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            exchanges_timed_out: self.exchanges_timed_out.load(Ordering::Relaxed),
            dpd_checks: self.dpd_checks.load(Ordering::Relaxed),
            fragments_sent: self.fragments_sent.load(Ordering::Relaxed),
            fragments_received: self.fragments_received.load(Ordering::Relaxed),
            proposal_failures: self.proposal_failures.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Handshakes started
    pub handshakes_started: u64,
    /// Handshakes that reached Established
    pub handshakes_completed: u64,
    /// Handshakes that failed before Established
    pub handshakes_failed: u64,
    /// Completed IKE SA rekeys
    pub ike_rekeys: u64,
    /// Completed Child SA rekeys
    pub child_rekeys: u64,
    /// Child SAs established
    pub children_created: u64,
    /// Child SAs deleted
    pub children_deleted: u64,
    /// Request datagram retransmissions
    pub retransmissions: u64,
    /// Exchanges abandoned after schedule exhaustion
    pub exchanges_timed_out: u64,
    /// DPD requests sent
    pub dpd_checks: u64,
    /// Message fragments sent
    pub fragments_sent: u64,
    /// Message fragments received
    pub fragments_received: u64,
    /// Negotiations rejected with NO_PROPOSAL_CHOSEN
    pub proposal_failures: u64,
    /// Authentication failures (local or peer-reported)
    pub auth_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = IkeMetrics::new();
        metrics.record_handshake_started();
        metrics.record_handshake_completed();
        metrics.record_retransmission();
        metrics.record_retransmission();
        metrics.record_fragments_sent(3);

        let snap = metrics.snapshot();
        assert_eq!(snap.handshakes_started, 1);
        assert_eq!(snap.handshakes_completed, 1);
        assert_eq!(snap.handshakes_failed, 0);
        assert_eq!(snap.retransmissions, 2);
        assert_eq!(snap.fragments_sent, 3);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = IkeMetrics::new();
        let clone = metrics.clone();
        clone.record_child_created();
        assert_eq!(metrics.snapshot().children_created, 1);
    }
}
