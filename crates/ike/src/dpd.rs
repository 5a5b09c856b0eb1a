//! Dead peer detection (RFC 7296 §2.4)
//!
//! An established session with no inbound traffic for the configured delay
//! sends an empty INFORMATIONAL request. The request goes through the normal
//! retransmission engine, so an unresponsive peer surfaces as retransmission
//! exhaustion; this module only decides when a check is due.

use std::time::Duration;

use tokio::time::Instant;

/// Dead-peer-detection settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpdConfig {
    /// Whether liveness checks run at all
    pub enabled: bool,

    /// Idle time before a check is sent
    pub delay: Duration,
}

impl DpdConfig {
    /// Enabled with the given delay
    pub fn enabled(delay: Duration) -> Self {
        DpdConfig {
            enabled: true,
            delay,
        }
    }

    /// Disabled
    pub fn disabled() -> Self {
        DpdConfig {
            enabled: false,
            delay: Duration::ZERO,
        }
    }
}

/// Tracks peer activity and decides when a liveness check is due
#[derive(Debug)]
pub struct DpdState {
    config: DpdConfig,
    last_inbound: Instant,
}

impl DpdState {
    /// Start tracking from `now`
    pub fn new(config: DpdConfig, now: Instant) -> Self {
        DpdState {
            config,
            last_inbound: now,
        }
    }

    /// Record any authenticated inbound message from the peer
    pub fn mark_received(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    /// Whether a liveness check is due at `now`
    pub fn should_send(&self, now: Instant) -> bool {
        self.config.enabled && now >= self.last_inbound + self.config.delay
    }

    /// When the next check becomes due, None when disabled
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.config.enabled {
            Some(self.last_inbound + self.config.delay)
        } else {
            None
        }
    }
}
