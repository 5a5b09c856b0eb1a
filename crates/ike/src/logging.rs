//! Structured logging helpers
//!
//! Thin wrappers around `tracing` so the state machines log uniformly. SPIs
//! are logged as hex, message IDs and state names as structured fields.

use tracing::{debug, info, warn};

/// Log an IKE session state transition
pub fn log_state_transition(spi_i: u64, spi_r: u64, from: &str, to: &str) {
    info!(
        initiator_spi = %hex::encode(spi_i.to_be_bytes()),
        responder_spi = %hex::encode(spi_r.to_be_bytes()),
        from = from,
        to = to,
        "IKE session state transition"
    );
}

/// Log an outbound exchange request
pub fn log_exchange_sent(exchange: &str, message_id: u32, bytes: usize, fragments: usize) {
    debug!(
        exchange = exchange,
        message_id = message_id,
        bytes = bytes,
        fragments = fragments,
        "Sent exchange request"
    );
}

/// Log an inbound message
pub fn log_message_received(exchange: &str, message_id: u32, response: bool) {
    debug!(
        exchange = exchange,
        message_id = message_id,
        response = response,
        "Received message"
    );
}

/// Log a retransmission
pub fn log_retransmission(message_id: u32) {
    debug!(message_id = message_id, "Retransmitting request");
}

/// Log retransmission schedule exhaustion
pub fn log_exchange_timeout(message_id: u32) {
    warn!(message_id = message_id, "Exchange timed out, peer unresponsive");
}

/// Log a successful peer authentication
pub fn log_auth_success(peer_id: &str) {
    info!(peer_id = peer_id, "Peer authenticated");
}

/// Log an authentication failure
pub fn log_auth_failure(reason: &str) {
    warn!(reason = reason, "Authentication failed");
}

/// Log a Child SA establishment
pub fn log_child_created(child_id: u32, local_spi: u32, peer_spi: &[u8]) {
    info!(
        child_id = child_id,
        local_spi = %hex::encode(local_spi.to_be_bytes()),
        peer_spi = %hex::encode(peer_spi),
        "Child SA established"
    );
}

/// Log a Child SA deletion
pub fn log_child_deleted(child_id: u32, local_spi: u32) {
    info!(
        child_id = child_id,
        local_spi = %hex::encode(local_spi.to_be_bytes()),
        "Child SA deleted"
    );
}

/// Log the start of a rekey
pub fn log_rekey_started(kind: &str) {
    info!(kind = kind, "Rekey started");
}

/// Log a completed rekey
pub fn log_rekey_completed(kind: &str) {
    info!(kind = kind, "Rekey completed");
}

/// Log an outbound fragmented request
pub fn log_fragmentation(message_id: u32, fragments: usize) {
    debug!(
        message_id = message_id,
        fragments = fragments,
        "Fragmented outbound message"
    );
}

/// Log a DPD liveness check
pub fn log_dpd_check(message_id: u32) {
    debug!(message_id = message_id, "Sending liveness check");
}

/// Log an error notify received from the peer
pub fn log_error_notify(notify_type: u16, exchange: &str) {
    warn!(
        notify_type = notify_type,
        exchange = exchange,
        "Peer reported error notify"
    );
}
