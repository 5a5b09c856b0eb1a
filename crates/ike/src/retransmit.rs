//! Request retransmission with bounded backoff
//!
//! IKEv2 is a reliable protocol over an unreliable transport: the initiator
//! of an exchange retransmits the request until it sees the matching response
//! or the backoff schedule is exhausted (RFC 7296 §2.1). At most one exchange
//! is in flight at a time per session (§2.3), so the engine keeps a single
//! in-flight slot.
//!
//! The retransmitter holds encoded datagrams, not messages: a fragmented
//! request is retransmitted as the same set of fragments.

use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::params::RetransmissionSchedule;

/// What to do when a retransmission deadline fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetransmitAction {
    /// Send these datagrams again
    Resend(Vec<Vec<u8>>),
    /// The schedule is exhausted; the exchange has failed
    Exhausted,
}

#[derive(Debug)]
struct InFlight {
    message_id: u32,
    datagrams: Vec<Vec<u8>>,
    /// Index into the schedule of the wait currently running
    attempt: usize,
    deadline: Instant,
}

/// Single-slot retransmission engine
///
/// `register` arms the first wait of the schedule. Each `handle_timeout` at or
/// past the deadline either yields the datagrams for resending and arms the
/// next wait, or reports exhaustion once the final wait has elapsed.
#[derive(Debug)]
pub struct Retransmitter {
    schedule: RetransmissionSchedule,
    inflight: Option<InFlight>,
}

impl Retransmitter {
    /// Create an idle retransmitter with the given schedule
    pub fn new(schedule: RetransmissionSchedule) -> Self {
        Retransmitter {
            schedule,
            inflight: None,
        }
    }

    /// Whether no exchange is currently in flight
    pub fn is_idle(&self) -> bool {
        self.inflight.is_none()
    }

    /// Message ID of the in-flight exchange, if any
    pub fn inflight_message_id(&self) -> Option<u32> {
        self.inflight.as_ref().map(|f| f.message_id)
    }

    /// Next retransmission deadline, if an exchange is in flight
    pub fn deadline(&self) -> Option<Instant> {
        self.inflight.as_ref().map(|f| f.deadline)
    }

    /// Track a freshly sent request
    ///
    /// Fails if another exchange is still in flight.
    pub fn register(&mut self, message_id: u32, datagrams: Vec<Vec<u8>>, now: Instant) -> Result<()> {
        if let Some(inflight) = &self.inflight {
            return Err(Error::InvalidState(format!(
                "Exchange {} still in flight",
                inflight.message_id
            )));
        }
        if datagrams.is_empty() {
            return Err(Error::Internal(
                "Cannot register an empty request".to_string(),
            ));
        }
        // Schedule validation guarantees at least one entry
        let first_wait = match self.schedule.wait_for_attempt(0) {
            Some(wait) => wait,
            None => {
                return Err(Error::Internal(
                    "Empty retransmission schedule".to_string(),
                ))
            }
        };
        self.inflight = Some(InFlight {
            message_id,
            datagrams,
            attempt: 0,
            deadline: now + first_wait,
        });
        Ok(())
    }

    /// Mark the in-flight exchange as answered
    ///
    /// Returns true when `message_id` matched the in-flight exchange and the
    /// slot was freed; false for stale or unknown IDs.
    pub fn acknowledge(&mut self, message_id: u32) -> bool {
        match &self.inflight {
            Some(inflight) if inflight.message_id == message_id => {
                self.inflight = None;
                true
            }
            _ => false,
        }
    }

    /// Drop the in-flight exchange without an answer
    pub fn abandon(&mut self) {
        self.inflight = None;
    }

    /// React to the clock reaching (or passing) the deadline
    ///
    /// Returns None when idle or the deadline has not arrived yet. On
    /// `Exhausted` the slot is freed.
    pub fn handle_timeout(&mut self, now: Instant) -> Option<RetransmitAction> {
        let inflight = self.inflight.as_mut()?;
        if now < inflight.deadline {
            return None;
        }
        let next_attempt = inflight.attempt + 1;
        match self.schedule.wait_for_attempt(next_attempt) {
            Some(wait) => {
                inflight.attempt = next_attempt;
                inflight.deadline = now + wait;
                Some(RetransmitAction::Resend(inflight.datagrams.clone()))
            }
            None => {
                self.inflight = None;
                Some(RetransmitAction::Exhausted)
            }
        }
    }
}
