//! Session event reporting
//!
//! The engine reports lifecycle changes through a single ordered event
//! channel. Terminal events (Closed, ClosedWithError) are delivered at most
//! once per SA; the dispatcher enforces that so state-machine code can call
//! the close paths without tracking what was already reported.

use std::collections::HashSet;

use tokio::sync::mpsc;

use crate::error::Error;
use crate::transport::IpsecTransform;

/// An error carried by a session event
#[derive(Debug)]
pub struct SessionError {
    /// What went wrong
    pub error: Error,

    /// Data of the error notify that caused this, when the peer sent one.
    /// None for locally detected failures.
    pub notify_data: Option<Vec<u8>>,
}

impl SessionError {
    /// A locally detected failure
    pub fn local(error: Error) -> Self {
        SessionError {
            error,
            notify_data: None,
        }
    }

    /// A failure reported by the peer through an error notify
    pub fn from_notify(error: Error, data: Vec<u8>) -> Self {
        SessionError {
            error,
            notify_data: Some(data),
        }
    }
}

/// Lifecycle events for the IKE SA
#[derive(Debug)]
pub enum IkeEvent {
    /// IKE_AUTH completed, the IKE SA is established
    Opened,

    /// The IKE SA was torn down normally
    Closed,

    /// The IKE SA was torn down because of an error
    ClosedWithError(SessionError),

    /// A non-fatal error occurred; the IKE SA stays up
    Error(SessionError),
}

/// Lifecycle events for a Child SA
#[derive(Debug)]
pub enum ChildEvent {
    /// The Child SA is established
    Opened {
        /// Configuration attributes the server replied with, in reply order
        config_replies: Vec<crate::ikev2::payload::ConfigAttribute>,
    },

    /// The Child SA was torn down normally
    Closed,

    /// The Child SA was torn down because of an error
    ClosedWithError(SessionError),

    /// A transform pair is ready for installation
    TransformCreated {
        /// Inbound transform
        inbound: IpsecTransform,
        /// Outbound transform
        outbound: IpsecTransform,
    },

    /// A transform pair was retired and must be removed
    TransformDeleted {
        /// Inbound transform
        inbound: IpsecTransform,
        /// Outbound transform
        outbound: IpsecTransform,
    },
}

/// An event from the session, tagged with its target SA
#[derive(Debug)]
pub enum SessionEvent {
    /// Event for the IKE SA itself
    Ike(IkeEvent),

    /// Event for a Child SA
    Child {
        /// Identifier assigned when the child was requested
        child_id: u32,
        /// What happened
        event: ChildEvent,
    },
}

/// Ordered event dispatcher with terminal-once delivery
#[derive(Debug)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<SessionEvent>,
    ike_terminal_sent: bool,
    child_terminal_sent: HashSet<u32>,
}

impl EventDispatcher {
    /// Create a dispatcher and the receiver observing its events
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventDispatcher {
                tx,
                ike_terminal_sent: false,
                child_terminal_sent: HashSet::new(),
            },
            rx,
        )
    }

    /// Dispatch an IKE SA event
    ///
    /// Terminal events after the first are dropped. Events after a dropped
    /// receiver are dropped silently; the session is shutting down anyway.
    pub fn ike(&mut self, event: IkeEvent) {
        let terminal = matches!(
            event,
            IkeEvent::Closed | IkeEvent::ClosedWithError(_)
        );
        if terminal {
            if self.ike_terminal_sent {
                return;
            }
            self.ike_terminal_sent = true;
        }
        let _ = self.tx.send(SessionEvent::Ike(event));
    }

    /// Dispatch a Child SA event
    pub fn child(&mut self, child_id: u32, event: ChildEvent) {
        let terminal = matches!(
            event,
            ChildEvent::Closed | ChildEvent::ClosedWithError(_)
        );
        if terminal {
            if !self.child_terminal_sent.insert(child_id) {
                return;
            }
        } else if self.child_terminal_sent.contains(&child_id) {
            // No further events for a closed child
            return;
        }
        let _ = self.tx.send(SessionEvent::Child { child_id, event });
    }
}
