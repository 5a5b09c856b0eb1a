//! Error types for the IKEv2 engine
//!
//! This module defines a unified error type covering proposal negotiation,
//! message encoding/decoding, authentication, and session lifecycle failures.
//!
//! The taxonomy follows the protocol's own failure classes: negotiation
//! failures (`NoProposalChosen`), authentication failures, traffic-selector
//! failures (`TsUnacceptable`), transport failures (`RetransmissionExhausted`)
//! and decode failures. Which of these is fatal for a session, a child, or
//! only a single exchange is decided by the state machines, not here.

use std::fmt;

/// Result type for IKE engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// IKEv2 engine errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No mutually acceptable proposal found during negotiation
    NoProposalChosen,

    /// Peer authentication failed (MAC, signature, or EAP verification)
    AuthenticationFailed(String),

    /// No acceptable traffic-selector narrowing exists
    TsUnacceptable,

    /// Retransmission schedule exhausted without a matching response
    RetransmissionExhausted,

    /// Invalid IKE message format
    InvalidMessage(String),

    /// Invalid IKE payload
    InvalidPayload(String),

    /// Payload marked critical but not understood
    UnknownCriticalPayload(u8),

    /// Unsupported protocol version
    UnsupportedVersion(u8),

    /// Unsupported exchange type
    UnsupportedExchangeType(u8),

    /// Buffer too short for operation
    BufferTooShort {
        /// Required length
        required: usize,
        /// Available length
        available: usize,
    },

    /// Invalid length field
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Message exceeds the maximum IKE message size
    MessageTooLarge(u32),

    /// Fragment inconsistent with already-buffered fragments
    FragmentMismatch(String),

    /// Security Association not found
    SaNotFound(String),

    /// Cryptographic provider failure
    CryptoError(String),

    /// State machine error
    InvalidState(String),

    /// Invalid configuration or argument
    InvalidParameter(String),

    /// I/O error
    Io(String),

    /// Internal error (should not happen)
    Internal(String),
}

impl Error {
    /// True if this error corresponds to an IKEv2 error notify we may
    /// receive from (or send to) the peer.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::NoProposalChosen
                | Error::AuthenticationFailed(_)
                | Error::TsUnacceptable
                | Error::InvalidMessage(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoProposalChosen => {
                write!(f, "No acceptable proposal found in negotiation")
            }
            Error::AuthenticationFailed(msg) => {
                write!(f, "Authentication failed: {}", msg)
            }
            Error::TsUnacceptable => {
                write!(f, "No acceptable traffic selector narrowing")
            }
            Error::RetransmissionExhausted => {
                write!(f, "Retransmission schedule exhausted")
            }
            Error::InvalidMessage(msg) => write!(f, "Invalid IKE message: {}", msg),
            Error::InvalidPayload(msg) => write!(f, "Invalid IKE payload: {}", msg),
            Error::UnknownCriticalPayload(t) => {
                write!(f, "Unknown critical payload type: {}", t)
            }
            Error::UnsupportedVersion(v) => {
                write!(f, "Unsupported IKE version: 0x{:02x}", v)
            }
            Error::UnsupportedExchangeType(t) => {
                write!(f, "Unsupported exchange type: {}", t)
            }
            Error::BufferTooShort {
                required,
                available,
            } => {
                write!(
                    f,
                    "Buffer too short: need {} bytes, have {}",
                    required, available
                )
            }
            Error::InvalidLength { expected, actual } => {
                write!(f, "Invalid length: expected {}, got {}", expected, actual)
            }
            Error::MessageTooLarge(size) => {
                write!(f, "IKE message too large: {} bytes", size)
            }
            Error::FragmentMismatch(msg) => write!(f, "Fragment mismatch: {}", msg),
            Error::SaNotFound(id) => write!(f, "Security Association not found: {}", id),
            Error::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::Io(msg) => write!(f, "I/O error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
