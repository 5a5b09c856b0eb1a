//! IKEv2 wire protocol (RFC 7296, RFC 7383)
//!
//! Message framing, payload codecs, proposal negotiation and fragmentation.
//! The state machines in the crate root drive these building blocks.

pub mod constants;
pub mod fragment;
pub mod message;
pub mod payload;
pub mod proposal;

pub use constants::{ExchangeType, IkeFlags, NotifyType, PayloadType};
pub use message::{IkeHeader, IkeMessage};
