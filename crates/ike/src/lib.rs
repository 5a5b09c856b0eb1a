//! IKEv2 session negotiation engine
//!
//! An initiator-side implementation of the IKEv2 protocol (RFC 7296) for
//! establishing and maintaining IPSec security associations: the IKE_SA_INIT
//! and IKE_AUTH handshake with PSK, digital-signature or EAP authentication,
//! Child SA negotiation with traffic-selector narrowing, rekeying of both SA
//! types, deletion, message fragmentation (RFC 7383), retransmission with
//! bounded backoff and dead peer detection.
//!
//! The crate is split into a sans-io core and a tokio driver:
//!
//! - [`IkeSessionCore`] holds the whole state machine. Datagrams and clock
//!   readings go in through method calls, outbound datagrams come back out of
//!   an outbox, and lifecycle changes arrive on an event channel. This is
//!   what the tests drive directly.
//! - [`IkeSession`] runs a core on a tokio task wired to a [`Transport`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use kestrel_ike::{
//!     ChildSessionParams, IkeAuthConfig, IkeSession, IkeSessionParams,
//! };
//! use kestrel_ike::crypto::StandardCryptoProvider;
//! use kestrel_ike::ikev2::payload::IdPayload;
//! use kestrel_ike::ikev2::proposal::{
//!     ChildSaProposal, DhGroup, EncryptionTransform, IkeSaProposal, PrfId,
//! };
//! use kestrel_ike::transport::{NullInstaller, UdpTransport};
//!
//! # async fn run() -> kestrel_ike::Result<()> {
//! let params = IkeSessionParams::builder("198.51.100.7:500".parse().unwrap())
//!     .add_proposal(
//!         IkeSaProposal::builder()
//!             .add_encryption(EncryptionTransform::aes_gcm(256))
//!             .add_prf(PrfId::HmacSha256)
//!             .add_dh_group(DhGroup::Group14)
//!             .build()?,
//!     )
//!     .with_local_id(IdPayload::from_fqdn("client.example.org"))
//!     .with_remote_id(IdPayload::from_fqdn("gw.example.org"))
//!     .with_auth(IkeAuthConfig::PresharedKey(b"secret".to_vec()))
//!     .build()?;
//! let child = ChildSessionParams::tunnel()
//!     .add_proposal(
//!         ChildSaProposal::builder()
//!             .add_encryption(EncryptionTransform::aes_gcm(128))
//!             .build()?,
//!     )
//!     .build()?;
//!
//! let socket = Arc::new(tokio::net::UdpSocket::bind("0.0.0.0:0").await?);
//! socket.connect("198.51.100.7:500").await?;
//! let transport = Arc::new(UdpTransport::new(socket));
//! let (inbound_tx, inbound_rx) = tokio::sync::mpsc::unbounded_channel();
//! # let _ = inbound_tx;
//!
//! let (_session, mut events) = IkeSession::spawn(
//!     params,
//!     child,
//!     Arc::new(StandardCryptoProvider::new()),
//!     Arc::new(NullInstaller::new()),
//!     None,
//!     transport,
//!     inbound_rx,
//! );
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod child;
pub mod crypto;
pub mod dpd;
pub mod driver;
pub mod error;
pub mod events;
pub mod ikev2;
pub mod logging;
pub mod metrics;
pub mod params;
pub mod retransmit;
pub mod session;
pub mod transport;

pub use child::{ChildState, TransformPair};
pub use driver::IkeSession;
pub use error::{Error, Result};
pub use events::{ChildEvent, IkeEvent, SessionError, SessionEvent};
pub use metrics::{IkeMetrics, MetricsSnapshot};
pub use params::{
    ChildMode, ChildSessionParams, ConfigRequest, EapMethod, IkeAuthConfig, IkeOption,
    IkeSessionParams, RetransmissionSchedule, SaLifetimes,
};
pub use session::{EapAuthenticator, EapOutcome, IkeSessionCore, IkeState};
pub use transport::{
    IpsecTransform, TransformDirection, TransformInstaller, Transport,
};
