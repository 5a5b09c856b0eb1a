//! Tokio driver for the session engine
//!
//! [`IkeSession`] runs an [`IkeSessionCore`] on its own task, multiplexing
//! control commands, inbound datagrams and the engine's next deadline with
//! `tokio::select!`. Outbound datagrams are flushed to the [`Transport`]
//! after every turn of the loop; the task exits when the engine reaches
//! `Closed`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use crate::crypto::CryptoProvider;
use crate::error::{Error, Result};
use crate::events::SessionEvent;
use crate::params::{ChildSessionParams, IkeSessionParams};
use crate::session::{EapAuthenticator, IkeSessionCore, IkeState};
use crate::transport::{TransformInstaller, Transport};

/// Fallback wait when the engine has no deadline armed
const IDLE_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug)]
enum Command {
    OpenChild(ChildSessionParams),
    RekeyChild(u32),
    CloseChild(u32),
    RekeyIke,
    Close,
    Kill,
}

/// Handle to a session running on its own task
#[derive(Debug, Clone)]
pub struct IkeSession {
    commands: mpsc::UnboundedSender<Command>,
}

impl IkeSession {
    /// Spawn the session task and start the handshake
    ///
    /// `inbound` carries datagrams received for this session; `transport`
    /// takes everything the engine wants sent. Events arrive on the returned
    /// receiver in the order the engine produced them.
    pub fn spawn(
        params: IkeSessionParams,
        first_child: ChildSessionParams,
        provider: Arc<dyn CryptoProvider>,
        installer: Arc<dyn TransformInstaller>,
        eap: Option<Box<dyn EapAuthenticator>>,
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (core, events) = IkeSessionCore::new(params, first_child, provider, installer, eap);
        let (commands, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_session(core, command_rx, inbound, transport));

        (IkeSession { commands }, events)
    }

    /// Request an additional Child SA
    pub fn open_child(&self, params: ChildSessionParams) -> Result<()> {
        self.send(Command::OpenChild(params))
    }

    /// Request a rekey of a Child SA
    pub fn rekey_child(&self, child_id: u32) -> Result<()> {
        self.send(Command::RekeyChild(child_id))
    }

    /// Request deletion of a Child SA
    pub fn close_child(&self, child_id: u32) -> Result<()> {
        self.send(Command::CloseChild(child_id))
    }

    /// Request a rekey of the IKE SA
    pub fn rekey_ike(&self) -> Result<()> {
        self.send(Command::RekeyIke)
    }

    /// Close the session gracefully
    pub fn close(&self) -> Result<()> {
        self.send(Command::Close)
    }

    /// Tear down immediately without notifying the peer
    pub fn kill(&self) -> Result<()> {
        self.send(Command::Kill)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::InvalidState("Session task has ended".to_string()))
    }
}

async fn run_session(
    mut core: IkeSessionCore,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    transport: Arc<dyn Transport>,
) {
    if core.open(Instant::now()).is_err() {
        return;
    }
    flush(&mut core, transport.as_ref());

    while core.state() != IkeState::Closed {
        let deadline = core
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_WAIT);

        tokio::select! {
            command = commands.recv() => {
                let now = Instant::now();
                match command {
                    Some(Command::OpenChild(params)) => {
                        if let Err(e) = core.request_open_child(params, now) {
                            warn!(error = %e, "Open child rejected");
                        }
                    }
                    Some(Command::RekeyChild(child_id)) => {
                        if let Err(e) = core.request_rekey_child(child_id, now) {
                            warn!(error = %e, child_id, "Rekey child rejected");
                        }
                    }
                    Some(Command::CloseChild(child_id)) => {
                        if let Err(e) = core.request_close_child(child_id, now) {
                            warn!(error = %e, child_id, "Close child rejected");
                        }
                    }
                    Some(Command::RekeyIke) => {
                        if let Err(e) = core.request_rekey_ike(now) {
                            warn!(error = %e, "IKE rekey rejected");
                        }
                    }
                    Some(Command::Close) => core.close(now),
                    // A dropped handle tears the session down
                    Some(Command::Kill) | None => core.kill(),
                }
            }
            datagram = inbound.recv() => {
                match datagram {
                    Some(data) => {
                        if let Err(e) = core.handle_datagram(&data, Instant::now()) {
                            warn!(error = %e, "Dropped malformed datagram");
                        }
                    }
                    None => core.kill(),
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                core.handle_timeout(Instant::now());
            }
        }

        flush(&mut core, transport.as_ref());
    }
}

fn flush(core: &mut IkeSessionCore, transport: &dyn Transport) {
    for datagram in core.take_datagrams() {
        if let Err(e) = transport.send(&datagram) {
            warn!(error = %e, "Failed to send datagram");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PassthroughCrypto;
    use crate::events::{ChildEvent, IkeEvent};
    use crate::ikev2::proposal::{
        ChildSaProposal, DhGroup, EncryptionTransform, IkeSaProposal, PrfId,
    };
    use crate::ikev2::{ExchangeType, IkeMessage};
    use crate::params::IkeAuthConfig;
    use crate::transport::{ChannelTransport, NullInstaller};

    fn test_params() -> (IkeSessionParams, ChildSessionParams) {
        let params = IkeSessionParams::builder("203.0.113.1:500".parse().unwrap())
            .add_proposal(
                IkeSaProposal::builder()
                    .add_encryption(EncryptionTransform::aes_gcm(256))
                    .add_prf(PrfId::HmacSha256)
                    .add_dh_group(DhGroup::Group14)
                    .build()
                    .unwrap(),
            )
            .with_local_id(crate::ikev2::payload::IdPayload::from_fqdn("client.test"))
            .with_remote_id(crate::ikev2::payload::IdPayload::from_fqdn("server.test"))
            .with_auth(IkeAuthConfig::PresharedKey(b"swordfish".to_vec()))
            .build()
            .unwrap();
        let child = ChildSessionParams::tunnel()
            .add_proposal(
                ChildSaProposal::builder()
                    .add_encryption(EncryptionTransform::aes_gcm(128))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        (params, child)
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_sends_init() {
        let (params, child) = test_params();
        let (transport, mut wire) = ChannelTransport::pair();
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let (_session, _events) = IkeSession::spawn(
            params,
            child,
            Arc::new(PassthroughCrypto::new()),
            Arc::new(NullInstaller::new()),
            None,
            Arc::new(transport),
            inbound_rx,
        );

        let datagram = wire.recv().await.expect("IKE_SA_INIT sent");
        let msg = IkeMessage::from_bytes(&datagram).unwrap();
        assert_eq!(msg.header.exchange_type, ExchangeType::IkeSaInit);
        assert_eq!(msg.header.message_id, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_closes_without_network() {
        let (params, child) = test_params();
        let (transport, mut wire) = ChannelTransport::pair();
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let (session, mut events) = IkeSession::spawn(
            params,
            child,
            Arc::new(PassthroughCrypto::new()),
            Arc::new(NullInstaller::new()),
            None,
            Arc::new(transport),
            inbound_rx,
        );

        // The initial request goes out, then the session is killed
        let _init = wire.recv().await.expect("IKE_SA_INIT sent");
        session.kill().unwrap();

        loop {
            match events.recv().await.expect("closure events") {
                SessionEvent::Ike(IkeEvent::Closed) => break,
                SessionEvent::Child {
                    event: ChildEvent::Closed,
                    ..
                } => continue,
                other => panic!("Unexpected event: {:?}", other),
            }
        }

        // Commands to a finished session fail
        tokio::task::yield_now().await;
        assert!(session.close().is_err() || session.commands.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_handshake_exhausts() {
        let (params, child) = test_params();
        let (transport, mut wire) = ChannelTransport::pair();
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let (_session, mut events) = IkeSession::spawn(
            params,
            child,
            Arc::new(PassthroughCrypto::new()),
            Arc::new(NullInstaller::new()),
            None,
            Arc::new(transport),
            inbound_rx,
        );

        // Initial send plus four retransmissions of the identical datagram
        let first = wire.recv().await.expect("initial send");
        for _ in 0..4 {
            let resend = wire.recv().await.expect("retransmission");
            assert_eq!(resend, first);
        }

        loop {
            match events.recv().await.expect("closure events") {
                SessionEvent::Ike(IkeEvent::ClosedWithError(err)) => {
                    assert!(matches!(err.error, Error::RetransmissionExhausted));
                    break;
                }
                SessionEvent::Child {
                    event: ChildEvent::Closed,
                    ..
                } => continue,
                other => panic!("Unexpected event: {:?}", other),
            }
        }
    }
}
