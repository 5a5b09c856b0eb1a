//! IKE session state machine
//!
//! [`IkeSessionCore`] is the initiator-side engine. It is sans-io: inbound
//! datagrams and clock readings come in through method calls, outbound
//! datagrams accumulate in an outbox the caller drains, and lifecycle changes
//! go out through the event channel. The tokio driver in [`crate::driver`]
//! wires it to a real socket and timer.
//!
//! One exchange is in flight at a time (RFC 7296 §2.3); requests issued while
//! busy are queued and started in order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use rand::RngCore;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::child::{ChildSession, ChildState, TransformPair};
use crate::crypto::{
    compute_psk_auth, construct_signed_octets, verify_psk_auth, ChildKeys, CryptoProvider,
    DhKeyPair, IkeKeys, PrfAlgorithm,
};
use crate::dpd::{DpdConfig, DpdState};
use crate::error::{Error, Result};
use crate::events::{ChildEvent, EventDispatcher, IkeEvent, SessionError, SessionEvent};
use crate::ikev2::constants::{ExchangeType, IkeFlags, NotifyType};
use crate::ikev2::fragment::{fragment_message, is_fragment, ReassemblyBuffer};
use crate::ikev2::message::{open_message, seal_message, IkeMessage};
use crate::ikev2::payload::{
    narrow_selectors, AuthMethod, AuthPayload, ConfigPayload, DeletePayload, EapPayload,
    IdPayload, IkePayload, KePayload, NoncePayload, NotifyPayload, SaPayload, TsPayload,
    CFG_REPLY,
};
use crate::ikev2::proposal::{
    select_child_proposal, select_ike_proposal, DhGroup, EncryptionId, EncryptionTransform,
    IntegrityId, NegotiatedChildSa, NegotiatedIkeSa, ProtocolId,
};
use crate::logging;
use crate::metrics::IkeMetrics;
use crate::params::{ChildSessionParams, IkeAuthConfig, IkeOption, IkeSessionParams};
use crate::retransmit::{RetransmitAction, Retransmitter};
use crate::transport::{IpsecTransform, TransformDirection, TransformInstaller};

/// Nonce length used for locally generated nonces
const NONCE_LEN: usize = 32;

/// Lifecycle state of the IKE SA
///
/// There is no rekeying variant: an in-flight IKE rekey stages the
/// replacement SA internally while the session stays [`Established`], since
/// the single-exchange window already serializes the rekey against other
/// traffic.
///
/// [`Established`]: IkeState::Established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IkeState {
    /// Not yet opened
    Initial,
    /// IKE_SA_INIT request sent
    IkeInitSent,
    /// IKE_AUTH (possibly including EAP rounds) in progress
    IkeAuthInProgress,
    /// Authenticated and usable
    Established,
    /// A delete exchange for the whole session is in flight
    Deleting,
    /// Torn down
    Closed,
}

impl IkeState {
    fn name(self) -> &'static str {
        match self {
            IkeState::Initial => "Initial",
            IkeState::IkeInitSent => "IkeInitSent",
            IkeState::IkeAuthInProgress => "IkeAuthInProgress",
            IkeState::Established => "Established",
            IkeState::Deleting => "Deleting",
            IkeState::Closed => "Closed",
        }
    }
}

/// Result of one EAP round
#[derive(Debug)]
pub enum EapOutcome {
    /// Send this EAP message to the peer and await the next request
    Response(Vec<u8>),
    /// The method completed; `msk` keys the final AUTH when present
    Success {
        /// Master session key exported by the method, if any
        msk: Option<Vec<u8>>,
    },
    /// The method failed
    Failure,
}

/// Client side of an EAP conversation
///
/// The engine feeds it each EAP request from the peer and sends whatever it
/// answers. Method internals (identities, vectors, retries within the method)
/// are entirely the implementation's business.
pub trait EapAuthenticator: Send {
    /// Process one EAP request from the peer
    fn process_request(&mut self, request: &[u8]) -> Result<EapOutcome>;
}

/// What the in-flight request is for
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingExchange {
    IkeInit,
    IkeAuth,
    CreateChild { child_id: u32 },
    RekeyChild { child_id: u32 },
    RekeyIke,
    RekeyIkeDelete,
    DeleteChild { child_id: u32 },
    DeleteIke,
    Dpd,
}

/// Where the authentication phase stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthPhase {
    AwaitingFirst,
    EapInProgress,
    AwaitingFinal,
}

/// Requests queued behind the in-flight exchange
#[derive(Debug)]
enum QueuedRequest {
    OpenChild { child_id: u32 },
    RekeyChild { child_id: u32 },
    CloseChild { child_id: u32 },
    RekeyIke,
    CloseIke,
}

/// Replacement IKE SA staged during a rekey, committed once the old SA's
/// delete exchange completes
#[derive(Debug)]
struct StagedIkeSa {
    spi_i: u64,
    spi_r: u64,
    keys: IkeKeys,
    negotiated: NegotiatedIkeSa,
}

/// Initiator-side IKE session engine
pub struct IkeSessionCore {
    params: IkeSessionParams,
    provider: Arc<dyn CryptoProvider>,
    installer: Arc<dyn TransformInstaller>,
    eap: Option<Box<dyn EapAuthenticator>>,

    state: IkeState,
    events: EventDispatcher,
    metrics: IkeMetrics,
    retransmitter: Retransmitter,
    reassembly: ReassemblyBuffer,
    outbox: Vec<Vec<u8>>,

    local_spi: u64,
    peer_spi: u64,
    local_msg_id: u32,
    peer_msg_id: u32,

    keys: Option<IkeKeys>,
    negotiated: Option<NegotiatedIkeSa>,
    dh: Option<DhKeyPair>,
    nonce_i: Vec<u8>,
    nonce_r: Vec<u8>,
    init_request_bytes: Vec<u8>,
    init_response_bytes: Vec<u8>,
    peer_supports_fragmentation: bool,

    pending: Option<PendingExchange>,
    auth_phase: AuthPhase,
    eap_msk: Option<Vec<u8>>,
    queue: VecDeque<QueuedRequest>,
    staged_ike: Option<StagedIkeSa>,
    rekey_new_spi: Option<u64>,
    staged_child: Option<(ChildSessionParams, u32)>,
    /// (child_id, new local ESP SPI) staged for an in-flight child rekey
    pending_child: Option<(u32, u32)>,
    /// Nonce we generated for the in-flight CREATE_CHILD_SA exchange
    nonce_exchange: Vec<u8>,
    retired_pairs: HashMap<u32, TransformPair>,

    children: Vec<ChildSession>,
    next_child_id: u32,

    dpd: Option<DpdState>,
    established_at: Option<Instant>,
    rekey_triggered: bool,
}

impl IkeSessionCore {
    /// Create a session and the receiver for its events
    ///
    /// `first_child` is negotiated inside IKE_AUTH; further children go
    /// through [`IkeSessionCore::request_open_child`].
    pub fn new(
        params: IkeSessionParams,
        first_child: ChildSessionParams,
        provider: Arc<dyn CryptoProvider>,
        installer: Arc<dyn TransformInstaller>,
        eap: Option<Box<dyn EapAuthenticator>>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = EventDispatcher::channel();
        let retransmitter = Retransmitter::new(params.retransmission().clone());
        let core = IkeSessionCore {
            params,
            provider,
            installer,
            eap,
            state: IkeState::Initial,
            events,
            metrics: IkeMetrics::new(),
            retransmitter,
            reassembly: ReassemblyBuffer::new(),
            outbox: Vec::new(),
            local_spi: 0,
            peer_spi: 0,
            local_msg_id: 0,
            peer_msg_id: 0,
            keys: None,
            negotiated: None,
            dh: None,
            nonce_i: Vec::new(),
            nonce_r: Vec::new(),
            init_request_bytes: Vec::new(),
            init_response_bytes: Vec::new(),
            peer_supports_fragmentation: false,
            pending: None,
            auth_phase: AuthPhase::AwaitingFirst,
            eap_msk: None,
            queue: VecDeque::new(),
            staged_ike: None,
            rekey_new_spi: None,
            staged_child: Some((first_child, 1)),
            pending_child: None,
            nonce_exchange: Vec::new(),
            retired_pairs: HashMap::new(),
            children: Vec::new(),
            next_child_id: 2,
            dpd: None,
            established_at: None,
            rekey_triggered: false,
        };
        (core, rx)
    }

    /// Current state
    pub fn state(&self) -> IkeState {
        self.state
    }

    /// Message ID the next locally initiated request will use
    pub fn local_message_id(&self) -> u32 {
        self.local_msg_id
    }

    /// Local IKE SPI, zero before [`IkeSessionCore::open`]
    pub fn local_spi(&self) -> u64 {
        self.local_spi
    }

    /// Peer IKE SPI, zero until the IKE_SA_INIT response arrives
    pub fn peer_spi(&self) -> u64 {
        self.peer_spi
    }

    /// Metrics handle shared with this session
    pub fn metrics(&self) -> IkeMetrics {
        self.metrics.clone()
    }

    /// Drain the datagrams queued for sending
    pub fn take_datagrams(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    /// Earliest point in time [`IkeSessionCore::handle_timeout`] needs to run
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = self.retransmitter.deadline();
        if self.state == IkeState::Established && self.retransmitter.is_idle() {
            if let Some(dpd) = &self.dpd {
                deadline = earliest(deadline, dpd.next_deadline());
            }
            if !self.rekey_triggered {
                deadline = earliest(
                    deadline,
                    self.established_at
                        .map(|t| t + self.params.lifetimes().soft),
                );
            }
        }
        deadline
    }

    /// Start the handshake by sending the IKE_SA_INIT request
    pub fn open(&mut self, now: Instant) -> Result<()> {
        if self.state != IkeState::Initial {
            return Err(Error::InvalidState(format!(
                "Cannot open in state {:?}",
                self.state
            )));
        }
        self.metrics.record_handshake_started();

        self.local_spi = random_nonzero_u64();
        self.nonce_i = random_bytes(NONCE_LEN);

        let group = self
            .params
            .proposals()
            .iter()
            .flat_map(|p| p.dh_groups().iter().copied())
            .next()
            .ok_or_else(|| Error::InvalidParameter("No DH group proposed".to_string()))?;
        let dh = self.provider.generate_dh_keypair(group)?;

        let proposals = self
            .params
            .proposals()
            .iter()
            .enumerate()
            .map(|(i, p)| p.to_wire((i + 1) as u8, Vec::new()))
            .collect();
        let payloads = vec![
            IkePayload::Sa(SaPayload::new(proposals)),
            IkePayload::Ke(KePayload::new(group.to_u16(), dh.public.clone())),
            IkePayload::Nonce(NoncePayload::new(self.nonce_i.clone())?),
            IkePayload::Notify(NotifyPayload::new(NotifyType::FragmentationSupported)),
        ];
        self.dh = Some(dh);

        let msg = IkeMessage::new(
            self.local_spi,
            0,
            ExchangeType::IkeSaInit,
            IkeFlags::request(true),
            0,
            payloads,
        );
        let bytes = msg.to_bytes()?;
        self.init_request_bytes = bytes.clone();

        logging::log_exchange_sent("IKE_SA_INIT", 0, bytes.len(), 1);
        self.retransmitter.register(0, vec![bytes.clone()], now)?;
        self.outbox.push(bytes);
        self.local_msg_id = 1;
        self.pending = Some(PendingExchange::IkeInit);
        self.transition(IkeState::IkeInitSent);
        Ok(())
    }

    /// Feed one inbound datagram
    ///
    /// A decode or verification failure of a single datagram is returned as
    /// an error but does not tear the session down; retransmission handles
    /// the gap.
    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) -> Result<()> {
        if self.state == IkeState::Closed || self.state == IkeState::Initial {
            return Ok(());
        }

        let msg = if is_fragment(data) {
            self.metrics.record_fragment_received();
            let key = self.open_key()?.to_vec();
            match self
                .reassembly
                .handle_fragment(self.provider.as_ref(), &key, data)?
            {
                Some(msg) => msg,
                None => return Ok(()),
            }
        } else if data.len() > 18 && data[18] == ExchangeType::IkeSaInit.to_u8() {
            IkeMessage::from_bytes(data)?
        } else {
            let key = self.open_key()?.to_vec();
            open_message(self.provider.as_ref(), &key, data)?
        };

        if msg.header.initiator_spi != self.local_spi {
            return Ok(());
        }

        if let Some(dpd) = &mut self.dpd {
            dpd.mark_received(now);
        }
        logging::log_message_received(
            msg.header.exchange_type.name(),
            msg.header.message_id,
            msg.header.flags.is_response(),
        );

        if msg.header.flags.is_response() {
            self.handle_response(msg, data, now)
        } else {
            self.handle_peer_request(msg, now)
        }
    }

    /// React to the clock: retransmissions, DPD, soft lifetime, queued work
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state == IkeState::Closed {
            return;
        }

        let inflight_id = self.retransmitter.inflight_message_id();
        match self.retransmitter.handle_timeout(now) {
            Some(RetransmitAction::Resend(datagrams)) => {
                self.metrics.record_retransmission();
                if let Some(id) = inflight_id {
                    logging::log_retransmission(id);
                }
                self.outbox.extend(datagrams);
            }
            Some(RetransmitAction::Exhausted) => {
                self.metrics.record_exchange_timed_out();
                let pending = self.pending.take();
                if let Some(id) = inflight_id {
                    logging::log_exchange_timeout(id);
                }
                match pending {
                    // The peer is already gone; finish tearing down locally
                    Some(PendingExchange::DeleteIke) => {
                        self.teardown_normal();
                        return;
                    }
                    // The old SA is dead either way; switch to the new one
                    Some(PendingExchange::RekeyIkeDelete) => self.commit_ike_rekey(),
                    // Unacknowledged child delete: wind the child down locally
                    Some(PendingExchange::DeleteChild { child_id }) => {
                        self.finish_child_delete(child_id);
                    }
                    Some(PendingExchange::CreateChild { child_id }) => {
                        self.remove_child(child_id);
                        self.events.child(
                            child_id,
                            ChildEvent::ClosedWithError(SessionError::local(
                                Error::RetransmissionExhausted,
                            )),
                        );
                    }
                    // The current pair stays in service
                    Some(PendingExchange::RekeyChild { child_id }) => {
                        self.pending_child = None;
                        self.dh = None;
                        if let Some(child) = self.child_mut(child_id) {
                            child.abort_rekey();
                        }
                        self.events.ike(IkeEvent::Error(SessionError::local(
                            Error::RetransmissionExhausted,
                        )));
                    }
                    Some(PendingExchange::RekeyIke) => {
                        self.rekey_new_spi = None;
                        self.dh = None;
                        self.events.ike(IkeEvent::Error(SessionError::local(
                            Error::RetransmissionExhausted,
                        )));
                    }
                    // Handshake exchanges and DPD probes are session-fatal
                    _ => {
                        self.fail_session(Error::RetransmissionExhausted, None);
                        return;
                    }
                }
            }
            None => {}
        }

        if self.state == IkeState::Established && self.retransmitter.is_idle() {
            let soft_due = !self.rekey_triggered
                && self
                    .established_at
                    .map(|t| now >= t + self.params.lifetimes().soft)
                    .unwrap_or(false);
            if soft_due {
                self.rekey_triggered = true;
                self.queue.push_back(QueuedRequest::RekeyIke);
            }

            let dpd_due = self
                .dpd
                .as_ref()
                .map(|d| d.should_send(now))
                .unwrap_or(false);
            if self.queue.is_empty() && dpd_due && self.pending.is_none() {
                self.metrics.record_dpd_check();
                logging::log_dpd_check(self.local_msg_id);
                if let Err(e) = self.send_request(
                    ExchangeType::Informational,
                    Vec::new(),
                    PendingExchange::Dpd,
                    now,
                ) {
                    self.fail_session(e, None);
                    return;
                }
                if let Some(dpd) = &mut self.dpd {
                    // Pushes the next check past the retransmission window
                    dpd.mark_received(now);
                }
            }
        }

        self.pump_queue(now);
    }

    /// Request an additional Child SA; returns its identifier
    pub fn request_open_child(
        &mut self,
        params: ChildSessionParams,
        now: Instant,
    ) -> Result<u32> {
        self.ensure_usable()?;
        let child_id = self.next_child_id;
        self.next_child_id += 1;
        self.children
            .push(ChildSession::new(child_id, params, random_nonzero_u32()));
        self.queue.push_back(QueuedRequest::OpenChild { child_id });
        self.pump_queue(now);
        Ok(child_id)
    }

    /// Request a rekey of an established Child SA
    pub fn request_rekey_child(&mut self, child_id: u32, now: Instant) -> Result<()> {
        self.ensure_usable()?;
        let child = self
            .child(child_id)
            .ok_or_else(|| Error::SaNotFound(format!("Child {}", child_id)))?;
        if child.state() != ChildState::Established {
            return Err(Error::InvalidState(format!(
                "Child {} is not established",
                child_id
            )));
        }
        self.queue.push_back(QueuedRequest::RekeyChild { child_id });
        self.pump_queue(now);
        Ok(())
    }

    /// Request deletion of an established Child SA
    pub fn request_close_child(&mut self, child_id: u32, now: Instant) -> Result<()> {
        self.ensure_usable()?;
        if self.child(child_id).is_none() {
            return Err(Error::SaNotFound(format!("Child {}", child_id)));
        }
        self.queue.push_back(QueuedRequest::CloseChild { child_id });
        self.pump_queue(now);
        Ok(())
    }

    /// Request a rekey of the IKE SA itself
    pub fn request_rekey_ike(&mut self, now: Instant) -> Result<()> {
        self.ensure_usable()?;
        self.queue.push_back(QueuedRequest::RekeyIke);
        self.pump_queue(now);
        Ok(())
    }

    /// Close the session gracefully with a Delete exchange
    pub fn close(&mut self, now: Instant) {
        match self.state {
            IkeState::Closed | IkeState::Deleting => {}
            IkeState::Initial | IkeState::IkeInitSent | IkeState::IkeAuthInProgress => {
                // Nothing authenticated yet worth telling the peer about
                self.retransmitter.abandon();
                self.teardown_normal();
            }
            IkeState::Established => {
                self.queue.push_back(QueuedRequest::CloseIke);
                self.pump_queue(now);
            }
        }
    }

    /// Tear down locally without notifying the peer
    pub fn kill(&mut self) {
        self.retransmitter.abandon();
        self.teardown_normal();
        self.outbox.clear();
    }

    // ------------------------------------------------------------------
    // Response handling
    // ------------------------------------------------------------------

    fn handle_response(&mut self, msg: IkeMessage, raw: &[u8], now: Instant) -> Result<()> {
        let msg_id = msg.header.message_id;
        if self.retransmitter.inflight_message_id() != Some(msg_id) {
            // Stale or unsolicited response
            return Ok(());
        }
        let pending = match self.pending.clone() {
            Some(p) => p,
            None => return Ok(()),
        };
        self.retransmitter.acknowledge(msg_id);

        let result = match pending {
            PendingExchange::IkeInit => self.handle_init_response(msg, raw, now),
            PendingExchange::IkeAuth => self.handle_auth_response(msg, now),
            PendingExchange::CreateChild { child_id } => {
                self.handle_create_child_response(child_id, msg, now)
            }
            PendingExchange::RekeyChild { child_id } => {
                self.handle_rekey_child_response(child_id, msg, now)
            }
            PendingExchange::RekeyIke => self.handle_rekey_ike_response(msg, now),
            PendingExchange::RekeyIkeDelete => {
                self.pending = None;
                self.commit_ike_rekey();
                Ok(())
            }
            PendingExchange::DeleteChild { child_id } => {
                self.pending = None;
                self.finish_child_delete(child_id);
                Ok(())
            }
            PendingExchange::DeleteIke => {
                self.pending = None;
                self.teardown_normal();
                Ok(())
            }
            PendingExchange::Dpd => {
                self.pending = None;
                Ok(())
            }
        };
        if result.is_ok() {
            self.pump_queue(now);
        }
        result
    }

    fn handle_init_response(&mut self, msg: IkeMessage, raw: &[u8], now: Instant) -> Result<()> {
        self.pending = None;

        if let Some(notify) = find_error_notify(&msg) {
            let error = notify_to_error(&notify);
            if matches!(error, Error::NoProposalChosen) {
                self.metrics.record_proposal_failure();
            }
            logging::log_error_notify(notify.notify_type, "IKE_SA_INIT");
            self.fail_session(error, Some(notify.data));
            return Ok(());
        }

        // The request is acknowledged and nothing is in flight anymore; a
        // local failure here closes the session instead of bubbling up
        if let Err(e) = self.process_init_response(msg, raw, now) {
            if matches!(e, Error::NoProposalChosen) {
                self.metrics.record_proposal_failure();
            }
            self.fail_session(e, None);
        }
        Ok(())
    }

    fn process_init_response(&mut self, msg: IkeMessage, raw: &[u8], now: Instant) -> Result<()> {
        let sa = msg
            .find(|p| match p {
                IkePayload::Sa(sa) => Some(sa.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::InvalidMessage("IKE_SA_INIT response without SA".to_string()))?;
        let ke = msg
            .find(|p| match p {
                IkePayload::Ke(ke) => Some(ke.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::InvalidMessage("IKE_SA_INIT response without KE".to_string()))?;
        let nonce = msg
            .find(|p| match p {
                IkePayload::Nonce(n) => Some(n.clone()),
                _ => None,
            })
            .ok_or_else(|| {
                Error::InvalidMessage("IKE_SA_INIT response without nonce".to_string())
            })?;

        let negotiated = select_ike_proposal(&sa.proposals, self.params.proposals())?;

        let dh = self
            .dh
            .take()
            .ok_or_else(|| Error::Internal("DH keypair missing".to_string()))?;
        let shared_secret =
            self.provider
                .compute_shared_secret(negotiated.dh_group, &dh.private, &ke.key_data)?;

        self.peer_spi = msg.header.responder_spi;
        self.nonce_r = nonce.nonce;
        self.peer_supports_fragmentation = msg
            .payloads
            .iter()
            .any(|p| matches!(p, IkePayload::Notify(n) if n.known_type() == Some(NotifyType::FragmentationSupported)));
        self.init_response_bytes = raw[..msg.header.length as usize].to_vec();

        let prf = PrfAlgorithm::from_transform(negotiated.prf);
        let keys = IkeKeys::derive(
            prf,
            &self.nonce_i,
            &self.nonce_r,
            &shared_secret,
            self.local_spi,
            self.peer_spi,
            encr_key_len(&negotiated.encryption),
            integ_key_len(negotiated.integrity),
        );
        self.keys = Some(keys);
        self.negotiated = Some(negotiated);

        self.send_ike_auth(now)
    }

    fn send_ike_auth(&mut self, now: Instant) -> Result<()> {
        let (child_params, child_id) = self
            .staged_child
            .take()
            .ok_or_else(|| Error::Internal("First child already consumed".to_string()))?;
        let local_esp_spi = random_nonzero_u32();
        let child = ChildSession::new(child_id, child_params, local_esp_spi);

        let mut payloads = vec![IkePayload::IdI(self.params.local_id().clone())];

        match self.params.auth() {
            IkeAuthConfig::PresharedKey(psk) => {
                payloads.push(IkePayload::Auth(self.compute_local_auth(psk.clone())?));
            }
            IkeAuthConfig::DigitalSignature { private_key, .. } => {
                let octets = self.local_signed_octets()?;
                let signature = self.provider.sign(private_key, &octets)?;
                payloads.push(IkePayload::Auth(AuthPayload::new(
                    AuthMethod::DigitalSignature,
                    signature,
                )));
            }
            IkeAuthConfig::Eap { .. } => {
                // AUTH omitted to request EAP (RFC 7296 §2.16)
            }
        }

        if self.params.has_option(IkeOption::EapOnlyAuth) {
            payloads.push(IkePayload::Notify(NotifyPayload::new(
                NotifyType::EapOnlyAuthentication,
            )));
        }
        if self.params.has_option(IkeOption::InitialContact) {
            payloads.push(IkePayload::Notify(NotifyPayload::new(
                NotifyType::InitialContact,
            )));
        }

        let config_requests: Vec<_> = self
            .params
            .config_requests()
            .iter()
            .chain(child.params().config_requests())
            .map(|r| r.to_attribute())
            .collect();
        if !config_requests.is_empty() {
            payloads.push(IkePayload::Config(ConfigPayload::request(config_requests)));
        }

        payloads.extend(self.child_negotiation_payloads(&child));
        self.children.push(child);

        self.transition(IkeState::IkeAuthInProgress);
        self.auth_phase = AuthPhase::AwaitingFirst;
        self.send_request(ExchangeType::IkeAuth, payloads, PendingExchange::IkeAuth, now)
    }

    fn handle_auth_response(&mut self, msg: IkeMessage, now: Instant) -> Result<()> {
        let has_auth = msg
            .payloads
            .iter()
            .any(|p| matches!(p, IkePayload::Auth(_)));
        let eap = msg.find(|p| match p {
            IkePayload::Eap(e) => Some(e.message.clone()),
            _ => None,
        });

        if let Some(notify) = find_error_notify(&msg) {
            if !has_auth {
                let error = notify_to_error(&notify);
                logging::log_error_notify(notify.notify_type, "IKE_AUTH");
                if matches!(error, Error::AuthenticationFailed(_)) {
                    self.metrics.record_auth_failure();
                }
                if matches!(error, Error::NoProposalChosen) {
                    self.metrics.record_proposal_failure();
                }
                self.pending = None;
                self.fail_session(error, Some(notify.data));
                return Ok(());
            }
        }

        if self.auth_phase != AuthPhase::AwaitingFinal {
            if let Some(request) = eap {
                return self.handle_eap_round(&request, now);
            }
        }
        self.pending = None;
        self.finish_ike_auth(msg, now)
    }

    fn handle_eap_round(&mut self, request: &[u8], now: Instant) -> Result<()> {
        self.auth_phase = AuthPhase::EapInProgress;
        let outcome = match self.eap.as_mut() {
            Some(authenticator) => authenticator.process_request(request)?,
            None => {
                self.pending = None;
                self.fail_session(
                    Error::AuthenticationFailed("Peer requested EAP, none configured".to_string()),
                    None,
                );
                return Ok(());
            }
        };
        self.pending = None;
        match outcome {
            EapOutcome::Response(message) => {
                let payloads = vec![IkePayload::Eap(EapPayload::new(message))];
                self.send_request(ExchangeType::IkeAuth, payloads, PendingExchange::IkeAuth, now)
            }
            EapOutcome::Success { msk } => {
                self.eap_msk = msk;
                let key = self.eap_auth_key(true)?;
                let auth = self.compute_local_auth(key)?;
                self.auth_phase = AuthPhase::AwaitingFinal;
                self.send_request(
                    ExchangeType::IkeAuth,
                    vec![IkePayload::Auth(auth)],
                    PendingExchange::IkeAuth,
                    now,
                )
            }
            EapOutcome::Failure => {
                self.metrics.record_auth_failure();
                self.fail_session(
                    Error::AuthenticationFailed("EAP method failed".to_string()),
                    None,
                );
                Ok(())
            }
        }
    }

    fn finish_ike_auth(&mut self, msg: IkeMessage, now: Instant) -> Result<()> {
        let id_r = msg.find(|p| match p {
            IkePayload::IdR(id) => Some(id.clone()),
            _ => None,
        });
        let auth = msg.find(|p| match p {
            IkePayload::Auth(a) => Some(a.clone()),
            _ => None,
        });

        let (id_r, auth) = match (id_r, auth) {
            (Some(i), Some(a)) => (i, a),
            _ => {
                self.metrics.record_auth_failure();
                self.fail_session(
                    Error::AuthenticationFailed("IKE_AUTH response missing IDr or AUTH".to_string()),
                    None,
                );
                return Ok(());
            }
        };

        if let Err(e) = self.verify_peer_auth(&id_r, &auth) {
            self.metrics.record_auth_failure();
            logging::log_auth_failure(&e.to_string());
            self.fail_session(e, None);
            return Ok(());
        }
        logging::log_auth_success(&id_r.as_string().unwrap_or_else(|| "<binary>".to_string()));

        // The peer is authenticated from here on: a child failure no longer
        // takes the IKE SA down with it
        self.transition(IkeState::Established);
        self.established_at = Some(now);
        self.dpd = Some(DpdState::new(
            DpdConfig::enabled(self.params.dpd_delay()),
            now,
        ));
        self.metrics.record_handshake_completed();
        self.events.ike(IkeEvent::Opened);

        let child_id = match self.children.first() {
            Some(c) => c.id(),
            None => return Err(Error::Internal("First child missing".to_string())),
        };
        let child_error = find_error_notify(&msg).map(|n| {
            let e = notify_to_error(&n);
            SessionError::from_notify(e, n.data)
        });
        match child_error {
            Some(err) => {
                self.remove_child(child_id);
                self.events
                    .child(child_id, ChildEvent::ClosedWithError(err));
            }
            None => {
                let (nonce_i, nonce_r) = (self.nonce_i.clone(), self.nonce_r.clone());
                if let Err(e) = self.complete_child(child_id, &msg, &nonce_i, &nonce_r, None) {
                    self.remove_child(child_id);
                    self.events
                        .child(child_id, ChildEvent::ClosedWithError(SessionError::local(e)));
                }
            }
        }
        Ok(())
    }

    fn handle_create_child_response(
        &mut self,
        child_id: u32,
        msg: IkeMessage,
        _now: Instant,
    ) -> Result<()> {
        self.pending = None;
        // A malformed response fails the child, never the whole session
        if let Err(e) = self.process_create_child_response(child_id, &msg) {
            self.remove_child(child_id);
            self.events
                .child(child_id, ChildEvent::ClosedWithError(SessionError::local(e)));
        }
        Ok(())
    }

    fn process_create_child_response(&mut self, child_id: u32, msg: &IkeMessage) -> Result<()> {
        let (nonce_i, secret) = self.take_exchange_crypto(msg)?;

        if let Some(notify) = find_error_notify(msg) {
            logging::log_error_notify(notify.notify_type, "CREATE_CHILD_SA");
            let error = notify_to_error(&notify);
            self.remove_child(child_id);
            self.events.child(
                child_id,
                ChildEvent::ClosedWithError(SessionError::from_notify(error, notify.data)),
            );
            return Ok(());
        }

        let nonce_r = msg
            .find(|p| match p {
                IkePayload::Nonce(n) => Some(n.nonce.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::InvalidMessage("CREATE_CHILD_SA without nonce".to_string()))?;

        self.complete_child(child_id, msg, &nonce_i, &nonce_r, secret.as_deref())
    }

    fn handle_rekey_child_response(
        &mut self,
        child_id: u32,
        msg: IkeMessage,
        now: Instant,
    ) -> Result<()> {
        self.pending = None;
        // A malformed response abandons the rekey; the current pair stays up
        if let Err(e) = self.process_rekey_child_response(child_id, &msg, now) {
            self.pending_child = None;
            self.dh = None;
            if let Some(child) = self.child_mut(child_id) {
                child.abort_rekey();
            }
            self.events.ike(IkeEvent::Error(SessionError::local(e)));
        }
        Ok(())
    }

    fn process_rekey_child_response(
        &mut self,
        child_id: u32,
        msg: &IkeMessage,
        now: Instant,
    ) -> Result<()> {
        let (nonce_i, secret) = self.take_exchange_crypto(msg)?;

        if let Some(notify) = find_error_notify(msg) {
            // The current pair stays in service
            logging::log_error_notify(notify.notify_type, "CREATE_CHILD_SA");
            self.pending_child = None;
            if let Some(child) = self.child_mut(child_id) {
                child.abort_rekey();
            }
            let error = notify_to_error(&notify);
            self.events
                .ike(IkeEvent::Error(SessionError::from_notify(error, notify.data)));
            return Ok(());
        }

        let nonce_r = msg
            .find(|p| match p {
                IkePayload::Nonce(n) => Some(n.nonce.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::InvalidMessage("CREATE_CHILD_SA without nonce".to_string()))?;

        let new_local_spi = match self.pending_child.take() {
            Some((id, spi)) if id == child_id => spi,
            _ => return Err(Error::Internal("Rekey SPI not staged".to_string())),
        };

        let child = self
            .child(child_id)
            .ok_or_else(|| Error::SaNotFound(format!("Child {}", child_id)))?;
        let sa = msg
            .find(|p| match p {
                IkePayload::Sa(sa) => Some(sa.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::InvalidMessage("CREATE_CHILD_SA without SA".to_string()))?;
        let negotiated = select_child_proposal(&sa.proposals, child.params().proposals())?;
        let new_pair = self.build_transform_pair(
            new_local_spi,
            &negotiated,
            &nonce_i,
            &nonce_r,
            secret.as_deref(),
        )?;

        self.installer
            .install(&new_pair.inbound, TransformDirection::Inbound)?;
        self.installer
            .install(&new_pair.outbound, TransformDirection::Outbound)?;
        self.events.child(
            child_id,
            ChildEvent::TransformCreated {
                inbound: new_pair.inbound.clone(),
                outbound: new_pair.outbound.clone(),
            },
        );

        let old_local_spi;
        {
            let child = self
                .child_mut(child_id)
                .ok_or_else(|| Error::SaNotFound(format!("Child {}", child_id)))?;
            old_local_spi = child.local_spi();
            let old_pair = child.complete_rekey(new_local_spi, new_pair)?;
            self.retired_pairs.insert(child_id, old_pair);
        }
        self.metrics.record_child_rekey();
        logging::log_rekey_completed("child");

        // Retire the replaced SA with a Delete on its old SPI
        let payloads = vec![IkePayload::Delete(DeletePayload::esp(vec![
            old_local_spi.to_be_bytes().to_vec(),
        ]))];
        self.send_request(
            ExchangeType::Informational,
            payloads,
            PendingExchange::DeleteChild { child_id },
            now,
        )
    }

    fn handle_rekey_ike_response(&mut self, msg: IkeMessage, now: Instant) -> Result<()> {
        self.pending = None;
        let (nonce_i, secret) = self.take_exchange_crypto(&msg)?;

        if let Some(notify) = find_error_notify(&msg) {
            logging::log_error_notify(notify.notify_type, "CREATE_CHILD_SA");
            let error = notify_to_error(&notify);
            self.rekey_new_spi = None;
            self.events
                .ike(IkeEvent::Error(SessionError::from_notify(error, notify.data)));
            return Ok(());
        }

        let sa = msg
            .find(|p| match p {
                IkePayload::Sa(sa) => Some(sa.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::InvalidMessage("Rekey response without SA".to_string()))?;
        let nonce_r = msg
            .find(|p| match p {
                IkePayload::Nonce(n) => Some(n.nonce.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::InvalidMessage("Rekey response without nonce".to_string()))?;

        let negotiated = select_ike_proposal(&sa.proposals, self.params.proposals())?;
        let peer_new_spi = sa
            .proposals
            .iter()
            .find(|p| p.proposal_num == negotiated.proposal_num)
            .map(|p| p.spi.clone())
            .filter(|spi| spi.len() == 8)
            .map(|spi| {
                let mut b = [0u8; 8];
                b.copy_from_slice(&spi);
                u64::from_be_bytes(b)
            })
            .ok_or_else(|| {
                Error::InvalidMessage("Rekey response proposal without 8-byte SPI".to_string())
            })?;

        let new_spi_i = self
            .rekey_new_spi
            .take()
            .ok_or_else(|| Error::Internal("No staged rekey SPI".to_string()))?;
        let shared_secret = secret.ok_or_else(|| {
            Error::InvalidMessage("Rekey response without KE".to_string())
        })?;

        let old_sk_d = self
            .keys
            .as_ref()
            .map(|k| k.sk_d.clone())
            .ok_or_else(|| Error::InvalidState("No IKE keys".to_string()))?;
        let prf = PrfAlgorithm::from_transform(negotiated.prf);
        let keys = IkeKeys::derive_rekeyed(
            prf,
            &old_sk_d,
            &nonce_i,
            &nonce_r,
            &shared_secret,
            new_spi_i,
            peer_new_spi,
            encr_key_len(&negotiated.encryption),
            integ_key_len(negotiated.integrity),
        );

        self.staged_ike = Some(StagedIkeSa {
            spi_i: new_spi_i,
            spi_r: peer_new_spi,
            keys,
            negotiated,
        });

        // The old SA is deleted under its own SPIs and keys; the new SA takes
        // over once that exchange completes
        let payloads = vec![IkePayload::Delete(DeletePayload::ike())];
        self.send_request(
            ExchangeType::Informational,
            payloads,
            PendingExchange::RekeyIkeDelete,
            now,
        )
    }

    fn commit_ike_rekey(&mut self) {
        let staged = match self.staged_ike.take() {
            Some(s) => s,
            None => return,
        };
        self.local_spi = staged.spi_i;
        self.peer_spi = staged.spi_r;
        self.keys = Some(staged.keys);
        self.negotiated = Some(staged.negotiated);
        self.local_msg_id = 0;
        self.peer_msg_id = 0;
        self.rekey_triggered = false;
        self.metrics.record_ike_rekey();
        logging::log_rekey_completed("ike");
    }

    // ------------------------------------------------------------------
    // Peer-initiated requests
    // ------------------------------------------------------------------

    fn handle_peer_request(&mut self, msg: IkeMessage, _now: Instant) -> Result<()> {
        if msg.header.message_id != self.peer_msg_id {
            return Ok(());
        }
        let msg_id = msg.header.message_id;
        self.peer_msg_id += 1;

        match msg.header.exchange_type {
            ExchangeType::Informational => {
                let deletes: Vec<DeletePayload> = msg
                    .payloads
                    .iter()
                    .filter_map(|p| match p {
                        IkePayload::Delete(d) => Some(d.clone()),
                        _ => None,
                    })
                    .collect();

                if deletes.is_empty() {
                    // Liveness check from the peer
                    return self.send_response(ExchangeType::Informational, Vec::new(), msg_id);
                }

                let mut ike_deleted = false;
                let mut response_payloads = Vec::new();
                for delete in deletes {
                    if delete.protocol_id == ProtocolId::Ike {
                        ike_deleted = true;
                    } else {
                        let acked = self.delete_children_by_peer_spi(&delete.spis);
                        if !acked.is_empty() {
                            response_payloads.push(IkePayload::Delete(DeletePayload::esp(acked)));
                        }
                    }
                }
                self.send_response(ExchangeType::Informational, response_payloads, msg_id)?;
                if ike_deleted {
                    self.teardown_normal();
                }
                Ok(())
            }
            ExchangeType::CreateChildSa => {
                // Peer-initiated child negotiation is not taken up here
                let payloads = vec![IkePayload::Notify(NotifyPayload::new(
                    NotifyType::TemporaryFailure,
                ))];
                self.send_response(ExchangeType::CreateChildSa, payloads, msg_id)
            }
            other => Err(Error::UnsupportedExchangeType(other.to_u8())),
        }
    }

    /// Close the children whose outbound (peer-side) SPIs were deleted,
    /// returning our local SPIs to acknowledge
    fn delete_children_by_peer_spi(&mut self, peer_spis: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut acked = Vec::new();
        let ids: Vec<u32> = self
            .children
            .iter()
            .filter(|c| {
                c.pair().map_or(false, |pair| {
                    peer_spis
                        .iter()
                        .any(|spi| spi.as_slice() == pair.outbound.spi.to_be_bytes())
                })
            })
            .map(|c| c.id())
            .collect();
        for child_id in ids {
            if let Some(child) = self.child_mut(child_id) {
                acked.push(child.local_spi().to_be_bytes().to_vec());
            }
            self.close_child_locally(child_id);
        }
        acked
    }

    // ------------------------------------------------------------------
    // Queued exchange starters
    // ------------------------------------------------------------------

    fn pump_queue(&mut self, now: Instant) {
        while self.state == IkeState::Established
            && self.pending.is_none()
            && self.retransmitter.is_idle()
        {
            let request = match self.queue.pop_front() {
                Some(r) => r,
                None => return,
            };
            let result = match request {
                QueuedRequest::OpenChild { child_id } => self.start_open_child(child_id, now),
                QueuedRequest::RekeyChild { child_id } => self.start_rekey_child(child_id, now),
                QueuedRequest::CloseChild { child_id } => self.start_close_child(child_id, now),
                QueuedRequest::RekeyIke => self.start_rekey_ike(now),
                QueuedRequest::CloseIke => self.start_close_ike(now),
            };
            if let Err(e) = result {
                self.fail_session(e, None);
                return;
            }
        }
    }

    fn start_open_child(&mut self, child_id: u32, now: Instant) -> Result<()> {
        let child = match self.child(child_id) {
            Some(c) if c.state() == ChildState::Creating => c,
            _ => return Ok(()),
        };
        let mut payloads = vec![IkePayload::Nonce(NoncePayload::new(random_bytes(
            NONCE_LEN,
        ))?)];
        let nonce_i = match &payloads[0] {
            IkePayload::Nonce(n) => n.nonce.clone(),
            _ => Vec::new(),
        };

        let pfs_group = child.params().proposals().first().and_then(|p| {
            p.dh_groups().first().copied()
        });
        if let Some(group) = pfs_group {
            let dh = self.provider.generate_dh_keypair(group)?;
            payloads.push(IkePayload::Ke(KePayload::new(
                group.to_u16(),
                dh.public.clone(),
            )));
            self.dh = Some(dh);
        }

        let child = match self.child(child_id) {
            Some(c) => c,
            None => return Ok(()),
        };
        payloads.extend(self.child_negotiation_payloads(child));

        self.nonce_exchange = nonce_i;
        self.send_request(
            ExchangeType::CreateChildSa,
            payloads,
            PendingExchange::CreateChild { child_id },
            now,
        )
    }

    fn start_rekey_child(&mut self, child_id: u32, now: Instant) -> Result<()> {
        let old_local_spi = match self.child(child_id) {
            Some(c) if c.state() == ChildState::Established => c.local_spi(),
            _ => return Ok(()),
        };
        logging::log_rekey_started("child");

        let new_local_spi = random_nonzero_u32();
        let nonce_i = random_bytes(NONCE_LEN);
        let mut payloads = vec![
            IkePayload::Notify(NotifyPayload::rekey_sa(old_local_spi.to_be_bytes().to_vec())),
            IkePayload::Nonce(NoncePayload::new(nonce_i.clone())?),
        ];

        let child = match self.child_mut(child_id) {
            Some(c) => c,
            None => return Ok(()),
        };
        child.begin_rekey()?;

        let pfs_group = match self.child(child_id) {
            Some(c) => c
                .params()
                .proposals()
                .first()
                .and_then(|p| p.dh_groups().first().copied()),
            None => return Ok(()),
        };
        if let Some(group) = pfs_group {
            let dh = self.provider.generate_dh_keypair(group)?;
            payloads.push(IkePayload::Ke(KePayload::new(
                group.to_u16(),
                dh.public.clone(),
            )));
            self.dh = Some(dh);
        }

        let child = match self.child(child_id) {
            Some(c) => c,
            None => return Ok(()),
        };
        let proposals: Vec<_> = child
            .params()
            .proposals()
            .iter()
            .enumerate()
            .map(|(i, p)| p.to_wire((i + 1) as u8, new_local_spi.to_be_bytes().to_vec()))
            .collect();
        payloads.push(IkePayload::Sa(SaPayload::new(proposals)));
        payloads.push(IkePayload::TsI(TsPayload::new(
            child.params().inbound_ts().to_vec(),
        )));
        payloads.push(IkePayload::TsR(TsPayload::new(
            child.params().outbound_ts().to_vec(),
        )));

        self.pending_child = Some((child_id, new_local_spi));
        self.nonce_exchange = nonce_i;
        self.send_request(
            ExchangeType::CreateChildSa,
            payloads,
            PendingExchange::RekeyChild { child_id },
            now,
        )
    }

    fn start_close_child(&mut self, child_id: u32, now: Instant) -> Result<()> {
        let local_spi = match self.child_mut(child_id) {
            Some(c) if c.state() == ChildState::Established => {
                let spi = c.local_spi();
                c.begin_delete()?;
                spi
            }
            _ => return Ok(()),
        };
        let payloads = vec![IkePayload::Delete(DeletePayload::esp(vec![local_spi
            .to_be_bytes()
            .to_vec()]))];
        self.send_request(
            ExchangeType::Informational,
            payloads,
            PendingExchange::DeleteChild { child_id },
            now,
        )
    }

    fn start_rekey_ike(&mut self, now: Instant) -> Result<()> {
        logging::log_rekey_started("ike");
        let new_spi = random_nonzero_u64();
        let nonce_i = random_bytes(NONCE_LEN);

        let group = self
            .negotiated
            .as_ref()
            .map(|n| n.dh_group)
            .ok_or_else(|| Error::InvalidState("No negotiated IKE SA".to_string()))?;
        let dh = self.provider.generate_dh_keypair(group)?;

        let proposals: Vec<_> = self
            .params
            .proposals()
            .iter()
            .enumerate()
            .map(|(i, p)| p.to_wire((i + 1) as u8, new_spi.to_be_bytes().to_vec()))
            .collect();
        let payloads = vec![
            IkePayload::Sa(SaPayload::new(proposals)),
            IkePayload::Nonce(NoncePayload::new(nonce_i.clone())?),
            IkePayload::Ke(KePayload::new(group.to_u16(), dh.public.clone())),
        ];
        self.dh = Some(dh);

        self.rekey_new_spi = Some(new_spi);
        self.nonce_exchange = nonce_i;
        self.send_request(
            ExchangeType::CreateChildSa,
            payloads,
            PendingExchange::RekeyIke,
            now,
        )
    }

    fn start_close_ike(&mut self, now: Instant) -> Result<()> {
        self.transition(IkeState::Deleting);
        let payloads = vec![IkePayload::Delete(DeletePayload::ike())];
        self.send_request(
            ExchangeType::Informational,
            payloads,
            PendingExchange::DeleteIke,
            now,
        )
    }

    // ------------------------------------------------------------------
    // Child completion
    // ------------------------------------------------------------------

    fn complete_child(
        &mut self,
        child_id: u32,
        msg: &IkeMessage,
        nonce_i: &[u8],
        nonce_r: &[u8],
        shared_secret: Option<&[u8]>,
    ) -> Result<()> {
        let child = self
            .child(child_id)
            .ok_or_else(|| Error::SaNotFound(format!("Child {}", child_id)))?;
        let local_esp_spi = child.local_spi();

        let sa = msg
            .find(|p| match p {
                IkePayload::Sa(sa) => Some(sa.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::InvalidMessage("Child response without SA".to_string()))?;
        let negotiated = select_child_proposal(&sa.proposals, child.params().proposals())?;

        let ts_i = msg
            .find(|p| match p {
                IkePayload::TsI(ts) => Some(ts.selectors.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::InvalidMessage("Child response without TSi".to_string()))?;
        let ts_r = msg
            .find(|p| match p {
                IkePayload::TsR(ts) => Some(ts.selectors.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::InvalidMessage("Child response without TSr".to_string()))?;

        let narrowed_in = narrow_selectors(child.params().inbound_ts(), &ts_i)?;
        let narrowed_out = narrow_selectors(child.params().outbound_ts(), &ts_r)?;

        let config_replies = msg
            .find(|p| match p {
                IkePayload::Config(c) if c.cfg_type == CFG_REPLY => {
                    Some(c.attributes.clone())
                }
                _ => None,
            })
            .unwrap_or_default();

        let pair = self.build_transform_pair(
            local_esp_spi,
            &negotiated,
            nonce_i,
            nonce_r,
            shared_secret,
        )?;

        self.installer
            .install(&pair.inbound, TransformDirection::Inbound)?;
        self.installer
            .install(&pair.outbound, TransformDirection::Outbound)?;
        logging::log_child_created(child_id, local_esp_spi, &negotiated.peer_spi);

        let child = self
            .child_mut(child_id)
            .ok_or_else(|| Error::SaNotFound(format!("Child {}", child_id)))?;
        child.establish(
            pair.clone(),
            narrowed_in,
            narrowed_out,
            config_replies.clone(),
        )?;

        self.metrics.record_child_created();
        self.events.child(
            child_id,
            ChildEvent::TransformCreated {
                inbound: pair.inbound,
                outbound: pair.outbound,
            },
        );
        self.events
            .child(child_id, ChildEvent::Opened { config_replies });
        Ok(())
    }

    fn build_transform_pair(
        &self,
        local_esp_spi: u32,
        negotiated: &NegotiatedChildSa,
        nonce_i: &[u8],
        nonce_r: &[u8],
        shared_secret: Option<&[u8]>,
    ) -> Result<TransformPair> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| Error::InvalidState("No IKE keys".to_string()))?;
        let prf = self
            .negotiated
            .as_ref()
            .map(|n| PrfAlgorithm::from_transform(n.prf))
            .ok_or_else(|| Error::InvalidState("No negotiated IKE SA".to_string()))?;

        if negotiated.peer_spi.len() != 4 {
            return Err(Error::InvalidMessage(format!(
                "ESP SPI must be 4 bytes, got {}",
                negotiated.peer_spi.len()
            )));
        }
        let mut spi_bytes = [0u8; 4];
        spi_bytes.copy_from_slice(&negotiated.peer_spi);
        let peer_esp_spi = u32::from_be_bytes(spi_bytes);

        let child_keys = ChildKeys::derive(
            prf,
            &keys.sk_d,
            nonce_i,
            nonce_r,
            shared_secret,
            encr_key_len(&negotiated.encryption),
            integ_key_len(negotiated.integrity),
        );

        // Initiator-to-responder material protects our outbound traffic
        let outbound = IpsecTransform {
            spi: peer_esp_spi,
            encryption: negotiated.encryption.clone(),
            integrity: negotiated.integrity,
            encryption_key: child_keys.sk_ei.clone(),
            integrity_key: child_keys.sk_ai.clone(),
        };
        let inbound = IpsecTransform {
            spi: local_esp_spi,
            encryption: negotiated.encryption.clone(),
            integrity: negotiated.integrity,
            encryption_key: child_keys.sk_er.clone(),
            integrity_key: child_keys.sk_ar.clone(),
        };
        Ok(TransformPair { inbound, outbound })
    }

    fn finish_child_delete(&mut self, child_id: u32) {
        if let Some(old_pair) = self.retired_pairs.remove(&child_id) {
            // Rekey cleanup: the child itself stays established on the new pair
            let _ = self
                .installer
                .remove(&old_pair.inbound, TransformDirection::Inbound);
            let _ = self
                .installer
                .remove(&old_pair.outbound, TransformDirection::Outbound);
            self.events.child(
                child_id,
                ChildEvent::TransformDeleted {
                    inbound: old_pair.inbound,
                    outbound: old_pair.outbound,
                },
            );
            return;
        }
        self.close_child_locally(child_id);
    }

    fn close_child_locally(&mut self, child_id: u32) {
        let pair = match self.child_mut(child_id) {
            Some(child) => child.close(),
            None => None,
        };
        if let Some(pair) = pair {
            let _ = self
                .installer
                .remove(&pair.inbound, TransformDirection::Inbound);
            let _ = self
                .installer
                .remove(&pair.outbound, TransformDirection::Outbound);
            if let Some(child) = self.child(child_id) {
                logging::log_child_deleted(child_id, child.local_spi());
            }
            self.events.child(
                child_id,
                ChildEvent::TransformDeleted {
                    inbound: pair.inbound,
                    outbound: pair.outbound,
                },
            );
        }
        self.metrics.record_child_deleted();
        self.events.child(child_id, ChildEvent::Closed);
        self.remove_child(child_id);
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn child(&self, child_id: u32) -> Option<&ChildSession> {
        self.children.iter().find(|c| c.id() == child_id)
    }

    fn child_mut(&mut self, child_id: u32) -> Option<&mut ChildSession> {
        self.children.iter_mut().find(|c| c.id() == child_id)
    }

    fn remove_child(&mut self, child_id: u32) {
        self.children.retain(|c| c.id() != child_id);
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state {
            IkeState::Established => Ok(()),
            other => Err(Error::InvalidState(format!(
                "Session is {:?}, not established",
                other
            ))),
        }
    }

    fn transition(&mut self, to: IkeState) {
        logging::log_state_transition(self.local_spi, self.peer_spi, self.state.name(), to.name());
        self.state = to;
    }

    /// Key that opens inbound messages (the responder seals with SK_er)
    fn open_key(&self) -> Result<&[u8]> {
        self.keys
            .as_ref()
            .map(|k| k.sk_er.as_slice())
            .ok_or_else(|| Error::InvalidState("No IKE keys yet".to_string()))
    }

    fn send_request(
        &mut self,
        exchange: ExchangeType,
        payloads: Vec<IkePayload>,
        pending: PendingExchange,
        now: Instant,
    ) -> Result<()> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| Error::InvalidState("No IKE keys yet".to_string()))?;
        let msg_id = self.local_msg_id;
        let sealed = seal_message(
            self.provider.as_ref(),
            &keys.sk_ei,
            self.local_spi,
            self.peer_spi,
            exchange,
            IkeFlags::request(true),
            msg_id,
            &payloads,
        )?;

        let datagrams = if self.peer_supports_fragmentation
            && sealed.len() > self.params.fragment_threshold()
        {
            let frags = fragment_message(
                self.provider.as_ref(),
                &keys.sk_ei,
                self.local_spi,
                self.peer_spi,
                exchange,
                IkeFlags::request(true),
                msg_id,
                &payloads,
                self.params.fragment_threshold(),
            )?;
            self.metrics.record_fragments_sent(frags.len() as u64);
            logging::log_fragmentation(msg_id, frags.len());
            frags
        } else {
            vec![sealed]
        };

        logging::log_exchange_sent(
            exchange.name(),
            msg_id,
            datagrams.iter().map(|d| d.len()).sum(),
            datagrams.len(),
        );
        self.retransmitter.register(msg_id, datagrams.clone(), now)?;
        self.outbox.extend(datagrams);
        self.local_msg_id += 1;
        self.pending = Some(pending);
        Ok(())
    }

    fn send_response(
        &mut self,
        exchange: ExchangeType,
        payloads: Vec<IkePayload>,
        msg_id: u32,
    ) -> Result<()> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| Error::InvalidState("No IKE keys yet".to_string()))?;
        let sealed = seal_message(
            self.provider.as_ref(),
            &keys.sk_ei,
            self.local_spi,
            self.peer_spi,
            exchange,
            IkeFlags::response(true),
            msg_id,
            &payloads,
        )?;
        self.outbox.push(sealed);
        Ok(())
    }

    /// SA, TSi, TSr payloads offering a child, in wire order
    fn child_negotiation_payloads(&self, child: &ChildSession) -> Vec<IkePayload> {
        let proposals: Vec<_> = child
            .params()
            .proposals()
            .iter()
            .enumerate()
            .map(|(i, p)| p.to_wire((i + 1) as u8, child.local_spi().to_be_bytes().to_vec()))
            .collect();
        vec![
            IkePayload::Sa(SaPayload::new(proposals)),
            IkePayload::TsI(TsPayload::new(child.params().inbound_ts().to_vec())),
            IkePayload::TsR(TsPayload::new(child.params().outbound_ts().to_vec())),
        ]
    }

    fn local_signed_octets(&self) -> Result<Vec<u8>> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| Error::InvalidState("No IKE keys".to_string()))?;
        let prf = self
            .negotiated
            .as_ref()
            .map(|n| PrfAlgorithm::from_transform(n.prf))
            .ok_or_else(|| Error::InvalidState("No negotiated IKE SA".to_string()))?;
        Ok(construct_signed_octets(
            prf,
            &self.init_request_bytes,
            &self.nonce_r,
            &keys.sk_pi,
            &self.params.local_id().to_payload_data(),
        ))
    }

    fn compute_local_auth(&self, key: Vec<u8>) -> Result<AuthPayload> {
        let prf = self
            .negotiated
            .as_ref()
            .map(|n| PrfAlgorithm::from_transform(n.prf))
            .ok_or_else(|| Error::InvalidState("No negotiated IKE SA".to_string()))?;
        let octets = self.local_signed_octets()?;
        Ok(compute_psk_auth(prf, &key, &octets))
    }

    /// Key for the shared-key MIC after EAP: the exported MSK when the method
    /// provided one, otherwise SK_p (RFC 7296 §2.16)
    fn eap_auth_key(&self, local: bool) -> Result<Vec<u8>> {
        if let Some(msk) = &self.eap_msk {
            return Ok(msk.clone());
        }
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| Error::InvalidState("No IKE keys".to_string()))?;
        Ok(if local {
            keys.sk_pi.clone()
        } else {
            keys.sk_pr.clone()
        })
    }

    fn verify_peer_auth(&self, id_r: &IdPayload, auth: &AuthPayload) -> Result<()> {
        if id_r != self.params.remote_id() {
            return Err(Error::AuthenticationFailed(format!(
                "Peer identity mismatch: expected {:?}",
                self.params.remote_id().as_string()
            )));
        }

        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| Error::InvalidState("No IKE keys".to_string()))?;
        let prf = self
            .negotiated
            .as_ref()
            .map(|n| PrfAlgorithm::from_transform(n.prf))
            .ok_or_else(|| Error::InvalidState("No negotiated IKE SA".to_string()))?;
        let octets = construct_signed_octets(
            prf,
            &self.init_response_bytes,
            &self.nonce_i,
            &keys.sk_pr,
            &id_r.to_payload_data(),
        );

        match self.params.auth() {
            IkeAuthConfig::PresharedKey(psk) => verify_psk_auth(prf, psk, &octets, auth),
            IkeAuthConfig::DigitalSignature { trust_anchor, .. } => self
                .provider
                .verify_signature(trust_anchor, &octets, &auth.auth_data),
            IkeAuthConfig::Eap { .. } => {
                let key = self.eap_auth_key(false)?;
                verify_psk_auth(prf, &key, &octets, auth)
            }
        }
    }

    /// Pull the nonce and (for PFS exchanges) the DH secret belonging to the
    /// exchange that just completed
    fn take_exchange_crypto(&mut self, msg: &IkeMessage) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let nonce_i = std::mem::take(&mut self.nonce_exchange);
        let secret = match self.dh.take() {
            Some(dh) => {
                let ke = msg.find(|p| match p {
                    IkePayload::Ke(ke) => Some(ke.clone()),
                    _ => None,
                });
                match ke {
                    Some(ke) => {
                        let group = DhGroup::from_u16(ke.dh_group).ok_or_else(|| {
                            Error::InvalidMessage(format!("Unknown DH group {}", ke.dh_group))
                        })?;
                        Some(self.provider.compute_shared_secret(
                            group,
                            &dh.private,
                            &ke.key_data,
                        )?)
                    }
                    None => None,
                }
            }
            None => None,
        };
        Ok((nonce_i, secret))
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Error teardown: children report plain Closed, the IKE SA carries the
    /// error
    fn fail_session(&mut self, error: Error, notify_data: Option<Vec<u8>>) {
        if self.state != IkeState::Established {
            self.metrics.record_handshake_failed();
        }
        self.retransmitter.abandon();
        self.remove_all_children();
        let session_error = SessionError {
            error,
            notify_data,
        };
        self.events.ike(IkeEvent::ClosedWithError(session_error));
        self.transition(IkeState::Closed);
    }

    fn teardown_normal(&mut self) {
        self.remove_all_children();
        self.events.ike(IkeEvent::Closed);
        self.transition(IkeState::Closed);
    }

    fn remove_all_children(&mut self) {
        let ids: Vec<u32> = self.children.iter().map(|c| c.id()).collect();
        for child_id in ids {
            let pair = match self.child_mut(child_id) {
                Some(c) => c.close(),
                None => None,
            };
            if let Some(pair) = pair {
                let _ = self
                    .installer
                    .remove(&pair.inbound, TransformDirection::Inbound);
                let _ = self
                    .installer
                    .remove(&pair.outbound, TransformDirection::Outbound);
                self.events.child(
                    child_id,
                    ChildEvent::TransformDeleted {
                        inbound: pair.inbound,
                        outbound: pair.outbound,
                    },
                );
            }
            self.events.child(child_id, ChildEvent::Closed);
        }
        self.children.clear();
        // A first child that never reached IKE_AUTH still gets its Closed
        if let Some((_, child_id)) = self.staged_child.take() {
            self.events.child(child_id, ChildEvent::Closed);
        }
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

fn find_error_notify(msg: &IkeMessage) -> Option<NotifyPayload> {
    msg.find(|p| match p {
        IkePayload::Notify(n) if n.is_error() => Some(n.clone()),
        _ => None,
    })
}

fn notify_to_error(notify: &NotifyPayload) -> Error {
    match notify.known_type() {
        Some(NotifyType::NoProposalChosen) => Error::NoProposalChosen,
        Some(NotifyType::AuthenticationFailed) => {
            Error::AuthenticationFailed("Peer rejected authentication".to_string())
        }
        Some(NotifyType::TsUnacceptable) => Error::TsUnacceptable,
        Some(NotifyType::UnsupportedCriticalPayload) => Error::UnknownCriticalPayload(
            notify.data.first().copied().unwrap_or(0),
        ),
        _ => Error::InvalidMessage(format!("Error notify {}", notify.notify_type)),
    }
}

fn encr_key_len(et: &EncryptionTransform) -> usize {
    match et.algorithm {
        EncryptionId::ChaCha20Poly1305 => 32,
        _ => et.key_len.map(|bits| bits as usize / 8).unwrap_or(0),
    }
}

fn integ_key_len(integ: Option<IntegrityId>) -> usize {
    match integ {
        None | Some(IntegrityId::None) => 0,
        Some(IntegrityId::HmacSha256_128) => 32,
        Some(IntegrityId::HmacSha384_192) => 48,
        Some(IntegrityId::HmacSha512_256) => 64,
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn random_nonzero_u64() -> u64 {
    loop {
        let v = rand::thread_rng().next_u64();
        if v != 0 {
            return v;
        }
    }
}

fn random_nonzero_u32() -> u32 {
    loop {
        let v = rand::thread_rng().next_u32();
        if v != 0 {
            return v;
        }
    }
}
