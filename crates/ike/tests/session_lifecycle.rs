//! End-to-end exercises of the session engine against a scripted responder.
//!
//! The responder side is built by hand from the wire codecs. With the
//! passthrough crypto provider both sides derive identical key material from
//! the public handshake values, so the responder can seal and open everything
//! the engine sends.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use kestrel_ike::crypto::{
    compute_psk_auth, construct_signed_octets, verify_psk_auth, ChildKeys, IkeKeys,
    PassthroughCrypto, PrfAlgorithm,
};
use kestrel_ike::ikev2::constants::{ExchangeType, IkeFlags, NotifyType, IKE_HEADER_SIZE};
use kestrel_ike::ikev2::fragment::fragment_message;
use kestrel_ike::ikev2::message::{open_message, seal_message, IkeMessage};
use kestrel_ike::ikev2::payload::{
    AuthPayload, DeletePayload, IdPayload, IkePayload, KePayload, NoncePayload, NotifyPayload,
    PayloadHeader, SaPayload, TrafficSelector, TsPayload,
};
use kestrel_ike::ikev2::proposal::{
    ChildSaProposal, DhGroup, EncryptionTransform, IkeSaProposal, PrfId,
};
use kestrel_ike::ikev2::payload::EapPayload;
use kestrel_ike::transport::NullInstaller;
use kestrel_ike::{
    ChildEvent, ChildSessionParams, EapAuthenticator, EapMethod, EapOutcome, Error, IkeAuthConfig,
    IkeEvent, IkeSessionCore, IkeSessionParams, IkeState, SessionEvent, TransformPair,
};

const PSK: &[u8] = b"swordfish";
const RESPONDER_SPI: u64 = 0xB00B_5000_DEAD_BEEF;
const SHARED_SECRET: [u8; 32] = [0x5a; 32];

fn ike_proposal() -> IkeSaProposal {
    IkeSaProposal::builder()
        .add_encryption(EncryptionTransform::aes_gcm(256))
        .add_prf(PrfId::HmacSha256)
        .add_dh_group(DhGroup::Group14)
        .build()
        .unwrap()
}

fn child_proposal() -> ChildSaProposal {
    ChildSaProposal::builder()
        .add_encryption(EncryptionTransform::aes_gcm(128))
        .build()
        .unwrap()
}

fn session_params_with(auth: IkeAuthConfig) -> IkeSessionParams {
    IkeSessionParams::builder("203.0.113.1:500".parse().unwrap())
        .add_proposal(ike_proposal())
        .with_local_id(IdPayload::from_fqdn("client.test"))
        .with_remote_id(IdPayload::from_fqdn("server.test"))
        .with_auth(auth)
        .build()
        .unwrap()
}

fn session_params() -> IkeSessionParams {
    session_params_with(IkeAuthConfig::PresharedKey(PSK.to_vec()))
}

fn child_params() -> ChildSessionParams {
    ChildSessionParams::tunnel()
        .add_proposal(child_proposal())
        .build()
        .unwrap()
}

/// Route engine tracing through the test harness, filtered by RUST_LOG
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn new_core() -> (IkeSessionCore, mpsc::UnboundedReceiver<SessionEvent>) {
    init_tracing();
    IkeSessionCore::new(
        session_params(),
        child_params(),
        Arc::new(PassthroughCrypto::new()),
        Arc::new(NullInstaller::new()),
        None,
    )
}

/// The scripted peer: holds everything needed to answer the engine
struct Responder {
    provider: PassthroughCrypto,
    prf: PrfAlgorithm,
    spi_i: u64,
    nonce_i: Vec<u8>,
    nonce_r: Vec<u8>,
    init_request: Vec<u8>,
    init_response: Vec<u8>,
    keys: Option<IkeKeys>,
    esp_spi: u32,
}

impl Responder {
    fn new() -> Self {
        init_tracing();
        Responder {
            provider: PassthroughCrypto::new(),
            prf: PrfAlgorithm::HmacSha256,
            spi_i: 0,
            nonce_i: Vec::new(),
            nonce_r: vec![0xBB; 32],
            init_request: Vec::new(),
            init_response: Vec::new(),
            keys: None,
            esp_spi: 0x0E5B_0001,
        }
    }

    fn keys(&self) -> &IkeKeys {
        self.keys.as_ref().expect("keys derived")
    }

    /// Answer the IKE_SA_INIT request and derive the shared key material
    fn answer_init(&mut self, request: &[u8]) -> Vec<u8> {
        let msg = IkeMessage::from_bytes(request).unwrap();
        assert_eq!(msg.header.exchange_type, ExchangeType::IkeSaInit);
        assert_eq!(msg.header.message_id, 0);
        self.spi_i = msg.header.initiator_spi;
        self.init_request = request.to_vec();
        self.nonce_i = msg
            .find(|p| match p {
                IkePayload::Nonce(n) => Some(n.nonce.clone()),
                _ => None,
            })
            .unwrap();

        let payloads = vec![
            IkePayload::Sa(SaPayload::new(vec![ike_proposal().to_wire(1, Vec::new())])),
            IkePayload::Ke(KePayload::new(DhGroup::Group14.to_u16(), vec![0x44; 32])),
            IkePayload::Nonce(NoncePayload::new(self.nonce_r.clone()).unwrap()),
            IkePayload::Notify(NotifyPayload::new(NotifyType::FragmentationSupported)),
        ];
        let response = IkeMessage::new(
            self.spi_i,
            RESPONDER_SPI,
            ExchangeType::IkeSaInit,
            IkeFlags::response(false),
            0,
            payloads,
        )
        .to_bytes()
        .unwrap();
        self.init_response = response.clone();

        self.keys = Some(IkeKeys::derive(
            self.prf,
            &self.nonce_i,
            &self.nonce_r,
            &SHARED_SECRET,
            self.spi_i,
            RESPONDER_SPI,
            32,
            0,
        ));
        response
    }

    fn open(&self, datagram: &[u8]) -> IkeMessage {
        open_message(&self.provider, &self.keys().sk_ei, datagram).unwrap()
    }

    fn seal(&self, message_id: u32, payloads: &[IkePayload]) -> Vec<u8> {
        seal_message(
            &self.provider,
            &self.keys().sk_er,
            self.spi_i,
            RESPONDER_SPI,
            ExchangeType::IkeAuth,
            IkeFlags::response(false),
            message_id,
            payloads,
        )
        .unwrap()
    }

    fn seal_as(
        &self,
        exchange: ExchangeType,
        message_id: u32,
        payloads: &[IkePayload],
    ) -> Vec<u8> {
        seal_message(
            &self.provider,
            &self.keys().sk_er,
            self.spi_i,
            RESPONDER_SPI,
            exchange,
            IkeFlags::response(false),
            message_id,
            payloads,
        )
        .unwrap()
    }

    /// Verify the client's AUTH payload the way a real gateway would
    fn check_client_auth(&self, auth_req: &IkeMessage) {
        let id_i = auth_req
            .find(|p| match p {
                IkePayload::IdI(id) => Some(id.clone()),
                _ => None,
            })
            .expect("IDi present");
        let auth = auth_req
            .find(|p| match p {
                IkePayload::Auth(a) => Some(a.clone()),
                _ => None,
            })
            .expect("AUTH present");
        let octets = construct_signed_octets(
            self.prf,
            &self.init_request,
            &self.nonce_r,
            &self.keys().sk_pi,
            &id_i.to_payload_data(),
        );
        verify_psk_auth(self.prf, PSK, &octets, &auth).expect("client AUTH verifies");
    }

    fn responder_auth(&self) -> AuthPayload {
        let id_r = IdPayload::from_fqdn("server.test");
        let octets = construct_signed_octets(
            self.prf,
            &self.init_response,
            &self.nonce_i,
            &self.keys().sk_pr,
            &id_r.to_payload_data(),
        );
        compute_psk_auth(self.prf, PSK, &octets)
    }

    /// The payloads of a successful IKE_AUTH response
    fn auth_response_payloads(&self) -> Vec<IkePayload> {
        vec![
            IkePayload::IdR(IdPayload::from_fqdn("server.test")),
            IkePayload::Auth(self.responder_auth()),
            IkePayload::Sa(SaPayload::new(vec![
                child_proposal().to_wire(1, self.esp_spi.to_be_bytes().to_vec())
            ])),
            IkePayload::TsI(TsPayload::new(vec![TrafficSelector::all_ipv4()])),
            IkePayload::TsR(TsPayload::new(vec![TrafficSelector::all_ipv4()])),
        ]
    }
}

/// Drive a core through the full handshake; returns the established child's
/// transform pair as reported by the TransformCreated event
fn establish(
    core: &mut IkeSessionCore,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    responder: &mut Responder,
    now: Instant,
) -> TransformPair {
    core.open(now).unwrap();
    let init_req = core.take_datagrams().remove(0);
    let init_resp = responder.answer_init(&init_req);
    core.handle_datagram(&init_resp, now).unwrap();

    let auth_req_bytes = core.take_datagrams().remove(0);
    let auth_req = responder.open(&auth_req_bytes);
    assert_eq!(auth_req.header.message_id, 1);
    responder.check_client_auth(&auth_req);

    let auth_resp = responder.seal(1, &responder.auth_response_payloads());
    core.handle_datagram(&auth_resp, now).unwrap();

    match events.try_recv().unwrap() {
        SessionEvent::Ike(IkeEvent::Opened) => {}
        other => panic!("Expected Opened, got {:?}", other),
    }
    let pair = match events.try_recv().unwrap() {
        SessionEvent::Child {
            child_id: 1,
            event: ChildEvent::TransformCreated { inbound, outbound },
        } => TransformPair { inbound, outbound },
        other => panic!("Expected TransformCreated, got {:?}", other),
    };
    match events.try_recv().unwrap() {
        SessionEvent::Child {
            child_id: 1,
            event: ChildEvent::Opened { .. },
        } => {}
        other => panic!("Expected child Opened, got {:?}", other),
    }
    pair
}

#[test]
fn handshake_establishes_ike_and_child() {
    let (mut core, mut events) = new_core();
    let mut responder = Responder::new();
    let now = Instant::now();

    let pair = establish(&mut core, &mut events, &mut responder, now);

    assert_eq!(core.state(), IkeState::Established);
    assert_eq!(core.peer_spi(), RESPONDER_SPI);
    // IKE_SA_INIT used 0, IKE_AUTH used 1
    assert_eq!(core.local_message_id(), 2);
    assert!(events.try_recv().is_err());

    // Child material matches an independent derivation from the handshake
    let expected = ChildKeys::derive(
        PrfAlgorithm::HmacSha256,
        &responder.keys().sk_d,
        &responder.nonce_i,
        &responder.nonce_r,
        None,
        16,
        0,
    );
    assert_eq!(pair.outbound.spi, responder.esp_spi);
    assert_eq!(pair.outbound.encryption_key, expected.sk_ei);
    assert_eq!(pair.inbound.encryption_key, expected.sk_er);
    assert_ne!(pair.inbound.spi, 0);

    let snapshot = core.metrics().snapshot();
    assert_eq!(snapshot.handshakes_completed, 1);
    assert_eq!(snapshot.children_created, 1);
}

#[test]
fn no_proposal_chosen_fails_handshake() {
    let (mut core, mut events) = new_core();
    let now = Instant::now();

    core.open(now).unwrap();
    let init_req = core.take_datagrams().remove(0);
    let msg = IkeMessage::from_bytes(&init_req).unwrap();

    let reject = IkeMessage::new(
        msg.header.initiator_spi,
        RESPONDER_SPI,
        ExchangeType::IkeSaInit,
        IkeFlags::response(false),
        0,
        vec![IkePayload::Notify(NotifyPayload::new(
            NotifyType::NoProposalChosen,
        ))],
    )
    .to_bytes()
    .unwrap();
    core.handle_datagram(&reject, now).unwrap();

    assert_eq!(core.state(), IkeState::Closed);

    // The never-negotiated child reports a plain Closed, the IKE SA carries
    // the error with the (empty) notify data attached
    match events.try_recv().unwrap() {
        SessionEvent::Child {
            child_id: 1,
            event: ChildEvent::Closed,
        } => {}
        other => panic!("Expected child Closed, got {:?}", other),
    }
    match events.try_recv().unwrap() {
        SessionEvent::Ike(IkeEvent::ClosedWithError(err)) => {
            assert!(matches!(err.error, Error::NoProposalChosen));
            assert_eq!(err.notify_data, Some(Vec::new()));
        }
        other => panic!("Expected ClosedWithError, got {:?}", other),
    }
    assert_eq!(core.metrics().snapshot().proposal_failures, 1);
}

#[test]
fn child_rekey_is_make_before_break() {
    let (mut core, mut events) = new_core();
    let mut responder = Responder::new();
    let now = Instant::now();
    let original_pair = establish(&mut core, &mut events, &mut responder, now);

    core.request_rekey_child(1, now).unwrap();
    let rekey_req_bytes = core.take_datagrams().remove(0);
    let rekey_req = responder.open(&rekey_req_bytes);
    assert_eq!(rekey_req.header.exchange_type, ExchangeType::CreateChildSa);
    assert_eq!(rekey_req.header.message_id, 2);

    // The request marks which SA it replaces
    let rekey_notify = rekey_req
        .find(|p| match p {
            IkePayload::Notify(n) if n.known_type() == Some(NotifyType::RekeySa) => {
                Some(n.spi.clone())
            }
            _ => None,
        })
        .expect("REKEY_SA notify");
    assert_eq!(rekey_notify, original_pair.inbound.spi.to_be_bytes().to_vec());

    let nonce_r2 = vec![0xC7; 32];
    let new_peer_esp: u32 = 0x0E5B_0002;
    let rekey_resp = responder.seal_as(
        ExchangeType::CreateChildSa,
        2,
        &[
            IkePayload::Sa(SaPayload::new(vec![
                child_proposal().to_wire(1, new_peer_esp.to_be_bytes().to_vec())
            ])),
            IkePayload::Nonce(NoncePayload::new(nonce_r2).unwrap()),
            IkePayload::TsI(TsPayload::new(vec![TrafficSelector::all_ipv4()])),
            IkePayload::TsR(TsPayload::new(vec![TrafficSelector::all_ipv4()])),
        ],
    );
    core.handle_datagram(&rekey_resp, now).unwrap();

    // New pair announced before anything is deleted
    let new_pair = match events.try_recv().unwrap() {
        SessionEvent::Child {
            child_id: 1,
            event: ChildEvent::TransformCreated { inbound, outbound },
        } => TransformPair { inbound, outbound },
        other => panic!("Expected TransformCreated, got {:?}", other),
    };
    assert_eq!(new_pair.outbound.spi, new_peer_esp);
    assert_ne!(new_pair.inbound.spi, original_pair.inbound.spi);
    assert_ne!(
        new_pair.outbound.encryption_key,
        original_pair.outbound.encryption_key
    );

    // The old SA's delete follows on the next message ID
    let delete_req_bytes = core.take_datagrams().remove(0);
    let delete_req = responder.open(&delete_req_bytes);
    assert_eq!(delete_req.header.exchange_type, ExchangeType::Informational);
    assert_eq!(delete_req.header.message_id, 3);
    let deleted_spis = delete_req
        .find(|p| match p {
            IkePayload::Delete(d) => Some(d.spis.clone()),
            _ => None,
        })
        .expect("Delete payload");
    assert_eq!(
        deleted_spis,
        vec![original_pair.inbound.spi.to_be_bytes().to_vec()]
    );

    let delete_resp = responder.seal_as(ExchangeType::Informational, 3, &[]);
    core.handle_datagram(&delete_resp, now).unwrap();

    // Only now does the retired pair go away, byte for byte the original
    match events.try_recv().unwrap() {
        SessionEvent::Child {
            child_id: 1,
            event: ChildEvent::TransformDeleted { inbound, outbound },
        } => {
            assert_eq!(inbound, original_pair.inbound);
            assert_eq!(outbound, original_pair.outbound);
        }
        other => panic!("Expected TransformDeleted, got {:?}", other),
    }
    assert!(events.try_recv().is_err());
    assert_eq!(core.metrics().snapshot().child_rekeys, 1);
}

#[test]
fn ike_rekey_resets_message_counters() {
    let (mut core, mut events) = new_core();
    let mut responder = Responder::new();
    let now = Instant::now();
    establish(&mut core, &mut events, &mut responder, now);

    core.request_rekey_ike(now).unwrap();
    let rekey_req_bytes = core.take_datagrams().remove(0);
    let rekey_req = responder.open(&rekey_req_bytes);
    assert_eq!(rekey_req.header.exchange_type, ExchangeType::CreateChildSa);
    assert_eq!(rekey_req.header.message_id, 2);

    let new_spi_i_bytes = rekey_req
        .find(|p| match p {
            IkePayload::Sa(sa) => sa.proposals.first().map(|pr| pr.spi.clone()),
            _ => None,
        })
        .expect("SA with new SPI");
    assert_eq!(new_spi_i_bytes.len(), 8);
    let mut b = [0u8; 8];
    b.copy_from_slice(&new_spi_i_bytes);
    let new_spi_i = u64::from_be_bytes(b);
    assert_ne!(new_spi_i, core.local_spi());

    let new_spi_r: u64 = 0xFACE_FACE_FACE_0001;
    let rekey_resp = responder.seal_as(
        ExchangeType::CreateChildSa,
        2,
        &[
            IkePayload::Sa(SaPayload::new(vec![
                ike_proposal().to_wire(1, new_spi_r.to_be_bytes().to_vec())
            ])),
            IkePayload::Nonce(NoncePayload::new(vec![0xD1; 32]).unwrap()),
            IkePayload::Ke(KePayload::new(DhGroup::Group14.to_u16(), vec![0x55; 32])),
        ],
    );
    core.handle_datagram(&rekey_resp, now).unwrap();

    // The old SA is retired with a Delete under the old SPIs
    let delete_req_bytes = core.take_datagrams().remove(0);
    let header_spi_i = u64::from_be_bytes(delete_req_bytes[0..8].try_into().unwrap());
    assert_ne!(header_spi_i, new_spi_i);
    let delete_req = responder.open(&delete_req_bytes);
    assert_eq!(delete_req.header.exchange_type, ExchangeType::Informational);
    assert_eq!(delete_req.header.message_id, 3);

    let delete_resp = responder.seal_as(ExchangeType::Informational, 3, &[]);
    core.handle_datagram(&delete_resp, now).unwrap();

    // Counters restart and traffic moves to the new SPI pair
    assert_eq!(core.local_message_id(), 0);
    assert_eq!(core.local_spi(), new_spi_i);
    assert_eq!(core.peer_spi(), new_spi_r);
    assert_eq!(core.metrics().snapshot().ike_rekeys, 1);
    assert_eq!(core.state(), IkeState::Established);

    core.request_close_child(1, now).unwrap();
    let next_req = core.take_datagrams().remove(0);
    assert_eq!(
        u64::from_be_bytes(next_req[0..8].try_into().unwrap()),
        new_spi_i
    );
    assert_eq!(
        u32::from_be_bytes(next_req[20..24].try_into().unwrap()),
        0,
        "first request on the rekeyed SA uses message ID zero"
    );
}

#[test]
fn close_reports_children_before_ike() {
    let (mut core, mut events) = new_core();
    let mut responder = Responder::new();
    let now = Instant::now();
    let pair = establish(&mut core, &mut events, &mut responder, now);

    core.close(now);
    assert_eq!(core.state(), IkeState::Deleting);
    let delete_req_bytes = core.take_datagrams().remove(0);
    let delete_req = responder.open(&delete_req_bytes);
    assert_eq!(delete_req.header.exchange_type, ExchangeType::Informational);

    let delete_resp = responder.seal_as(ExchangeType::Informational, 2, &[]);
    core.handle_datagram(&delete_resp, now).unwrap();

    assert_eq!(core.state(), IkeState::Closed);
    match events.try_recv().unwrap() {
        SessionEvent::Child {
            child_id: 1,
            event: ChildEvent::TransformDeleted { inbound, .. },
        } => assert_eq!(inbound, pair.inbound),
        other => panic!("Expected TransformDeleted, got {:?}", other),
    }
    match events.try_recv().unwrap() {
        SessionEvent::Child {
            child_id: 1,
            event: ChildEvent::Closed,
        } => {}
        other => panic!("Expected child Closed, got {:?}", other),
    }
    match events.try_recv().unwrap() {
        SessionEvent::Ike(IkeEvent::Closed) => {}
        other => panic!("Expected IKE Closed, got {:?}", other),
    }
    assert!(events.try_recv().is_err());
}

#[test]
fn kill_emits_no_datagrams() {
    let (mut core, mut events) = new_core();
    let mut responder = Responder::new();
    let now = Instant::now();
    establish(&mut core, &mut events, &mut responder, now);

    core.kill();
    assert_eq!(core.state(), IkeState::Closed);
    assert!(core.take_datagrams().is_empty());

    // Teardown is still reported locally, children first
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::Child {
            child_id: 1,
            event: ChildEvent::TransformDeleted { .. }
        }
    ));
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::Child {
            child_id: 1,
            event: ChildEvent::Closed
        }
    ));
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::Ike(IkeEvent::Closed)
    ));
}

#[test]
fn fragmented_auth_response_is_reassembled() {
    let (mut core, mut events) = new_core();
    let mut responder = Responder::new();
    let now = Instant::now();

    core.open(now).unwrap();
    let init_req = core.take_datagrams().remove(0);
    let init_resp = responder.answer_init(&init_req);
    core.handle_datagram(&init_resp, now).unwrap();
    core.take_datagrams();

    // Pad the response so it splits into several fragments
    let mut payloads = responder.auth_response_payloads();
    payloads.push(IkePayload::VendorId(vec![0xEE; 2000]));
    let fragments = fragment_message(
        &responder.provider,
        &responder.keys().sk_er,
        responder.spi_i,
        RESPONDER_SPI,
        ExchangeType::IkeAuth,
        IkeFlags::response(false),
        1,
        &payloads,
        900,
    )
    .unwrap();
    assert!(fragments.len() >= 3);

    // Deliver out of order with a duplicate thrown in
    core.handle_datagram(&fragments[1], now).unwrap();
    core.handle_datagram(&fragments[1], now).unwrap();
    core.handle_datagram(&fragments[0], now).unwrap();
    for fragment in &fragments[2..] {
        core.handle_datagram(fragment, now).unwrap();
    }

    assert_eq!(core.state(), IkeState::Established);
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::Ike(IkeEvent::Opened)
    ));
    assert!(core.metrics().snapshot().fragments_received >= 3);
}

#[test]
fn inconsistent_fragment_total_is_rejected() {
    let (mut core, _events) = new_core();
    let mut responder = Responder::new();
    let now = Instant::now();

    core.open(now).unwrap();
    let init_req = core.take_datagrams().remove(0);
    let init_resp = responder.answer_init(&init_req);
    core.handle_datagram(&init_resp, now).unwrap();
    core.take_datagrams();

    let mut payloads = responder.auth_response_payloads();
    payloads.push(IkePayload::VendorId(vec![0xEE; 2000]));
    let fragments = fragment_message(
        &responder.provider,
        &responder.keys().sk_er,
        responder.spi_i,
        RESPONDER_SPI,
        ExchangeType::IkeAuth,
        IkeFlags::response(false),
        1,
        &payloads,
        900,
    )
    .unwrap();

    core.handle_datagram(&fragments[0], now).unwrap();

    // A fragment claiming a different total contradicts the buffered state
    let mut bad = fragments[1].clone();
    let off = IKE_HEADER_SIZE + PayloadHeader::SIZE + 2;
    bad[off..off + 2].copy_from_slice(&42u16.to_be_bytes());
    let result = core.handle_datagram(&bad, now);
    assert!(matches!(result, Err(Error::FragmentMismatch(_))));

    // The exchange is lost but the session survives to retransmit
    assert_eq!(core.state(), IkeState::IkeAuthInProgress);
}

#[test]
fn dpd_probe_sent_when_idle() {
    let (mut core, mut events) = new_core();
    let mut responder = Responder::new();
    let now = Instant::now();
    establish(&mut core, &mut events, &mut responder, now);

    let deadline = core.next_deadline().expect("DPD deadline armed");
    core.handle_timeout(deadline);

    let probe_bytes = core.take_datagrams().remove(0);
    let probe = responder.open(&probe_bytes);
    assert_eq!(probe.header.exchange_type, ExchangeType::Informational);
    assert!(probe.payloads.is_empty());
    assert!(!probe.header.flags.is_response());
    assert_eq!(core.metrics().snapshot().dpd_checks, 1);

    let reply = responder.seal_as(ExchangeType::Informational, probe.header.message_id, &[]);
    core.handle_datagram(&reply, deadline).unwrap();
    assert_eq!(core.state(), IkeState::Established);
}

#[test]
fn peer_delete_closes_session() {
    let (mut core, mut events) = new_core();
    let mut responder = Responder::new();
    let now = Instant::now();
    establish(&mut core, &mut events, &mut responder, now);

    // Peer-initiated INFORMATIONAL request deleting the IKE SA
    let delete_req = seal_message(
        &responder.provider,
        &responder.keys().sk_er,
        responder.spi_i,
        RESPONDER_SPI,
        ExchangeType::Informational,
        IkeFlags::request(false),
        0,
        &[IkePayload::Delete(DeletePayload::ike())],
    )
    .unwrap();
    core.handle_datagram(&delete_req, now).unwrap();

    // We acknowledge before tearing down
    let ack_bytes = core.take_datagrams().remove(0);
    let ack = responder.open(&ack_bytes);
    assert!(ack.header.flags.is_response());
    assert_eq!(ack.header.message_id, 0);

    assert_eq!(core.state(), IkeState::Closed);
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::Child {
            child_id: 1,
            event: ChildEvent::TransformDeleted { .. }
        }
    ));
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::Child {
            child_id: 1,
            event: ChildEvent::Closed
        }
    ));
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::Ike(IkeEvent::Closed)
    ));
}

/// Answers the first EAP request, completes on the second
struct ScriptedEap {
    rounds: usize,
}

impl EapAuthenticator for ScriptedEap {
    fn process_request(&mut self, _request: &[u8]) -> kestrel_ike::Result<EapOutcome> {
        self.rounds += 1;
        if self.rounds == 1 {
            Ok(EapOutcome::Response(b"identity-response".to_vec()))
        } else {
            Ok(EapOutcome::Success { msk: None })
        }
    }
}

#[test]
fn eap_rounds_use_fresh_message_ids() {
    let (mut core, mut events) = IkeSessionCore::new(
        session_params_with(IkeAuthConfig::Eap {
            methods: vec![EapMethod::Aka],
        }),
        child_params(),
        Arc::new(PassthroughCrypto::new()),
        Arc::new(NullInstaller::new()),
        Some(Box::new(ScriptedEap { rounds: 0 })),
    );
    let mut responder = Responder::new();
    let now = Instant::now();

    core.open(now).unwrap();
    let init_resp = responder.answer_init(&core.take_datagrams().remove(0));
    core.handle_datagram(&init_resp, now).unwrap();

    // Requesting EAP means the first IKE_AUTH carries no AUTH payload
    let first = responder.open(&core.take_datagrams().remove(0));
    assert_eq!(first.header.message_id, 1);
    assert!(!first.payloads.iter().any(|p| matches!(p, IkePayload::Auth(_))));
    assert!(first.payloads.iter().any(|p| matches!(p, IkePayload::IdI(_))));

    // EAP challenge, answered under the next message ID
    let challenge = responder.seal(1, &[IkePayload::Eap(EapPayload::new(b"challenge-1".to_vec()))]);
    core.handle_datagram(&challenge, now).unwrap();
    let eap_reply = responder.open(&core.take_datagrams().remove(0));
    assert_eq!(eap_reply.header.message_id, 2);
    let message = eap_reply
        .find(|p| match p {
            IkePayload::Eap(e) => Some(e.message.clone()),
            _ => None,
        })
        .expect("EAP reply");
    assert_eq!(message, b"identity-response".to_vec());

    // Second challenge completes the method; the engine sends its AUTH
    let challenge = responder.seal(2, &[IkePayload::Eap(EapPayload::new(b"challenge-2".to_vec()))]);
    core.handle_datagram(&challenge, now).unwrap();
    let final_req = responder.open(&core.take_datagrams().remove(0));
    assert_eq!(final_req.header.message_id, 3);
    let auth = final_req
        .find(|p| match p {
            IkePayload::Auth(a) => Some(a.clone()),
            _ => None,
        })
        .expect("final AUTH");

    // Without an MSK the shared-key MIC is keyed by SK_pi (RFC 7296 §2.16)
    let octets = construct_signed_octets(
        responder.prf,
        &responder.init_request,
        &responder.nonce_r,
        &responder.keys().sk_pi,
        &IdPayload::from_fqdn("client.test").to_payload_data(),
    );
    verify_psk_auth(responder.prf, &responder.keys().sk_pi, &octets, &auth)
        .expect("EAP AUTH keyed by SK_pi");

    // Responder closes with its own SK_pr-keyed AUTH plus the child payloads
    let id_r = IdPayload::from_fqdn("server.test");
    let octets_r = construct_signed_octets(
        responder.prf,
        &responder.init_response,
        &responder.nonce_i,
        &responder.keys().sk_pr,
        &id_r.to_payload_data(),
    );
    let responder_auth = compute_psk_auth(responder.prf, &responder.keys().sk_pr, &octets_r);
    let final_resp = responder.seal(
        3,
        &[
            IkePayload::IdR(id_r),
            IkePayload::Auth(responder_auth),
            IkePayload::Sa(SaPayload::new(vec![
                child_proposal().to_wire(1, responder.esp_spi.to_be_bytes().to_vec())
            ])),
            IkePayload::TsI(TsPayload::new(vec![TrafficSelector::all_ipv4()])),
            IkePayload::TsR(TsPayload::new(vec![TrafficSelector::all_ipv4()])),
        ],
    );
    core.handle_datagram(&final_resp, now).unwrap();

    assert_eq!(core.state(), IkeState::Established);
    assert_eq!(core.local_message_id(), 4);
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::Ike(IkeEvent::Opened)
    ));
}

#[test]
fn second_child_negotiated_after_establishment() {
    let (mut core, mut events) = new_core();
    let mut responder = Responder::new();
    let now = Instant::now();
    establish(&mut core, &mut events, &mut responder, now);

    let child_id = core.request_open_child(child_params(), now).unwrap();
    assert_eq!(child_id, 2);

    let req_bytes = core.take_datagrams().remove(0);
    let req = responder.open(&req_bytes);
    assert_eq!(req.header.exchange_type, ExchangeType::CreateChildSa);

    let second_esp: u32 = 0x0E5B_0003;
    let resp = responder.seal_as(
        ExchangeType::CreateChildSa,
        req.header.message_id,
        &[
            IkePayload::Sa(SaPayload::new(vec![
                child_proposal().to_wire(1, second_esp.to_be_bytes().to_vec())
            ])),
            IkePayload::Nonce(NoncePayload::new(vec![0xE2; 32]).unwrap()),
            IkePayload::TsI(TsPayload::new(vec![TrafficSelector::all_ipv4()])),
            IkePayload::TsR(TsPayload::new(vec![TrafficSelector::all_ipv4()])),
        ],
    );
    core.handle_datagram(&resp, now).unwrap();

    match events.try_recv().unwrap() {
        SessionEvent::Child {
            child_id: 2,
            event: ChildEvent::TransformCreated { outbound, .. },
        } => assert_eq!(outbound.spi, second_esp),
        other => panic!("Expected TransformCreated, got {:?}", other),
    }
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::Child {
            child_id: 2,
            event: ChildEvent::Opened { .. }
        }
    ));
    assert_eq!(core.metrics().snapshot().children_created, 2);
}

#[test]
fn unmatchable_init_response_closes_session() {
    let (mut core, mut events) = new_core();
    let now = Instant::now();

    core.open(now).unwrap();
    let init_req = core.take_datagrams().remove(0);
    let msg = IkeMessage::from_bytes(&init_req).unwrap();

    // A syntactically fine response whose proposal we never offered
    let off_proposal = IkeSaProposal::builder()
        .add_encryption(EncryptionTransform::aes_gcm(128))
        .add_prf(PrfId::HmacSha256)
        .add_dh_group(DhGroup::Group14)
        .build()
        .unwrap();
    let resp = IkeMessage::new(
        msg.header.initiator_spi,
        RESPONDER_SPI,
        ExchangeType::IkeSaInit,
        IkeFlags::response(false),
        0,
        vec![
            IkePayload::Sa(SaPayload::new(vec![off_proposal.to_wire(1, Vec::new())])),
            IkePayload::Ke(KePayload::new(DhGroup::Group14.to_u16(), vec![0x44; 32])),
            IkePayload::Nonce(NoncePayload::new(vec![0xBB; 32]).unwrap()),
        ],
    )
    .to_bytes()
    .unwrap();
    core.handle_datagram(&resp, now).unwrap();

    // The session closes instead of waiting on a request that was answered
    assert_eq!(core.state(), IkeState::Closed);
    assert!(core.next_deadline().is_none());
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::Child {
            child_id: 1,
            event: ChildEvent::Closed
        }
    ));
    match events.try_recv().unwrap() {
        SessionEvent::Ike(IkeEvent::ClosedWithError(err)) => {
            assert!(matches!(err.error, Error::NoProposalChosen));
            assert_eq!(err.notify_data, None);
        }
        other => panic!("Expected ClosedWithError, got {:?}", other),
    }
    assert_eq!(core.metrics().snapshot().proposal_failures, 1);
    assert_eq!(core.metrics().snapshot().handshakes_failed, 1);
}

#[test]
fn child_delete_exhaustion_keeps_session_alive() {
    let (mut core, mut events) = new_core();
    let mut responder = Responder::new();
    let now = Instant::now();
    establish(&mut core, &mut events, &mut responder, now);

    core.request_close_child(1, now).unwrap();
    let delete_req = responder.open(&core.take_datagrams().remove(0));
    assert_eq!(delete_req.header.exchange_type, ExchangeType::Informational);

    // Never answer; run the clock through the whole backoff schedule
    let mut at = now;
    let mut fired = 0;
    while core.metrics().snapshot().exchanges_timed_out == 0 {
        at = core.next_deadline().expect("retransmission deadline armed");
        core.handle_timeout(at);
        fired += 1;
        assert!(fired <= 8, "schedule must exhaust");
    }
    assert_eq!(core.metrics().snapshot().retransmissions, 4);

    // The unacknowledged child winds down locally; the IKE SA stays up
    assert_eq!(core.state(), IkeState::Established);
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::Child {
            child_id: 1,
            event: ChildEvent::TransformDeleted { .. }
        }
    ));
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::Child {
            child_id: 1,
            event: ChildEvent::Closed
        }
    ));
    assert!(events.try_recv().is_err());

    // A replacement child can be negotiated straight away
    core.take_datagrams();
    let child_id = core.request_open_child(child_params(), at).unwrap();
    assert_eq!(child_id, 2);
    assert!(!core.take_datagrams().is_empty());
}

fn pfs_child_proposal() -> ChildSaProposal {
    ChildSaProposal::builder()
        .add_encryption(EncryptionTransform::aes_gcm(128))
        .add_dh_group(DhGroup::Group14)
        .build()
        .unwrap()
}

#[test]
fn pfs_child_rekey_sends_ke_and_mixes_secret() {
    let (mut core, mut events) = new_core();
    let mut responder = Responder::new();
    let now = Instant::now();
    establish(&mut core, &mut events, &mut responder, now);

    let params = ChildSessionParams::tunnel()
        .add_proposal(pfs_child_proposal())
        .build()
        .unwrap();
    let child_id = core.request_open_child(params, now).unwrap();
    assert_eq!(child_id, 2);

    let req = responder.open(&core.take_datagrams().remove(0));
    assert_eq!(req.header.exchange_type, ExchangeType::CreateChildSa);
    let req_ke = req
        .find(|p| match p {
            IkePayload::Ke(ke) => Some(ke.clone()),
            _ => None,
        })
        .expect("KE in PFS child request");
    assert_eq!(req_ke.dh_group, DhGroup::Group14.to_u16());
    let nonce_i2 = req
        .find(|p| match p {
            IkePayload::Nonce(n) => Some(n.nonce.clone()),
            _ => None,
        })
        .unwrap();

    let esp2: u32 = 0x0E5B_0010;
    let nonce_r2 = vec![0xC2; 32];
    let resp = responder.seal_as(
        ExchangeType::CreateChildSa,
        req.header.message_id,
        &[
            IkePayload::Sa(SaPayload::new(vec![
                pfs_child_proposal().to_wire(1, esp2.to_be_bytes().to_vec())
            ])),
            IkePayload::Nonce(NoncePayload::new(nonce_r2.clone()).unwrap()),
            IkePayload::Ke(KePayload::new(DhGroup::Group14.to_u16(), vec![0x66; 32])),
            IkePayload::TsI(TsPayload::new(vec![TrafficSelector::all_ipv4()])),
            IkePayload::TsR(TsPayload::new(vec![TrafficSelector::all_ipv4()])),
        ],
    );
    core.handle_datagram(&resp, now).unwrap();

    let first_pair = match events.try_recv().unwrap() {
        SessionEvent::Child {
            child_id: 2,
            event: ChildEvent::TransformCreated { inbound, outbound },
        } => TransformPair { inbound, outbound },
        other => panic!("Expected TransformCreated, got {:?}", other),
    };
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::Child {
            child_id: 2,
            event: ChildEvent::Opened { .. }
        }
    ));

    // Keys mix the DH secret alongside the nonces
    let expected = ChildKeys::derive(
        PrfAlgorithm::HmacSha256,
        &responder.keys().sk_d,
        &nonce_i2,
        &nonce_r2,
        Some(SHARED_SECRET.as_slice()),
        16,
        0,
    );
    assert_eq!(first_pair.outbound.encryption_key, expected.sk_ei);

    // Rekeying the PFS child carries a fresh KE next to the REKEY_SA marker
    core.request_rekey_child(2, now).unwrap();
    let rekey_req = responder.open(&core.take_datagrams().remove(0));
    assert_eq!(rekey_req.header.exchange_type, ExchangeType::CreateChildSa);
    assert!(rekey_req
        .payloads
        .iter()
        .any(|p| matches!(p, IkePayload::Ke(_))));
    let rekey_marker = rekey_req
        .find(|p| match p {
            IkePayload::Notify(n) if n.known_type() == Some(NotifyType::RekeySa) => {
                Some(n.spi.clone())
            }
            _ => None,
        })
        .expect("REKEY_SA notify");
    assert_eq!(rekey_marker, first_pair.inbound.spi.to_be_bytes().to_vec());
    let nonce_i3 = rekey_req
        .find(|p| match p {
            IkePayload::Nonce(n) => Some(n.nonce.clone()),
            _ => None,
        })
        .unwrap();

    let esp3: u32 = 0x0E5B_0011;
    let nonce_r3 = vec![0xC3; 32];
    let rekey_resp = responder.seal_as(
        ExchangeType::CreateChildSa,
        rekey_req.header.message_id,
        &[
            IkePayload::Sa(SaPayload::new(vec![
                pfs_child_proposal().to_wire(1, esp3.to_be_bytes().to_vec())
            ])),
            IkePayload::Nonce(NoncePayload::new(nonce_r3.clone()).unwrap()),
            IkePayload::Ke(KePayload::new(DhGroup::Group14.to_u16(), vec![0x77; 32])),
            IkePayload::TsI(TsPayload::new(vec![TrafficSelector::all_ipv4()])),
            IkePayload::TsR(TsPayload::new(vec![TrafficSelector::all_ipv4()])),
        ],
    );
    core.handle_datagram(&rekey_resp, now).unwrap();

    let new_pair = match events.try_recv().unwrap() {
        SessionEvent::Child {
            child_id: 2,
            event: ChildEvent::TransformCreated { inbound, outbound },
        } => TransformPair { inbound, outbound },
        other => panic!("Expected TransformCreated, got {:?}", other),
    };
    assert_eq!(new_pair.outbound.spi, esp3);
    let expected = ChildKeys::derive(
        PrfAlgorithm::HmacSha256,
        &responder.keys().sk_d,
        &nonce_i3,
        &nonce_r3,
        Some(SHARED_SECRET.as_slice()),
        16,
        0,
    );
    assert_eq!(new_pair.outbound.encryption_key, expected.sk_ei);

    // The replaced pair is retired through the usual delete
    let delete_req = responder.open(&core.take_datagrams().remove(0));
    assert_eq!(delete_req.header.exchange_type, ExchangeType::Informational);
    let delete_resp =
        responder.seal_as(ExchangeType::Informational, delete_req.header.message_id, &[]);
    core.handle_datagram(&delete_resp, now).unwrap();
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::Child {
            child_id: 2,
            event: ChildEvent::TransformDeleted { .. }
        }
    ));
    assert_eq!(core.metrics().snapshot().child_rekeys, 1);
}

#[test]
fn create_child_response_without_nonce_fails_child() {
    let (mut core, mut events) = new_core();
    let mut responder = Responder::new();
    let now = Instant::now();
    establish(&mut core, &mut events, &mut responder, now);

    let child_id = core.request_open_child(child_params(), now).unwrap();
    assert_eq!(child_id, 2);
    let req = responder.open(&core.take_datagrams().remove(0));

    // Everything present except the nonce
    let resp = responder.seal_as(
        ExchangeType::CreateChildSa,
        req.header.message_id,
        &[
            IkePayload::Sa(SaPayload::new(vec![
                child_proposal().to_wire(1, 0x0E5B_0020u32.to_be_bytes().to_vec())
            ])),
            IkePayload::TsI(TsPayload::new(vec![TrafficSelector::all_ipv4()])),
            IkePayload::TsR(TsPayload::new(vec![TrafficSelector::all_ipv4()])),
        ],
    );
    core.handle_datagram(&resp, now).unwrap();

    // Only that child dies
    match events.try_recv().unwrap() {
        SessionEvent::Child {
            child_id: 2,
            event: ChildEvent::ClosedWithError(err),
        } => {
            assert!(matches!(err.error, Error::InvalidMessage(_)));
            assert_eq!(err.notify_data, None);
        }
        other => panic!("Expected ClosedWithError, got {:?}", other),
    }
    assert!(events.try_recv().is_err());
    assert_eq!(core.state(), IkeState::Established);

    // The exchange window is free for the next request
    let replacement = core.request_open_child(child_params(), now).unwrap();
    assert_eq!(replacement, 3);
    assert!(!core.take_datagrams().is_empty());
}

#[test]
fn auth_response_child_error_still_opens_ike() {
    let (mut core, mut events) = new_core();
    let mut responder = Responder::new();
    let now = Instant::now();

    core.open(now).unwrap();
    let init_resp = responder.answer_init(&core.take_datagrams().remove(0));
    core.handle_datagram(&init_resp, now).unwrap();
    let auth_req = responder.open(&core.take_datagrams().remove(0));
    responder.check_client_auth(&auth_req);

    // Valid AUTH, but the gateway refuses the embedded child's selectors
    let resp = responder.seal(
        1,
        &[
            IkePayload::IdR(IdPayload::from_fqdn("server.test")),
            IkePayload::Auth(responder.responder_auth()),
            IkePayload::Notify(NotifyPayload::new(NotifyType::TsUnacceptable)),
        ],
    );
    core.handle_datagram(&resp, now).unwrap();

    // The IKE SA is up, the first child reports its own failure
    assert_eq!(core.state(), IkeState::Established);
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::Ike(IkeEvent::Opened)
    ));
    match events.try_recv().unwrap() {
        SessionEvent::Child {
            child_id: 1,
            event: ChildEvent::ClosedWithError(err),
        } => {
            assert!(matches!(err.error, Error::TsUnacceptable));
            assert_eq!(err.notify_data, Some(Vec::new()));
        }
        other => panic!("Expected ClosedWithError, got {:?}", other),
    }
    assert_eq!(core.metrics().snapshot().handshakes_completed, 1);
    assert_eq!(core.metrics().snapshot().children_created, 0);

    // A replacement child can be negotiated on the established SA
    let child_id = core.request_open_child(child_params(), now).unwrap();
    assert_eq!(child_id, 2);
}
