//! Session and Child Session parameters
//!
//! Builder-pattern configuration for IKE and Child sessions. Everything is
//! validated at `build()` time so the state machines can assume well-formed
//! input. Getters return construction inputs unchanged and order-preserving.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ikev2::constants::DEFAULT_FRAGMENT_THRESHOLD;
use crate::ikev2::payload::{ConfigAttribute, ConfigAttributeType, IdPayload, TrafficSelector};
use crate::ikev2::proposal::{ChildSaProposal, IkeSaProposal};

/// Default hard lifetime (4 hours)
pub const DEFAULT_HARD_LIFETIME: Duration = Duration::from_secs(14400);

/// Default soft lifetime (2 hours)
pub const DEFAULT_SOFT_LIFETIME: Duration = Duration::from_secs(7200);

/// Default dead-peer-detection delay (2 minutes)
pub const DEFAULT_DPD_DELAY: Duration = Duration::from_secs(120);

/// Default retransmission backoff, in milliseconds
pub const DEFAULT_RETRANSMIT_TIMEOUTS_MS: [u64; 5] = [500, 1000, 2000, 4000, 8000];

/// SA lifetime pair
///
/// The soft lifetime triggers a rekey; the hard lifetime is the point past
/// which the SA must not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaLifetimes {
    /// Hard expiry
    pub hard: Duration,

    /// Soft expiry (rekey trigger)
    pub soft: Duration,
}

impl Default for SaLifetimes {
    fn default() -> Self {
        SaLifetimes {
            hard: DEFAULT_HARD_LIFETIME,
            soft: DEFAULT_SOFT_LIFETIME,
        }
    }
}

impl SaLifetimes {
    /// Create a lifetime pair, enforcing hard > soft > 0
    pub fn new(hard: Duration, soft: Duration) -> Result<Self> {
        if soft.is_zero() {
            return Err(Error::InvalidParameter(
                "Soft lifetime must be positive".to_string(),
            ));
        }
        if hard <= soft {
            return Err(Error::InvalidParameter(
                "Hard lifetime must exceed soft lifetime".to_string(),
            ));
        }
        Ok(SaLifetimes { hard, soft })
    }
}

/// Retransmission backoff schedule
///
/// One entry per wait between (re)transmissions; when the last wait elapses
/// without a response the exchange is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmissionSchedule {
    timeouts: Vec<Duration>,
}

impl Default for RetransmissionSchedule {
    fn default() -> Self {
        RetransmissionSchedule {
            timeouts: DEFAULT_RETRANSMIT_TIMEOUTS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

impl RetransmissionSchedule {
    /// Create a schedule from explicit waits
    pub fn new(timeouts: Vec<Duration>) -> Result<Self> {
        if timeouts.is_empty() {
            return Err(Error::InvalidParameter(
                "Retransmission schedule cannot be empty".to_string(),
            ));
        }
        if timeouts.iter().any(|t| t.is_zero()) {
            return Err(Error::InvalidParameter(
                "Retransmission timeouts must be positive".to_string(),
            ));
        }
        Ok(RetransmissionSchedule { timeouts })
    }

    /// The configured waits, in order
    pub fn timeouts(&self) -> &[Duration] {
        &self.timeouts
    }

    /// Wait before the given attempt, if the schedule extends that far
    pub fn wait_for_attempt(&self, attempt: usize) -> Option<Duration> {
        self.timeouts.get(attempt).copied()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.timeouts.len()
    }

    /// Whether the schedule is empty (never true after validation)
    pub fn is_empty(&self) -> bool {
        self.timeouts.is_empty()
    }
}

/// EAP method identifiers (IANA method types)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EapMethod {
    /// EAP-SIM
    Sim = 18,
    /// EAP-AKA
    Aka = 23,
    /// EAP-MSCHAPv2
    Mschapv2 = 26,
    /// EAP-AKA'
    AkaPrime = 50,
}

impl EapMethod {
    /// Methods that provide mutual authentication and may be used without a
    /// server certificate signature
    pub fn is_safe_for_eap_only(self) -> bool {
        matches!(self, EapMethod::Sim | EapMethod::Aka | EapMethod::AkaPrime)
    }
}

/// Authentication configuration for the IKE session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IkeAuthConfig {
    /// Pre-shared key
    PresharedKey(Vec<u8>),

    /// Digital signature authentication
    ///
    /// Both blobs are opaque to the engine and handed to the crypto
    /// provider's sign/verify operations.
    DigitalSignature {
        /// Local private key blob
        private_key: Vec<u8>,
        /// Trust anchor blob for verifying the peer
        trust_anchor: Vec<u8>,
    },

    /// EAP authentication (methods run through an external authenticator)
    Eap {
        /// Methods the client is willing to run, in preference order
        methods: Vec<EapMethod>,
    },
}

/// Session-level options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IkeOption {
    /// Request EAP-only authentication (no server signature), RFC 5998
    EapOnlyAuth,

    /// Announce INITIAL_CONTACT in IKE_AUTH
    InitialContact,
}

/// A configuration attribute request for tunnel mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigRequest {
    /// Request an internal IPv4 address, optionally a specific one
    Ipv4Address(Option<std::net::Ipv4Addr>),

    /// Request an internal IPv6 address, optionally a specific one with a
    /// prefix length
    Ipv6Address(Option<(std::net::Ipv6Addr, u8)>),

    /// Request IPv4 DNS servers
    Ipv4Dns,

    /// Request IPv6 DNS servers
    Ipv6Dns,

    /// Request the IPv4 netmask
    Ipv4Netmask,

    /// Request protected IPv4 subnets
    Ipv4Subnet,

    /// Request protected IPv6 subnets
    Ipv6Subnet,
}

impl ConfigRequest {
    /// Encode as a CFG_REQUEST attribute
    pub fn to_attribute(&self) -> ConfigAttribute {
        match self {
            ConfigRequest::Ipv4Address(addr) => ConfigAttribute {
                attr_type: ConfigAttributeType::InternalIp4Address.to_u16(),
                value: addr.map(|a| a.octets().to_vec()).unwrap_or_default(),
            },
            ConfigRequest::Ipv6Address(addr) => ConfigAttribute {
                attr_type: ConfigAttributeType::InternalIp6Address.to_u16(),
                value: addr
                    .map(|(a, prefix)| {
                        let mut v = a.octets().to_vec();
                        v.push(prefix);
                        v
                    })
                    .unwrap_or_default(),
            },
            ConfigRequest::Ipv4Dns => ConfigAttribute {
                attr_type: ConfigAttributeType::InternalIp4Dns.to_u16(),
                value: Vec::new(),
            },
            ConfigRequest::Ipv6Dns => ConfigAttribute {
                attr_type: ConfigAttributeType::InternalIp6Dns.to_u16(),
                value: Vec::new(),
            },
            ConfigRequest::Ipv4Netmask => ConfigAttribute {
                attr_type: ConfigAttributeType::InternalIp4Netmask.to_u16(),
                value: Vec::new(),
            },
            ConfigRequest::Ipv4Subnet => ConfigAttribute {
                attr_type: ConfigAttributeType::InternalIp4Subnet.to_u16(),
                value: Vec::new(),
            },
            ConfigRequest::Ipv6Subnet => ConfigAttribute {
                attr_type: ConfigAttributeType::InternalIp6Subnet.to_u16(),
                value: Vec::new(),
            },
        }
    }
}

/// Parameters for an IKE session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeSessionParams {
    server_addr: SocketAddr,
    proposals: Vec<IkeSaProposal>,
    local_id: IdPayload,
    remote_id: IdPayload,
    auth: IkeAuthConfig,
    lifetimes: SaLifetimes,
    dpd_delay: Duration,
    retransmission: RetransmissionSchedule,
    config_requests: Vec<ConfigRequest>,
    options: Vec<IkeOption>,
    fragment_threshold: usize,
}

impl IkeSessionParams {
    /// Start building session parameters
    pub fn builder(server_addr: SocketAddr) -> IkeSessionParamsBuilder {
        IkeSessionParamsBuilder {
            server_addr,
            proposals: Vec::new(),
            local_id: None,
            remote_id: None,
            auth: None,
            lifetimes: SaLifetimes::default(),
            dpd_delay: DEFAULT_DPD_DELAY,
            retransmission: RetransmissionSchedule::default(),
            config_requests: Vec::new(),
            options: Vec::new(),
            fragment_threshold: DEFAULT_FRAGMENT_THRESHOLD,
        }
    }

    /// Server address
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// IKE SA proposals, in preference order
    pub fn proposals(&self) -> &[IkeSaProposal] {
        &self.proposals
    }

    /// Local identification
    pub fn local_id(&self) -> &IdPayload {
        &self.local_id
    }

    /// Expected remote identification
    pub fn remote_id(&self) -> &IdPayload {
        &self.remote_id
    }

    /// Authentication configuration
    pub fn auth(&self) -> &IkeAuthConfig {
        &self.auth
    }

    /// IKE SA lifetimes
    pub fn lifetimes(&self) -> SaLifetimes {
        self.lifetimes
    }

    /// Dead-peer-detection delay
    pub fn dpd_delay(&self) -> Duration {
        self.dpd_delay
    }

    /// Retransmission schedule
    pub fn retransmission(&self) -> &RetransmissionSchedule {
        &self.retransmission
    }

    /// Configuration requests, in declared order
    pub fn config_requests(&self) -> &[ConfigRequest] {
        &self.config_requests
    }

    /// Whether an option is set
    pub fn has_option(&self, option: IkeOption) -> bool {
        self.options.contains(&option)
    }

    /// Fragmentation threshold in bytes
    pub fn fragment_threshold(&self) -> usize {
        self.fragment_threshold
    }
}

/// Builder for [`IkeSessionParams`]
#[derive(Debug, Clone)]
pub struct IkeSessionParamsBuilder {
    server_addr: SocketAddr,
    proposals: Vec<IkeSaProposal>,
    local_id: Option<IdPayload>,
    remote_id: Option<IdPayload>,
    auth: Option<IkeAuthConfig>,
    lifetimes: SaLifetimes,
    dpd_delay: Duration,
    retransmission: RetransmissionSchedule,
    config_requests: Vec<ConfigRequest>,
    options: Vec<IkeOption>,
    fragment_threshold: usize,
}

impl IkeSessionParamsBuilder {
    /// Add an IKE SA proposal
    pub fn add_proposal(mut self, proposal: IkeSaProposal) -> Self {
        self.proposals.push(proposal);
        self
    }

    /// Set local identification
    pub fn with_local_id(mut self, id: IdPayload) -> Self {
        self.local_id = Some(id);
        self
    }

    /// Set expected remote identification
    pub fn with_remote_id(mut self, id: IdPayload) -> Self {
        self.remote_id = Some(id);
        self
    }

    /// Set authentication configuration
    pub fn with_auth(mut self, auth: IkeAuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Set IKE SA lifetimes
    pub fn with_lifetimes(mut self, lifetimes: SaLifetimes) -> Self {
        self.lifetimes = lifetimes;
        self
    }

    /// Set dead-peer-detection delay
    pub fn with_dpd_delay(mut self, delay: Duration) -> Self {
        self.dpd_delay = delay;
        self
    }

    /// Set retransmission schedule
    pub fn with_retransmission(mut self, schedule: RetransmissionSchedule) -> Self {
        self.retransmission = schedule;
        self
    }

    /// Add a configuration request
    pub fn add_config_request(mut self, request: ConfigRequest) -> Self {
        self.config_requests.push(request);
        self
    }

    /// Set a session option
    pub fn add_option(mut self, option: IkeOption) -> Self {
        if !self.options.contains(&option) {
            self.options.push(option);
        }
        self
    }

    /// Set fragmentation threshold in bytes
    pub fn with_fragment_threshold(mut self, threshold: usize) -> Self {
        self.fragment_threshold = threshold;
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<IkeSessionParams> {
        if self.proposals.is_empty() {
            return Err(Error::InvalidParameter(
                "At least one IKE proposal required".to_string(),
            ));
        }
        let local_id = self
            .local_id
            .ok_or_else(|| Error::InvalidParameter("local_id is required".to_string()))?;
        let remote_id = self
            .remote_id
            .ok_or_else(|| Error::InvalidParameter("remote_id is required".to_string()))?;
        let auth = self
            .auth
            .ok_or_else(|| Error::InvalidParameter("auth config is required".to_string()))?;

        match &auth {
            IkeAuthConfig::PresharedKey(psk) if psk.is_empty() => {
                return Err(Error::InvalidParameter("PSK cannot be empty".to_string()));
            }
            IkeAuthConfig::Eap { methods } if methods.is_empty() => {
                return Err(Error::InvalidParameter(
                    "EAP auth requires at least one method".to_string(),
                ));
            }
            _ => {}
        }

        if self.options.contains(&IkeOption::EapOnlyAuth) {
            match &auth {
                IkeAuthConfig::Eap { methods } => {
                    if let Some(unsafe_method) =
                        methods.iter().find(|m| !m.is_safe_for_eap_only())
                    {
                        return Err(Error::InvalidParameter(format!(
                            "EAP method {:?} is not allowed with EAP-only authentication",
                            unsafe_method
                        )));
                    }
                }
                _ => {
                    return Err(Error::InvalidParameter(
                        "EAP-only option requires EAP authentication".to_string(),
                    ));
                }
            }
        }

        if self.dpd_delay.is_zero() {
            return Err(Error::InvalidParameter(
                "DPD delay must be positive".to_string(),
            ));
        }
        if self.fragment_threshold < 576 {
            return Err(Error::InvalidParameter(
                "Fragment threshold below minimum datagram size".to_string(),
            ));
        }

        Ok(IkeSessionParams {
            server_addr: self.server_addr,
            proposals: self.proposals,
            local_id,
            remote_id,
            auth,
            lifetimes: self.lifetimes,
            dpd_delay: self.dpd_delay,
            retransmission: self.retransmission,
            config_requests: self.config_requests,
            options: self.options,
            fragment_threshold: self.fragment_threshold,
        })
    }
}

/// Encapsulation mode for a Child session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildMode {
    /// Transport mode (host-to-host)
    Transport,
    /// Tunnel mode (the default IKEv2 mode)
    Tunnel,
}

/// Parameters for a Child session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSessionParams {
    mode: ChildMode,
    proposals: Vec<ChildSaProposal>,
    inbound_ts: Vec<TrafficSelector>,
    outbound_ts: Vec<TrafficSelector>,
    lifetimes: SaLifetimes,
    config_requests: Vec<ConfigRequest>,
}

impl ChildSessionParams {
    /// Start building transport-mode parameters
    pub fn transport() -> ChildSessionParamsBuilder {
        ChildSessionParamsBuilder::new(ChildMode::Transport)
    }

    /// Start building tunnel-mode parameters
    pub fn tunnel() -> ChildSessionParamsBuilder {
        ChildSessionParamsBuilder::new(ChildMode::Tunnel)
    }

    /// Encapsulation mode
    pub fn mode(&self) -> ChildMode {
        self.mode
    }

    /// Child SA proposals, in preference order
    pub fn proposals(&self) -> &[ChildSaProposal] {
        &self.proposals
    }

    /// Inbound traffic selectors, in declared order
    pub fn inbound_ts(&self) -> &[TrafficSelector] {
        &self.inbound_ts
    }

    /// Outbound traffic selectors, in declared order
    pub fn outbound_ts(&self) -> &[TrafficSelector] {
        &self.outbound_ts
    }

    /// Child SA lifetimes
    pub fn lifetimes(&self) -> SaLifetimes {
        self.lifetimes
    }

    /// Configuration requests (tunnel mode only)
    pub fn config_requests(&self) -> &[ConfigRequest] {
        &self.config_requests
    }
}

/// Builder for [`ChildSessionParams`]
#[derive(Debug, Clone)]
pub struct ChildSessionParamsBuilder {
    mode: ChildMode,
    proposals: Vec<ChildSaProposal>,
    inbound_ts: Vec<TrafficSelector>,
    outbound_ts: Vec<TrafficSelector>,
    lifetimes: SaLifetimes,
    config_requests: Vec<ConfigRequest>,
}

impl ChildSessionParamsBuilder {
    fn new(mode: ChildMode) -> Self {
        ChildSessionParamsBuilder {
            mode,
            proposals: Vec::new(),
            inbound_ts: Vec::new(),
            outbound_ts: Vec::new(),
            lifetimes: SaLifetimes::default(),
            config_requests: Vec::new(),
        }
    }

    /// Add a Child SA proposal
    pub fn add_proposal(mut self, proposal: ChildSaProposal) -> Self {
        self.proposals.push(proposal);
        self
    }

    /// Add an inbound traffic selector
    pub fn add_inbound_ts(mut self, ts: TrafficSelector) -> Self {
        self.inbound_ts.push(ts);
        self
    }

    /// Add an outbound traffic selector
    pub fn add_outbound_ts(mut self, ts: TrafficSelector) -> Self {
        self.outbound_ts.push(ts);
        self
    }

    /// Set Child SA lifetimes
    pub fn with_lifetimes(mut self, lifetimes: SaLifetimes) -> Self {
        self.lifetimes = lifetimes;
        self
    }

    /// Add a configuration request (tunnel mode only)
    pub fn add_config_request(mut self, request: ConfigRequest) -> Self {
        self.config_requests.push(request);
        self
    }

    /// Validate and build
    ///
    /// Traffic selectors default to the full IPv4 range when none are given.
    pub fn build(self) -> Result<ChildSessionParams> {
        if self.proposals.is_empty() {
            return Err(Error::InvalidParameter(
                "At least one Child proposal required".to_string(),
            ));
        }
        if self.mode == ChildMode::Transport && !self.config_requests.is_empty() {
            return Err(Error::InvalidParameter(
                "Configuration requests are tunnel-mode only".to_string(),
            ));
        }

        let inbound_ts = if self.inbound_ts.is_empty() {
            vec![TrafficSelector::all_ipv4()]
        } else {
            self.inbound_ts
        };
        let outbound_ts = if self.outbound_ts.is_empty() {
            vec![TrafficSelector::all_ipv4()]
        } else {
            self.outbound_ts
        };

        Ok(ChildSessionParams {
            mode: self.mode,
            proposals: self.proposals,
            inbound_ts,
            outbound_ts,
            lifetimes: self.lifetimes,
            config_requests: self.config_requests,
        })
    }
}
