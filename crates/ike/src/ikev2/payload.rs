//! IKEv2 Payload structures and parsing
//!
//! Implements IKE payloads as defined in RFC 7296 Section 3.2: the generic
//! payload header, the payload chain with next-payload linking, and the
//! individual payload bodies used by the exchanges.

use std::net::IpAddr;

use super::constants::{NotifyType, PayloadType};
use super::proposal::{Proposal, ProtocolId};
use crate::error::{Error, Result};

/// Generic IKE payload header (4 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Next Payload  |C|  RESERVED   |         Payload Length        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Next payload type (raw, may be unknown to us)
    pub next_payload: u8,

    /// Critical bit (if set, must understand this payload)
    pub critical: bool,

    /// Total payload length including header (4 bytes + data)
    pub length: u16,
}

impl PayloadHeader {
    /// Payload header size
    pub const SIZE: usize = 4;

    /// Create new payload header
    pub fn new(next_payload: u8, critical: bool, length: u16) -> Self {
        PayloadHeader {
            next_payload,
            critical,
            length,
        }
    }

    /// Parse payload header from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::BufferTooShort {
                required: Self::SIZE,
                available: data.len(),
            });
        }

        let next_payload = data[0];
        let critical = (data[1] & 0x80) != 0;
        let length = u16::from_be_bytes([data[2], data[3]]);

        if (length as usize) < Self::SIZE {
            return Err(Error::InvalidLength {
                expected: Self::SIZE,
                actual: length as usize,
            });
        }

        Ok(PayloadHeader {
            next_payload,
            critical,
            length,
        })
    }

    /// Serialize payload header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.next_payload;
        bytes[1] = if self.critical { 0x80 } else { 0x00 };
        bytes[2..4].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Payload data length (excluding header)
    pub fn data_length(&self) -> usize {
        self.length as usize - Self::SIZE
    }
}

/// Security Association Payload (RFC 7296 Section 3.3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaPayload {
    /// List of proposals
    pub proposals: Vec<Proposal>,
}

impl SaPayload {
    /// Create new SA payload with proposals
    pub fn new(proposals: Vec<Proposal>) -> Self {
        SaPayload { proposals }
    }

    /// Parse SA payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        let mut proposals = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            let (proposal, is_last, consumed) = Proposal::from_bytes(&data[offset..])?;
            proposals.push(proposal);
            offset += consumed;
            if is_last {
                break;
            }
        }

        if proposals.is_empty() {
            return Err(Error::InvalidPayload(
                "SA payload carries no proposals".to_string(),
            ));
        }

        Ok(SaPayload { proposals })
    }

    /// Serialize SA payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        for (i, proposal) in self.proposals.iter().enumerate() {
            bytes.extend_from_slice(&proposal.to_bytes(i == self.proposals.len() - 1));
        }
        bytes
    }
}

/// Key Exchange Payload (RFC 7296 Section 3.4)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Next Payload  |C|  RESERVED   |         Payload Length        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Diffie-Hellman Group Num    |           RESERVED            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// ~                       Key Exchange Data                       ~
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KePayload {
    /// Diffie-Hellman group number
    pub dh_group: u16,

    /// Key exchange data (public value)
    pub key_data: Vec<u8>,
}

impl KePayload {
    /// Create new KE payload
    pub fn new(dh_group: u16, key_data: Vec<u8>) -> Self {
        KePayload { dh_group, key_data }
    }

    /// Parse KE payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let dh_group = u16::from_be_bytes([data[0], data[1]]);
        let key_data = data[4..].to_vec();

        Ok(KePayload { dh_group, key_data })
    }

    /// Serialize KE payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + self.key_data.len());
        data.extend_from_slice(&self.dh_group.to_be_bytes());
        data.extend_from_slice(&[0u8, 0u8]);
        data.extend_from_slice(&self.key_data);
        data
    }
}

/// Nonce Payload (RFC 7296 Section 3.9)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoncePayload {
    /// Nonce data
    pub nonce: Vec<u8>,
}

impl NoncePayload {
    /// Minimum nonce size (16 bytes)
    pub const MIN_SIZE: usize = 16;

    /// Maximum nonce size (256 bytes)
    pub const MAX_SIZE: usize = 256;

    /// Create new nonce payload
    pub fn new(nonce: Vec<u8>) -> Result<Self> {
        if nonce.len() < Self::MIN_SIZE {
            return Err(Error::InvalidPayload(format!(
                "Nonce too short: {} bytes (minimum {})",
                nonce.len(),
                Self::MIN_SIZE
            )));
        }
        if nonce.len() > Self::MAX_SIZE {
            return Err(Error::InvalidPayload(format!(
                "Nonce too long: {} bytes (maximum {})",
                nonce.len(),
                Self::MAX_SIZE
            )));
        }
        Ok(NoncePayload { nonce })
    }

    /// Parse nonce payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        Self::new(data.to_vec())
    }

    /// Serialize nonce payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        self.nonce.clone()
    }
}

/// ID Type for Identification Payload (RFC 7296 Section 3.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IdType {
    /// IPv4 address
    Ipv4Addr = 1,
    /// Fully-qualified domain name
    Fqdn = 2,
    /// RFC 822 email address
    Rfc822Addr = 3,
    /// IPv6 address
    Ipv6Addr = 5,
    /// Distinguished Name (binary DER)
    DnBinaryDer = 9,
    /// Key ID
    KeyId = 11,
}

impl IdType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(IdType::Ipv4Addr),
            2 => Some(IdType::Fqdn),
            3 => Some(IdType::Rfc822Addr),
            5 => Some(IdType::Ipv6Addr),
            9 => Some(IdType::DnBinaryDer),
            11 => Some(IdType::KeyId),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Identification Payload (RFC 7296 Section 3.5)
///
/// Used for IDi (Initiator) and IDr (Responder) payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPayload {
    /// ID type
    pub id_type: IdType,

    /// Identification data
    pub data: Vec<u8>,
}

impl IdPayload {
    /// Create new ID payload
    pub fn new(id_type: IdType, data: Vec<u8>) -> Self {
        IdPayload { id_type, data }
    }

    /// Create ID from FQDN
    pub fn from_fqdn(fqdn: &str) -> Self {
        IdPayload {
            id_type: IdType::Fqdn,
            data: fqdn.as_bytes().to_vec(),
        }
    }

    /// Create ID from email address
    pub fn from_email(email: &str) -> Self {
        IdPayload {
            id_type: IdType::Rfc822Addr,
            data: email.as_bytes().to_vec(),
        }
    }

    /// Create ID from Key ID
    pub fn from_key_id(key_id: &[u8]) -> Self {
        IdPayload {
            id_type: IdType::KeyId,
            data: key_id.to_vec(),
        }
    }

    /// Parse ID payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let id_type = IdType::from_u8(data[0])
            .ok_or_else(|| Error::InvalidPayload(format!("Unknown ID type: {}", data[0])))?;
        let id_data = data[4..].to_vec();

        Ok(IdPayload {
            id_type,
            data: id_data,
        })
    }

    /// Serialize ID payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.data.len());
        bytes.push(self.id_type.to_u8());
        bytes.extend_from_slice(&[0u8, 0u8, 0u8]);
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Get ID as string (if applicable)
    pub fn as_string(&self) -> Option<String> {
        match self.id_type {
            IdType::Fqdn | IdType::Rfc822Addr => String::from_utf8(self.data.clone()).ok(),
            _ => None,
        }
    }
}

/// Authentication Method (RFC 7296 Section 3.8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    /// RSA Digital Signature
    RsaSig = 1,
    /// Shared Key Message Integrity Code (PSK)
    SharedKeyMic = 2,
    /// ECDSA with SHA-256 on P-256 curve
    EcdsaSha256P256 = 9,
    /// ECDSA with SHA-384 on P-384 curve
    EcdsaSha384P384 = 10,
    /// Digital Signature (RFC 7427)
    DigitalSignature = 14,
}

impl AuthMethod {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AuthMethod::RsaSig),
            2 => Some(AuthMethod::SharedKeyMic),
            9 => Some(AuthMethod::EcdsaSha256P256),
            10 => Some(AuthMethod::EcdsaSha384P384),
            14 => Some(AuthMethod::DigitalSignature),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Authentication Payload (RFC 7296 Section 3.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPayload {
    /// Authentication method
    pub auth_method: AuthMethod,

    /// Authentication data
    pub auth_data: Vec<u8>,
}

impl AuthPayload {
    /// Create new AUTH payload
    pub fn new(auth_method: AuthMethod, auth_data: Vec<u8>) -> Self {
        AuthPayload {
            auth_method,
            auth_data,
        }
    }

    /// Parse AUTH payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let auth_method = AuthMethod::from_u8(data[0])
            .ok_or_else(|| Error::InvalidPayload(format!("Unknown auth method: {}", data[0])))?;
        let auth_data = data[4..].to_vec();

        Ok(AuthPayload {
            auth_method,
            auth_data,
        })
    }

    /// Serialize AUTH payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.auth_data.len());
        bytes.push(self.auth_method.to_u8());
        bytes.extend_from_slice(&[0u8, 0u8, 0u8]);
        bytes.extend_from_slice(&self.auth_data);
        bytes
    }
}

/// Notify Payload (RFC 7296 Section 3.10)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Next Payload  |C|  RESERVED   |         Payload Length        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Protocol ID  |   SPI Size    |      Notify Message Type      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ~                Security Parameter Index (SPI)                 ~
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ~                       Notification Data                       ~
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    /// Protocol ID (0 for IKE SA level notifies)
    pub protocol_id: u8,

    /// SPI of the SA the notification refers to, if any
    pub spi: Vec<u8>,

    /// Notify message type (raw; may be unknown to us)
    pub notify_type: u16,

    /// Notification data
    pub data: Vec<u8>,
}

impl NotifyPayload {
    /// Create a status or error notification without an SPI
    pub fn new(notify_type: NotifyType) -> Self {
        NotifyPayload {
            protocol_id: 0,
            spi: Vec::new(),
            notify_type: notify_type.to_u16(),
            data: Vec::new(),
        }
    }

    /// Create a notification with data
    pub fn with_data(notify_type: NotifyType, data: Vec<u8>) -> Self {
        NotifyPayload {
            protocol_id: 0,
            spi: Vec::new(),
            notify_type: notify_type.to_u16(),
            data,
        }
    }

    /// Create a REKEY_SA notification referencing the given ESP SPI
    pub fn rekey_sa(spi: Vec<u8>) -> Self {
        NotifyPayload {
            protocol_id: ProtocolId::Esp.to_u8(),
            spi,
            notify_type: NotifyType::RekeySa.to_u16(),
            data: Vec::new(),
        }
    }

    /// Typed notify type, when known
    pub fn known_type(&self) -> Option<NotifyType> {
        NotifyType::from_u16(self.notify_type)
    }

    /// Check if this is an error notification
    pub fn is_error(&self) -> bool {
        self.notify_type < 16384
    }

    /// Parse Notify payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let protocol_id = data[0];
        let spi_size = data[1] as usize;
        let notify_type = u16::from_be_bytes([data[2], data[3]]);

        if data.len() < 4 + spi_size {
            return Err(Error::BufferTooShort {
                required: 4 + spi_size,
                available: data.len(),
            });
        }

        let spi = data[4..4 + spi_size].to_vec();
        let notify_data = data[4 + spi_size..].to_vec();

        Ok(NotifyPayload {
            protocol_id,
            spi,
            notify_type,
            data: notify_data,
        })
    }

    /// Serialize Notify payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.spi.len() + self.data.len());
        bytes.push(self.protocol_id);
        bytes.push(self.spi.len() as u8);
        bytes.extend_from_slice(&self.notify_type.to_be_bytes());
        bytes.extend_from_slice(&self.spi);
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

/// Delete Payload (RFC 7296 Section 3.11)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Protocol of the SAs being deleted
    pub protocol_id: ProtocolId,

    /// SPIs of the SAs being deleted; empty for the IKE SA itself
    pub spis: Vec<Vec<u8>>,
}

impl DeletePayload {
    /// Delete the IKE SA (no SPIs, they are in the message header)
    pub fn ike() -> Self {
        DeletePayload {
            protocol_id: ProtocolId::Ike,
            spis: Vec::new(),
        }
    }

    /// Delete ESP Child SAs by their inbound SPIs
    pub fn esp(spis: Vec<Vec<u8>>) -> Self {
        DeletePayload {
            protocol_id: ProtocolId::Esp,
            spis,
        }
    }

    /// Parse Delete payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let protocol_id = ProtocolId::from_u8(data[0])
            .ok_or_else(|| Error::InvalidPayload(format!("Unknown protocol ID: {}", data[0])))?;
        let spi_size = data[1] as usize;
        let num_spis = u16::from_be_bytes([data[2], data[3]]) as usize;

        if data.len() < 4 + spi_size * num_spis {
            return Err(Error::BufferTooShort {
                required: 4 + spi_size * num_spis,
                available: data.len(),
            });
        }

        let mut spis = Vec::with_capacity(num_spis);
        for i in 0..num_spis {
            let start = 4 + i * spi_size;
            spis.push(data[start..start + spi_size].to_vec());
        }

        Ok(DeletePayload { protocol_id, spis })
    }

    /// Serialize Delete payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let spi_size = self.spis.first().map(|s| s.len()).unwrap_or(0);
        let mut bytes = Vec::with_capacity(4 + spi_size * self.spis.len());
        bytes.push(self.protocol_id.to_u8());
        bytes.push(spi_size as u8);
        bytes.extend_from_slice(&(self.spis.len() as u16).to_be_bytes());
        for spi in &self.spis {
            bytes.extend_from_slice(spi);
        }
        bytes
    }
}

/// Traffic selector type (RFC 7296 Section 3.13.1)
pub const TS_IPV4_ADDR_RANGE: u8 = 7;
/// Traffic selector type for IPv6 ranges
pub const TS_IPV6_ADDR_RANGE: u8 = 8;

/// A single traffic selector: protocol, port range and address range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSelector {
    /// IP protocol (0 = any)
    pub ip_protocol: u8,

    /// Start of port range (inclusive)
    pub start_port: u16,

    /// End of port range (inclusive)
    pub end_port: u16,

    /// Start of address range (inclusive)
    pub start_addr: IpAddr,

    /// End of address range (inclusive)
    pub end_addr: IpAddr,
}

impl TrafficSelector {
    /// Create a selector covering a full address range with all ports
    pub fn new(start_addr: IpAddr, end_addr: IpAddr) -> Result<Self> {
        Self::with_ports(start_addr, end_addr, 0, 65535)
    }

    /// Create a selector with an explicit port range
    pub fn with_ports(
        start_addr: IpAddr,
        end_addr: IpAddr,
        start_port: u16,
        end_port: u16,
    ) -> Result<Self> {
        if start_addr.is_ipv4() != end_addr.is_ipv4() {
            return Err(Error::InvalidParameter(
                "Traffic selector address range must be a single family".to_string(),
            ));
        }
        if addr_bytes(&start_addr) > addr_bytes(&end_addr) {
            return Err(Error::InvalidParameter(
                "Traffic selector address range is inverted".to_string(),
            ));
        }
        if start_port > end_port {
            return Err(Error::InvalidParameter(
                "Traffic selector port range is inverted".to_string(),
            ));
        }
        Ok(TrafficSelector {
            ip_protocol: 0,
            start_port,
            end_port,
            start_addr,
            end_addr,
        })
    }

    /// A selector covering all of IPv4
    pub fn all_ipv4() -> Self {
        TrafficSelector {
            ip_protocol: 0,
            start_port: 0,
            end_port: 65535,
            start_addr: IpAddr::V4([0, 0, 0, 0].into()),
            end_addr: IpAddr::V4([255, 255, 255, 255].into()),
        }
    }

    /// A selector covering all of IPv6
    pub fn all_ipv6() -> Self {
        TrafficSelector {
            ip_protocol: 0,
            start_port: 0,
            end_port: 65535,
            start_addr: IpAddr::V6([0u8; 16].into()),
            end_addr: IpAddr::V6([0xffu8; 16].into()),
        }
    }

    /// Intersect with another selector
    ///
    /// Returns the overlapping sub-range, or None when the selectors are
    /// disjoint or of different address families.
    pub fn intersect(&self, other: &TrafficSelector) -> Option<TrafficSelector> {
        if self.start_addr.is_ipv4() != other.start_addr.is_ipv4() {
            return None;
        }
        if self.ip_protocol != 0 && other.ip_protocol != 0 && self.ip_protocol != other.ip_protocol
        {
            return None;
        }

        let start_port = self.start_port.max(other.start_port);
        let end_port = self.end_port.min(other.end_port);
        if start_port > end_port {
            return None;
        }

        let start_addr = max_addr(self.start_addr, other.start_addr);
        let end_addr = min_addr(self.end_addr, other.end_addr);
        if addr_bytes(&start_addr) > addr_bytes(&end_addr) {
            return None;
        }

        Some(TrafficSelector {
            ip_protocol: if self.ip_protocol != 0 {
                self.ip_protocol
            } else {
                other.ip_protocol
            },
            start_port,
            end_port,
            start_addr,
            end_addr,
        })
    }

    /// Serialize one selector (RFC 7296 Section 3.13.1)
    pub fn to_bytes(&self) -> Vec<u8> {
        let (ts_type, start, end) = match (&self.start_addr, &self.end_addr) {
            (IpAddr::V4(s), IpAddr::V4(e)) => {
                (TS_IPV4_ADDR_RANGE, s.octets().to_vec(), e.octets().to_vec())
            }
            (IpAddr::V6(s), IpAddr::V6(e)) => {
                (TS_IPV6_ADDR_RANGE, s.octets().to_vec(), e.octets().to_vec())
            }
            // Mixed families rejected at construction
            _ => (TS_IPV4_ADDR_RANGE, vec![0; 4], vec![0; 4]),
        };

        let length = 8 + start.len() + end.len();
        let mut bytes = Vec::with_capacity(length);
        bytes.push(ts_type);
        bytes.push(self.ip_protocol);
        bytes.extend_from_slice(&(length as u16).to_be_bytes());
        bytes.extend_from_slice(&self.start_port.to_be_bytes());
        bytes.extend_from_slice(&self.end_port.to_be_bytes());
        bytes.extend_from_slice(&start);
        bytes.extend_from_slice(&end);
        bytes
    }

    /// Parse one selector, returning it and the bytes consumed
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 8 {
            return Err(Error::BufferTooShort {
                required: 8,
                available: data.len(),
            });
        }

        let ts_type = data[0];
        let ip_protocol = data[1];
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < length {
            return Err(Error::BufferTooShort {
                required: length,
                available: data.len(),
            });
        }

        let start_port = u16::from_be_bytes([data[4], data[5]]);
        let end_port = u16::from_be_bytes([data[6], data[7]]);

        let (start_addr, end_addr) = match ts_type {
            TS_IPV4_ADDR_RANGE => {
                if length != 16 {
                    return Err(Error::InvalidLength {
                        expected: 16,
                        actual: length,
                    });
                }
                let s: [u8; 4] = data[8..12].try_into().map_err(|_| Error::Internal(
                    "selector slice length".to_string(),
                ))?;
                let e: [u8; 4] = data[12..16].try_into().map_err(|_| Error::Internal(
                    "selector slice length".to_string(),
                ))?;
                (IpAddr::V4(s.into()), IpAddr::V4(e.into()))
            }
            TS_IPV6_ADDR_RANGE => {
                if length != 40 {
                    return Err(Error::InvalidLength {
                        expected: 40,
                        actual: length,
                    });
                }
                let s: [u8; 16] = data[8..24].try_into().map_err(|_| Error::Internal(
                    "selector slice length".to_string(),
                ))?;
                let e: [u8; 16] = data[24..40].try_into().map_err(|_| Error::Internal(
                    "selector slice length".to_string(),
                ))?;
                (IpAddr::V6(s.into()), IpAddr::V6(e.into()))
            }
            other => {
                return Err(Error::InvalidPayload(format!(
                    "Unknown traffic selector type: {}",
                    other
                )))
            }
        };

        Ok((
            TrafficSelector {
                ip_protocol,
                start_port,
                end_port,
                start_addr,
                end_addr,
            },
            length,
        ))
    }
}

fn addr_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

fn max_addr(a: IpAddr, b: IpAddr) -> IpAddr {
    if addr_bytes(&a) >= addr_bytes(&b) {
        a
    } else {
        b
    }
}

fn min_addr(a: IpAddr, b: IpAddr) -> IpAddr {
    if addr_bytes(&a) <= addr_bytes(&b) {
        a
    } else {
        b
    }
}

/// Traffic Selector Payload (RFC 7296 Section 3.13)
///
/// Used for both TSi and TSr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsPayload {
    /// Selectors, in order
    pub selectors: Vec<TrafficSelector>,
}

impl TsPayload {
    /// Create new TS payload
    pub fn new(selectors: Vec<TrafficSelector>) -> Self {
        TsPayload { selectors }
    }

    /// Parse TS payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let count = data[0] as usize;
        let mut selectors = Vec::with_capacity(count);
        let mut offset = 4;
        for _ in 0..count {
            let (ts, consumed) = TrafficSelector::from_bytes(&data[offset..])?;
            selectors.push(ts);
            offset += consumed;
        }

        Ok(TsPayload { selectors })
    }

    /// Serialize TS payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.push(self.selectors.len() as u8);
        bytes.extend_from_slice(&[0u8, 0u8, 0u8]);
        for ts in &self.selectors {
            bytes.extend_from_slice(&ts.to_bytes());
        }
        bytes
    }
}

/// Narrow two selector lists to their pairwise intersection
///
/// Every (local, peer) pair that overlaps contributes its intersection, in
/// local-list order. An empty result means no traffic can be agreed on.
///
/// # Errors
///
/// Returns [`Error::TsUnacceptable`] when the intersection is empty.
pub fn narrow_selectors(
    local: &[TrafficSelector],
    peer: &[TrafficSelector],
) -> Result<Vec<TrafficSelector>> {
    let mut narrowed = Vec::new();
    for l in local {
        for p in peer {
            if let Some(ts) = l.intersect(p) {
                if !narrowed.contains(&ts) {
                    narrowed.push(ts);
                }
            }
        }
    }

    if narrowed.is_empty() {
        return Err(Error::TsUnacceptable);
    }
    Ok(narrowed)
}

/// Configuration attribute types (RFC 7296 Section 3.15.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ConfigAttributeType {
    /// INTERNAL_IP4_ADDRESS
    InternalIp4Address = 1,
    /// INTERNAL_IP4_NETMASK
    InternalIp4Netmask = 2,
    /// INTERNAL_IP4_DNS
    InternalIp4Dns = 3,
    /// INTERNAL_IP6_ADDRESS
    InternalIp6Address = 8,
    /// INTERNAL_IP6_DNS
    InternalIp6Dns = 10,
    /// INTERNAL_IP4_SUBNET
    InternalIp4Subnet = 13,
    /// INTERNAL_IP6_SUBNET
    InternalIp6Subnet = 15,
}

impl ConfigAttributeType {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(ConfigAttributeType::InternalIp4Address),
            2 => Some(ConfigAttributeType::InternalIp4Netmask),
            3 => Some(ConfigAttributeType::InternalIp4Dns),
            8 => Some(ConfigAttributeType::InternalIp6Address),
            10 => Some(ConfigAttributeType::InternalIp6Dns),
            13 => Some(ConfigAttributeType::InternalIp4Subnet),
            15 => Some(ConfigAttributeType::InternalIp6Subnet),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// A single configuration attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigAttribute {
    /// Attribute type (raw; may be unknown to us)
    pub attr_type: u16,

    /// Attribute value (empty in requests)
    pub value: Vec<u8>,
}

/// Configuration payload type (CFG_REQUEST)
pub const CFG_REQUEST: u8 = 1;
/// Configuration payload type (CFG_REPLY)
pub const CFG_REPLY: u8 = 2;

/// Configuration Payload (RFC 7296 Section 3.15)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPayload {
    /// CFG type (request or reply)
    pub cfg_type: u8,

    /// Attributes, in order
    pub attributes: Vec<ConfigAttribute>,
}

impl ConfigPayload {
    /// Create a CFG_REQUEST
    pub fn request(attributes: Vec<ConfigAttribute>) -> Self {
        ConfigPayload {
            cfg_type: CFG_REQUEST,
            attributes,
        }
    }

    /// Create a CFG_REPLY
    pub fn reply(attributes: Vec<ConfigAttribute>) -> Self {
        ConfigPayload {
            cfg_type: CFG_REPLY,
            attributes,
        }
    }

    /// Parse Config payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let cfg_type = data[0];
        let mut attributes = Vec::new();
        let mut offset = 4;
        while offset < data.len() {
            if data.len() - offset < 4 {
                return Err(Error::InvalidPayload(
                    "Truncated configuration attribute".to_string(),
                ));
            }
            // Top bit of attribute type is reserved
            let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]) & 0x7fff;
            let len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            if data.len() - offset < 4 + len {
                return Err(Error::InvalidPayload(
                    "Truncated configuration attribute".to_string(),
                ));
            }
            attributes.push(ConfigAttribute {
                attr_type,
                value: data[offset + 4..offset + 4 + len].to_vec(),
            });
            offset += 4 + len;
        }

        Ok(ConfigPayload {
            cfg_type,
            attributes,
        })
    }

    /// Serialize Config payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.push(self.cfg_type);
        bytes.extend_from_slice(&[0u8, 0u8, 0u8]);
        for attr in &self.attributes {
            bytes.extend_from_slice(&attr.attr_type.to_be_bytes());
            bytes.extend_from_slice(&(attr.value.len() as u16).to_be_bytes());
            bytes.extend_from_slice(&attr.value);
        }
        bytes
    }
}

/// Extensible Authentication Payload (RFC 7296 Section 3.16)
///
/// The EAP message itself is opaque to the IKE layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapPayload {
    /// Raw EAP message
    pub message: Vec<u8>,
}

impl EapPayload {
    /// Create new EAP payload
    pub fn new(message: Vec<u8>) -> Self {
        EapPayload { message }
    }

    /// Parse EAP payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        Ok(EapPayload {
            message: data.to_vec(),
        })
    }

    /// Serialize EAP payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        self.message.clone()
    }
}

/// IKE Payload variants
#[derive(Debug, Clone, PartialEq)]
pub enum IkePayload {
    /// Security Association payload
    Sa(SaPayload),

    /// Key Exchange payload
    Ke(KePayload),

    /// Nonce payload
    Nonce(NoncePayload),

    /// Identification payload (Initiator)
    IdI(IdPayload),

    /// Identification payload (Responder)
    IdR(IdPayload),

    /// Authentication payload
    Auth(AuthPayload),

    /// Notify payload
    Notify(NotifyPayload),

    /// Delete payload
    Delete(DeletePayload),

    /// Traffic Selector payload (Initiator)
    TsI(TsPayload),

    /// Traffic Selector payload (Responder)
    TsR(TsPayload),

    /// Configuration payload
    Config(ConfigPayload),

    /// Extensible Authentication payload
    Eap(EapPayload),

    /// Vendor ID payload (raw)
    VendorId(Vec<u8>),

    /// Unknown non-critical payload, retained raw
    Unknown {
        /// Raw payload type
        payload_type: u8,
        /// Raw payload data (excluding header)
        data: Vec<u8>,
    },
}

impl IkePayload {
    /// Get payload type byte
    pub fn payload_type(&self) -> u8 {
        match self {
            IkePayload::Sa(_) => PayloadType::SA.to_u8(),
            IkePayload::Ke(_) => PayloadType::KE.to_u8(),
            IkePayload::Nonce(_) => PayloadType::Nonce.to_u8(),
            IkePayload::IdI(_) => PayloadType::IDi.to_u8(),
            IkePayload::IdR(_) => PayloadType::IDr.to_u8(),
            IkePayload::Auth(_) => PayloadType::AUTH.to_u8(),
            IkePayload::Notify(_) => PayloadType::N.to_u8(),
            IkePayload::Delete(_) => PayloadType::D.to_u8(),
            IkePayload::TsI(_) => PayloadType::TSi.to_u8(),
            IkePayload::TsR(_) => PayloadType::TSr.to_u8(),
            IkePayload::Config(_) => PayloadType::CP.to_u8(),
            IkePayload::Eap(_) => PayloadType::EAP.to_u8(),
            IkePayload::VendorId(_) => PayloadType::V.to_u8(),
            IkePayload::Unknown { payload_type, .. } => *payload_type,
        }
    }

    /// Serialize the payload body (without the generic header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        match self {
            IkePayload::Sa(p) => p.to_payload_data(),
            IkePayload::Ke(p) => p.to_payload_data(),
            IkePayload::Nonce(p) => p.to_payload_data(),
            IkePayload::IdI(p) | IkePayload::IdR(p) => p.to_payload_data(),
            IkePayload::Auth(p) => p.to_payload_data(),
            IkePayload::Notify(p) => p.to_payload_data(),
            IkePayload::Delete(p) => p.to_payload_data(),
            IkePayload::TsI(p) | IkePayload::TsR(p) => p.to_payload_data(),
            IkePayload::Config(p) => p.to_payload_data(),
            IkePayload::Eap(p) => p.to_payload_data(),
            IkePayload::VendorId(data) => data.clone(),
            IkePayload::Unknown { data, .. } => data.clone(),
        }
    }

    /// Decode one payload body of the given type
    fn from_typed_data(payload_type: u8, critical: bool, data: &[u8]) -> Result<Self> {
        let known = PayloadType::from_u8(payload_type);
        let payload = match known {
            Some(PayloadType::SA) => IkePayload::Sa(SaPayload::from_payload_data(data)?),
            Some(PayloadType::KE) => IkePayload::Ke(KePayload::from_payload_data(data)?),
            Some(PayloadType::Nonce) => IkePayload::Nonce(NoncePayload::from_payload_data(data)?),
            Some(PayloadType::IDi) => IkePayload::IdI(IdPayload::from_payload_data(data)?),
            Some(PayloadType::IDr) => IkePayload::IdR(IdPayload::from_payload_data(data)?),
            Some(PayloadType::AUTH) => IkePayload::Auth(AuthPayload::from_payload_data(data)?),
            Some(PayloadType::N) => IkePayload::Notify(NotifyPayload::from_payload_data(data)?),
            Some(PayloadType::D) => IkePayload::Delete(DeletePayload::from_payload_data(data)?),
            Some(PayloadType::TSi) => IkePayload::TsI(TsPayload::from_payload_data(data)?),
            Some(PayloadType::TSr) => IkePayload::TsR(TsPayload::from_payload_data(data)?),
            Some(PayloadType::CP) => IkePayload::Config(ConfigPayload::from_payload_data(data)?),
            Some(PayloadType::EAP) => IkePayload::Eap(EapPayload::from_payload_data(data)?),
            Some(PayloadType::V) => IkePayload::VendorId(data.to_vec()),
            _ => {
                // An unknown payload marked critical kills the message
                if critical {
                    return Err(Error::UnknownCriticalPayload(payload_type));
                }
                IkePayload::Unknown {
                    payload_type,
                    data: data.to_vec(),
                }
            }
        };
        Ok(payload)
    }
}

/// Encode an ordered payload chain with next-payload linking
///
/// Each payload's header carries the type of the NEXT payload; the last one
/// carries zero. The type of the FIRST payload goes into the enclosing
/// header (message header or SK payload header), which the caller owns.
pub fn encode_payload_chain(payloads: &[IkePayload]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for (i, payload) in payloads.iter().enumerate() {
        let next = payloads
            .get(i + 1)
            .map(|p| p.payload_type())
            .unwrap_or(PayloadType::None.to_u8());
        let body = payload.to_payload_data();
        let header = PayloadHeader::new(next, false, (PayloadHeader::SIZE + body.len()) as u16);
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&body);
    }
    bytes
}

/// First payload type of a chain, for the enclosing header
pub fn first_payload_type(payloads: &[IkePayload]) -> u8 {
    payloads
        .first()
        .map(|p| p.payload_type())
        .unwrap_or(PayloadType::None.to_u8())
}

/// Decode an ordered payload chain
///
/// `first` is the type of the first payload (from the enclosing header).
/// Unknown non-critical payloads are retained as [`IkePayload::Unknown`];
/// an unknown critical payload or a malformed length fails the whole chain.
pub fn decode_payload_chain(first: u8, data: &[u8]) -> Result<Vec<IkePayload>> {
    let mut payloads = Vec::new();
    let mut current_type = first;
    let mut offset = 0;

    while current_type != PayloadType::None.to_u8() {
        if offset >= data.len() {
            return Err(Error::InvalidMessage(
                "Payload chain ends before terminator".to_string(),
            ));
        }

        let header = PayloadHeader::from_bytes(&data[offset..])?;
        let end = offset + header.length as usize;
        if end > data.len() {
            return Err(Error::BufferTooShort {
                required: end,
                available: data.len(),
            });
        }

        let body = &data[offset + PayloadHeader::SIZE..end];
        payloads.push(IkePayload::from_typed_data(
            current_type,
            header.critical,
            body,
        )?);

        current_type = header.next_payload;
        offset = end;
    }

    Ok(payloads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::proposal::{EncryptionTransform, PrfId, Transform, DhGroup};

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4([a, b, c, d].into())
    }

    #[test]
    fn test_payload_header_roundtrip() {
        let header = PayloadHeader::new(PayloadType::Nonce.to_u8(), true, 100);
        let bytes = header.to_bytes();
        let parsed = PayloadHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header, parsed);
        assert_eq!(parsed.data_length(), 96);
    }

    #[test]
    fn test_payload_header_invalid_length() {
        let data = [33, 0, 0, 2];
        let result = PayloadHeader::from_bytes(&data);
        assert!(matches!(result, Err(Error::InvalidLength { .. })));
    }

    #[test]
    fn test_sa_payload_roundtrip() {
        let proposal = Proposal::new(1, ProtocolId::Ike)
            .add_transform(Transform::encr(EncryptionTransform::aes_gcm(256)))
            .add_transform(Transform::prf(PrfId::HmacSha256))
            .add_transform(Transform::dh(DhGroup::Group14));
        let sa = SaPayload::new(vec![proposal]);

        let bytes = sa.to_payload_data();
        let parsed = SaPayload::from_payload_data(&bytes).unwrap();
        assert_eq!(parsed, sa);
    }

    #[test]
    fn test_sa_payload_empty_rejected() {
        let result = SaPayload::from_payload_data(&[]);
        assert!(result.is_err());
    }

    #[test]
    fn test_nonce_bounds() {
        assert!(NoncePayload::new(vec![1u8; 10]).is_err());
        assert!(NoncePayload::new(vec![1u8; 300]).is_err());
        assert!(NoncePayload::new(vec![1u8; 32]).is_ok());
    }

    #[test]
    fn test_notify_roundtrip_with_spi() {
        let notify = NotifyPayload::rekey_sa(vec![0x01, 0x02, 0x03, 0x04]);
        let bytes = notify.to_payload_data();
        let parsed = NotifyPayload::from_payload_data(&bytes).unwrap();

        assert_eq!(parsed, notify);
        assert_eq!(parsed.known_type(), Some(NotifyType::RekeySa));
        assert!(!parsed.is_error());
    }

    #[test]
    fn test_notify_error_classification() {
        let notify = NotifyPayload::new(NotifyType::NoProposalChosen);
        assert!(notify.is_error());

        let bytes = notify.to_payload_data();
        let parsed = NotifyPayload::from_payload_data(&bytes).unwrap();
        assert!(parsed.data.is_empty());
        assert!(parsed.spi.is_empty());
    }

    #[test]
    fn test_delete_payload_ike() {
        let del = DeletePayload::ike();
        let bytes = del.to_payload_data();
        let parsed = DeletePayload::from_payload_data(&bytes).unwrap();
        assert_eq!(parsed.protocol_id, ProtocolId::Ike);
        assert!(parsed.spis.is_empty());
    }

    #[test]
    fn test_delete_payload_esp_spis() {
        let del = DeletePayload::esp(vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
        let bytes = del.to_payload_data();
        let parsed = DeletePayload::from_payload_data(&bytes).unwrap();
        assert_eq!(parsed.spis.len(), 2);
        assert_eq!(parsed.spis[1], vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_traffic_selector_roundtrip() {
        let ts = TrafficSelector::with_ports(v4(10, 0, 0, 0), v4(10, 0, 0, 255), 0, 65535)
            .unwrap();
        let bytes = ts.to_bytes();
        let (parsed, consumed) = TrafficSelector::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, ts);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_traffic_selector_rejects_mixed_family() {
        let result = TrafficSelector::new(v4(10, 0, 0, 1), IpAddr::V6([0u8; 16].into()));
        assert!(result.is_err());
    }

    #[test]
    fn test_traffic_selector_rejects_inverted_range() {
        assert!(TrafficSelector::new(v4(10, 0, 0, 255), v4(10, 0, 0, 0)).is_err());
        assert!(TrafficSelector::with_ports(v4(10, 0, 0, 0), v4(10, 0, 0, 1), 500, 100).is_err());
    }

    #[test]
    fn test_selector_intersection() {
        let a = TrafficSelector::with_ports(v4(10, 0, 0, 0), v4(10, 0, 0, 255), 0, 1000).unwrap();
        let b = TrafficSelector::with_ports(v4(10, 0, 0, 128), v4(10, 0, 1, 0), 500, 65535)
            .unwrap();

        let i = a.intersect(&b).unwrap();
        assert_eq!(i.start_addr, v4(10, 0, 0, 128));
        assert_eq!(i.end_addr, v4(10, 0, 0, 255));
        assert_eq!(i.start_port, 500);
        assert_eq!(i.end_port, 1000);
    }

    #[test]
    fn test_selector_disjoint() {
        let a = TrafficSelector::new(v4(10, 0, 0, 0), v4(10, 0, 0, 255)).unwrap();
        let b = TrafficSelector::new(v4(192, 168, 0, 0), v4(192, 168, 0, 255)).unwrap();
        assert!(a.intersect(&b).is_none());
    }

    #[test]
    fn test_narrow_selectors_empty_is_unacceptable() {
        let local = vec![TrafficSelector::new(v4(10, 0, 0, 0), v4(10, 0, 0, 255)).unwrap()];
        let peer = vec![TrafficSelector::new(v4(172, 16, 0, 0), v4(172, 16, 0, 255)).unwrap()];
        let result = narrow_selectors(&local, &peer);
        assert!(matches!(result, Err(Error::TsUnacceptable)));
    }

    #[test]
    fn test_narrow_selectors_intersection() {
        let local = vec![TrafficSelector::all_ipv4()];
        let peer = vec![TrafficSelector::new(v4(10, 1, 0, 0), v4(10, 1, 255, 255)).unwrap()];
        let narrowed = narrow_selectors(&local, &peer).unwrap();
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].start_addr, v4(10, 1, 0, 0));
    }

    #[test]
    fn test_ts_payload_roundtrip() {
        let ts = TsPayload::new(vec![
            TrafficSelector::all_ipv4(),
            TrafficSelector::new(v4(10, 0, 0, 1), v4(10, 0, 0, 1)).unwrap(),
        ]);
        let bytes = ts.to_payload_data();
        let parsed = TsPayload::from_payload_data(&bytes).unwrap();
        assert_eq!(parsed, ts);
    }

    #[test]
    fn test_config_payload_roundtrip() {
        let cp = ConfigPayload::request(vec![
            ConfigAttribute {
                attr_type: ConfigAttributeType::InternalIp4Address.to_u16(),
                value: Vec::new(),
            },
            ConfigAttribute {
                attr_type: ConfigAttributeType::InternalIp4Dns.to_u16(),
                value: Vec::new(),
            },
        ]);
        let bytes = cp.to_payload_data();
        let parsed = ConfigPayload::from_payload_data(&bytes).unwrap();
        assert_eq!(parsed, cp);
        assert_eq!(parsed.cfg_type, CFG_REQUEST);
    }

    #[test]
    fn test_config_reply_with_values() {
        let cp = ConfigPayload::reply(vec![ConfigAttribute {
            attr_type: ConfigAttributeType::InternalIp4Address.to_u16(),
            value: vec![10, 8, 0, 2],
        }]);
        let bytes = cp.to_payload_data();
        let parsed = ConfigPayload::from_payload_data(&bytes).unwrap();
        assert_eq!(parsed.attributes[0].value, vec![10, 8, 0, 2]);
    }

    #[test]
    fn test_payload_chain_roundtrip() {
        let payloads = vec![
            IkePayload::Nonce(NoncePayload::new(vec![7u8; 32]).unwrap()),
            IkePayload::Notify(NotifyPayload::new(NotifyType::FragmentationSupported)),
            IkePayload::Ke(KePayload::new(14, vec![0xAA; 64])),
        ];

        let bytes = encode_payload_chain(&payloads);
        let first = first_payload_type(&payloads);
        assert_eq!(first, PayloadType::Nonce.to_u8());

        let parsed = decode_payload_chain(first, &bytes).unwrap();
        assert_eq!(parsed, payloads);
    }

    #[test]
    fn test_payload_chain_unknown_non_critical_retained() {
        // Hand-build a chain: one unknown payload (type 200), then a nonce
        let nonce_body = vec![7u8; 16];
        let mut bytes = Vec::new();
        // Unknown payload header: next = Nonce, not critical, length 4 + 3
        bytes.extend_from_slice(&[PayloadType::Nonce.to_u8(), 0x00, 0, 7]);
        bytes.extend_from_slice(&[1, 2, 3]);
        // Nonce payload header: next = none
        bytes.extend_from_slice(&[0, 0x00, 0, 20]);
        bytes.extend_from_slice(&nonce_body);

        let parsed = decode_payload_chain(200, &bytes).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(matches!(
            parsed[0],
            IkePayload::Unknown {
                payload_type: 200,
                ..
            }
        ));
    }

    #[test]
    fn test_payload_chain_unknown_critical_fails() {
        let mut bytes = Vec::new();
        // Unknown payload, critical bit set
        bytes.extend_from_slice(&[0, 0x80, 0, 7]);
        bytes.extend_from_slice(&[1, 2, 3]);

        let result = decode_payload_chain(200, &bytes);
        assert!(matches!(result, Err(Error::UnknownCriticalPayload(200))));
    }

    #[test]
    fn test_payload_chain_truncated() {
        let payloads = vec![IkePayload::Nonce(NoncePayload::new(vec![7u8; 32]).unwrap())];
        let bytes = encode_payload_chain(&payloads);
        let result = decode_payload_chain(first_payload_type(&payloads), &bytes[..10]);
        assert!(result.is_err());
    }

    #[test]
    fn test_eap_payload_roundtrip() {
        let eap = EapPayload::new(vec![0x02, 0x01, 0x00, 0x0A, 0x17, 0x05]);
        let bytes = eap.to_payload_data();
        let parsed = EapPayload::from_payload_data(&bytes).unwrap();
        assert_eq!(parsed, eap);
    }

    #[test]
    fn test_id_payload_fqdn() {
        let id = IdPayload::from_fqdn("gw.example.net");
        assert_eq!(id.id_type, IdType::Fqdn);
        assert_eq!(id.as_string().unwrap(), "gw.example.net");

        let bytes = id.to_payload_data();
        let parsed = IdPayload::from_payload_data(&bytes).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_auth_payload_roundtrip() {
        let auth = AuthPayload::new(AuthMethod::SharedKeyMic, vec![0xAB; 32]);
        let bytes = auth.to_payload_data();
        let parsed = AuthPayload::from_payload_data(&bytes).unwrap();
        assert_eq!(parsed, auth);
    }
}
