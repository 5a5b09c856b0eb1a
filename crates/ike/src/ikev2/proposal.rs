//! IKEv2 Proposal and Transform structures
//!
//! Implements SA proposal construction and negotiation as defined in
//! RFC 7296 Section 3.3.
//!
//! # Structure
//!
//! ```text
//! SA Payload
//!   └── Proposal(s)
//!         └── Transform(s)
//! ```
//!
//! Two layers live here: the wire-level [`Proposal`]/[`Transform`] codec, and
//! the typed [`IkeSaProposal`]/[`ChildSaProposal`] builders that applications
//! configure. Negotiation walks the peer's offers in order and picks the first
//! one the local configuration can fully satisfy.

use crate::error::{Error, Result};

/// Transform Type (RFC 7296 Section 3.3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransformType {
    /// Encryption Algorithm (ENCR)
    Encr = 1,
    /// Pseudo-random Function (PRF)
    Prf = 2,
    /// Integrity Algorithm (INTEG)
    Integ = 3,
    /// Diffie-Hellman Group (D-H)
    Dh = 4,
    /// Extended Sequence Numbers (ESN)
    Esn = 5,
}

impl TransformType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TransformType::Encr),
            2 => Some(TransformType::Prf),
            3 => Some(TransformType::Integ),
            4 => Some(TransformType::Dh),
            5 => Some(TransformType::Esn),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Encryption algorithm transform IDs (ENCR)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EncryptionId {
    /// AES-CBC (key length carried as an attribute)
    AesCbc = 12,
    /// AES-GCM with 8-byte ICV
    AesGcm8 = 18,
    /// AES-GCM with 12-byte ICV
    AesGcm12 = 19,
    /// AES-GCM with 16-byte ICV
    AesGcm16 = 20,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305 = 28,
}

impl EncryptionId {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            12 => Some(EncryptionId::AesCbc),
            18 => Some(EncryptionId::AesGcm8),
            19 => Some(EncryptionId::AesGcm12),
            20 => Some(EncryptionId::AesGcm16),
            28 => Some(EncryptionId::ChaCha20Poly1305),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Check if this is an AEAD cipher (combined mode, no separate integrity)
    pub fn is_aead(self) -> bool {
        matches!(
            self,
            EncryptionId::AesGcm8
                | EncryptionId::AesGcm12
                | EncryptionId::AesGcm16
                | EncryptionId::ChaCha20Poly1305
        )
    }
}

/// PRF algorithm transform IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PrfId {
    /// HMAC-SHA2-256
    HmacSha256 = 5,
    /// HMAC-SHA2-384
    HmacSha384 = 6,
    /// HMAC-SHA2-512
    HmacSha512 = 7,
}

impl PrfId {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            5 => Some(PrfId::HmacSha256),
            6 => Some(PrfId::HmacSha384),
            7 => Some(PrfId::HmacSha512),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Integrity algorithm transform IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum IntegrityId {
    /// NONE (only valid alongside AEAD encryption)
    None = 0,
    /// HMAC-SHA2-256-128 (128-bit ICV)
    HmacSha256_128 = 12,
    /// HMAC-SHA2-384-192 (192-bit ICV)
    HmacSha384_192 = 13,
    /// HMAC-SHA2-512-256 (256-bit ICV)
    HmacSha512_256 = 14,
}

impl IntegrityId {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(IntegrityId::None),
            12 => Some(IntegrityId::HmacSha256_128),
            13 => Some(IntegrityId::HmacSha384_192),
            14 => Some(IntegrityId::HmacSha512_256),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Diffie-Hellman group transform IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DhGroup {
    /// NONE (Child SA without PFS)
    None = 0,
    /// 2048-bit MODP Group
    Group14 = 14,
    /// 3072-bit MODP Group
    Group15 = 15,
    /// 4096-bit MODP Group
    Group16 = 16,
    /// Curve25519
    Group31 = 31,
}

impl DhGroup {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(DhGroup::None),
            14 => Some(DhGroup::Group14),
            15 => Some(DhGroup::Group15),
            16 => Some(DhGroup::Group16),
            31 => Some(DhGroup::Group31),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Key Length attribute type (RFC 7296 Section 3.3.5)
pub const ATTR_KEY_LENGTH: u16 = 14;

/// TV-format attribute flag (attribute format bit)
const ATTR_TV_FLAG: u16 = 0x8000;

/// An encryption algorithm choice with optional key length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncryptionTransform {
    /// Algorithm ID
    pub algorithm: EncryptionId,
    /// Key length in bits, when the algorithm is variable-length
    pub key_len: Option<u16>,
}

impl EncryptionTransform {
    /// AES-GCM with 16-byte ICV and the given key length
    pub fn aes_gcm(key_len: u16) -> Self {
        EncryptionTransform {
            algorithm: EncryptionId::AesGcm16,
            key_len: Some(key_len),
        }
    }

    /// AES-CBC with the given key length
    pub fn aes_cbc(key_len: u16) -> Self {
        EncryptionTransform {
            algorithm: EncryptionId::AesCbc,
            key_len: Some(key_len),
        }
    }

    /// ChaCha20-Poly1305 (fixed key length)
    pub fn chacha20_poly1305() -> Self {
        EncryptionTransform {
            algorithm: EncryptionId::ChaCha20Poly1305,
            key_len: None,
        }
    }
}

/// IKE Transform (wire level)
///
/// One cryptographic algorithm choice inside a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    /// Transform type
    pub transform_type: TransformType,

    /// Transform ID
    pub transform_id: u16,

    /// Key length in bits (attribute type 14), if present
    pub key_len: Option<u16>,
}

impl Transform {
    /// Create new transform
    pub fn new(transform_type: TransformType, transform_id: u16) -> Self {
        Transform {
            transform_type,
            transform_id,
            key_len: None,
        }
    }

    /// Create encryption transform
    pub fn encr(et: EncryptionTransform) -> Self {
        Transform {
            transform_type: TransformType::Encr,
            transform_id: et.algorithm.to_u16(),
            key_len: et.key_len,
        }
    }

    /// Create PRF transform
    pub fn prf(id: PrfId) -> Self {
        Transform::new(TransformType::Prf, id.to_u16())
    }

    /// Create integrity transform
    pub fn integ(id: IntegrityId) -> Self {
        Transform::new(TransformType::Integ, id.to_u16())
    }

    /// Create DH group transform
    pub fn dh(id: DhGroup) -> Self {
        Transform::new(TransformType::Dh, id.to_u16())
    }

    /// Set key length attribute
    pub fn with_key_len(mut self, bits: u16) -> Self {
        self.key_len = Some(bits);
        self
    }

    /// Check if this transform matches another (type, ID and key length)
    pub fn matches(&self, other: &Transform) -> bool {
        self.transform_type == other.transform_type
            && self.transform_id == other.transform_id
            && self.key_len == other.key_len
    }

    /// Serialize transform to bytes (RFC 7296 Section 3.3.2)
    ///
    /// Format:
    /// - Byte 0: Last/More flag (0 = last, 3 = more)
    /// - Bytes 1-3: Reserved
    /// - Bytes 4-5: Transform Length
    /// - Byte 6: Transform Type
    /// - Byte 7: Reserved
    /// - Bytes 8-9: Transform ID
    /// - Bytes 10+: Attributes (if any)
    pub fn to_bytes(&self, is_last: bool) -> Vec<u8> {
        let mut bytes = Vec::new();

        // Key length attribute is TV format: 2-byte type with AF bit, 2-byte value
        let attr_len = if self.key_len.is_some() { 4 } else { 0 };
        // Length field counts from itself onwards:
        // length (2) + type (1) + reserved (1) + id (2) + attributes
        let total_len = 6 + attr_len;

        bytes.push(if is_last { 0 } else { 3 });
        bytes.extend_from_slice(&[0u8; 3]);
        bytes.extend_from_slice(&(total_len as u16).to_be_bytes());
        bytes.push(self.transform_type.to_u8());
        bytes.push(0);
        bytes.extend_from_slice(&self.transform_id.to_be_bytes());

        if let Some(bits) = self.key_len {
            bytes.extend_from_slice(&(ATTR_TV_FLAG | ATTR_KEY_LENGTH).to_be_bytes());
            bytes.extend_from_slice(&bits.to_be_bytes());
        }

        bytes
    }

    /// Parse transform from bytes
    ///
    /// Returns (transform, is_last, bytes consumed).
    pub fn from_bytes(data: &[u8]) -> Result<(Self, bool, usize)> {
        if data.len() < 8 {
            return Err(Error::BufferTooShort {
                required: 8,
                available: data.len(),
            });
        }

        let is_last = data[0] == 0;
        let transform_len = u16::from_be_bytes([data[4], data[5]]) as usize;

        if transform_len < 6 {
            return Err(Error::InvalidLength {
                expected: 6,
                actual: transform_len,
            });
        }
        // Total bytes on the wire include the 4-byte last/reserved prefix
        let total = 4 + transform_len;
        if data.len() < total {
            return Err(Error::BufferTooShort {
                required: total,
                available: data.len(),
            });
        }

        let transform_type = TransformType::from_u8(data[6])
            .ok_or_else(|| Error::InvalidPayload(format!("Unknown transform type: {}", data[6])))?;
        let transform_id = u16::from_be_bytes([data[8], data[9]]);

        // Parse attributes, keeping only the key length (type 14, TV format)
        let mut key_len = None;
        let mut offset = 10;
        while offset < total {
            if total - offset < 4 {
                return Err(Error::InvalidPayload(
                    "Truncated transform attribute".to_string(),
                ));
            }
            let raw_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
            if raw_type & ATTR_TV_FLAG != 0 {
                // TV format: 2-byte value follows
                let attr_type = raw_type & !ATTR_TV_FLAG;
                let value = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
                if attr_type == ATTR_KEY_LENGTH {
                    key_len = Some(value);
                }
                offset += 4;
            } else {
                // TLV format: length field, then value
                let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
                if total - offset < 4 + attr_len {
                    return Err(Error::InvalidPayload(
                        "Truncated transform attribute".to_string(),
                    ));
                }
                offset += 4 + attr_len;
            }
        }

        let transform = Transform {
            transform_type,
            transform_id,
            key_len,
        };

        Ok((transform, is_last, total))
    }
}

/// Protocol ID for proposals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolId {
    /// IKE SA
    Ike = 1,
    /// AH (Authentication Header)
    Ah = 2,
    /// ESP (Encapsulating Security Payload)
    Esp = 3,
}

impl ProtocolId {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ProtocolId::Ike),
            2 => Some(ProtocolId::Ah),
            3 => Some(ProtocolId::Esp),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// IKE Proposal (wire level)
///
/// A single numbered proposal carrying one or more transforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Proposal number (1-based)
    pub proposal_num: u8,

    /// Protocol ID (IKE, ESP, AH)
    pub protocol_id: ProtocolId,

    /// SPI, empty for the initial IKE SA
    pub spi: Vec<u8>,

    /// List of transforms
    pub transforms: Vec<Transform>,
}

impl Proposal {
    /// Create new proposal
    pub fn new(proposal_num: u8, protocol_id: ProtocolId) -> Self {
        Proposal {
            proposal_num,
            protocol_id,
            spi: Vec::new(),
            transforms: Vec::new(),
        }
    }

    /// Add transform to proposal
    pub fn add_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Set SPI
    pub fn with_spi(mut self, spi: Vec<u8>) -> Self {
        self.spi = spi;
        self
    }

    /// Get all transforms of a type, in declared order
    pub fn transforms_of(&self, transform_type: TransformType) -> impl Iterator<Item = &Transform> {
        self.transforms
            .iter()
            .filter(move |t| t.transform_type == transform_type)
    }

    /// Get first transform of a type
    pub fn get_transform(&self, transform_type: TransformType) -> Option<&Transform> {
        self.transforms
            .iter()
            .find(|t| t.transform_type == transform_type)
    }

    /// Serialize proposal to bytes (RFC 7296 Section 3.3.1)
    ///
    /// Format:
    /// - Byte 0: Last/More flag (0 = last, 2 = more)
    /// - Bytes 1-3: Reserved
    /// - Bytes 4-5: Proposal Length
    /// - Byte 6: Proposal Number
    /// - Byte 7: Protocol ID
    /// - Byte 8: SPI Size
    /// - Byte 9: Num Transforms
    /// - Bytes 10+: SPI (variable), then transforms
    pub fn to_bytes(&self, is_last: bool) -> Vec<u8> {
        let mut bytes = Vec::new();

        let transform_bytes: Vec<Vec<u8>> = self
            .transforms
            .iter()
            .enumerate()
            .map(|(i, t)| t.to_bytes(i == self.transforms.len() - 1))
            .collect();
        let transforms_len: usize = transform_bytes.iter().map(|tb| tb.len()).sum();

        let spi_size = self.spi.len();
        // Length field counts from itself onwards:
        // length (2) + num (1) + protocol (1) + spi size (1) + count (1) + SPI + transforms
        let total_len = 6 + spi_size + transforms_len;

        bytes.push(if is_last { 0 } else { 2 });
        bytes.extend_from_slice(&[0u8; 3]);
        bytes.extend_from_slice(&(total_len as u16).to_be_bytes());
        bytes.push(self.proposal_num);
        bytes.push(self.protocol_id.to_u8());
        bytes.push(spi_size as u8);
        bytes.push(self.transforms.len() as u8);
        bytes.extend_from_slice(&self.spi);

        for transform_byte in transform_bytes {
            bytes.extend_from_slice(&transform_byte);
        }

        bytes
    }

    /// Parse proposal from bytes
    ///
    /// Returns (proposal, is_last, bytes consumed).
    pub fn from_bytes(data: &[u8]) -> Result<(Self, bool, usize)> {
        if data.len() < 10 {
            return Err(Error::BufferTooShort {
                required: 10,
                available: data.len(),
            });
        }

        let is_last = data[0] == 0;
        let proposal_len = u16::from_be_bytes([data[4], data[5]]) as usize;

        if proposal_len < 6 {
            return Err(Error::InvalidLength {
                expected: 6,
                actual: proposal_len,
            });
        }
        // Total bytes on the wire include the 4-byte last/reserved prefix
        let total = 4 + proposal_len;
        if data.len() < total {
            return Err(Error::BufferTooShort {
                required: total,
                available: data.len(),
            });
        }

        let proposal_num = data[6];
        let protocol_id = ProtocolId::from_u8(data[7])
            .ok_or_else(|| Error::InvalidPayload(format!("Unknown protocol ID: {}", data[7])))?;
        let spi_size = data[8] as usize;
        let num_transforms = data[9] as usize;

        if total < 10 + spi_size {
            return Err(Error::BufferTooShort {
                required: 10 + spi_size,
                available: total,
            });
        }
        let spi = data[10..10 + spi_size].to_vec();

        let mut transforms = Vec::new();
        let mut offset = 10 + spi_size;

        for _ in 0..num_transforms {
            if offset >= total {
                return Err(Error::InvalidPayload(
                    "Transform count exceeds proposal length".to_string(),
                ));
            }
            let (transform, _, transform_len) = Transform::from_bytes(&data[offset..total])?;
            transforms.push(transform);
            offset += transform_len;
        }

        let proposal = Proposal {
            proposal_num,
            protocol_id,
            spi,
            transforms,
        };

        Ok((proposal, is_last, total))
    }
}

/// IKE SA proposal (typed)
///
/// Algorithms are kept in preference order; negotiation respects that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeSaProposal {
    encryption: Vec<EncryptionTransform>,
    prf: Vec<PrfId>,
    integrity: Vec<IntegrityId>,
    dh_groups: Vec<DhGroup>,
}

impl IkeSaProposal {
    /// Start building a proposal
    pub fn builder() -> IkeSaProposalBuilder {
        IkeSaProposalBuilder::default()
    }

    /// Encryption algorithms in preference order
    pub fn encryption(&self) -> &[EncryptionTransform] {
        &self.encryption
    }

    /// PRF algorithms in preference order
    pub fn prf(&self) -> &[PrfId] {
        &self.prf
    }

    /// Integrity algorithms in preference order
    pub fn integrity(&self) -> &[IntegrityId] {
        &self.integrity
    }

    /// DH groups in preference order
    pub fn dh_groups(&self) -> &[DhGroup] {
        &self.dh_groups
    }

    /// Convert to a wire proposal
    pub fn to_wire(&self, proposal_num: u8, spi: Vec<u8>) -> Proposal {
        let mut p = Proposal::new(proposal_num, ProtocolId::Ike).with_spi(spi);
        for e in &self.encryption {
            p = p.add_transform(Transform::encr(*e));
        }
        for prf in &self.prf {
            p = p.add_transform(Transform::prf(*prf));
        }
        for i in &self.integrity {
            p = p.add_transform(Transform::integ(*i));
        }
        for dh in &self.dh_groups {
            p = p.add_transform(Transform::dh(*dh));
        }
        p
    }
}

/// Builder for [`IkeSaProposal`]
#[derive(Debug, Clone, Default)]
pub struct IkeSaProposalBuilder {
    encryption: Vec<EncryptionTransform>,
    prf: Vec<PrfId>,
    integrity: Vec<IntegrityId>,
    dh_groups: Vec<DhGroup>,
}

impl IkeSaProposalBuilder {
    /// Add an encryption algorithm
    pub fn add_encryption(mut self, transform: EncryptionTransform) -> Self {
        self.encryption.push(transform);
        self
    }

    /// Add a PRF algorithm
    pub fn add_prf(mut self, prf: PrfId) -> Self {
        self.prf.push(prf);
        self
    }

    /// Add an integrity algorithm
    pub fn add_integrity(mut self, integ: IntegrityId) -> Self {
        self.integrity.push(integ);
        self
    }

    /// Add a DH group
    pub fn add_dh_group(mut self, group: DhGroup) -> Self {
        self.dh_groups.push(group);
        self
    }

    /// Validate and build
    ///
    /// An IKE proposal needs at least one encryption algorithm, one PRF and
    /// one DH group. Integrity NONE is only allowed when every encryption
    /// algorithm is an AEAD.
    pub fn build(self) -> Result<IkeSaProposal> {
        if self.encryption.is_empty() {
            return Err(Error::InvalidParameter(
                "IKE proposal requires at least one encryption algorithm".to_string(),
            ));
        }
        if self.prf.is_empty() {
            return Err(Error::InvalidParameter(
                "IKE proposal requires at least one PRF".to_string(),
            ));
        }
        if self.dh_groups.is_empty() || self.dh_groups.contains(&DhGroup::None) {
            return Err(Error::InvalidParameter(
                "IKE proposal requires at least one real DH group".to_string(),
            ));
        }

        let all_aead = self.encryption.iter().all(|e| e.algorithm.is_aead());
        let integrity_none = self.integrity.is_empty() || self.integrity.contains(&IntegrityId::None);
        if integrity_none && !all_aead {
            return Err(Error::InvalidParameter(
                "Integrity NONE requires AEAD encryption".to_string(),
            ));
        }

        Ok(IkeSaProposal {
            encryption: self.encryption,
            prf: self.prf,
            integrity: self.integrity,
            dh_groups: self.dh_groups,
        })
    }
}

/// Child SA proposal (typed, ESP)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSaProposal {
    encryption: Vec<EncryptionTransform>,
    integrity: Vec<IntegrityId>,
    dh_groups: Vec<DhGroup>,
}

impl ChildSaProposal {
    /// Start building a proposal
    pub fn builder() -> ChildSaProposalBuilder {
        ChildSaProposalBuilder::default()
    }

    /// Encryption algorithms in preference order
    pub fn encryption(&self) -> &[EncryptionTransform] {
        &self.encryption
    }

    /// Integrity algorithms in preference order
    pub fn integrity(&self) -> &[IntegrityId] {
        &self.integrity
    }

    /// DH groups in preference order (may be empty, no PFS)
    pub fn dh_groups(&self) -> &[DhGroup] {
        &self.dh_groups
    }

    /// Convert to a wire proposal carrying the given ESP SPI
    pub fn to_wire(&self, proposal_num: u8, spi: Vec<u8>) -> Proposal {
        let mut p = Proposal::new(proposal_num, ProtocolId::Esp).with_spi(spi);
        for e in &self.encryption {
            p = p.add_transform(Transform::encr(*e));
        }
        for i in &self.integrity {
            p = p.add_transform(Transform::integ(*i));
        }
        for dh in &self.dh_groups {
            if *dh != DhGroup::None {
                p = p.add_transform(Transform::dh(*dh));
            }
        }
        p
    }
}

/// Builder for [`ChildSaProposal`]
#[derive(Debug, Clone, Default)]
pub struct ChildSaProposalBuilder {
    encryption: Vec<EncryptionTransform>,
    integrity: Vec<IntegrityId>,
    dh_groups: Vec<DhGroup>,
}

impl ChildSaProposalBuilder {
    /// Add an encryption algorithm
    pub fn add_encryption(mut self, transform: EncryptionTransform) -> Self {
        self.encryption.push(transform);
        self
    }

    /// Add an integrity algorithm
    pub fn add_integrity(mut self, integ: IntegrityId) -> Self {
        self.integrity.push(integ);
        self
    }

    /// Add a DH group (PFS)
    pub fn add_dh_group(mut self, group: DhGroup) -> Self {
        self.dh_groups.push(group);
        self
    }

    /// Validate and build
    ///
    /// Integrity NONE is only allowed when every encryption algorithm is an
    /// AEAD. Child proposals carry no PRF.
    pub fn build(self) -> Result<ChildSaProposal> {
        if self.encryption.is_empty() {
            return Err(Error::InvalidParameter(
                "Child proposal requires at least one encryption algorithm".to_string(),
            ));
        }

        let all_aead = self.encryption.iter().all(|e| e.algorithm.is_aead());
        let integrity_none = self.integrity.is_empty() || self.integrity.contains(&IntegrityId::None);
        if integrity_none && !all_aead {
            return Err(Error::InvalidParameter(
                "Integrity NONE requires AEAD encryption".to_string(),
            ));
        }

        Ok(ChildSaProposal {
            encryption: self.encryption,
            integrity: self.integrity,
            dh_groups: self.dh_groups,
        })
    }
}

/// The outcome of a successful negotiation: one transform per category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedIkeSa {
    /// Chosen encryption transform
    pub encryption: EncryptionTransform,
    /// Chosen PRF
    pub prf: PrfId,
    /// Chosen integrity algorithm, None for AEAD
    pub integrity: Option<IntegrityId>,
    /// Chosen DH group
    pub dh_group: DhGroup,
    /// Number of the peer proposal that was accepted
    pub proposal_num: u8,
}

/// The outcome of a successful Child SA negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedChildSa {
    /// Chosen encryption transform
    pub encryption: EncryptionTransform,
    /// Chosen integrity algorithm, None for AEAD
    pub integrity: Option<IntegrityId>,
    /// Chosen DH group, None when the exchange carries no KE
    pub dh_group: Option<DhGroup>,
    /// Number of the peer proposal that was accepted
    pub proposal_num: u8,
    /// Peer's SPI from the accepted proposal
    pub peer_spi: Vec<u8>,
}

fn pick_encryption(
    offered: &Proposal,
    configured: &[EncryptionTransform],
) -> Option<EncryptionTransform> {
    for t in offered.transforms_of(TransformType::Encr) {
        let candidate = EncryptionId::from_u16(t.transform_id).map(|algorithm| {
            EncryptionTransform {
                algorithm,
                key_len: t.key_len,
            }
        });
        if let Some(candidate) = candidate {
            if configured.contains(&candidate) {
                return Some(candidate);
            }
        }
    }
    None
}

fn pick_prf(offered: &Proposal, configured: &[PrfId]) -> Option<PrfId> {
    for t in offered.transforms_of(TransformType::Prf) {
        if let Some(prf) = PrfId::from_u16(t.transform_id) {
            if configured.contains(&prf) {
                return Some(prf);
            }
        }
    }
    None
}

fn pick_integrity(offered: &Proposal, configured: &[IntegrityId]) -> Option<IntegrityId> {
    for t in offered.transforms_of(TransformType::Integ) {
        if let Some(integ) = IntegrityId::from_u16(t.transform_id) {
            if configured.contains(&integ) {
                return Some(integ);
            }
        }
    }
    None
}

fn pick_dh(offered: &Proposal, configured: &[DhGroup]) -> Option<DhGroup> {
    for t in offered.transforms_of(TransformType::Dh) {
        if let Some(dh) = DhGroup::from_u16(t.transform_id) {
            if configured.contains(&dh) {
                return Some(dh);
            }
        }
    }
    None
}

/// Select an IKE SA from the peer's offered proposals
///
/// Walks the peer's proposals in their declared order; the first one where
/// every mandatory category (ENCR, PRF, D-H, and INTEG unless the chosen
/// cipher is AEAD) has a mutually supported choice wins. Within a proposal,
/// the first mutually supported transform per category is taken, again in
/// the peer's declared order.
///
/// # Errors
///
/// Returns [`Error::NoProposalChosen`] when no offer is fully satisfiable.
pub fn select_ike_proposal(
    offered: &[Proposal],
    configured: &[IkeSaProposal],
) -> Result<NegotiatedIkeSa> {
    for proposal in offered {
        if proposal.protocol_id != ProtocolId::Ike {
            continue;
        }
        for config in configured {
            let encryption = match pick_encryption(proposal, config.encryption()) {
                Some(e) => e,
                None => continue,
            };
            let prf = match pick_prf(proposal, config.prf()) {
                Some(p) => p,
                None => continue,
            };
            let dh_group = match pick_dh(proposal, config.dh_groups()) {
                Some(d) => d,
                None => continue,
            };
            let integrity = if encryption.algorithm.is_aead() {
                None
            } else {
                match pick_integrity(proposal, config.integrity()) {
                    Some(IntegrityId::None) | None => continue,
                    Some(i) => Some(i),
                }
            };

            return Ok(NegotiatedIkeSa {
                encryption,
                prf,
                integrity,
                dh_group,
                proposal_num: proposal.proposal_num,
            });
        }
    }

    Err(Error::NoProposalChosen)
}

/// Select a Child SA from the peer's offered proposals
///
/// Same first-satisfiable walk as [`select_ike_proposal`], but Child
/// proposals carry no PRF and may omit the DH group entirely.
pub fn select_child_proposal(
    offered: &[Proposal],
    configured: &[ChildSaProposal],
) -> Result<NegotiatedChildSa> {
    for proposal in offered {
        if proposal.protocol_id != ProtocolId::Esp {
            continue;
        }
        for config in configured {
            let encryption = match pick_encryption(proposal, config.encryption()) {
                Some(e) => e,
                None => continue,
            };
            let integrity = if encryption.algorithm.is_aead() {
                None
            } else {
                match pick_integrity(proposal, config.integrity()) {
                    Some(IntegrityId::None) | None => continue,
                    Some(i) => Some(i),
                }
            };
            // DH is optional for Child SAs: only negotiated when both sides
            // offered at least one group.
            let offers_dh = proposal.get_transform(TransformType::Dh).is_some();
            let dh_group = if offers_dh && !config.dh_groups().is_empty() {
                match pick_dh(proposal, config.dh_groups()) {
                    Some(d) => Some(d),
                    None => continue,
                }
            } else {
                None
            };

            return Ok(NegotiatedChildSa {
                encryption,
                integrity,
                dh_group,
                proposal_num: proposal.proposal_num,
                peer_spi: proposal.spi.clone(),
            });
        }
    }

    Err(Error::NoProposalChosen)
}
