//! IKEv2 Message header and framing
//!
//! Implements the IKE header (RFC 7296 Section 3.1), plaintext message
//! encoding/decoding for IKE_SA_INIT, and SK-sealed encoding/decoding for
//! every protected exchange.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       IKE SA Initiator's SPI                  |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       IKE SA Responder's SPI                  |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Message ID                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            Length                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use super::constants::{
    ExchangeType, IkeFlags, PayloadType, IKE_HEADER_SIZE, IKE_VERSION, MAX_IKE_MESSAGE_SIZE,
};
use super::payload::{
    decode_payload_chain, encode_payload_chain, first_payload_type, IkePayload, PayloadHeader,
};
use crate::crypto::CryptoProvider;
use crate::error::{Error, Result};

/// IKE message header (28 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IkeHeader {
    /// Initiator's SPI
    pub initiator_spi: u64,

    /// Responder's SPI (zero in the IKE_SA_INIT request)
    pub responder_spi: u64,

    /// Type of the first payload
    pub next_payload: u8,

    /// Exchange type
    pub exchange_type: ExchangeType,

    /// Flags (response / initiator bits)
    pub flags: IkeFlags,

    /// Message ID
    pub message_id: u32,

    /// Total message length including this header
    pub length: u32,
}

impl IkeHeader {
    /// Create new header
    pub fn new(
        initiator_spi: u64,
        responder_spi: u64,
        next_payload: u8,
        exchange_type: ExchangeType,
        flags: IkeFlags,
        message_id: u32,
    ) -> Self {
        IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload,
            exchange_type,
            flags,
            message_id,
            length: IKE_HEADER_SIZE as u32,
        }
    }

    /// Parse header from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < IKE_HEADER_SIZE {
            return Err(Error::BufferTooShort {
                required: IKE_HEADER_SIZE,
                available: data.len(),
            });
        }

        let initiator_spi = u64::from_be_bytes(
            data[0..8]
                .try_into()
                .map_err(|_| Error::Internal("header slice length".to_string()))?,
        );
        let responder_spi = u64::from_be_bytes(
            data[8..16]
                .try_into()
                .map_err(|_| Error::Internal("header slice length".to_string()))?,
        );

        let next_payload = data[16];

        let version = data[17];
        if version != IKE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let exchange_type = ExchangeType::from_u8(data[18])
            .ok_or(Error::UnsupportedExchangeType(data[18]))?;

        let flags = IkeFlags::new(data[19]);

        let message_id = u32::from_be_bytes(
            data[20..24]
                .try_into()
                .map_err(|_| Error::Internal("header slice length".to_string()))?,
        );
        let length = u32::from_be_bytes(
            data[24..28]
                .try_into()
                .map_err(|_| Error::Internal("header slice length".to_string()))?,
        );

        if length < IKE_HEADER_SIZE as u32 {
            return Err(Error::InvalidLength {
                expected: IKE_HEADER_SIZE,
                actual: length as usize,
            });
        }
        if length > MAX_IKE_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(length));
        }

        Ok(IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload,
            exchange_type,
            flags,
            message_id,
            length,
        })
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; IKE_HEADER_SIZE] {
        let mut bytes = [0u8; IKE_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.initiator_spi.to_be_bytes());
        bytes[8..16].copy_from_slice(&self.responder_spi.to_be_bytes());
        bytes[16] = self.next_payload;
        bytes[17] = IKE_VERSION;
        bytes[18] = self.exchange_type.to_u8();
        bytes[19] = self.flags.value();
        bytes[20..24].copy_from_slice(&self.message_id.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// SPI pair as a tuple, for reassembly and session keying
    pub fn spi_pair(&self) -> (u64, u64) {
        (self.initiator_spi, self.responder_spi)
    }
}

/// A decoded IKE message: header plus ordered payloads
#[derive(Debug, Clone, PartialEq)]
pub struct IkeMessage {
    /// Message header
    pub header: IkeHeader,

    /// Payloads in wire order
    pub payloads: Vec<IkePayload>,
}

impl IkeMessage {
    /// Build a plaintext message
    pub fn new(
        initiator_spi: u64,
        responder_spi: u64,
        exchange_type: ExchangeType,
        flags: IkeFlags,
        message_id: u32,
        payloads: Vec<IkePayload>,
    ) -> Self {
        let next_payload = first_payload_type(&payloads);
        IkeMessage {
            header: IkeHeader::new(
                initiator_spi,
                responder_spi,
                next_payload,
                exchange_type,
                flags,
                message_id,
            ),
            payloads,
        }
    }

    /// Encode as a plaintext message (IKE_SA_INIT)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let chain = encode_payload_chain(&self.payloads);
        let length = (IKE_HEADER_SIZE + chain.len()) as u32;
        if length > MAX_IKE_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(length));
        }

        let mut header = self.header;
        header.next_payload = first_payload_type(&self.payloads);
        header.length = length;

        let mut bytes = Vec::with_capacity(length as usize);
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&chain);
        Ok(bytes)
    }

    /// Decode a plaintext message (IKE_SA_INIT)
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let header = IkeHeader::from_bytes(data)?;
        if (header.length as usize) > data.len() {
            return Err(Error::BufferTooShort {
                required: header.length as usize,
                available: data.len(),
            });
        }

        let body = &data[IKE_HEADER_SIZE..header.length as usize];
        let payloads = decode_payload_chain(header.next_payload, body)?;

        Ok(IkeMessage { header, payloads })
    }

    /// Find the first payload matching a predicate
    pub fn find<'a, T>(&'a self, f: impl Fn(&'a IkePayload) -> Option<T>) -> Option<T> {
        self.payloads.iter().find_map(f)
    }
}

/// Associated data for SK sealing: the header with the length zeroed
///
/// The final length depends on the sealed size, so it cannot itself be
/// covered. Everything else in the header is bound to the ciphertext.
pub(crate) fn seal_aad(header: &IkeHeader) -> Vec<u8> {
    let mut h = *header;
    h.length = 0;
    h.to_bytes().to_vec()
}

/// Encode a protected message: payload chain sealed inside an SK payload
///
/// The message header's next payload is SK; the SK payload header carries
/// the type of the first inner payload.
pub fn seal_message(
    provider: &dyn CryptoProvider,
    key: &[u8],
    initiator_spi: u64,
    responder_spi: u64,
    exchange_type: ExchangeType,
    flags: IkeFlags,
    message_id: u32,
    payloads: &[IkePayload],
) -> Result<Vec<u8>> {
    let plaintext = encode_payload_chain(payloads);

    let mut header = IkeHeader::new(
        initiator_spi,
        responder_spi,
        PayloadType::SK.to_u8(),
        exchange_type,
        flags,
        message_id,
    );

    let sealed = provider.seal(key, &plaintext, &seal_aad(&header))?;

    let sk_header = PayloadHeader::new(
        first_payload_type(payloads),
        false,
        (PayloadHeader::SIZE + sealed.len()) as u16,
    );

    let length = (IKE_HEADER_SIZE + PayloadHeader::SIZE + sealed.len()) as u32;
    if length > MAX_IKE_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge(length));
    }
    header.length = length;

    let mut bytes = Vec::with_capacity(length as usize);
    bytes.extend_from_slice(&header.to_bytes());
    bytes.extend_from_slice(&sk_header.to_bytes());
    bytes.extend_from_slice(&sealed);
    Ok(bytes)
}

/// Decode a protected message
///
/// Expects the header's next payload to be SK. Returns the header and the
/// inner payload chain.
pub fn open_message(
    provider: &dyn CryptoProvider,
    key: &[u8],
    data: &[u8],
) -> Result<IkeMessage> {
    let header = IkeHeader::from_bytes(data)?;
    if (header.length as usize) > data.len() {
        return Err(Error::BufferTooShort {
            required: header.length as usize,
            available: data.len(),
        });
    }
    if header.next_payload != PayloadType::SK.to_u8() {
        return Err(Error::InvalidMessage(format!(
            "Expected SK payload, got type {}",
            header.next_payload
        )));
    }

    let body = &data[IKE_HEADER_SIZE..header.length as usize];
    let sk_header = PayloadHeader::from_bytes(body)?;
    if (sk_header.length as usize) > body.len() {
        return Err(Error::BufferTooShort {
            required: sk_header.length as usize,
            available: body.len(),
        });
    }

    let sealed = &body[PayloadHeader::SIZE..sk_header.length as usize];
    let plaintext = provider.open(key, sealed, &seal_aad(&header))?;

    let payloads = decode_payload_chain(sk_header.next_payload, &plaintext)?;

    Ok(IkeMessage { header, payloads })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{PassthroughCrypto, StandardCryptoProvider};
    use crate::ikev2::constants::NotifyType;
    use crate::ikev2::payload::{NoncePayload, NotifyPayload};

    fn sample_payloads() -> Vec<IkePayload> {
        vec![
            IkePayload::Nonce(NoncePayload::new(vec![9u8; 32]).unwrap()),
            IkePayload::Notify(NotifyPayload::new(NotifyType::FragmentationSupported)),
        ]
    }

    #[test]
    fn test_header_roundtrip() {
        let header = IkeHeader::new(
            0x1122334455667788,
            0x99AABBCCDDEEFF00,
            PayloadType::SA.to_u8(),
            ExchangeType::IkeSaInit,
            IkeFlags::request(true),
            0,
        );
        let bytes = header.to_bytes();
        let parsed = IkeHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.spi_pair(), (0x1122334455667788, 0x99AABBCCDDEEFF00));
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let header = IkeHeader::new(
            1,
            2,
            0,
            ExchangeType::IkeAuth,
            IkeFlags::request(true),
            1,
        );
        let mut bytes = header.to_bytes();
        bytes[17] = 0x10; // IKEv1
        let result = IkeHeader::from_bytes(&bytes);
        assert!(matches!(result, Err(Error::UnsupportedVersion(0x10))));
    }

    #[test]
    fn test_header_rejects_bad_exchange() {
        let header = IkeHeader::new(
            1,
            2,
            0,
            ExchangeType::IkeAuth,
            IkeFlags::request(true),
            1,
        );
        let mut bytes = header.to_bytes();
        bytes[18] = 99;
        let result = IkeHeader::from_bytes(&bytes);
        assert!(matches!(result, Err(Error::UnsupportedExchangeType(99))));
    }

    #[test]
    fn test_header_rejects_short_length() {
        let header = IkeHeader::new(
            1,
            2,
            0,
            ExchangeType::IkeAuth,
            IkeFlags::request(true),
            1,
        );
        let mut bytes = header.to_bytes();
        bytes[24..28].copy_from_slice(&10u32.to_be_bytes());
        let result = IkeHeader::from_bytes(&bytes);
        assert!(matches!(result, Err(Error::InvalidLength { .. })));
    }

    #[test]
    fn test_plaintext_message_roundtrip() {
        let msg = IkeMessage::new(
            0xAA,
            0,
            ExchangeType::IkeSaInit,
            IkeFlags::request(true),
            0,
            sample_payloads(),
        );
        let bytes = msg.to_bytes().unwrap();
        let parsed = IkeMessage::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.header.exchange_type, ExchangeType::IkeSaInit);
        assert_eq!(parsed.header.message_id, 0);
        assert_eq!(parsed.payloads, msg.payloads);
        assert_eq!(parsed.header.length as usize, bytes.len());
    }

    #[test]
    fn test_sealed_message_roundtrip_passthrough() {
        let provider = PassthroughCrypto::new();
        let payloads = sample_payloads();
        let bytes = seal_message(
            &provider,
            &[],
            0x11,
            0x22,
            ExchangeType::IkeAuth,
            IkeFlags::request(true),
            1,
            &payloads,
        )
        .unwrap();

        let msg = open_message(&provider, &[], &bytes).unwrap();
        assert_eq!(msg.header.message_id, 1);
        assert_eq!(msg.payloads, payloads);
    }

    #[test]
    fn test_sealed_message_roundtrip_aes_gcm() {
        let provider = StandardCryptoProvider::new();
        let key = vec![0x13; 32];
        let payloads = sample_payloads();
        let bytes = seal_message(
            &provider,
            &key,
            0x11,
            0x22,
            ExchangeType::CreateChildSa,
            IkeFlags::response(false),
            7,
            &payloads,
        )
        .unwrap();

        let msg = open_message(&provider, &key, &bytes).unwrap();
        assert_eq!(msg.payloads, payloads);
        assert_eq!(msg.header.exchange_type, ExchangeType::CreateChildSa);
        assert!(msg.header.flags.is_response());
    }

    #[test]
    fn test_open_rejects_wrong_key() {
        let provider = StandardCryptoProvider::new();
        let bytes = seal_message(
            &provider,
            &[0x13; 32],
            0x11,
            0x22,
            ExchangeType::IkeAuth,
            IkeFlags::request(true),
            1,
            &sample_payloads(),
        )
        .unwrap();

        let result = open_message(&provider, &[0x14; 32], &bytes);
        assert!(result.is_err());
    }

    #[test]
    fn test_open_rejects_header_tamper() {
        // Header is bound as associated data, so flipping the exchange type
        // must fail the open
        let provider = StandardCryptoProvider::new();
        let key = vec![0x13; 16];
        let mut bytes = seal_message(
            &provider,
            &key,
            0x11,
            0x22,
            ExchangeType::IkeAuth,
            IkeFlags::request(true),
            1,
            &sample_payloads(),
        )
        .unwrap();
        bytes[18] = ExchangeType::Informational.to_u8();

        let result = open_message(&provider, &key, &bytes);
        assert!(result.is_err());
    }

    #[test]
    fn test_open_rejects_plaintext_message() {
        let provider = PassthroughCrypto::new();
        let msg = IkeMessage::new(
            0xAA,
            0,
            ExchangeType::IkeSaInit,
            IkeFlags::request(true),
            0,
            sample_payloads(),
        );
        let bytes = msg.to_bytes().unwrap();
        let result = open_message(&provider, &[], &bytes);
        assert!(matches!(result, Err(Error::InvalidMessage(_))));
    }
}
