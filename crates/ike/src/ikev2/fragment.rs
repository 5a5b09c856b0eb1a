//! IKEv2 Message Fragmentation (RFC 7383)
//!
//! Large protected messages (in practice IKE_AUTH) are split into
//! Encrypted Fragment (SKF) payloads so each UDP datagram stays under the
//! path MTU. Each fragment is a complete IKE message whose only payload is
//! one SKF, sealed independently:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Next Payload  |C|  RESERVED   |         Payload Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Fragment Number        |        Total Fragments        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ~                      Encrypted content                        ~
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Fragment numbers are 1-based. Reassembly is keyed by (SPI pair,
//! message ID); duplicates with identical content are ignored, any
//! inconsistency fails the message.

use std::collections::{BTreeMap, HashMap};

use super::constants::{ExchangeType, IkeFlags, PayloadType, IKE_HEADER_SIZE};
use super::message::{seal_aad, IkeHeader, IkeMessage};
use super::payload::{
    decode_payload_chain, encode_payload_chain, first_payload_type, IkePayload, PayloadHeader,
};
use crate::crypto::CryptoProvider;
use crate::error::{Error, Result};

/// Fixed per-fragment overhead: IKE header, SKF header, fragment fields and
/// sealing expansion
const FRAGMENT_OVERHEAD: usize = IKE_HEADER_SIZE + PayloadHeader::SIZE + 4 + 28;

fn fragment_aad(header: &IkeHeader, fragment_number: u16, total_fragments: u16) -> Vec<u8> {
    let mut aad = seal_aad(header);
    aad.extend_from_slice(&fragment_number.to_be_bytes());
    aad.extend_from_slice(&total_fragments.to_be_bytes());
    aad
}

/// Split a payload chain into sealed SKF fragment datagrams
///
/// Each returned Vec<u8> is one complete IKE message. All fragments share
/// the message ID; numbering is 1-based. The first fragment's SKF header
/// carries the type of the first inner payload, later ones carry zero.
#[allow(clippy::too_many_arguments)]
pub fn fragment_message(
    provider: &dyn CryptoProvider,
    key: &[u8],
    initiator_spi: u64,
    responder_spi: u64,
    exchange_type: ExchangeType,
    flags: IkeFlags,
    message_id: u32,
    payloads: &[IkePayload],
    threshold: usize,
) -> Result<Vec<Vec<u8>>> {
    let plaintext = encode_payload_chain(payloads);

    let chunk_size = threshold.saturating_sub(FRAGMENT_OVERHEAD);
    if chunk_size == 0 {
        return Err(Error::InvalidParameter(format!(
            "Fragment threshold {} leaves no room for content",
            threshold
        )));
    }

    let chunks: Vec<&[u8]> = plaintext.chunks(chunk_size).collect();
    let total = chunks.len() as u16;
    let inner_first = first_payload_type(payloads);

    let mut datagrams = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        let fragment_number = (i + 1) as u16;

        let mut header = IkeHeader::new(
            initiator_spi,
            responder_spi,
            PayloadType::SKF.to_u8(),
            exchange_type,
            flags,
            message_id,
        );

        let sealed = provider.seal(key, chunk, &fragment_aad(&header, fragment_number, total))?;

        let skf_next = if fragment_number == 1 { inner_first } else { 0 };
        let skf_header = PayloadHeader::new(
            skf_next,
            false,
            (PayloadHeader::SIZE + 4 + sealed.len()) as u16,
        );

        header.length =
            (IKE_HEADER_SIZE + PayloadHeader::SIZE + 4 + sealed.len()) as u32;

        let mut bytes = Vec::with_capacity(header.length as usize);
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&skf_header.to_bytes());
        bytes.extend_from_slice(&fragment_number.to_be_bytes());
        bytes.extend_from_slice(&total.to_be_bytes());
        bytes.extend_from_slice(&sealed);
        datagrams.push(bytes);
    }

    Ok(datagrams)
}

/// Check whether a datagram is an SKF fragment
pub fn is_fragment(data: &[u8]) -> bool {
    data.len() >= IKE_HEADER_SIZE && data[16] == PayloadType::SKF.to_u8()
}

#[derive(Debug)]
struct PendingMessage {
    header: IkeHeader,
    total: u16,
    /// Type of the first inner payload, known once fragment 1 arrives
    inner_first: Option<u8>,
    /// Decrypted chunks by fragment number
    chunks: BTreeMap<u16, Vec<u8>>,
}

/// Reassembly buffer for incoming SKF fragments
///
/// Keyed by (SPI pair, message ID). The caller owns retiring stale entries
/// when an exchange is abandoned.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    pending: HashMap<((u64, u64), u32), PendingMessage>,
}

impl ReassemblyBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        ReassemblyBuffer {
            pending: HashMap::new(),
        }
    }

    /// Number of messages currently being reassembled
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partial state for the given message
    pub fn discard(&mut self, spi_pair: (u64, u64), message_id: u32) {
        self.pending.remove(&(spi_pair, message_id));
    }

    /// Ingest one SKF fragment datagram
    ///
    /// Returns the fully reassembled message once the last missing fragment
    /// arrives, or None while fragments are still outstanding. Duplicate
    /// fragments with identical content are ignored; a fragment that
    /// contradicts buffered state (different total, different content for
    /// the same index) fails the whole message and clears its state.
    pub fn handle_fragment(
        &mut self,
        provider: &dyn CryptoProvider,
        key: &[u8],
        data: &[u8],
    ) -> Result<Option<IkeMessage>> {
        let header = IkeHeader::from_bytes(data)?;
        if (header.length as usize) > data.len() {
            return Err(Error::BufferTooShort {
                required: header.length as usize,
                available: data.len(),
            });
        }
        if header.next_payload != PayloadType::SKF.to_u8() {
            return Err(Error::InvalidMessage(
                "Not an SKF fragment".to_string(),
            ));
        }

        let body = &data[IKE_HEADER_SIZE..header.length as usize];
        let skf_header = PayloadHeader::from_bytes(body)?;
        if (skf_header.length as usize) > body.len()
            || (skf_header.length as usize) < PayloadHeader::SIZE + 4
        {
            return Err(Error::InvalidLength {
                expected: PayloadHeader::SIZE + 4,
                actual: skf_header.length as usize,
            });
        }

        let fragment_number =
            u16::from_be_bytes([body[PayloadHeader::SIZE], body[PayloadHeader::SIZE + 1]]);
        let total =
            u16::from_be_bytes([body[PayloadHeader::SIZE + 2], body[PayloadHeader::SIZE + 3]]);

        if fragment_number == 0 || total == 0 || fragment_number > total {
            return Err(Error::FragmentMismatch(format!(
                "Fragment {}/{} out of range",
                fragment_number, total
            )));
        }

        let sealed = &body[PayloadHeader::SIZE + 4..skf_header.length as usize];
        let chunk = provider.open(key, sealed, &fragment_aad(&header, fragment_number, total))?;

        let key_id = (header.spi_pair(), header.message_id);

        enum Check {
            Accept,
            Duplicate,
            Conflict,
            TotalMismatch(u16),
        }

        let check = match self.pending.get(&key_id) {
            None => Check::Accept,
            Some(entry) if entry.total != total => Check::TotalMismatch(entry.total),
            Some(entry) => match entry.chunks.get(&fragment_number) {
                Some(existing) if *existing == chunk => Check::Duplicate,
                Some(_) => Check::Conflict,
                None => Check::Accept,
            },
        };

        match check {
            Check::Duplicate => {
                // Duplicate resend, nothing new
                return Ok(None);
            }
            Check::TotalMismatch(old) => {
                self.pending.remove(&key_id);
                return Err(Error::FragmentMismatch(format!(
                    "Total fragment count changed from {} to {}",
                    old, total
                )));
            }
            Check::Conflict => {
                self.pending.remove(&key_id);
                return Err(Error::FragmentMismatch(format!(
                    "Fragment {} content changed between resends",
                    fragment_number
                )));
            }
            Check::Accept => {}
        }

        let entry = self.pending.entry(key_id).or_insert_with(|| PendingMessage {
            header,
            total,
            inner_first: None,
            chunks: BTreeMap::new(),
        });

        if fragment_number == 1 {
            entry.inner_first = Some(skf_header.next_payload);
        }
        entry.chunks.insert(fragment_number, chunk);

        if entry.chunks.len() < entry.total as usize {
            return Ok(None);
        }

        // All fragments present: concatenate in index order and decode
        let entry = match self.pending.remove(&key_id) {
            Some(e) => e,
            None => return Err(Error::Internal("Reassembly entry vanished".to_string())),
        };
        let inner_first = entry
            .inner_first
            .ok_or_else(|| Error::FragmentMismatch("First fragment missing".to_string()))?;

        let mut plaintext = Vec::new();
        for (_, chunk) in entry.chunks {
            plaintext.extend_from_slice(&chunk);
        }

        let payloads = decode_payload_chain(inner_first, &plaintext)?;
        Ok(Some(IkeMessage {
            header: entry.header,
            payloads,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PassthroughCrypto;
    use crate::ikev2::constants::NotifyType;
    use crate::ikev2::payload::{IdPayload, NotifyPayload};

    fn big_payloads() -> Vec<IkePayload> {
        vec![
            IkePayload::IdI(IdPayload::from_fqdn("client.example.org")),
            IkePayload::Notify(NotifyPayload::with_data(
                NotifyType::InitialContact,
                vec![0xC3; 2000],
            )),
        ]
    }

    fn fragment_all(payloads: &[IkePayload], threshold: usize) -> Vec<Vec<u8>> {
        fragment_message(
            &PassthroughCrypto::new(),
            &[],
            0x1111,
            0x2222,
            ExchangeType::IkeAuth,
            IkeFlags::request(true),
            1,
            payloads,
            threshold,
        )
        .unwrap()
    }

    #[test]
    fn test_fragment_and_reassemble() {
        let payloads = big_payloads();
        let frags = fragment_all(&payloads, 1280);
        assert!(frags.len() >= 2);
        for frag in &frags {
            assert!(frag.len() <= 1280);
            assert!(is_fragment(frag));
        }

        let provider = PassthroughCrypto::new();
        let mut buffer = ReassemblyBuffer::new();
        let mut result = None;
        for frag in &frags {
            result = buffer.handle_fragment(&provider, &[], frag).unwrap();
        }

        let msg = result.expect("last fragment completes the message");
        assert_eq!(msg.payloads, payloads);
        assert_eq!(msg.header.message_id, 1);
        assert_eq!(buffer.pending_count(), 0);
    }

    #[test]
    fn test_reassemble_out_of_order() {
        let payloads = big_payloads();
        let frags = fragment_all(&payloads, 900);
        assert!(frags.len() >= 3);

        let provider = PassthroughCrypto::new();
        let mut buffer = ReassemblyBuffer::new();

        // Deliver in reverse order
        let mut result = None;
        for frag in frags.iter().rev() {
            result = buffer.handle_fragment(&provider, &[], frag).unwrap();
        }

        let msg = result.expect("reassembly completes");
        assert_eq!(msg.payloads, payloads);
    }

    #[test]
    fn test_duplicate_fragment_idempotent() {
        let payloads = big_payloads();
        let frags = fragment_all(&payloads, 1280);

        let provider = PassthroughCrypto::new();
        let mut buffer = ReassemblyBuffer::new();

        assert!(buffer
            .handle_fragment(&provider, &[], &frags[0])
            .unwrap()
            .is_none());
        // Same fragment again: ignored
        assert!(buffer
            .handle_fragment(&provider, &[], &frags[0])
            .unwrap()
            .is_none());

        let mut result = None;
        for frag in &frags[1..] {
            result = buffer.handle_fragment(&provider, &[], frag).unwrap();
        }
        assert!(result.is_some());
    }

    #[test]
    fn test_mismatched_total_fails() {
        let payloads = big_payloads();
        let frags = fragment_all(&payloads, 900);
        assert!(frags.len() >= 3);

        let provider = PassthroughCrypto::new();
        let mut buffer = ReassemblyBuffer::new();
        buffer.handle_fragment(&provider, &[], &frags[0]).unwrap();

        // Corrupt the total count in the second fragment
        let mut bad = frags[1].clone();
        let off = IKE_HEADER_SIZE + PayloadHeader::SIZE + 2;
        bad[off..off + 2].copy_from_slice(&99u16.to_be_bytes());

        let result = buffer.handle_fragment(&provider, &[], &bad);
        assert!(matches!(result, Err(Error::FragmentMismatch(_))));
    }

    #[test]
    fn test_zero_fragment_number_rejected() {
        let payloads = big_payloads();
        let frags = fragment_all(&payloads, 1280);

        let mut bad = frags[0].clone();
        let off = IKE_HEADER_SIZE + PayloadHeader::SIZE;
        bad[off..off + 2].copy_from_slice(&0u16.to_be_bytes());

        let provider = PassthroughCrypto::new();
        let mut buffer = ReassemblyBuffer::new();
        let result = buffer.handle_fragment(&provider, &[], &bad);
        assert!(matches!(result, Err(Error::FragmentMismatch(_))));
    }

    #[test]
    fn test_distinct_message_ids_tracked_separately() {
        let provider = PassthroughCrypto::new();
        let payloads = big_payloads();

        let frags_a = fragment_all(&payloads, 1280);
        let frags_b = fragment_message(
            &provider,
            &[],
            0x1111,
            0x2222,
            ExchangeType::IkeAuth,
            IkeFlags::request(true),
            2,
            &payloads,
            1280,
        )
        .unwrap();

        let mut buffer = ReassemblyBuffer::new();
        buffer.handle_fragment(&provider, &[], &frags_a[0]).unwrap();
        buffer.handle_fragment(&provider, &[], &frags_b[0]).unwrap();
        assert_eq!(buffer.pending_count(), 2);

        buffer.discard((0x1111, 0x2222), 2);
        assert_eq!(buffer.pending_count(), 1);
    }
}
