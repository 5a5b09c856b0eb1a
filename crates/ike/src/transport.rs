//! Datagram transport and transform installation seams
//!
//! The session engine never touches sockets or the kernel IPSec stack
//! directly. Outbound datagrams go through [`Transport`]; negotiated Child SA
//! transforms are handed to a [`TransformInstaller`]. Both are trait objects
//! so tests can run the whole state machine over in-memory channels.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::ikev2::proposal::{EncryptionTransform, IntegrityId};

/// Fire-and-forget datagram sender
///
/// Implementations must not block: the session task calls this inline.
pub trait Transport: Send + Sync {
    /// Send one IKE datagram to the peer
    fn send(&self, datagram: &[u8]) -> Result<()>;
}

/// Transport over a connected UDP socket
#[derive(Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Wrap a connected socket
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        UdpTransport { socket }
    }
}

impl Transport for UdpTransport {
    fn send(&self, datagram: &[u8]) -> Result<()> {
        match self.socket.try_send(datagram) {
            Ok(_) => Ok(()),
            // A full send buffer drops the datagram; retransmission covers it
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory transport for tests and loopback harnesses
///
/// Sent datagrams appear on the paired receiver.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelTransport {
    /// Create a transport and the receiver observing its sends
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelTransport { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, datagram: &[u8]) -> Result<()> {
        self.tx
            .send(datagram.to_vec())
            .map_err(|_| Error::Io("Transport receiver dropped".to_string()))
    }
}

/// Direction of an installed IPSec transform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformDirection {
    /// Protects traffic arriving from the peer
    Inbound,
    /// Protects traffic sent to the peer
    Outbound,
}

/// A negotiated ESP transform: SPI, algorithms and key material
///
/// Two of these (one per direction) make up an established Child SA. They are
/// reported through events and handed to the [`TransformInstaller`] as a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpsecTransform {
    /// ESP SPI (the receiver's SPI for this direction)
    pub spi: u32,

    /// Negotiated encryption algorithm
    pub encryption: EncryptionTransform,

    /// Negotiated integrity algorithm, None for AEAD
    pub integrity: Option<IntegrityId>,

    /// Encryption key
    pub encryption_key: Vec<u8>,

    /// Integrity key (empty for AEAD)
    pub integrity_key: Vec<u8>,
}

/// Sink for negotiated transforms
///
/// A production implementation programs the kernel SA database; the default
/// [`NullInstaller`] just accepts everything.
pub trait TransformInstaller: Send + Sync {
    /// Install one direction of a Child SA
    fn install(&self, transform: &IpsecTransform, direction: TransformDirection) -> Result<()>;

    /// Remove one direction of a Child SA
    fn remove(&self, transform: &IpsecTransform, direction: TransformDirection) -> Result<()>;
}

/// Installer that accepts every transform without side effects
#[derive(Debug, Default)]
pub struct NullInstaller;

impl NullInstaller {
    /// Create a new no-op installer
    pub fn new() -> Self {
        NullInstaller
    }
}

impl TransformInstaller for NullInstaller {
    fn install(&self, _transform: &IpsecTransform, _direction: TransformDirection) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _transform: &IpsecTransform, _direction: TransformDirection) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_transport_delivers() {
        let (transport, mut rx) = ChannelTransport::pair();
        transport.send(&[1, 2, 3]).unwrap();
        transport.send(&[4, 5]).unwrap();

        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
        assert_eq!(rx.try_recv().unwrap(), vec![4, 5]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_transport_closed_receiver() {
        let (transport, rx) = ChannelTransport::pair();
        drop(rx);
        assert!(transport.send(&[1]).is_err());
    }

    #[test]
    fn test_null_installer_accepts() {
        let installer = NullInstaller::new();
        let transform = IpsecTransform {
            spi: 0x1234,
            encryption: EncryptionTransform::aes_gcm(128),
            integrity: None,
            encryption_key: vec![0u8; 16],
            integrity_key: Vec::new(),
        };
        assert!(installer
            .install(&transform, TransformDirection::Inbound)
            .is_ok());
        assert!(installer
            .remove(&transform, TransformDirection::Outbound)
            .is_ok());
    }
}
