//! Connection-scoped state shared by every engine task

use super::mailbox::ControlMessage;
use crate::config::{AuthProtocol, Config};
use crate::error::{Result, VpnError};
use crate::protocol::sstp::{put_data_prefix, NONCE_LEN};
use crate::protocol::{ControlPacket, HashProtocol, WireUnit};
use bytes::BytesMut;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type TransportWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// SSTP control-plane state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SstpState {
    Init,
    ConnectSent,
    ConnectAcked,
    CryptoBound,
    Terminating,
    Closed,
}

/// Results of LCP, authentication and the NCPs; each field has one writer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedState {
    pub mru: Option<u16>,
    pub peer_mru: Option<u16>,
    pub auth: Option<AuthProtocol>,
    pub ipv4: Option<Ipv4Addr>,
    pub peer_ipv4: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub ipv6_identifier: Option<[u8; 8]>,
    pub peer_ipv6_identifier: Option<[u8; 8]>,
}

#[derive(Debug, Clone)]
pub struct CryptoMaterial {
    pub hash: Option<HashProtocol>,
    pub nonce: [u8; NONCE_LEN],
    pub hlak: [u8; 32],
}

impl Default for CryptoMaterial {
    fn default() -> Self {
        Self {
            hash: None,
            nonce: [0; NONCE_LEN],
            hlak: [0; 32],
        }
    }
}

/// Serialized one-byte frame identifier
#[derive(Debug, Default)]
pub struct FrameIdAllocator {
    next: Mutex<u8>,
}

impl FrameIdAllocator {
    pub fn next(&self) -> u8 {
        let mut next = self.next.lock();
        let id = *next;
        *next = next.wrapping_add(1);
        id
    }
}

/// Raised when the peer Protocol-Rejects one of the network control protocols
#[derive(Debug, Default)]
pub struct NcpRejections {
    pub ipcp: CancellationToken,
    pub ipv6cp: CancellationToken,
}

pub struct Bridge {
    pub config: Arc<Config>,
    guid: Uuid,
    peer_certificate: Option<Vec<u8>>,
    state: RwLock<SstpState>,
    negotiated: RwLock<NegotiatedState>,
    crypto: Mutex<CryptoMaterial>,
    frame_ids: FrameIdAllocator,
    rejections: NcpRejections,
    last_received: Mutex<Instant>,
    transport: tokio::sync::Mutex<TransportWriter>,
    interface: OnceLock<tokio::sync::Mutex<TransportWriter>>,
    control: mpsc::UnboundedSender<ControlMessage>,
}

impl Bridge {
    pub fn new(
        config: Arc<Config>,
        peer_certificate: Option<Vec<u8>>,
        transport: TransportWriter,
        control: mpsc::UnboundedSender<ControlMessage>,
    ) -> Self {
        Self {
            config,
            guid: Uuid::new_v4(),
            peer_certificate,
            state: RwLock::new(SstpState::Init),
            negotiated: RwLock::new(NegotiatedState::default()),
            crypto: Mutex::new(CryptoMaterial::default()),
            frame_ids: FrameIdAllocator::default(),
            rejections: NcpRejections::default(),
            last_received: Mutex::new(Instant::now()),
            transport: tokio::sync::Mutex::new(transport),
            interface: OnceLock::new(),
            control,
        }
    }

    /// Correlation ID, braced and uppercase as sent in the HTTP upgrade
    pub fn correlation_id(&self) -> String {
        format!("{{{}}}", self.guid.hyphenated().to_string().to_uppercase())
    }

    pub fn peer_certificate(&self) -> Option<&[u8]> {
        self.peer_certificate.as_deref()
    }

    pub fn state(&self) -> SstpState {
        *self.state.read()
    }

    pub fn set_state(&self, state: SstpState) {
        let mut current = self.state.write();
        if *current != state {
            debug!("SSTP state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    pub fn negotiated(&self) -> NegotiatedState {
        self.negotiated.read().clone()
    }

    pub fn update_negotiated(&self, update: impl FnOnce(&mut NegotiatedState)) {
        update(&mut self.negotiated.write());
    }

    pub fn crypto(&self) -> CryptoMaterial {
        self.crypto.lock().clone()
    }

    pub fn update_crypto(&self, update: impl FnOnce(&mut CryptoMaterial)) {
        update(&mut self.crypto.lock());
    }

    pub fn next_frame_id(&self) -> u8 {
        self.frame_ids.next()
    }

    pub fn rejections(&self) -> &NcpRejections {
        &self.rejections
    }

    /// Records that something arrived from the gateway
    pub fn touch(&self) {
        *self.last_received.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_received.lock().elapsed()
    }

    /// Posts a message to the supervisor
    pub fn report(&self, message: ControlMessage) {
        if self.control.send(message).is_err() {
            debug!("Control channel closed, report dropped");
        }
    }

    /// Writes raw bytes to the TLS terminal under the transport lock
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut transport = self.transport.lock().await;
        transport.write_all(bytes).await?;
        transport.flush().await?;
        Ok(())
    }

    pub async fn send_control(&self, packet: &ControlPacket) -> Result<()> {
        debug!("Sending SSTP {:?}", packet.message_type);
        self.send(&packet.to_bytes()).await
    }

    /// Frames `unit` as a PPP payload of `protocol` in an SSTP data packet
    pub async fn send_frame<U: WireUnit>(&self, protocol: u16, unit: &U) -> Result<()> {
        let mut buf = BytesMut::with_capacity(unit.length() + 8);
        put_data_prefix(&mut buf, protocol, unit.length());
        unit.encode(&mut buf);
        self.send(&buf).await
    }

    /// One-shot transition that enables IP forwarding towards the interface
    pub fn attach_interface(&self, writer: TransportWriter) -> Result<()> {
        self.interface
            .set(tokio::sync::Mutex::new(writer))
            .map_err(|_| VpnError::InvalidState("IP terminal already attached".to_string()))
    }

    pub fn interface_attached(&self) -> bool {
        self.interface.get().is_some()
    }

    /// Writes one IP packet to the interface; `false` when none is attached yet
    pub async fn write_ip(&self, packet: &[u8]) -> Result<bool> {
        let Some(interface) = self.interface.get() else {
            return Ok(false);
        };
        interface.lock().await.write_all(packet).await?;
        Ok(true)
    }

    /// Shuts down both terminals; safe to call more than once
    pub async fn close(&self) {
        if let Err(e) = self.transport.lock().await.shutdown().await {
            debug!("TLS shutdown: {e}");
        }
        if let Some(interface) = self.interface.get() {
            if let Err(e) = interface.lock().await.shutdown().await {
                warn!("Interface shutdown: {e}");
            }
        }
        self.set_state(SstpState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing;
    use std::collections::HashSet;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_frame_ids_wrap() {
        let ids = FrameIdAllocator::default();
        let seen: Vec<u8> = (0..258).map(|_| ids.next()).collect();
        assert_eq!(seen[0], 0);
        assert_eq!(seen[255], 255);
        assert_eq!(seen[256], 0);
        assert_eq!(seen[257], 1);
    }

    #[test]
    fn test_frame_ids_unique_across_threads() {
        let ids = Arc::new(FrameIdAllocator::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..64).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();
        let all: HashSet<u8> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(all.len(), 256);
    }

    #[tokio::test]
    async fn test_interface_attaches_once() {
        let (bridge, _gateway, _control) = testing::bridge(testing::config());
        assert!(!bridge.write_ip(&[0x45]).await.unwrap());

        let (a, mut b) = tokio::io::duplex(64);
        bridge.attach_interface(Box::new(a)).unwrap();
        assert!(bridge.interface_attached());
        assert!(bridge.write_ip(&[0x45, 0x00]).await.unwrap());
        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x45, 0x00]);

        let (c, _d) = tokio::io::duplex(64);
        assert!(matches!(
            bridge.attach_interface(Box::new(c)),
            Err(VpnError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_send_frame_prefixes_data_header() {
        let (bridge, mut gateway, _control) = testing::bridge(testing::config());
        let packet = ControlPacket::bare(crate::protocol::MessageType::EchoRequest);
        bridge.send_frame(0xC021, &packet).await.unwrap();
        let mut buf = [0u8; 16];
        gateway.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..8], &[0x10, 0x00, 0x00, 0x10, 0xFF, 0x03, 0xC0, 0x21]);
    }

    #[test]
    fn test_correlation_id_format() {
        let (bridge, _gateway, _control) = testing::bridge(testing::config());
        let id = bridge.correlation_id();
        assert_eq!(id.len(), 38);
        assert!(id.starts_with('{') && id.ends_with('}'));
        assert_eq!(id, id.to_uppercase());
    }
}
