//! Outgoing manager: IP terminal packets to coalesced SSTP data packets

use super::bridge::Bridge;
use super::mailbox::{ControlMessage, Origin, Outcome};
use crate::protocol::ppp::protocol;
use crate::protocol::sstp::{put_data_prefix, DATA_PREFIX_LEN, MAX_DATA_PAYLOAD};
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Packets waiting between the retrieval and batching loops
pub(crate) const QUEUE_DEPTH: usize = 256;

/// What to do with one packet read from the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Send(u16),
    Drop,
    Invalid(u8),
}

/// Coalesces framed packets into one transport write
#[derive(Debug)]
pub(crate) struct Batcher {
    capacity: usize,
    ipv4: bool,
    ipv6: bool,
    buffer: BytesMut,
}

impl Batcher {
    pub(crate) fn new(capacity: usize, ipv4: bool, ipv6: bool) -> Self {
        Self {
            capacity,
            ipv4,
            ipv6,
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub(crate) fn classify(&self, packet: &[u8]) -> Disposition {
        let Some(first) = packet.first() else {
            return Disposition::Drop;
        };
        match first >> 4 {
            4 if self.ipv4 => Disposition::Send(protocol::IPV4),
            6 if self.ipv6 => Disposition::Send(protocol::IPV6),
            4 | 6 => Disposition::Drop,
            version => Disposition::Invalid(version),
        }
    }

    /// Whether a payload of `len` bytes can ever be sent
    pub(crate) fn fits_alone(&self, len: usize) -> bool {
        len <= MAX_DATA_PAYLOAD && DATA_PREFIX_LEN + len <= self.capacity
    }

    /// Appends a framed packet; `false` leaves the batch untouched when it would overflow
    pub(crate) fn push(&mut self, protocol: u16, packet: &[u8]) -> bool {
        if self.buffer.len() + DATA_PREFIX_LEN + packet.len() > self.capacity {
            return false;
        }
        put_data_prefix(&mut self.buffer, protocol, packet.len());
        self.buffer.put_slice(packet);
        true
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub(crate) fn take(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }
}

/// Packets' worth of buffer allocated at once for retrieval
const SLAB_PACKETS: usize = 16;

/// Reads one packet per read into a shared slab and queues each as its own
/// `Bytes`; the slab is refilled once its spare capacity is below one packet
pub(crate) async fn retrieve<R: AsyncRead + Unpin>(
    bridge: Arc<Bridge>,
    mut reader: R,
    queue: mpsc::Sender<Bytes>,
) {
    let size = (bridge.config.ppp.mtu as usize).max(MAX_DATA_PAYLOAD);
    let mut slab = BytesMut::with_capacity(size * SLAB_PACKETS);

    loop {
        if slab.capacity() < size {
            slab.reserve(size * SLAB_PACKETS);
        }

        match reader.read_buf(&mut slab).await {
            Ok(0) => {
                bridge.report(ControlMessage::new(
                    Origin::Interface,
                    Outcome::InterfaceFailed,
                    "interface closed",
                ));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                bridge.report(ControlMessage::new(
                    Origin::Interface,
                    Outcome::InterfaceFailed,
                    e.to_string(),
                ));
                return;
            }
        }

        if queue.send(slab.split().freeze()).await.is_err() {
            debug!("Outgoing queue closed");
            return;
        }
    }
}

/// Frames queued packets and writes as many as fit per transport write
pub(crate) async fn transmit(bridge: Arc<Bridge>, mut queue: mpsc::Receiver<Bytes>) {
    let config = &bridge.config;
    let mut batcher = Batcher::new(
        config.network.transport_buffer_size,
        config.ppp.ipv4,
        config.ppp.ipv6,
    );
    let mut carried: Option<(u16, Bytes)> = None;

    loop {
        if let Some((protocol, packet)) = carried.take() {
            batcher.push(protocol, &packet);
        } else {
            let Some(packet) = queue.recv().await else {
                debug!("Outgoing queue closed");
                return;
            };
            if let Err(message) = admit(&mut batcher, packet, &mut carried) {
                bridge.report(message);
                return;
            }
        }

        while carried.is_none() {
            let Ok(packet) = queue.try_recv() else {
                break;
            };
            if let Err(message) = admit(&mut batcher, packet, &mut carried) {
                bridge.report(message);
                return;
            }
        }

        if batcher.is_empty() {
            continue;
        }
        let batch = batcher.take();
        if let Err(e) = bridge.send(&batch).await {
            bridge.report(ControlMessage::new(
                Origin::Outgoing,
                Outcome::TransportFailed,
                e.to_string(),
            ));
            return;
        }
    }
}

/// Adds `packet` to the batch, or parks it in `carried` when the batch is full
fn admit(
    batcher: &mut Batcher,
    packet: Bytes,
    carried: &mut Option<(u16, Bytes)>,
) -> Result<(), ControlMessage> {
    let protocol = match batcher.classify(&packet) {
        Disposition::Send(protocol) => protocol,
        Disposition::Drop => {
            debug!("Dropping outgoing packet of a disabled family");
            return Ok(());
        }
        Disposition::Invalid(version) => {
            return Err(ControlMessage::new(
                Origin::Outgoing,
                Outcome::UnknownType,
                format!("IP version {version}"),
            ))
        }
    };
    if !batcher.fits_alone(packet.len()) {
        warn!("Dropping outgoing packet of {} bytes, too large", packet.len());
        return Ok(());
    }
    if !batcher.push(protocol, &packet) {
        *carried = Some((protocol, packet));
    }
    Ok(())
}
