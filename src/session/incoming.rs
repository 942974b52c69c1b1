//! Incoming demultiplexer: TLS bytes to typed units in per-protocol mailboxes

use super::bridge::Bridge;
use super::mailbox::{deliver, ControlMessage, Origin, Outcome, Routes};
use crate::error::ParseError;
use crate::protocol::auth::{ChapFrame, EapFrame, PapFrame};
use crate::protocol::ppp::{is_configure_code, protocol};
use crate::protocol::sstp::{is_control, peek_packet_length};
use crate::protocol::{ConfigureFrame, ControlPacket, DataPacket, LcpFrame, WireUnit};
use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Smallest prefix that carries the SSTP length field
const LENGTH_PREFIX: usize = 4;

fn parse_failure(error: ParseError) -> ControlMessage {
    let outcome = match error {
        ParseError::UnknownType { .. } => Outcome::UnknownType,
        _ => Outcome::ParsingFailed,
    };
    ControlMessage::new(Origin::Incoming, outcome, error.to_string())
}

/// Splits complete packets off `buffer` and routes them
pub(crate) struct Demultiplexer {
    bridge: Arc<Bridge>,
    routes: Routes,
}

impl Demultiplexer {
    pub(crate) fn new(bridge: Arc<Bridge>, routes: Routes) -> Self {
        Self { bridge, routes }
    }

    /// Drains every complete packet from `buffer`; partial packets stay
    pub(crate) async fn drain(&self, buffer: &mut BytesMut) -> Result<(), ControlMessage> {
        while let Some(length) = peek_packet_length(buffer) {
            if length < LENGTH_PREFIX {
                return Err(parse_failure(ParseError::InvalidField {
                    unit: "SSTP packet",
                    field: "length",
                    value: length as u32,
                }));
            }
            if buffer.len() < length {
                break;
            }
            let packet = buffer.split_to(length).freeze();
            self.bridge.touch();
            self.dispatch(packet).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, mut packet: Bytes) -> Result<(), ControlMessage> {
        if is_control(&packet) {
            let control = ControlPacket::decode(&mut packet).map_err(parse_failure)?;
            debug!("Received SSTP {:?}", control.message_type);
            deliver(&self.routes.sstp, control, "SSTP");
            return Ok(());
        }

        let data = DataPacket::decode(&mut packet).map_err(parse_failure)?;
        self.route(data).await
    }

    async fn route(&self, data: DataPacket) -> Result<(), ControlMessage> {
        let config = &self.bridge.config;
        let mut payload = data.payload.clone();
        match data.protocol {
            protocol::LCP => match LcpFrame::decode(&mut payload) {
                Ok(LcpFrame::Configure(frame)) => {
                    deliver(&self.routes.lcp_configure, frame, "LCP configure")
                }
                Ok(frame) => deliver(&self.routes.lcp_link, frame, "LCP link"),
                Err(ParseError::UnknownType { value, .. }) => {
                    warn!("Unknown LCP code {value}, sending Code-Reject");
                    self.code_reject(data.payload).await?;
                }
                Err(e) => return Err(parse_failure(e)),
            },
            protocol::PAP => {
                let frame = PapFrame::decode(&mut payload).map_err(parse_failure)?;
                deliver(&self.routes.pap, frame, "PAP");
            }
            protocol::CHAP => {
                let frame = ChapFrame::decode(&mut payload).map_err(parse_failure)?;
                deliver(&self.routes.chap, frame, "CHAP");
            }
            protocol::EAP => {
                let frame = EapFrame::decode(&mut payload).map_err(parse_failure)?;
                deliver(&self.routes.eap, frame, "EAP");
            }
            protocol::IPCP if config.ppp.ipv4 => {
                if !payload.first().is_some_and(|code| is_configure_code(*code)) {
                    debug!("Ignoring non-configure IPCP frame");
                    return Ok(());
                }
                let frame = ConfigureFrame::decode(&mut payload).map_err(parse_failure)?;
                deliver(&self.routes.ipcp, frame, "IPCP");
            }
            protocol::IPV6CP if config.ppp.ipv6 => {
                if !payload.first().is_some_and(|code| is_configure_code(*code)) {
                    debug!("Ignoring non-configure IPv6CP frame");
                    return Ok(());
                }
                let frame = ConfigureFrame::decode(&mut payload).map_err(parse_failure)?;
                deliver(&self.routes.ipv6cp, frame, "IPv6CP");
            }
            protocol::IPV4 if config.ppp.ipv4 => self.forward(&data.payload).await?,
            protocol::IPV6 if config.ppp.ipv6 => self.forward(&data.payload).await?,
            protocol::IPV4 | protocol::IPV6 => {
                debug!("Dropping {} packet, family disabled", protocol::name(data.protocol));
            }
            other => {
                warn!(
                    "Unsupported PPP protocol {other:#06x} ({}), sending Protocol-Reject",
                    protocol::name(other)
                );
                self.protocol_reject(other, data.payload).await?;
            }
        }
        Ok(())
    }

    async fn forward(&self, packet: &[u8]) -> Result<(), ControlMessage> {
        match self.bridge.write_ip(packet).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!("Dropping IP packet, interface not attached");
                Ok(())
            }
            Err(e) => Err(ControlMessage::new(
                Origin::Interface,
                Outcome::InterfaceFailed,
                e.to_string(),
            )),
        }
    }

    async fn code_reject(&self, rejected: Bytes) -> Result<(), ControlMessage> {
        let frame = LcpFrame::CodeReject {
            id: self.bridge.next_frame_id(),
            rejected: self.truncate(rejected, 4),
        };
        self.send_lcp(&frame).await
    }

    async fn protocol_reject(&self, rejected: u16, info: Bytes) -> Result<(), ControlMessage> {
        let frame = LcpFrame::ProtocolReject {
            id: self.bridge.next_frame_id(),
            protocol: rejected,
            info: self.truncate(info, 6),
        };
        self.send_lcp(&frame).await
    }

    /// Keeps a rejected frame within the peer's MRU
    fn truncate(&self, mut data: Bytes, header: usize) -> Bytes {
        let mru = self
            .bridge
            .negotiated()
            .peer_mru
            .unwrap_or(self.bridge.config.ppp.mru) as usize;
        data.truncate(mru.saturating_sub(header));
        data
    }

    async fn send_lcp(&self, frame: &LcpFrame) -> Result<(), ControlMessage> {
        self.bridge
            .send_frame(protocol::LCP, frame)
            .await
            .map_err(|e| ControlMessage::new(Origin::Incoming, Outcome::TransportFailed, e.to_string()))
    }
}

/// Reads the TLS terminal until it closes or a unit fails to parse
pub(crate) async fn run<R: AsyncRead + Unpin>(
    bridge: Arc<Bridge>,
    mut reader: R,
    routes: Routes,
    mut buffer: BytesMut,
) {
    let capacity = bridge.config.network.transport_buffer_size;
    let demux = Demultiplexer::new(bridge.clone(), routes);

    loop {
        if let Err(message) = demux.drain(&mut buffer).await {
            bridge.report(message);
            return;
        }
        buffer.reserve(capacity);
        match reader.read_buf(&mut buffer).await {
            Ok(0) => {
                bridge.report(ControlMessage::new(
                    Origin::Incoming,
                    Outcome::TransportFailed,
                    "connection closed by gateway",
                ));
                return;
            }
            Ok(n) => debug!("Read {n} bytes from TLS"),
            Err(e) => {
                bridge.report(ControlMessage::new(
                    Origin::Incoming,
                    Outcome::TransportFailed,
                    e.to_string(),
                ));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ipcp::IpcpOptions;
    use crate::protocol::sstp::put_data_prefix;
    use crate::protocol::{ConfigureCode, MessageType};
    use crate::session::mailbox::mailboxes;
    use crate::session::testing;
    use bytes::BufMut;

    fn data_packet(protocol: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_data_prefix(&mut buf, protocol, payload.len());
        buf.put_slice(payload);
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_partial_packets_wait_for_the_rest() {
        let (bridge, _gateway, _control) = testing::bridge(testing::config());
        let (routes, mut inboxes) = mailboxes(8);
        let demux = Demultiplexer::new(bridge, routes);

        let echo = ControlPacket::bare(MessageType::EchoRequest).to_bytes();
        let mut buffer = BytesMut::from(&echo[..5]);
        demux.drain(&mut buffer).await.unwrap();
        assert!(inboxes.sstp.try_recv().is_err());
        assert_eq!(buffer.len(), 5);

        buffer.put_slice(&echo[5..]);
        buffer.put_slice(&echo);
        demux.drain(&mut buffer).await.unwrap();
        assert!(buffer.is_empty());
        assert_eq!(inboxes.sstp.try_recv().unwrap().message_type, MessageType::EchoRequest);
        assert_eq!(inboxes.sstp.try_recv().unwrap().message_type, MessageType::EchoRequest);
    }

    #[tokio::test]
    async fn test_routes_by_ppp_protocol() {
        let (bridge, _gateway, _control) = testing::bridge(testing::config());
        let (routes, mut inboxes) = mailboxes(8);
        let demux = Demultiplexer::new(bridge, routes);

        let mut options = IpcpOptions::default();
        options.set_address(std::net::Ipv4Addr::new(10, 0, 0, 1));
        let ipcp = ConfigureFrame::new(ConfigureCode::Request, 7, options).to_bytes();
        let echo = LcpFrame::EchoRequest {
            id: 1,
            magic: 0,
            data: Bytes::new(),
        }
        .to_bytes();

        let mut buffer = BytesMut::new();
        buffer.put_slice(&data_packet(protocol::IPCP, &ipcp));
        buffer.put_slice(&data_packet(protocol::LCP, &echo));
        demux.drain(&mut buffer).await.unwrap();

        assert_eq!(inboxes.ipcp.try_recv().unwrap().id, 7);
        assert!(matches!(
            inboxes.lcp_link.try_recv().unwrap(),
            LcpFrame::EchoRequest { id: 1, .. }
        ));
        assert!(inboxes.lcp_configure.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_protocol_is_protocol_rejected() {
        let (bridge, mut gateway, _control) = testing::bridge(testing::config());
        let (routes, _inboxes) = mailboxes(8);
        let demux = Demultiplexer::new(bridge, routes);

        let mut buffer = BytesMut::from(&data_packet(0x80FD, &[1, 1, 0, 4])[..]);
        demux.drain(&mut buffer).await.unwrap();

        let frame: LcpFrame = testing::read_frame(&mut gateway, protocol::LCP).await;
        match frame {
            LcpFrame::ProtocolReject { protocol, info, .. } => {
                assert_eq!(protocol, 0x80FD);
                assert_eq!(&info[..], &[1, 1, 0, 4]);
            }
            other => panic!("expected Protocol-Reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disabled_family_control_is_protocol_rejected() {
        let (bridge, mut gateway, _control) = testing::bridge(testing::config());
        let (routes, _inboxes) = mailboxes(8);
        let demux = Demultiplexer::new(bridge, routes);

        let mut buffer = BytesMut::from(&data_packet(protocol::IPV6CP, &[1, 1, 0, 4])[..]);
        demux.drain(&mut buffer).await.unwrap();
        let frame: LcpFrame = testing::read_frame(&mut gateway, protocol::LCP).await;
        assert!(matches!(
            frame,
            LcpFrame::ProtocolReject { protocol: protocol::IPV6CP, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_lcp_code_is_code_rejected() {
        let (bridge, mut gateway, _control) = testing::bridge(testing::config());
        let (routes, _inboxes) = mailboxes(8);
        let demux = Demultiplexer::new(bridge, routes);

        let mut buffer = BytesMut::from(&data_packet(protocol::LCP, &[0x0C, 3, 0, 4])[..]);
        demux.drain(&mut buffer).await.unwrap();
        let frame: LcpFrame = testing::read_frame(&mut gateway, protocol::LCP).await;
        match frame {
            LcpFrame::CodeReject { rejected, .. } => assert_eq!(&rejected[..], &[0x0C, 3, 0, 4]),
            other => panic!("expected Code-Reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_parse_failures_are_classified() {
        let (bridge, _gateway, _control) = testing::bridge(testing::config());
        let (routes, _inboxes) = mailboxes(8);
        let demux = Demultiplexer::new(bridge, routes);

        let mut unknown = BytesMut::from(&[0x10, 0x01, 0x00, 0x08, 0x00, 0x0A, 0x00, 0x00][..]);
        let message = demux.drain(&mut unknown).await.unwrap_err();
        assert_eq!(message.outcome, Outcome::UnknownType);

        let truncated_pap = data_packet(protocol::PAP, &[2, 1, 0, 9, 5, b'o']);
        let mut buffer = BytesMut::from(&truncated_pap[..]);
        let message = demux.drain(&mut buffer).await.unwrap_err();
        assert_eq!(message.outcome, Outcome::ParsingFailed);

        let mut bogus = BytesMut::from(&[0x10, 0x01, 0x00, 0x02][..]);
        let message = demux.drain(&mut bogus).await.unwrap_err();
        assert_eq!(message.outcome, Outcome::ParsingFailed);
    }

    #[tokio::test]
    async fn test_ip_packets_reach_attached_interface() {
        let (bridge, _gateway, _control) = testing::bridge(testing::config());
        let (routes, _inboxes) = mailboxes(8);
        let demux = Demultiplexer::new(bridge.clone(), routes);

        let ip = [0x45u8, 0, 0, 20, 0, 0, 0, 0, 64, 17, 0, 0, 10, 0, 0, 1, 10, 0, 0, 2];
        let mut buffer = BytesMut::from(&data_packet(protocol::IPV4, &ip)[..]);
        demux.drain(&mut buffer).await.unwrap();

        let (interface, mut far_end) = tokio::io::duplex(256);
        bridge.attach_interface(Box::new(interface)).unwrap();
        let mut buffer = BytesMut::from(&data_packet(protocol::IPV4, &ip)[..]);
        demux.drain(&mut buffer).await.unwrap();

        let mut received = [0u8; 20];
        far_end.read_exact(&mut received).await.unwrap();
        assert_eq!(received, ip);
    }

    #[tokio::test]
    async fn test_run_reports_closed_transport() {
        let (bridge, _gateway, mut control) = testing::bridge(testing::config());
        let (routes, _inboxes) = mailboxes(8);
        let (reader, writer) = tokio::io::duplex(64);
        drop(writer);
        run(bridge, reader, routes, BytesMut::new()).await;
        assert_eq!(control.recv().await.unwrap().outcome, Outcome::TransportFailed);
    }
}
