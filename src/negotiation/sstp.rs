//! SSTP control plane: HTTPS upgrade, Call-Connect, crypto binding and the
//! steady-state echo/disconnect handling

use crate::crypto::crypto_binding;
use crate::protocol::ppp::protocol;
use crate::protocol::{ControlPacket, HashProtocol, LcpFrame, MessageType};
use crate::session::{Bridge, ControlMessage, Origin, Outcome, SstpState};
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const UPGRADE_PATH: &str = "/sra_{BA195980-CD49-458b-9E23-C84EE0ADCD75}/";
const MAX_RESPONSE_HEAD: usize = 8192;
const DISCONNECT_ACK_WAIT: Duration = Duration::from_secs(1);

fn failure(outcome: Outcome, detail: impl Into<String>) -> ControlMessage {
    ControlMessage::new(Origin::Sstp, outcome, detail)
}

fn transport(e: crate::error::VpnError) -> ControlMessage {
    failure(Outcome::TransportFailed, e.to_string())
}

pub fn upgrade_request(host: &str, correlation_id: &str) -> String {
    format!(
        "SSTP_DUPLEX_POST {UPGRADE_PATH} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Content-Length: 18446744073709551615\r\n\
         SSTPCORRELATIONID: {correlation_id}\r\n\
         \r\n"
    )
}

/// Sends the HTTPS upgrade and consumes the response head; returns any
/// bytes that followed it.
pub async fn upgrade<R: AsyncRead + Unpin>(
    bridge: &Bridge,
    reader: &mut R,
) -> Result<BytesMut, ControlMessage> {
    let request = upgrade_request(&bridge.config.server.hostname, &bridge.correlation_id());
    bridge.send(request.as_bytes()).await.map_err(transport)?;

    let window = Duration::from_secs(bridge.config.server.timeout as u64);
    let mut buffer = BytesMut::with_capacity(1024);
    let head_len = timeout(window, read_head(reader, &mut buffer))
        .await
        .map_err(|_| failure(Outcome::Timeout, "no HTTP response to upgrade"))??;

    let head = buffer.split_to(head_len);
    let status = head[..]
        .split(|b| *b == b'\n')
        .next()
        .map(|line| String::from_utf8_lossy(line).trim_end().to_string())
        .unwrap_or_default();
    if !status.starts_with("HTTP/1.1 200") {
        return Err(failure(Outcome::Rejected, status));
    }
    info!("HTTPS upgrade accepted");
    Ok(buffer)
}

async fn read_head<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> Result<usize, ControlMessage> {
    loop {
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            return Ok(pos + 4);
        }
        if buffer.len() > MAX_RESPONSE_HEAD {
            return Err(failure(Outcome::Rejected, "HTTP response head too large"));
        }
        match reader.read_buf(buffer).await {
            Ok(0) => return Err(failure(Outcome::TransportFailed, "closed during upgrade")),
            Ok(_) => {}
            Err(e) => return Err(failure(Outcome::TransportFailed, e.to_string())),
        }
    }
}

/// Sends Call-Connect-Request until acknowledged, retransmitting on the restart timer
pub async fn connect(
    bridge: &Bridge,
    inbox: &mut mpsc::Receiver<ControlPacket>,
) -> Result<(), ControlMessage> {
    let restart = bridge.config.restart_timer();
    let attempts = bridge.config.ppp.max_configure;

    for attempt in 1..=attempts {
        bridge
            .send_control(&ControlPacket::connect_request())
            .await
            .map_err(transport)?;
        bridge.set_state(SstpState::ConnectSent);
        let deadline = Instant::now() + restart;

        loop {
            let packet = match timeout_at(deadline, inbox.recv()).await {
                Err(_) => {
                    debug!("Call-Connect-Request {attempt}/{attempts} unanswered");
                    break;
                }
                Ok(None) => return Err(failure(Outcome::TransportFailed, "mailbox closed")),
                Ok(Some(packet)) => packet,
            };
            match packet.message_type {
                MessageType::CallConnectAck => return accept(bridge, &packet),
                MessageType::CallConnectNak => {
                    return Err(failure(
                        Outcome::NegativeAcknowledged,
                        packet.status_summary().unwrap_or_default(),
                    ))
                }
                MessageType::EchoRequest => answer_echo(bridge).await?,
                MessageType::CallAbort | MessageType::CallDisconnect => {
                    return Err(hang_up(bridge, &packet).await)
                }
                other => {
                    return Err(failure(
                        Outcome::UnexpectedMessage,
                        format!("{other:?} while connecting"),
                    ))
                }
            }
        }
    }
    Err(failure(
        Outcome::Timeout,
        format!("{attempts} Call-Connect-Requests unanswered"),
    ))
}

/// Records the hash protocol and nonce offered in Call-Connect-Ack
fn accept(bridge: &Bridge, packet: &ControlPacket) -> Result<(), ControlMessage> {
    let (bitmask, nonce) = packet.crypto_binding_request().ok_or_else(|| {
        failure(
            Outcome::UnexpectedMessage,
            "Call-Connect-Ack without Crypto-Binding-Request",
        )
    })?;
    let hash = HashProtocol::from_bitmask(bitmask).ok_or_else(|| {
        failure(
            Outcome::UnexpectedMessage,
            format!("no supported hash in bitmask {bitmask:#04x}"),
        )
    })?;
    bridge.update_crypto(|crypto| {
        crypto.hash = Some(hash);
        crypto.nonce = nonce;
    });
    bridge.set_state(SstpState::ConnectAcked);
    info!("SSTP connected, crypto binding uses {hash:?}");
    Ok(())
}

/// Sends Call-Connected carrying the crypto binding over the current HLAK
pub async fn call_connected(bridge: &Bridge) -> Result<(), ControlMessage> {
    let crypto = bridge.crypto();
    let hash = crypto
        .hash
        .ok_or_else(|| failure(Outcome::UnexpectedMessage, "no Call-Connect-Ack received"))?;
    let certificate = bridge
        .peer_certificate()
        .ok_or_else(|| failure(Outcome::VerificationFailed, "no gateway certificate"))?;

    let binding = crypto_binding(hash, &crypto.nonce, certificate, &crypto.hlak);
    bridge
        .send_control(&ControlPacket::call_connected(binding))
        .await
        .map_err(transport)?;
    bridge.set_state(SstpState::CryptoBound);
    info!("Crypto binding sent");
    Ok(())
}

async fn answer_echo(bridge: &Bridge) -> Result<(), ControlMessage> {
    bridge
        .send_control(&ControlPacket::bare(MessageType::EchoResponse))
        .await
        .map_err(transport)
}

/// Acknowledges a gateway Abort or Disconnect and describes it
async fn hang_up(bridge: &Bridge, packet: &ControlPacket) -> ControlMessage {
    if let Err(e) = bridge
        .send_control(&ControlPacket::bare(MessageType::CallDisconnectAck))
        .await
    {
        warn!("Could not acknowledge disconnect: {e}");
    }
    bridge.set_state(SstpState::Terminating);
    let outcome = if packet.message_type == MessageType::CallAbort {
        Outcome::AbortRequested
    } else {
        Outcome::DisconnectRequested
    };
    match packet.status_summary() {
        Some(status) => failure(outcome, status),
        None => ControlMessage::bare(Origin::Sstp, outcome),
    }
}

/// Answers echoes, sends keepalives and handles gateway or local disconnects
/// for the rest of the connection.
pub async fn steady_state(
    bridge: Arc<Bridge>,
    mut inbox: mpsc::Receiver<ControlPacket>,
    shutdown: CancellationToken,
) {
    let message = watch(&bridge, &mut inbox, &shutdown).await;
    bridge.report(message);
}

async fn watch(
    bridge: &Bridge,
    inbox: &mut mpsc::Receiver<ControlPacket>,
    shutdown: &CancellationToken,
) -> ControlMessage {
    let keepalive = bridge.config.keepalive_interval();
    let period = keepalive.unwrap_or(Duration::from_secs(3600));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut echo_pending = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return disconnect(bridge, inbox).await,
            packet = inbox.recv() => {
                let Some(packet) = packet else {
                    return failure(Outcome::TransportFailed, "mailbox closed");
                };
                match packet.message_type {
                    MessageType::EchoRequest => {
                        if let Err(message) = answer_echo(bridge).await {
                            return message;
                        }
                    }
                    MessageType::EchoResponse => debug!("Echo answered"),
                    MessageType::CallAbort | MessageType::CallDisconnect => {
                        return hang_up(bridge, &packet).await
                    }
                    other => warn!("Ignoring {other:?} in steady state"),
                }
            }
            _ = ticker.tick(), if keepalive.is_some() => {
                if bridge.idle_for() < period {
                    echo_pending = false;
                    continue;
                }
                if echo_pending {
                    return failure(Outcome::Timeout, "gateway stopped answering echoes");
                }
                debug!("Link idle, sending echo");
                if let Err(e) = bridge
                    .send_control(&ControlPacket::bare(MessageType::EchoRequest))
                    .await
                {
                    return transport(e);
                }
                echo_pending = true;
            }
        }
    }
}

/// Terminates LCP, sends Call-Disconnect and waits briefly for its ack
async fn disconnect(
    bridge: &Bridge,
    inbox: &mut mpsc::Receiver<ControlPacket>,
) -> ControlMessage {
    info!("Disconnecting from gateway");
    bridge.set_state(SstpState::Terminating);
    let terminate = LcpFrame::TerminateRequest {
        id: bridge.next_frame_id(),
        data: Bytes::new(),
    };
    let sent = async {
        if bridge.negotiated().mru.is_some() {
            bridge.send_frame(protocol::LCP, &terminate).await?;
        }
        bridge
            .send_control(&ControlPacket::bare(MessageType::CallDisconnect))
            .await
    };
    if let Err(e) = sent.await {
        warn!("Disconnect not sent: {e}");
        return failure(Outcome::DisconnectedLocally, e.to_string());
    }

    let acked = timeout(DISCONNECT_ACK_WAIT, async {
        while let Some(packet) = inbox.recv().await {
            if packet.message_type == MessageType::CallDisconnectAck {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    if !acked {
        debug!("No Call-Disconnect-Ack before closing");
    }
    ControlMessage::bare(Origin::Sstp, Outcome::DisconnectedLocally)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{certificate_hash, compound_mac};
    use crate::protocol::sstp::Attribute;
    use crate::protocol::WireUnit;
    use crate::session::testing;
    use tokio::io::AsyncWriteExt;

    fn connect_ack(bitmask: u8) -> ControlPacket {
        ControlPacket::new(
            MessageType::CallConnectAck,
            vec![Attribute::CryptoBindingRequest {
                hash_bitmask: bitmask,
                nonce: [7; 32],
            }],
        )
    }

    #[test]
    fn test_upgrade_request_format() {
        let request = upgrade_request("vpn.example.com", "{ABC}");
        assert!(request.starts_with(
            "SSTP_DUPLEX_POST /sra_{BA195980-CD49-458b-9E23-C84EE0ADCD75}/ HTTP/1.1\r\n"
        ));
        assert!(request.contains("Host: vpn.example.com\r\n"));
        assert!(request.contains("Content-Length: 18446744073709551615\r\n"));
        assert!(request.contains("SSTPCORRELATIONID: {ABC}\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_upgrade_keeps_trailing_bytes() {
        let (bridge, _gateway, _control) = testing::bridge(testing::config());
        let (mut server, mut reader) = tokio::io::duplex(1024);
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\n\x10\x01")
            .await
            .unwrap();
        let leftover = upgrade(&bridge, &mut reader).await.unwrap();
        assert_eq!(&leftover[..], &[0x10, 0x01]);
    }

    #[tokio::test]
    async fn test_upgrade_rejected_status() {
        let (bridge, _gateway, _control) = testing::bridge(testing::config());
        let (mut server, mut reader) = tokio::io::duplex(1024);
        server
            .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
            .await
            .unwrap();
        let message = upgrade(&bridge, &mut reader).await.unwrap_err();
        assert_eq!(message.outcome, Outcome::Rejected);
        assert!(message.detail.unwrap().contains("403"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_times_out() {
        let (bridge, _gateway, _control) = testing::bridge(testing::config());
        let (_server, mut reader) = tokio::io::duplex(1024);
        let message = upgrade(&bridge, &mut reader).await.unwrap_err();
        assert_eq!(message.outcome, Outcome::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_records_binding_request() {
        let (bridge, mut gateway, _control) = testing::bridge(testing::config());
        let (tx, mut rx) = mpsc::channel(4);

        let request = testing::read_control(&mut gateway);
        let (_, connected) = tokio::join!(
            async {
                let request = request.await;
                assert_eq!(request.message_type, MessageType::CallConnectRequest);
                tx.send(connect_ack(0x03)).await.unwrap();
            },
            connect(&bridge, &mut rx)
        );
        connected.unwrap();

        let crypto = bridge.crypto();
        assert_eq!(crypto.hash, Some(HashProtocol::Sha256));
        assert_eq!(crypto.nonce, [7; 32]);
        assert_eq!(bridge.state(), SstpState::ConnectAcked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retransmits_then_times_out() {
        let mut config = testing::config();
        config.ppp.max_configure = 2;
        let (bridge, mut gateway, _control) = testing::bridge(config);
        let (_tx, mut rx) = mpsc::channel(4);

        let message = connect(&bridge, &mut rx).await.unwrap_err();
        assert_eq!(message.outcome, Outcome::Timeout);
        for _ in 0..2 {
            assert_eq!(
                testing::read_control(&mut gateway).await.message_type,
                MessageType::CallConnectRequest
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_nak_and_missing_hash() {
        let (bridge, _gateway, _control) = testing::bridge(testing::config());
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(ControlPacket::bare(MessageType::CallConnectNak))
            .await
            .unwrap();
        let message = connect(&bridge, &mut rx).await.unwrap_err();
        assert_eq!(message.outcome, Outcome::NegativeAcknowledged);

        tx.send(connect_ack(0x00)).await.unwrap();
        let message = connect(&bridge, &mut rx).await.unwrap_err();
        assert_eq!(message.outcome, Outcome::UnexpectedMessage);
    }

    #[tokio::test]
    async fn test_call_connected_carries_valid_mac() {
        let (bridge, mut gateway, _control) = testing::bridge(testing::config());
        bridge.update_crypto(|crypto| {
            crypto.hash = Some(HashProtocol::Sha1);
            crypto.nonce = [3; 32];
        });
        call_connected(&bridge).await.unwrap();

        let packet = testing::read_control(&mut gateway).await;
        assert_eq!(packet.message_type, MessageType::CallConnected);
        assert_eq!(packet.length(), 112);
        let Some(Attribute::CryptoBinding(binding)) = packet.attributes.first() else {
            panic!("missing binding");
        };
        let cert_hash = certificate_hash(HashProtocol::Sha1, testing::CERTIFICATE);
        assert_eq!(binding.cert_hash, cert_hash);
        assert_eq!(
            binding.compound_mac,
            compound_mac(HashProtocol::Sha1, &[3; 32], &cert_hash, &[0; 32])
        );
        assert_eq!(bridge.state(), SstpState::CryptoBound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_and_disconnect_in_steady_state() {
        let (bridge, mut gateway, mut control) = testing::bridge(testing::config());
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(steady_state(bridge.clone(), rx, CancellationToken::new()));

        tx.send(ControlPacket::bare(MessageType::EchoRequest)).await.unwrap();
        assert_eq!(
            testing::read_control(&mut gateway).await.message_type,
            MessageType::EchoResponse
        );

        tx.send(ControlPacket::bare(MessageType::CallDisconnect)).await.unwrap();
        assert_eq!(
            testing::read_control(&mut gateway).await.message_type,
            MessageType::CallDisconnectAck
        );
        task.await.unwrap();
        assert_eq!(control.recv().await.unwrap().outcome, Outcome::DisconnectRequested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_in_steady_state_is_acknowledged() {
        let (bridge, mut gateway, mut control) = testing::bridge(testing::config());
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(steady_state(bridge.clone(), rx, CancellationToken::new()));

        let abort = ControlPacket::new(
            MessageType::CallAbort,
            vec![Attribute::StatusInfo {
                attribute_id: 3,
                status: 0x0000_0006,
                value: Bytes::new(),
            }],
        );
        tx.send(abort).await.unwrap();
        assert_eq!(
            testing::read_control(&mut gateway).await,
            ControlPacket::bare(MessageType::CallDisconnectAck)
        );
        task.await.unwrap();

        let message = control.recv().await.unwrap();
        assert_eq!(message.origin, Origin::Sstp);
        assert_eq!(message.outcome, Outcome::AbortRequested);
        assert!(message.detail.unwrap().contains("status 0x00000006"));
        assert_eq!(bridge.state(), SstpState::Terminating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_times_out_silent_gateway() {
        let (bridge, mut gateway, mut control) = testing::bridge(testing::config());
        let (_tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(steady_state(bridge.clone(), rx, CancellationToken::new()));

        assert_eq!(
            testing::read_control(&mut gateway).await.message_type,
            MessageType::EchoRequest
        );
        task.await.unwrap();
        assert_eq!(control.recv().await.unwrap().outcome, Outcome::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_disconnect_waits_for_ack() {
        let (bridge, mut gateway, mut control) = testing::bridge(testing::config());
        let (tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(steady_state(bridge.clone(), rx, shutdown.clone()));

        shutdown.cancel();
        assert_eq!(
            testing::read_control(&mut gateway).await.message_type,
            MessageType::CallDisconnect
        );
        tx.send(ControlPacket::bare(MessageType::CallDisconnectAck))
            .await
            .unwrap();
        task.await.unwrap();
        assert_eq!(
            control.recv().await.unwrap().outcome,
            Outcome::DisconnectedLocally
        );
    }
}
