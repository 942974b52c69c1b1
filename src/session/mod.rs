//! The concurrent engine of one SSTP connection
//!
//! [`run`] performs the HTTPS upgrade, then spawns the incoming
//! demultiplexer and the establishment driver, and supervises the control
//! channel until the first fatal [`ControlMessage`]. All tasks stop together
//! through one cancellation token; both terminals are closed on the way out.

pub mod bridge;
pub mod incoming;
pub mod mailbox;
pub mod outgoing;

pub use bridge::{Bridge, CryptoMaterial, NegotiatedState, SstpState};
pub use mailbox::{mailboxes, ControlMessage, Inboxes, Origin, Outcome, Reported, Routes};

use crate::config::{AuthProtocol, Config};
use crate::crypto::tls::TlsTerminal;
use crate::negotiation::ipcp::{IpcpPolicy, Ipv6cpPolicy};
use crate::negotiation::lcp::LcpPolicy;
use crate::negotiation::{self, chap, eap, negotiate, pap, NegotiationPolicy};
use crate::protocol::ConfigureFrame;
use crate::tunnel::{InterfaceBuilder, InterfaceParams};
use log::{error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bound of every per-protocol mailbox
pub const MAILBOX_DEPTH: usize = 64;

/// How long a local disconnect waits for the steady-state task to finish
const DISCONNECT_GRACE: Duration = Duration::from_millis(1500);

/// Spawns `task` so that cancelling `token` stops it at its next suspension point
pub(crate) fn spawn_guarded<F>(token: &CancellationToken, task: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = task => {}
        }
    })
}

/// Runs one connection over an established TLS terminal and returns the
/// message that ended it.
pub async fn run<T: TlsTerminal>(
    config: Arc<Config>,
    terminal: T,
    builder: Arc<dyn InterfaceBuilder>,
    shutdown: CancellationToken,
) -> ControlMessage {
    let peer_certificate = terminal.peer_certificate();
    if peer_certificate.is_none() {
        warn!("Gateway certificate unavailable; crypto binding will fail");
    }
    let (mut reader, writer) = tokio::io::split(terminal);
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let bridge = Arc::new(Bridge::new(
        config,
        peer_certificate,
        Box::new(writer),
        control_tx,
    ));

    let leftover = tokio::select! {
        _ = shutdown.cancelled() => {
            bridge.close().await;
            return ControlMessage::bare(Origin::Supervisor, Outcome::DisconnectedLocally);
        }
        result = negotiation::sstp::upgrade(&bridge, &mut reader) => match result {
            Ok(leftover) => leftover,
            Err(message) => {
                error!("{message}");
                bridge.close().await;
                return message;
            }
        }
    };

    let engine = CancellationToken::new();
    let (routes, inboxes) = mailboxes(MAILBOX_DEPTH);
    spawn_guarded(
        &engine,
        incoming::run(bridge.clone(), reader, routes, leftover),
    );
    spawn_guarded(
        &engine,
        drive(bridge.clone(), inboxes, builder, engine.clone(), shutdown.clone()),
    );

    let message = supervise(&bridge, &mut control_rx, &shutdown).await;
    engine.cancel();
    bridge.close().await;
    message
}

async fn supervise(
    bridge: &Bridge,
    control: &mut mpsc::UnboundedReceiver<ControlMessage>,
    shutdown: &CancellationToken,
) -> ControlMessage {
    loop {
        let message = tokio::select! {
            message = control.recv() => message,
            _ = shutdown.cancelled() => return disconnect_locally(bridge, control).await,
        };
        match message {
            Some(message) if message.is_fatal() => {
                error!("{message}");
                return message;
            }
            Some(message) => info!("{message}"),
            None => {
                return ControlMessage::new(
                    Origin::Supervisor,
                    Outcome::TransportFailed,
                    "control channel closed",
                )
            }
        }
    }
}

/// Lets the steady-state task say goodbye to the gateway when it is running
async fn disconnect_locally(
    bridge: &Bridge,
    control: &mut mpsc::UnboundedReceiver<ControlMessage>,
) -> ControlMessage {
    let fallback = ControlMessage::bare(Origin::Supervisor, Outcome::DisconnectedLocally);
    if !matches!(
        bridge.state(),
        SstpState::ConnectAcked | SstpState::CryptoBound | SstpState::Terminating
    ) {
        return fallback;
    }
    let wait = async {
        while let Some(message) = control.recv().await {
            if message.is_fatal() {
                return Some(message);
            }
        }
        None
    };
    match tokio::time::timeout(DISCONNECT_GRACE, wait).await {
        Ok(Some(message)) => message,
        _ => fallback,
    }
}

async fn drive(
    bridge: Arc<Bridge>,
    inboxes: Inboxes,
    builder: Arc<dyn InterfaceBuilder>,
    engine: CancellationToken,
    shutdown: CancellationToken,
) {
    match establish(&bridge, inboxes, builder.as_ref(), &engine, &shutdown).await {
        Ok(()) => bridge.report(ControlMessage::new(
            Origin::Supervisor,
            Outcome::Proceeded,
            "tunnel established",
        )),
        Err(message) => bridge.report(message),
    }
}

/// SSTP connect, LCP, authentication, crypto binding, NCPs, interface
async fn establish(
    bridge: &Arc<Bridge>,
    inboxes: Inboxes,
    builder: &dyn InterfaceBuilder,
    engine: &CancellationToken,
    shutdown: &CancellationToken,
) -> Result<(), ControlMessage> {
    let Inboxes {
        mut sstp,
        mut lcp_configure,
        lcp_link,
        mut pap,
        mut chap,
        mut eap,
        mut ipcp,
        mut ipv6cp,
    } = inboxes;

    negotiation::sstp::connect(bridge, &mut sstp).await?;
    spawn_guarded(
        engine,
        negotiation::sstp::steady_state(bridge.clone(), sstp, shutdown.clone()),
    );

    let mut lcp = LcpPolicy::new(bridge.config.clone());
    negotiate(bridge, &mut lcp_configure, &mut lcp).await?;
    spawn_guarded(
        engine,
        negotiation::lcp::maintain_link(bridge.clone(), lcp_link, lcp_configure),
    );

    let hlak = match bridge.negotiated().auth {
        Some(AuthProtocol::Pap) => pap::authenticate(bridge, &mut pap).await?,
        Some(AuthProtocol::MsChapV2) => chap::authenticate(bridge, &mut chap).await?,
        Some(AuthProtocol::EapMsChapV2) => eap::authenticate(bridge, &mut eap).await?,
        None => {
            info!("Gateway requested no authentication");
            [0; 32]
        }
    };
    bridge.update_crypto(|crypto| crypto.hlak = hlak);
    negotiation::sstp::call_connected(bridge).await?;

    let config = &bridge.config;
    let rejections = bridge.rejections();
    let (ipv4, ipv6) = tokio::join!(
        open_family(
            bridge,
            &mut ipcp,
            config.ppp.ipv4.then(|| IpcpPolicy::new(config)),
            &rejections.ipcp,
        ),
        open_family(
            bridge,
            &mut ipv6cp,
            config.ppp.ipv6.then(Ipv6cpPolicy::new),
            &rejections.ipv6cp,
        ),
    );
    settle_families([ipv4, ipv6])?;

    open_interface(bridge, builder, engine)
}

/// Negotiates one address family; `None` when it is disabled locally
async fn open_family<P: NegotiationPolicy>(
    bridge: &Bridge,
    inbox: &mut mpsc::Receiver<ConfigureFrame<P::Pack>>,
    policy: Option<P>,
    rejected: &CancellationToken,
) -> Option<Result<(), ControlMessage>> {
    let mut policy = policy?;
    Some(tokio::select! {
        result = negotiate(bridge, inbox, &mut policy) => result.map(|_| ()),
        _ = rejected.cancelled() => Err(ControlMessage::new(
            P::ORIGIN,
            Outcome::ProtocolRejected,
            "rejected by gateway",
        )),
    })
}

/// One opened family is enough; a Protocol-Reject of the other is tolerated
fn settle_families(results: [Option<Result<(), ControlMessage>>; 2]) -> Result<(), ControlMessage> {
    let mut opened = 0;
    let mut rejected = None;
    for result in results.into_iter().flatten() {
        match result {
            Ok(()) => opened += 1,
            Err(message) if message.outcome == Outcome::ProtocolRejected => {
                warn!("{message}");
                rejected = Some(message);
            }
            Err(message) => return Err(message),
        }
    }
    match (opened, rejected) {
        (0, Some(message)) => Err(message),
        (0, None) => Err(ControlMessage::new(
            Origin::Supervisor,
            Outcome::UnexpectedMessage,
            "no address family enabled",
        )),
        _ => Ok(()),
    }
}

fn open_interface(
    bridge: &Arc<Bridge>,
    builder: &dyn InterfaceBuilder,
    engine: &CancellationToken,
) -> Result<(), ControlMessage> {
    let params = InterfaceParams::negotiated(&bridge.config, &bridge.negotiated())
        .reported(Origin::Interface, Outcome::InterfaceFailed)?;
    info!("Opening interface {}", params.name);
    let terminal = builder
        .establish(&params)
        .reported(Origin::Interface, Outcome::InterfaceFailed)?;

    let (reader, writer) = tokio::io::split(terminal);
    bridge
        .attach_interface(Box::new(writer))
        .reported(Origin::Interface, Outcome::InterfaceFailed)?;

    let (queue_tx, queue_rx) = mpsc::channel(outgoing::QUEUE_DEPTH);
    spawn_guarded(engine, outgoing::retrieve(bridge.clone(), reader, queue_tx));
    spawn_guarded(engine, outgoing::transmit(bridge.clone(), queue_rx));
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::protocol::sstp::peek_packet_length;
    use crate::protocol::{ControlPacket, DataPacket, WireUnit};
    use bytes::{Bytes, BytesMut};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    pub(crate) const CERTIFICATE: &[u8] = b"gateway certificate (DER)";

    pub(crate) fn config() -> Config {
        Config::new("gateway.test", "user", "secret")
    }

    /// A bridge whose TLS writes land in the returned gateway stream
    pub(crate) fn bridge(
        config: Config,
    ) -> (
        Arc<Bridge>,
        DuplexStream,
        mpsc::UnboundedReceiver<ControlMessage>,
    ) {
        let (client, gateway) = tokio::io::duplex(1 << 16);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(
            Arc::new(config),
            Some(CERTIFICATE.to_vec()),
            Box::new(client),
            control_tx,
        );
        (Arc::new(bridge), gateway, control_rx)
    }

    pub(crate) async fn read_packet(gateway: &mut DuplexStream) -> Bytes {
        let mut header = [0u8; 4];
        gateway.read_exact(&mut header).await.unwrap();
        let length = peek_packet_length(&header).unwrap();
        let mut packet = BytesMut::from(&header[..]);
        packet.resize(length, 0);
        gateway.read_exact(&mut packet[4..]).await.unwrap();
        packet.freeze()
    }

    pub(crate) async fn read_control(gateway: &mut DuplexStream) -> ControlPacket {
        let mut packet = read_packet(gateway).await;
        ControlPacket::decode(&mut packet).unwrap()
    }

    pub(crate) async fn read_frame<U: WireUnit>(gateway: &mut DuplexStream, protocol: u16) -> U {
        let mut packet = read_packet(gateway).await;
        let data = DataPacket::decode(&mut packet).unwrap();
        assert_eq!(data.protocol, protocol, "unexpected PPP protocol");
        let mut payload = data.payload;
        U::decode(&mut payload).unwrap()
    }

    pub(crate) async fn write_unit<U: WireUnit>(gateway: &mut DuplexStream, unit: &U) {
        gateway.write_all(&unit.to_bytes()).await.unwrap();
    }

    /// True once the client side has closed its end
    pub(crate) async fn at_end(gateway: &mut DuplexStream) -> bool {
        let mut byte = [0u8; 1];
        matches!(gateway.read(&mut byte).await, Ok(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(origin: Origin) -> Option<Result<(), ControlMessage>> {
        Some(Err(ControlMessage::bare(origin, Outcome::ProtocolRejected)))
    }

    #[test]
    fn test_one_family_is_enough() {
        assert!(settle_families([Some(Ok(())), rejected(Origin::Ipv6cp)]).is_ok());
        assert!(settle_families([Some(Ok(())), None]).is_ok());
        let error = settle_families([rejected(Origin::Ipcp), None]).unwrap_err();
        assert_eq!(error.outcome, Outcome::ProtocolRejected);
    }

    #[test]
    fn test_other_failures_are_fatal() {
        let timeout = Some(Err(ControlMessage::bare(Origin::Ipcp, Outcome::CountExhausted)));
        let error = settle_families([timeout, Some(Ok(()))]).unwrap_err();
        assert_eq!(error.outcome, Outcome::CountExhausted);
    }

    #[tokio::test]
    async fn test_spawn_guarded_stops_on_cancel() {
        let token = CancellationToken::new();
        let handle = spawn_guarded(&token, std::future::pending());
        token.cancel();
        handle.await.unwrap();
    }
}
