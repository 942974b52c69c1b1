//! PPP and SSTP negotiation state machines
//!
//! [`negotiate`] runs the Configure-Request/Ack/Nak/Reject exchange shared by
//! LCP, IPCP and IPv6CP; a [`NegotiationPolicy`] supplies what we ask for and
//! how we judge the peer's requests.

pub mod chap;
pub mod eap;
pub mod ipcp;
pub mod lcp;
pub mod pap;
pub mod sstp;

use crate::protocol::{ConfigureCode, ConfigureFrame, OptionPack};
use crate::session::{Bridge, ControlMessage, Origin, Outcome};
use bytes::BytesMut;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

/// Our answer to a peer Configure-Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict<P> {
    Ack,
    Nak(P),
    Reject(P),
}

pub trait NegotiationPolicy: Send {
    type Pack: OptionPack;
    const ORIGIN: Origin;

    /// Options we currently ask for
    fn request(&self) -> Self::Pack;

    fn review(&mut self, peer: &Self::Pack) -> Verdict<Self::Pack>;

    fn adopt_nak(&mut self, suggested: &Self::Pack) -> Result<(), ControlMessage>;

    fn adopt_reject(&mut self, rejected: &Self::Pack) -> Result<(), ControlMessage>;

    /// Stores the outcome once both directions are acknowledged
    fn commit(&self, bridge: &Bridge, peer: &Self::Pack) -> Result<(), ControlMessage>;
}

fn pack_bytes<P: OptionPack>(pack: &P) -> BytesMut {
    let mut buf = BytesMut::with_capacity(pack.pack_length());
    pack.encode_pack(&mut buf);
    buf
}

fn closed(origin: Origin) -> ControlMessage {
    ControlMessage::new(origin, Outcome::TransportFailed, "mailbox closed")
}

/// Runs one option negotiation until both directions are acknowledged
pub async fn negotiate<P: NegotiationPolicy>(
    bridge: &Bridge,
    inbox: &mut mpsc::Receiver<ConfigureFrame<P::Pack>>,
    policy: &mut P,
) -> Result<P::Pack, ControlMessage> {
    let restart: Duration = bridge.config.restart_timer();
    let max_configure = bridge.config.ppp.max_configure;
    let name = <P::Pack as OptionPack>::NAME;

    let mut sent = 0u32;
    let mut idle = 0u32;
    let mut acked = false;
    let mut peer: Option<P::Pack> = None;

    let mut request = send_request(bridge, policy, &mut sent, max_configure).await?;
    let mut deadline = Instant::now() + restart;

    while !(acked && peer.is_some()) {
        let frame = match timeout_at(deadline, inbox.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(closed(P::ORIGIN)),
            Err(_) if acked => {
                idle += 1;
                if idle >= max_configure {
                    return Err(ControlMessage::new(
                        P::ORIGIN,
                        Outcome::Timeout,
                        "peer sent no Configure-Request",
                    ));
                }
                deadline = Instant::now() + restart;
                continue;
            }
            Err(_) => {
                debug!("{name} restart timer expired");
                request = send_request(bridge, policy, &mut sent, max_configure).await?;
                deadline = Instant::now() + restart;
                continue;
            }
        };

        match frame.code {
            ConfigureCode::Request => {
                let (code, options) = match policy.review(&frame.options) {
                    Verdict::Ack => {
                        peer = Some(frame.options.clone());
                        (ConfigureCode::Ack, frame.options)
                    }
                    Verdict::Nak(suggested) => (ConfigureCode::Nak, suggested),
                    Verdict::Reject(rejected) => (ConfigureCode::Reject, rejected),
                };
                debug!("{name} answering request {} with {code:?}", frame.id);
                send(bridge, P::ORIGIN, &ConfigureFrame::new(code, frame.id, options)).await?;
            }
            ConfigureCode::Ack if acked => debug!("{name} duplicate Configure-Ack ignored"),
            ConfigureCode::Ack => {
                if frame.id != request.id {
                    return Err(ControlMessage::new(
                        P::ORIGIN,
                        Outcome::UnexpectedMessage,
                        format!("Configure-Ack id {} for request {}", frame.id, request.id),
                    ));
                }
                if pack_bytes(&frame.options) != pack_bytes(&request.options) {
                    return Err(ControlMessage::new(
                        P::ORIGIN,
                        Outcome::UnexpectedMessage,
                        "Configure-Ack options differ from the request",
                    ));
                }
                acked = true;
                deadline = Instant::now() + restart;
            }
            ConfigureCode::Nak | ConfigureCode::Reject if acked || frame.id != request.id => {
                warn!("{name} stale {:?} id {} discarded", frame.code, frame.id);
            }
            ConfigureCode::Nak => {
                policy.adopt_nak(&frame.options)?;
                request = send_request(bridge, policy, &mut sent, max_configure).await?;
                deadline = Instant::now() + restart;
            }
            ConfigureCode::Reject => {
                policy.adopt_reject(&frame.options)?;
                request = send_request(bridge, policy, &mut sent, max_configure).await?;
                deadline = Instant::now() + restart;
            }
        }
    }

    let peer = peer.unwrap_or_default();
    policy.commit(bridge, &peer)?;
    info!("{name} opened after {sent} request(s)");
    Ok(peer)
}

async fn send_request<P: NegotiationPolicy>(
    bridge: &Bridge,
    policy: &P,
    sent: &mut u32,
    max_configure: u32,
) -> Result<ConfigureFrame<P::Pack>, ControlMessage> {
    if *sent >= max_configure {
        return Err(ControlMessage::new(
            P::ORIGIN,
            Outcome::CountExhausted,
            format!("{max_configure} Configure-Requests unanswered"),
        ));
    }
    *sent += 1;
    let frame = ConfigureFrame::new(ConfigureCode::Request, bridge.next_frame_id(), policy.request());
    send(bridge, P::ORIGIN, &frame).await?;
    Ok(frame)
}

async fn send<P: OptionPack>(
    bridge: &Bridge,
    origin: Origin,
    frame: &ConfigureFrame<P>,
) -> Result<(), ControlMessage> {
    bridge
        .send_frame(P::PROTOCOL, frame)
        .await
        .map_err(|e| ControlMessage::new(origin, Outcome::TransportFailed, e.to_string()))
}

/// Overall bound on an authentication or handshake wait
pub(crate) fn response_window(bridge: &Bridge) -> Duration {
    bridge.config.restart_timer() * bridge.config.ppp.max_configure
}
