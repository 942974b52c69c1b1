//! LCP: option policy and link maintenance after the link opens

use super::{NegotiationPolicy, Verdict};
use crate::config::{AuthProtocol, Config};
use crate::protocol::lcp::{AuthOption, LcpOptions, MIN_MRU, OPTION_AUTH};
use crate::protocol::ppp::protocol;
use crate::protocol::{ConfigureFrame, LcpFrame, OptionPack};
use crate::session::{Bridge, ControlMessage, Origin, Outcome, Reported};
use bytes::Bytes;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn auth_protocol(option: AuthOption) -> Option<AuthProtocol> {
    match option {
        AuthOption::PAP => Some(AuthProtocol::Pap),
        AuthOption::MSCHAPV2 => Some(AuthProtocol::MsChapV2),
        AuthOption::EAP => Some(AuthProtocol::EapMsChapV2),
        _ => None,
    }
}

pub fn auth_option(protocol: AuthProtocol) -> AuthOption {
    match protocol {
        AuthProtocol::Pap => AuthOption::PAP,
        AuthProtocol::MsChapV2 => AuthOption::MSCHAPV2,
        AuthProtocol::EapMsChapV2 => AuthOption::EAP,
    }
}

/// Strongest enabled protocol, suggested when the peer asks for one we refuse
pub fn preferred_auth(config: &Config) -> Option<AuthProtocol> {
    [
        AuthProtocol::MsChapV2,
        AuthProtocol::EapMsChapV2,
        AuthProtocol::Pap,
    ]
    .into_iter()
    .find(|protocol| config.is_enabled(*protocol))
}

pub struct LcpPolicy {
    config: Arc<Config>,
    desired: LcpOptions,
    peer_auth: Option<AuthProtocol>,
}

impl LcpPolicy {
    pub fn new(config: Arc<Config>) -> Self {
        let mut desired = LcpOptions::default();
        desired.set_mru(config.ppp.mru);
        Self {
            config,
            desired,
            peer_auth: None,
        }
    }
}

impl NegotiationPolicy for LcpPolicy {
    type Pack = LcpOptions;
    const ORIGIN: Origin = Origin::Lcp;

    fn request(&self) -> LcpOptions {
        self.desired.clone()
    }

    fn review(&mut self, peer: &LcpOptions) -> Verdict<LcpOptions> {
        if peer.has_unknown() {
            return Verdict::Reject(peer.unknown_only());
        }

        let mut nak = LcpOptions::default();
        if peer.mru().is_some_and(|mru| mru < MIN_MRU) {
            nak.set_mru(self.config.ppp.mru);
        }
        let requested = peer.auth().map(|option| (option, auth_protocol(option)));
        match requested {
            Some((_, Some(protocol))) if self.config.is_enabled(protocol) => {}
            Some((option, _)) => {
                debug!("Refusing authentication {:#06x}", option.protocol);
                match preferred_auth(&self.config) {
                    Some(preferred) => nak.set_auth(auth_option(preferred)),
                    None => return Verdict::Reject(peer.subset(&[OPTION_AUTH])),
                }
            }
            None => {}
        }
        if !nak.is_empty() {
            return Verdict::Nak(nak);
        }

        self.peer_auth = requested.and_then(|(_, protocol)| protocol);
        Verdict::Ack
    }

    fn adopt_nak(&mut self, suggested: &LcpOptions) -> Result<(), ControlMessage> {
        if let Some(mru) = suggested.mru() {
            if mru >= MIN_MRU {
                self.desired.set_mru(mru);
            } else {
                warn!("Ignoring suggested MRU {mru}");
            }
        }
        Ok(())
    }

    fn adopt_reject(&mut self, rejected: &LcpOptions) -> Result<(), ControlMessage> {
        for kind in rejected.order().kinds() {
            self.desired.remove(kind);
        }
        Ok(())
    }

    fn commit(&self, bridge: &Bridge, peer: &LcpOptions) -> Result<(), ControlMessage> {
        let mru = self.desired.mru().unwrap_or(self.config.ppp.mru);
        let peer_mru = peer.mru().unwrap_or(self.config.ppp.mru);
        bridge.update_negotiated(|state| {
            state.mru = Some(mru);
            state.peer_mru = Some(peer_mru);
            state.auth = self.peer_auth;
        });
        info!(
            "LCP: MRU {mru}, peer MRU {peer_mru}, authentication {:?}",
            self.peer_auth
        );
        Ok(())
    }
}

/// Answers link-level LCP traffic until the link ends
pub async fn maintain_link(
    bridge: Arc<Bridge>,
    mut link: mpsc::Receiver<LcpFrame>,
    mut configure: mpsc::Receiver<ConfigureFrame<LcpOptions>>,
) {
    loop {
        tokio::select! {
            frame = link.recv() => {
                let Some(frame) = frame else {
                    debug!("LCP link mailbox closed");
                    return;
                };
                if let Err(message) = handle(&bridge, frame).await {
                    bridge.report(message);
                    return;
                }
            }
            Some(frame) = configure.recv() => {
                warn!("Ignoring LCP {:?} after the link opened", frame.code);
            }
        }
    }
}

async fn handle(bridge: &Bridge, frame: LcpFrame) -> Result<(), ControlMessage> {
    let send = |frame: LcpFrame| async move {
        bridge
            .send_frame(protocol::LCP, &frame)
            .await
            .reported(Origin::Lcp, Outcome::TransportFailed)
    };

    match frame {
        LcpFrame::EchoRequest { id, data, .. } => {
            send(LcpFrame::EchoReply { id, magic: 0, data }).await
        }
        LcpFrame::EchoReply { .. } | LcpFrame::DiscardRequest { .. } => {
            debug!("LCP {} ignored", frame.code());
            Ok(())
        }
        LcpFrame::TerminateRequest { id, .. } => {
            send(LcpFrame::TerminateAck {
                id,
                data: Bytes::new(),
            })
            .await?;
            Err(ControlMessage::bare(Origin::Lcp, Outcome::TerminateRequested))
        }
        LcpFrame::TerminateAck { .. } => {
            debug!("LCP Terminate-Ack received");
            Ok(())
        }
        LcpFrame::ProtocolReject {
            protocol: rejected, ..
        } => match rejected {
            protocol::IPCP => {
                warn!("Gateway rejected IPCP");
                bridge.rejections().ipcp.cancel();
                Ok(())
            }
            protocol::IPV6CP => {
                warn!("Gateway rejected IPv6CP");
                bridge.rejections().ipv6cp.cancel();
                Ok(())
            }
            other => Err(ControlMessage::new(
                Origin::Lcp,
                Outcome::ProtocolRejected,
                protocol::name(other),
            )),
        },
        LcpFrame::CodeReject { rejected, .. } => Err(ControlMessage::new(
            Origin::Lcp,
            Outcome::CodeRejected,
            format!("code {}", rejected.first().copied().unwrap_or_default()),
        )),
        LcpFrame::Configure(_) => Ok(()),
    }
}
