//! EAP-MSCHAPv2 authentication

use super::chap::{answer, conclude};
use super::response_window;
use crate::crypto::ChapMessage;
use crate::protocol::auth::{eap_type, mschapv2_opcode, EapFrame, MsChapV2Packet};
use crate::protocol::ppp::protocol;
use crate::protocol::WireUnit;
use crate::session::{Bridge, ControlMessage, Origin, Outcome, Reported};
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

async fn respond(bridge: &Bridge, id: u8, kind: u8, data: Bytes) -> Result<(), ControlMessage> {
    bridge
        .send_frame(protocol::EAP, &EapFrame::Response { id, kind, data })
        .await
        .reported(Origin::Eap, Outcome::TransportFailed)
}

pub async fn authenticate(
    bridge: &Bridge,
    inbox: &mut mpsc::Receiver<EapFrame>,
) -> Result<[u8; 32], ControlMessage> {
    let deadline = Instant::now() + response_window(bridge);
    let username = Bytes::copy_from_slice(bridge.config.auth.username.as_bytes());
    let mut exchange: Option<ChapMessage> = None;
    let mut hlak: Option<[u8; 32]> = None;

    loop {
        let frame = match timeout_at(deadline, inbox.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                return Err(ControlMessage::new(
                    Origin::Eap,
                    Outcome::TransportFailed,
                    "mailbox closed",
                ))
            }
            Err(_) => {
                return Err(ControlMessage::new(
                    Origin::Eap,
                    Outcome::Timeout,
                    "EAP exchange did not finish",
                ))
            }
        };

        let (id, kind, mut data) = match frame {
            EapFrame::Request { id, kind, data } => (id, kind, data),
            EapFrame::Success { .. } => {
                return match hlak {
                    Some(hlak) => {
                        info!("EAP-MSCHAPv2 authentication succeeded");
                        Ok(hlak)
                    }
                    None => Err(ControlMessage::new(
                        Origin::Eap,
                        Outcome::VerificationFailed,
                        "EAP Success before MS-CHAPv2 Success",
                    )),
                };
            }
            EapFrame::Failure { .. } => {
                return Err(ControlMessage::bare(Origin::Eap, Outcome::AuthenticationFailed))
            }
            EapFrame::Response { id, .. } => {
                warn!("Ignoring EAP Response {id} from gateway");
                continue;
            }
        };

        match kind {
            eap_type::IDENTITY => {
                debug!("EAP identity request {id}");
                respond(bridge, id, eap_type::IDENTITY, username.clone()).await?;
            }
            eap_type::MSCHAPV2 => {
                let packet = MsChapV2Packet::decode(&mut data).map_err(|e| {
                    ControlMessage::new(Origin::Eap, Outcome::ParsingFailed, e.to_string())
                })?;
                match packet {
                    MsChapV2Packet::Challenge { ms_id, value, .. } => {
                        let current = answer(bridge, Origin::Eap, &value)?;
                        let response = MsChapV2Packet::Response {
                            ms_id,
                            value: Bytes::copy_from_slice(&current.response_value()),
                            name: username.clone(),
                        };
                        respond(bridge, id, eap_type::MSCHAPV2, response.to_bytes()).await?;
                        exchange = Some(current);
                    }
                    MsChapV2Packet::Success { message, .. } => {
                        let Some(current) = &exchange else {
                            return Err(ControlMessage::new(
                                Origin::Eap,
                                Outcome::UnexpectedMessage,
                                "MS-CHAPv2 Success before any challenge",
                            ));
                        };
                        hlak = Some(conclude(bridge, Origin::Eap, current, &message)?);
                        let ack = MsChapV2Packet::Acknowledge {
                            opcode: mschapv2_opcode::SUCCESS,
                        };
                        respond(bridge, id, eap_type::MSCHAPV2, ack.to_bytes()).await?;
                    }
                    MsChapV2Packet::Failure { message, .. } => {
                        return Err(ControlMessage::new(
                            Origin::Eap,
                            Outcome::AuthenticationFailed,
                            String::from_utf8_lossy(&message),
                        ));
                    }
                    other => warn!("Ignoring MS-CHAPv2 {other:?} in an EAP request"),
                }
            }
            other => {
                debug!("EAP type {other} refused, proposing MS-CHAPv2");
                respond(
                    bridge,
                    id,
                    eap_type::NAK,
                    Bytes::from_static(&[eap_type::MSCHAPV2]),
                )
                .await?;
            }
        }
    }
}
