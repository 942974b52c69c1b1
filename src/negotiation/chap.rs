//! MS-CHAPv2 authentication over CHAP

use super::response_window;
use crate::crypto::ChapMessage;
use crate::protocol::auth::ChapFrame;
use crate::protocol::ppp::protocol;
use crate::session::{Bridge, ControlMessage, Origin, Outcome, Reported};
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

/// Builds the exchange for a server challenge, rejecting malformed lengths
pub(crate) fn answer(
    bridge: &Bridge,
    origin: Origin,
    challenge: &[u8],
) -> Result<ChapMessage, ControlMessage> {
    let server_challenge: [u8; 16] = challenge.try_into().map_err(|_| {
        ControlMessage::new(
            origin,
            Outcome::ParsingFailed,
            format!("challenge of {} bytes", challenge.len()),
        )
    })?;
    let auth = &bridge.config.auth;
    ChapMessage::new(server_challenge, &auth.username, &auth.password)
        .reported(origin, Outcome::VerificationFailed)
}

/// Checks the authenticator string and derives the HLAK
pub(crate) fn conclude(
    bridge: &Bridge,
    origin: Origin,
    exchange: &ChapMessage,
    message: &[u8],
) -> Result<[u8; 32], ControlMessage> {
    if !exchange.verify(message) {
        return Err(ControlMessage::new(
            origin,
            Outcome::VerificationFailed,
            "authenticator response mismatch",
        ));
    }
    Ok(exchange.hlak(&bridge.config.auth.password))
}

pub async fn authenticate(
    bridge: &Bridge,
    inbox: &mut mpsc::Receiver<ChapFrame>,
) -> Result<[u8; 32], ControlMessage> {
    let deadline = Instant::now() + response_window(bridge);
    let name = Bytes::copy_from_slice(bridge.config.auth.username.as_bytes());
    let mut pending: Option<(u8, ChapMessage)> = None;

    loop {
        let frame = match timeout_at(deadline, inbox.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                return Err(ControlMessage::new(
                    Origin::Chap,
                    Outcome::TransportFailed,
                    "mailbox closed",
                ))
            }
            Err(_) => {
                let waiting = if pending.is_some() { "Success" } else { "Challenge" };
                return Err(ControlMessage::new(
                    Origin::Chap,
                    Outcome::Timeout,
                    format!("no {waiting} from gateway"),
                ));
            }
        };

        match frame {
            ChapFrame::Challenge { id, value, .. } => {
                let exchange = answer(bridge, Origin::Chap, &value)?;
                let response = ChapFrame::Response {
                    id,
                    value: Bytes::copy_from_slice(&exchange.response_value()),
                    name: name.clone(),
                };
                bridge
                    .send_frame(protocol::CHAP, &response)
                    .await
                    .reported(Origin::Chap, Outcome::TransportFailed)?;
                debug!("MS-CHAPv2 response {id} sent");
                pending = Some((id, exchange));
            }
            ChapFrame::Success { id, message } => {
                let Some((expected, exchange)) = &pending else {
                    warn!("MS-CHAPv2 Success before any challenge");
                    continue;
                };
                if id != *expected {
                    warn!("MS-CHAPv2 Success id {id} for response {expected}");
                    continue;
                }
                let hlak = conclude(bridge, Origin::Chap, exchange, &message)?;
                info!("MS-CHAPv2 authentication succeeded");
                return Ok(hlak);
            }
            ChapFrame::Failure { message, .. } => {
                return Err(ControlMessage::new(
                    Origin::Chap,
                    Outcome::AuthenticationFailed,
                    String::from_utf8_lossy(&message),
                ));
            }
            ChapFrame::Response { id, .. } => warn!("Ignoring CHAP Response {id} from gateway"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::mschap::{authenticator_response, challenge_hash, derive_hlak};
    use crate::session::testing;
    use std::time::Duration;

    const SERVER_CHALLENGE: [u8; 16] = [7; 16];

    /// Plays the gateway: sends a challenge and returns our response value
    async fn challenge(
        gateway: &mut tokio::io::DuplexStream,
        tx: &mpsc::Sender<ChapFrame>,
    ) -> (u8, Bytes) {
        tx.send(ChapFrame::Challenge {
            id: 0x21,
            value: Bytes::copy_from_slice(&SERVER_CHALLENGE),
            name: Bytes::from_static(b"gateway"),
        })
        .await
        .unwrap();
        let response: ChapFrame = testing::read_frame(gateway, protocol::CHAP).await;
        let ChapFrame::Response { id, value, name } = response else {
            panic!("expected Response");
        };
        assert_eq!(&name[..], b"user");
        (id, value)
    }

    fn success_message(value: &[u8]) -> Bytes {
        let client_challenge: [u8; 16] = value[..16].try_into().unwrap();
        let nt: [u8; 24] = value[24..48].try_into().unwrap();
        let hash = challenge_hash(&client_challenge, &SERVER_CHALLENGE, "user");
        let authenticator = authenticator_response("secret", &nt, &hash);
        Bytes::from(format!("{authenticator} M=Welcome"))
    }

    #[tokio::test]
    async fn test_verified_success_yields_hlak() {
        let (bridge, mut gateway, _control) = testing::bridge(testing::config());
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn({
            let bridge = bridge.clone();
            async move { authenticate(&bridge, &mut rx).await }
        });

        let (id, value) = challenge(&mut gateway, &tx).await;
        assert_eq!(id, 0x21);
        assert_eq!(value.len(), 49);
        assert_eq!(&value[16..24], &[0; 8]);
        assert_eq!(value[48], 0);

        tx.send(ChapFrame::Success {
            id,
            message: success_message(&value),
        })
        .await
        .unwrap();
        let nt: [u8; 24] = value[24..48].try_into().unwrap();
        assert_eq!(task.await.unwrap().unwrap(), derive_hlak("secret", &nt));
    }

    #[tokio::test]
    async fn test_forged_authenticator_is_fatal() {
        let (bridge, mut gateway, _control) = testing::bridge(testing::config());
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn({
            let bridge = bridge.clone();
            async move { authenticate(&bridge, &mut rx).await }
        });

        let (id, _) = challenge(&mut gateway, &tx).await;
        tx.send(ChapFrame::Success {
            id,
            message: Bytes::from(format!("S={} M=ok", "0".repeat(40))),
        })
        .await
        .unwrap();
        let error = task.await.unwrap().unwrap_err();
        assert_eq!(error.outcome, Outcome::VerificationFailed);
        assert!(error.is_fatal());
    }

    #[tokio::test]
    async fn test_failure_and_short_challenge() {
        let (bridge, mut gateway, _control) = testing::bridge(testing::config());
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(ChapFrame::Challenge {
            id: 1,
            value: Bytes::from_static(&[1, 2, 3]),
            name: Bytes::new(),
        })
        .await
        .unwrap();
        let error = authenticate(&bridge, &mut rx).await.unwrap_err();
        assert_eq!(error.outcome, Outcome::ParsingFailed);

        let task = tokio::spawn({
            let bridge = bridge.clone();
            async move { authenticate(&bridge, &mut rx).await }
        });
        let (id, _) = challenge(&mut gateway, &tx).await;
        tx.send(ChapFrame::Failure {
            id,
            message: Bytes::from_static(b"E=691 R=0"),
        })
        .await
        .unwrap();
        let error = task.await.unwrap().unwrap_err();
        assert_eq!(error.outcome, Outcome::AuthenticationFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_gateway_times_out() {
        let (bridge, _gateway, _control) = testing::bridge(testing::config());
        let (_tx, mut rx) = mpsc::channel(4);
        let started = Instant::now();
        let error = authenticate(&bridge, &mut rx).await.unwrap_err();
        assert_eq!(error.outcome, Outcome::Timeout);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }
}
