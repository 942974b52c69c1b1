//! PAP authentication

use crate::protocol::auth::PapFrame;
use crate::protocol::ppp::protocol;
use crate::session::{Bridge, ControlMessage, Origin, Outcome, Reported};
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

/// Authenticates with the configured credentials; PAP yields a zero HLAK
pub async fn authenticate(
    bridge: &Bridge,
    inbox: &mut mpsc::Receiver<PapFrame>,
) -> Result<[u8; 32], ControlMessage> {
    let auth = &bridge.config.auth;
    let restart = bridge.config.restart_timer();
    let peer_id = Bytes::copy_from_slice(auth.username.as_bytes());
    let password = Bytes::copy_from_slice(auth.password.as_bytes());

    for attempt in 1..=bridge.config.ppp.max_configure {
        let id = bridge.next_frame_id();
        let request = PapFrame::Request {
            id,
            peer_id: peer_id.clone(),
            password: password.clone(),
        };
        bridge
            .send_frame(protocol::PAP, &request)
            .await
            .reported(Origin::Pap, Outcome::TransportFailed)?;
        debug!("PAP request {id} sent (attempt {attempt})");

        let deadline = Instant::now() + restart;
        loop {
            let frame = match timeout_at(deadline, inbox.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    return Err(ControlMessage::new(
                        Origin::Pap,
                        Outcome::TransportFailed,
                        "mailbox closed",
                    ))
                }
                Err(_) => break,
            };
            match frame {
                PapFrame::Ack { id: ack, message } if ack == id => {
                    info!(
                        "PAP authentication succeeded: {}",
                        String::from_utf8_lossy(&message)
                    );
                    return Ok([0; 32]);
                }
                PapFrame::Nak { id: nak, message } if nak == id => {
                    return Err(ControlMessage::new(
                        Origin::Pap,
                        Outcome::AuthenticationFailed,
                        String::from_utf8_lossy(&message),
                    ));
                }
                other => warn!("Ignoring PAP frame {other:?}"),
            }
        }
    }

    Err(ControlMessage::new(
        Origin::Pap,
        Outcome::Timeout,
        "no answer to Authenticate-Request",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing;

    #[tokio::test]
    async fn test_ack_completes_with_zero_hlak() {
        let (bridge, mut gateway, _control) = testing::bridge(testing::config());
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn({
            let bridge = bridge.clone();
            async move { authenticate(&bridge, &mut rx).await }
        });

        let request: PapFrame = testing::read_frame(&mut gateway, protocol::PAP).await;
        let PapFrame::Request {
            id,
            peer_id,
            password,
        } = request
        else {
            panic!("expected Authenticate-Request");
        };
        assert_eq!(&peer_id[..], b"user");
        assert_eq!(&password[..], b"secret");

        tx.send(PapFrame::Ack {
            id,
            message: Bytes::from_static(b"welcome"),
        })
        .await
        .unwrap();
        assert_eq!(task.await.unwrap().unwrap(), [0; 32]);
    }

    #[tokio::test]
    async fn test_nak_fails_authentication() {
        let (bridge, mut gateway, _control) = testing::bridge(testing::config());
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn({
            let bridge = bridge.clone();
            async move { authenticate(&bridge, &mut rx).await }
        });

        let request: PapFrame = testing::read_frame(&mut gateway, protocol::PAP).await;
        let PapFrame::Request { id, .. } = request else {
            panic!("expected Authenticate-Request");
        };
        tx.send(PapFrame::Nak {
            id,
            message: Bytes::from_static(b"denied"),
        })
        .await
        .unwrap();

        let error = task.await.unwrap().unwrap_err();
        assert_eq!(error.outcome, Outcome::AuthenticationFailed);
        assert_eq!(error.detail.as_deref(), Some("denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmits_with_fresh_ids_then_times_out() {
        let mut config = testing::config();
        config.ppp.max_configure = 3;
        let (bridge, mut gateway, _control) = testing::bridge(config);
        let (_tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn({
            let bridge = bridge.clone();
            async move { authenticate(&bridge, &mut rx).await }
        });

        let mut ids = Vec::new();
        for _ in 0..3 {
            let request: PapFrame = testing::read_frame(&mut gateway, protocol::PAP).await;
            let PapFrame::Request { id, .. } = request else {
                panic!("expected Authenticate-Request");
            };
            ids.push(id);
        }
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(task.await.unwrap().unwrap_err().outcome, Outcome::Timeout);
    }
}
