//! Control messages and the per-protocol mailboxes
//!
//! Every state machine reports through one unbounded control channel; units
//! decoded by the incoming demultiplexer reach their state machine through a
//! bounded mailbox per protocol. The demultiplexer owns all senders, so
//! stopping it closes every mailbox at once.

use crate::error::VpnError;
use crate::protocol::auth::{ChapFrame, EapFrame, PapFrame};
use crate::protocol::ipcp::{IpcpOptions, Ipv6cpOptions};
use crate::protocol::lcp::LcpOptions;
use crate::protocol::{ConfigureFrame, ControlPacket, LcpFrame};
use log::{debug, warn};
use std::fmt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Component that produced a [`ControlMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Incoming,
    Outgoing,
    Sstp,
    Lcp,
    Pap,
    Chap,
    Eap,
    Ipcp,
    Ipv6cp,
    Interface,
    Supervisor,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Origin::Incoming => "incoming",
            Origin::Outgoing => "outgoing",
            Origin::Sstp => "SSTP",
            Origin::Lcp => "LCP",
            Origin::Pap => "PAP",
            Origin::Chap => "CHAP",
            Origin::Eap => "EAP",
            Origin::Ipcp => "IPCP",
            Origin::Ipv6cp => "IPv6CP",
            Origin::Interface => "interface",
            Origin::Supervisor => "supervisor",
        };
        f.write_str(name)
    }
}

/// Result of an engine component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Proceeded,
    Timeout,
    CountExhausted,
    UnknownType,
    UnexpectedMessage,
    ParsingFailed,
    VerificationFailed,
    NegativeAcknowledged,
    AbortRequested,
    DisconnectRequested,
    TerminateRequested,
    ProtocolRejected,
    CodeRejected,
    AuthenticationFailed,
    AddressRejected,
    OptionRejected,
    Rejected,
    TransportFailed,
    InterfaceFailed,
    DisconnectedLocally,
}

impl Outcome {
    /// Everything but `Proceeded` tears the connection down
    pub fn is_fatal(self) -> bool {
        self != Outcome::Proceeded
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Proceeded => "proceeded",
            Outcome::Timeout => "timeout",
            Outcome::CountExhausted => "count exhausted",
            Outcome::UnknownType => "unknown type",
            Outcome::UnexpectedMessage => "unexpected message",
            Outcome::ParsingFailed => "parsing failed",
            Outcome::VerificationFailed => "verification failed",
            Outcome::NegativeAcknowledged => "negative acknowledged",
            Outcome::AbortRequested => "abort requested",
            Outcome::DisconnectRequested => "disconnect requested",
            Outcome::TerminateRequested => "terminate requested",
            Outcome::ProtocolRejected => "protocol rejected",
            Outcome::CodeRejected => "code rejected",
            Outcome::AuthenticationFailed => "authentication failed",
            Outcome::AddressRejected => "address rejected",
            Outcome::OptionRejected => "option rejected",
            Outcome::Rejected => "rejected",
            Outcome::TransportFailed => "transport failed",
            Outcome::InterfaceFailed => "interface failed",
            Outcome::DisconnectedLocally => "disconnected locally",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One report on the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub origin: Origin,
    pub outcome: Outcome,
    pub detail: Option<String>,
}

impl ControlMessage {
    pub fn new(origin: Origin, outcome: Outcome, detail: impl Into<String>) -> Self {
        Self {
            origin,
            outcome,
            detail: Some(detail.into()),
        }
    }

    pub fn bare(origin: Origin, outcome: Outcome) -> Self {
        Self {
            origin,
            outcome,
            detail: None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.outcome.is_fatal()
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.outcome)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

/// Maps a library error into a control message for `origin`
pub trait Reported<T> {
    fn reported(self, origin: Origin, outcome: Outcome) -> Result<T, ControlMessage>;
}

impl<T> Reported<T> for crate::error::Result<T> {
    fn reported(self, origin: Origin, outcome: Outcome) -> Result<T, ControlMessage> {
        self.map_err(|e: VpnError| ControlMessage::new(origin, outcome, e.to_string()))
    }
}

/// Sending ends, owned by the incoming demultiplexer
#[derive(Debug)]
pub struct Routes {
    pub sstp: mpsc::Sender<ControlPacket>,
    pub lcp_configure: mpsc::Sender<ConfigureFrame<LcpOptions>>,
    pub lcp_link: mpsc::Sender<LcpFrame>,
    pub pap: mpsc::Sender<PapFrame>,
    pub chap: mpsc::Sender<ChapFrame>,
    pub eap: mpsc::Sender<EapFrame>,
    pub ipcp: mpsc::Sender<ConfigureFrame<IpcpOptions>>,
    pub ipv6cp: mpsc::Sender<ConfigureFrame<Ipv6cpOptions>>,
}

/// Receiving ends, handed out to the state machines
#[derive(Debug)]
pub struct Inboxes {
    pub sstp: mpsc::Receiver<ControlPacket>,
    pub lcp_configure: mpsc::Receiver<ConfigureFrame<LcpOptions>>,
    pub lcp_link: mpsc::Receiver<LcpFrame>,
    pub pap: mpsc::Receiver<PapFrame>,
    pub chap: mpsc::Receiver<ChapFrame>,
    pub eap: mpsc::Receiver<EapFrame>,
    pub ipcp: mpsc::Receiver<ConfigureFrame<IpcpOptions>>,
    pub ipv6cp: mpsc::Receiver<ConfigureFrame<Ipv6cpOptions>>,
}

/// Creates every mailbox with the same bound
pub fn mailboxes(capacity: usize) -> (Routes, Inboxes) {
    let (sstp_tx, sstp_rx) = mpsc::channel(capacity);
    let (lcp_configure_tx, lcp_configure_rx) = mpsc::channel(capacity);
    let (lcp_link_tx, lcp_link_rx) = mpsc::channel(capacity);
    let (pap_tx, pap_rx) = mpsc::channel(capacity);
    let (chap_tx, chap_rx) = mpsc::channel(capacity);
    let (eap_tx, eap_rx) = mpsc::channel(capacity);
    let (ipcp_tx, ipcp_rx) = mpsc::channel(capacity);
    let (ipv6cp_tx, ipv6cp_rx) = mpsc::channel(capacity);

    (
        Routes {
            sstp: sstp_tx,
            lcp_configure: lcp_configure_tx,
            lcp_link: lcp_link_tx,
            pap: pap_tx,
            chap: chap_tx,
            eap: eap_tx,
            ipcp: ipcp_tx,
            ipv6cp: ipv6cp_tx,
        },
        Inboxes {
            sstp: sstp_rx,
            lcp_configure: lcp_configure_rx,
            lcp_link: lcp_link_rx,
            pap: pap_rx,
            chap: chap_rx,
            eap: eap_rx,
            ipcp: ipcp_rx,
            ipv6cp: ipv6cp_rx,
        },
    )
}

/// Posts without waiting; a full or abandoned mailbox drops the unit
pub(crate) fn deliver<T: fmt::Debug>(sender: &mpsc::Sender<T>, unit: T, mailbox: &str) {
    match sender.try_send(unit) {
        Ok(()) => {}
        Err(TrySendError::Full(unit)) => warn!("{mailbox} mailbox full, dropping {unit:?}"),
        Err(TrySendError::Closed(unit)) => debug!("{mailbox} mailbox closed, dropping {unit:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    #[test]
    fn test_control_message_display() {
        let msg = ControlMessage::new(Origin::Ipcp, Outcome::AddressRejected, "10.0.0.1");
        assert_eq!(msg.to_string(), "IPCP: address rejected (10.0.0.1)");
        assert_eq!(
            ControlMessage::bare(Origin::Sstp, Outcome::Timeout).to_string(),
            "SSTP: timeout"
        );
    }

    #[test]
    fn test_only_proceeded_is_benign() {
        assert!(!ControlMessage::bare(Origin::Supervisor, Outcome::Proceeded).is_fatal());
        assert!(Outcome::DisconnectedLocally.is_fatal());
        assert!(Outcome::TransportFailed.is_fatal());
    }

    #[test]
    fn test_reported_wraps_error_text() {
        let result: crate::error::Result<()> = Err(VpnError::TunTap("no device".to_string()));
        let msg = result
            .reported(Origin::Interface, Outcome::InterfaceFailed)
            .unwrap_err();
        assert_eq!(msg.outcome, Outcome::InterfaceFailed);
        assert!(msg.detail.unwrap().contains("no device"));
    }

    #[tokio::test]
    async fn test_deliver_drops_when_full_or_closed() {
        let (routes, mut inboxes) = mailboxes(1);
        deliver(&routes.sstp, ControlPacket::bare(MessageType::EchoRequest), "SSTP");
        deliver(&routes.sstp, ControlPacket::bare(MessageType::EchoResponse), "SSTP");
        assert_eq!(
            inboxes.sstp.recv().await.unwrap().message_type,
            MessageType::EchoRequest
        );
        assert!(inboxes.sstp.try_recv().is_err());

        drop(inboxes);
        deliver(&routes.sstp, ControlPacket::bare(MessageType::EchoRequest), "SSTP");
    }
}
