//! IPCP and IPv6CP option policies

use super::{NegotiationPolicy, Verdict};
use crate::config::Config;
use crate::protocol::ipcp::{
    Ipv6cpOptions, IpcpOptions, OPTION_INTERFACE_IDENTIFIER, OPTION_IP_ADDRESS,
    OPTION_PRIMARY_DNS,
};
use crate::protocol::OptionPack;
use crate::session::{Bridge, ControlMessage, Origin, Outcome};
use log::{debug, info, warn};
use rand::Rng;
use std::net::Ipv4Addr;

/// An address from 169.254.1.0 - 169.254.254.255 for a gateway that asked for none
fn link_local_address() -> Ipv4Addr {
    let mut rng = rand::thread_rng();
    Ipv4Addr::new(169, 254, rng.gen_range(1..=254), rng.gen())
}

pub struct IpcpPolicy {
    desired: IpcpOptions,
}

impl IpcpPolicy {
    pub fn new(config: &Config) -> Self {
        let mut desired = IpcpOptions::default();
        desired.set_address(config.ppp.static_ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED));
        if config.ppp.request_dns {
            desired.set_dns(Ipv4Addr::UNSPECIFIED);
        }
        Self { desired }
    }
}

impl NegotiationPolicy for IpcpPolicy {
    type Pack = IpcpOptions;
    const ORIGIN: Origin = Origin::Ipcp;

    fn request(&self) -> IpcpOptions {
        self.desired.clone()
    }

    fn review(&mut self, peer: &IpcpOptions) -> Verdict<IpcpOptions> {
        let mut rejected: Vec<u8> = peer.unknown().iter().map(|o| o.kind).collect();
        // we never hand out a DNS server
        if peer.dns().is_some() {
            rejected.push(OPTION_PRIMARY_DNS);
        }
        if !rejected.is_empty() {
            return Verdict::Reject(peer.subset(&rejected));
        }
        if peer.address() == Some(Ipv4Addr::UNSPECIFIED) {
            let mut suggestion = IpcpOptions::default();
            suggestion.set_address(link_local_address());
            return Verdict::Nak(suggestion);
        }
        Verdict::Ack
    }

    fn adopt_nak(&mut self, suggested: &IpcpOptions) -> Result<(), ControlMessage> {
        if let Some(address) = suggested.address() {
            debug!("IPCP: gateway assigns {address}");
            self.desired.set_address(address);
        }
        if let Some(dns) = suggested.dns() {
            self.desired.set_dns(dns);
        }
        Ok(())
    }

    fn adopt_reject(&mut self, rejected: &IpcpOptions) -> Result<(), ControlMessage> {
        if rejected.address().is_some() {
            return Err(ControlMessage::new(
                Origin::Ipcp,
                Outcome::AddressRejected,
                "gateway rejected the IP-Address option",
            ));
        }
        if rejected.dns().is_some() {
            warn!("Gateway does not offer a DNS server");
            self.desired.remove(OPTION_PRIMARY_DNS);
        }
        for unknown in rejected.unknown() {
            self.desired.remove(unknown.kind);
        }
        Ok(())
    }

    fn commit(&self, bridge: &Bridge, peer: &IpcpOptions) -> Result<(), ControlMessage> {
        let address = self.desired.address().unwrap_or(Ipv4Addr::UNSPECIFIED);
        if address.is_unspecified() {
            return Err(ControlMessage::new(
                Origin::Ipcp,
                Outcome::AddressRejected,
                "no address assigned",
            ));
        }
        let dns = self.desired.dns().filter(|dns| !dns.is_unspecified());
        bridge.update_negotiated(|state| {
            state.ipv4 = Some(address);
            state.peer_ipv4 = peer.address();
            state.dns = dns;
        });
        info!(
            "IPCP: address {address}, gateway {:?}, DNS {:?}",
            peer.address(),
            dns
        );
        Ok(())
    }
}

pub struct Ipv6cpPolicy {
    desired: Ipv6cpOptions,
}

fn random_identifier() -> [u8; 8] {
    loop {
        let identifier: [u8; 8] = rand::random();
        if identifier != [0; 8] {
            return identifier;
        }
    }
}

impl Ipv6cpPolicy {
    pub fn new() -> Self {
        let mut desired = Ipv6cpOptions::default();
        desired.set_identifier(random_identifier());
        Self { desired }
    }

    fn identifier(&self) -> Option<[u8; 8]> {
        self.desired.identifier()
    }
}

impl Default for Ipv6cpPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl NegotiationPolicy for Ipv6cpPolicy {
    type Pack = Ipv6cpOptions;
    const ORIGIN: Origin = Origin::Ipv6cp;

    fn request(&self) -> Ipv6cpOptions {
        self.desired.clone()
    }

    fn review(&mut self, peer: &Ipv6cpOptions) -> Verdict<Ipv6cpOptions> {
        if peer.has_unknown() {
            return Verdict::Reject(peer.unknown_only());
        }
        match peer.identifier() {
            Some(identifier) if identifier == [0; 8] || Some(identifier) == self.identifier() => {
                let mut suggestion = Ipv6cpOptions::default();
                let mut fresh = random_identifier();
                while Some(fresh) == self.identifier() {
                    fresh = random_identifier();
                }
                suggestion.set_identifier(fresh);
                Verdict::Nak(suggestion)
            }
            _ => Verdict::Ack,
        }
    }

    fn adopt_nak(&mut self, suggested: &Ipv6cpOptions) -> Result<(), ControlMessage> {
        if let Some(identifier) = suggested.identifier() {
            self.desired.set_identifier(identifier);
        }
        Ok(())
    }

    fn adopt_reject(&mut self, rejected: &Ipv6cpOptions) -> Result<(), ControlMessage> {
        if rejected.order().kinds().contains(&OPTION_INTERFACE_IDENTIFIER) {
            return Err(ControlMessage::new(
                Origin::Ipv6cp,
                Outcome::OptionRejected,
                "gateway rejected the Interface-Identifier option",
            ));
        }
        for unknown in rejected.unknown() {
            self.desired.remove(unknown.kind);
        }
        Ok(())
    }

    fn commit(&self, bridge: &Bridge, peer: &Ipv6cpOptions) -> Result<(), ControlMessage> {
        let identifier = self.identifier();
        bridge.update_negotiated(|state| {
            state.ipv6_identifier = identifier;
            state.peer_ipv6_identifier = peer.identifier();
        });
        info!(
            "IPv6CP: identifier {}, gateway {}",
            identifier.map(hex::encode).unwrap_or_default(),
            peer.identifier().map(hex::encode).unwrap_or_default()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::negotiate;
    use crate::protocol::ppp::protocol;
    use crate::protocol::{ConfigureCode, ConfigureFrame, WireUnit};
    use bytes::Bytes;
    use crate::session::testing;
    use tokio::sync::mpsc;

    #[test]
    fn test_initial_request() {
        let mut config = testing::config();
        let ipcp = IpcpPolicy::new(&config);
        assert_eq!(ipcp.request().address(), Some(Ipv4Addr::UNSPECIFIED));
        assert_eq!(ipcp.request().dns(), Some(Ipv4Addr::UNSPECIFIED));

        config.ppp.request_dns = false;
        config.ppp.static_ipv4 = Some(Ipv4Addr::new(10, 0, 0, 9));
        let ipcp = IpcpPolicy::new(&config);
        assert_eq!(ipcp.request().address(), Some(Ipv4Addr::new(10, 0, 0, 9)));
        assert_eq!(ipcp.request().dns(), None);
    }

    #[test]
    fn test_zero_peer_address_is_nakked() {
        let mut ipcp = IpcpPolicy::new(&testing::config());
        let mut peer = IpcpOptions::default();
        peer.set_address(Ipv4Addr::UNSPECIFIED);
        let Verdict::Nak(suggested) = ipcp.review(&peer) else {
            panic!("expected Nak");
        };
        let address = suggested.address().unwrap();
        assert!(address.is_link_local());
        assert!(!address.is_unspecified());
        assert_eq!(suggested.dns(), None);

        // unknown options are rejected before anything is nakked
        let mut bytes = Bytes::from_static(&[1, 1, 0, 12, 3, 6, 0, 0, 0, 0, 130, 2]);
        let with_unknown = ConfigureFrame::<IpcpOptions>::decode(&mut bytes).unwrap();
        let Verdict::Reject(rejected) = ipcp.review(&with_unknown.options) else {
            panic!("expected Reject");
        };
        assert_eq!(rejected.address(), None);
        assert_eq!(rejected.unknown().len(), 1);

        peer.set_address(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ipcp.review(&peer), Verdict::Ack);
    }

    #[test]
    fn test_address_reject_is_fatal_and_dns_reject_is_not() {
        let mut ipcp = IpcpPolicy::new(&testing::config());
        let mut dns_only = IpcpOptions::default();
        dns_only.set_dns(Ipv4Addr::UNSPECIFIED);
        ipcp.adopt_reject(&dns_only).unwrap();
        assert_eq!(ipcp.request().dns(), None);

        let mut address = IpcpOptions::default();
        address.set_address(Ipv4Addr::UNSPECIFIED);
        let error = ipcp.adopt_reject(&address).unwrap_err();
        assert_eq!(error.outcome, Outcome::AddressRejected);
    }

    #[test]
    fn test_ipv6_identifier_collision_is_nakked() {
        let mut ipv6cp = Ipv6cpPolicy::new();
        let ours = ipv6cp.identifier().unwrap();
        assert_ne!(ours, [0; 8]);

        for bad in [[0; 8], ours] {
            let mut peer = Ipv6cpOptions::default();
            peer.set_identifier(bad);
            let Verdict::Nak(suggestion) = ipv6cp.review(&peer) else {
                panic!("expected Nak");
            };
            let fresh = suggestion.identifier().unwrap();
            assert_ne!(fresh, [0; 8]);
            assert_ne!(fresh, ours);
        }

        let mut peer = Ipv6cpOptions::default();
        peer.set_identifier([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(ipv6cp.review(&peer), Verdict::Ack);

        let error = ipv6cp.adopt_reject(&ipv6cp.request()).unwrap_err();
        assert_eq!(error.outcome, Outcome::OptionRejected);
    }

    #[tokio::test]
    async fn test_ipcp_adopts_assigned_address() {
        let (bridge, mut gateway, _control) = testing::bridge(testing::config());
        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn({
            let bridge = bridge.clone();
            async move {
                let mut ipcp = IpcpPolicy::new(&bridge.config);
                negotiate(&bridge, &mut rx, &mut ipcp).await
            }
        });

        let first: ConfigureFrame<IpcpOptions> =
            testing::read_frame(&mut gateway, protocol::IPCP).await;
        assert_eq!(first.options.address(), Some(Ipv4Addr::UNSPECIFIED));

        let mut assigned = IpcpOptions::default();
        assigned.set_address(Ipv4Addr::new(10, 0, 0, 2));
        assigned.set_dns(Ipv4Addr::new(10, 0, 0, 53));
        tx.send(ConfigureFrame::new(ConfigureCode::Nak, first.id, assigned))
            .await
            .unwrap();

        let second: ConfigureFrame<IpcpOptions> =
            testing::read_frame(&mut gateway, protocol::IPCP).await;
        assert_eq!(second.options.address(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        tx.send(ConfigureFrame::new(
            ConfigureCode::Ack,
            second.id,
            second.options.clone(),
        ))
        .await
        .unwrap();

        let mut gateway_request = IpcpOptions::default();
        gateway_request.set_address(Ipv4Addr::new(10, 0, 0, 1));
        tx.send(ConfigureFrame::new(ConfigureCode::Request, 7, gateway_request))
            .await
            .unwrap();
        let ack: ConfigureFrame<IpcpOptions> =
            testing::read_frame(&mut gateway, protocol::IPCP).await;
        assert_eq!(ack.code, ConfigureCode::Ack);
        assert_eq!(ack.id, 7);

        task.await.unwrap().unwrap();
        let state = bridge.negotiated();
        assert_eq!(state.ipv4, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(state.peer_ipv4, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(state.dns, Some(Ipv4Addr::new(10, 0, 0, 53)));
    }

    #[tokio::test]
    async fn test_commit_requires_an_address() {
        let (bridge, _gateway, _control) = testing::bridge(testing::config());
        let ipcp = IpcpPolicy::new(&bridge.config);
        let error = ipcp.commit(&bridge, &IpcpOptions::default()).unwrap_err();
        assert_eq!(error.outcome, Outcome::AddressRejected);
        assert_eq!(bridge.negotiated().ipv4, None);
    }
}
