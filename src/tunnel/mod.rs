//! The IP side of the tunnel
//!
//! The engine reads and writes whole IP packets through an [`IpTerminal`].
//! Once negotiation finishes it asks an [`InterfaceBuilder`] for one, passing
//! the negotiated addresses and the configured routes as [`InterfaceParams`].

#[cfg(target_os = "linux")]
pub mod linux;
pub mod real_tun;

pub use real_tun::{TunBuilder, TunnelDevice};

use crate::config::Config;
use crate::error::{Result, VpnError};
use crate::session::NegotiatedState;
use ipnet::IpNet;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncWrite};

/// A packet stream: each read yields one IP packet, each write takes one
pub trait IpTerminal: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> IpTerminal for T {}

/// Everything needed to bring up the local interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceParams {
    pub name: String,
    pub mtu: u16,
    pub ipv4: Option<Ipv4Addr>,
    pub peer_ipv4: Option<Ipv4Addr>,
    pub ipv6_identifier: Option<[u8; 8]>,
    pub peer_ipv6_identifier: Option<[u8; 8]>,
    pub dns: Option<Ipv4Addr>,
    pub routes: Vec<IpNet>,
    pub default_route: bool,
}

impl InterfaceParams {
    pub fn negotiated(config: &Config, state: &NegotiatedState) -> Result<Self> {
        if state.ipv4.is_none() && state.ipv6_identifier.is_none() {
            return Err(VpnError::InvalidState(
                "no address family was negotiated".to_string(),
            ));
        }

        // never larger than what the gateway accepts
        let mtu = state
            .peer_mru
            .map_or(config.ppp.mtu, |mru| mru.min(config.ppp.mtu));

        Ok(Self {
            name: config.network.interface_name.clone(),
            mtu,
            ipv4: state.ipv4,
            peer_ipv4: state.peer_ipv4,
            ipv6_identifier: state.ipv6_identifier,
            peer_ipv6_identifier: state.peer_ipv6_identifier,
            dns: state.dns,
            routes: config.routes()?,
            default_route: config.network.default_route,
        })
    }

    /// Our `fe80::/64` address built from the negotiated identifier
    pub fn ipv6_link_local(&self) -> Option<Ipv6Addr> {
        self.ipv6_identifier.map(link_local)
    }

    pub fn peer_ipv6_link_local(&self) -> Option<Ipv6Addr> {
        self.peer_ipv6_identifier.map(link_local)
    }
}

fn link_local(identifier: [u8; 8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[0] = 0xfe;
    octets[1] = 0x80;
    octets[8..].copy_from_slice(&identifier);
    Ipv6Addr::from(octets)
}

/// Creates the IP terminal once the link is negotiated
pub trait InterfaceBuilder: Send + Sync {
    fn establish(&self, params: &InterfaceParams) -> Result<Box<dyn IpTerminal>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> NegotiatedState {
        NegotiatedState {
            mru: Some(1500),
            peer_mru: Some(1400),
            ipv4: Some(Ipv4Addr::new(10, 0, 0, 2)),
            peer_ipv4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            dns: Some(Ipv4Addr::new(10, 0, 0, 53)),
            ..NegotiatedState::default()
        }
    }

    #[test]
    fn test_params_from_negotiation() {
        let mut config = Config::new("vpn.example.com", "user", "pass");
        config.network.custom_routes = vec!["192.168.10.0/24".to_string()];
        config.network.default_route = true;

        let params = InterfaceParams::negotiated(&config, &state()).unwrap();
        assert_eq!(params.name, config.network.interface_name);
        assert_eq!(params.mtu, 1400);
        assert_eq!(params.ipv4, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(params.routes, vec!["192.168.10.0/24".parse::<IpNet>().unwrap()]);
        assert!(params.default_route);
        assert_eq!(params.ipv6_link_local(), None);
    }

    #[test]
    fn test_params_need_an_address() {
        let config = Config::new("vpn.example.com", "user", "pass");
        let empty = NegotiatedState::default();
        assert!(matches!(
            InterfaceParams::negotiated(&config, &empty),
            Err(VpnError::InvalidState(_))
        ));

        let mut bad_route = config.clone();
        bad_route.network.custom_routes = vec!["not-a-route".to_string()];
        assert!(matches!(
            InterfaceParams::negotiated(&bad_route, &state()),
            Err(VpnError::Config(_))
        ));
    }

    #[test]
    fn test_link_local_from_identifier() {
        let config = Config::new("vpn.example.com", "user", "pass");
        let state = NegotiatedState {
            ipv6_identifier: Some([0x02, 0, 0, 0, 0, 0, 0, 0x2a]),
            ..NegotiatedState::default()
        };
        let params = InterfaceParams::negotiated(&config, &state).unwrap();
        assert_eq!(
            params.ipv6_link_local(),
            Some("fe80::200:0:0:2a".parse().unwrap())
        );
        assert_eq!(params.mtu, config.ppp.mtu);
    }
}
