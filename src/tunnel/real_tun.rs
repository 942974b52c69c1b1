//! TUN interface backed by the `tun` crate

use super::{InterfaceBuilder, InterfaceParams, IpTerminal};
use crate::error::{Result, VpnError};
use log::info;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Creates TUN devices; `server` is the gateway's address, kept reachable
/// outside the tunnel when the default route moves into it
#[derive(Debug, Clone, Default)]
pub struct TunBuilder {
    server: Option<IpAddr>,
}

impl TunBuilder {
    pub fn new(server: Option<IpAddr>) -> Self {
        Self { server }
    }

    fn configuration(params: &InterfaceParams) -> tun::Configuration {
        let mut config = tun::Configuration::default();
        config.name(&params.name).mtu(params.mtu as i32).up();
        if let Some(address) = params.ipv4 {
            config.address(address).netmask((255, 255, 255, 255));
            if let Some(peer) = params.peer_ipv4 {
                config.destination(peer);
            }
        }
        #[cfg(target_os = "linux")]
        config.platform(|platform| {
            platform.packet_information(false);
        });
        config
    }
}

impl InterfaceBuilder for TunBuilder {
    fn establish(&self, params: &InterfaceParams) -> Result<Box<dyn IpTerminal>> {
        let device = tun::create_as_async(&Self::configuration(params))
            .map_err(|e| VpnError::TunTap(format!("Failed to create {}: {e}", params.name)))?;
        info!(
            "TUN interface {} up: {:?} -> {:?}, MTU {}",
            params.name, params.ipv4, params.peer_ipv4, params.mtu
        );

        #[cfg(target_os = "linux")]
        let host_route = super::linux::configure(params, self.server)?;
        #[cfg(not(target_os = "linux"))]
        let host_route: Option<String> = {
            if !params.routes.is_empty() || params.default_route || params.ipv6_identifier.is_some() {
                log::warn!("Routes and IPv6 addresses are only configured on Linux");
            }
            None
        };

        Ok(Box::new(TunnelDevice {
            device,
            host_route,
        }))
    }
}

/// The async TUN device plus the host route to drop when it closes
pub struct TunnelDevice {
    device: tun::AsyncDevice,
    host_route: Option<String>,
}

impl Drop for TunnelDevice {
    fn drop(&mut self) {
        if let Some(route) = self.host_route.take() {
            #[cfg(target_os = "linux")]
            super::linux::remove_host_route(&route);
            #[cfg(not(target_os = "linux"))]
            log::warn!("Leaving route {route} in place");
        }
    }
}

impl AsyncRead for TunnelDevice {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.device).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelDevice {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.device).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.device).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.device).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_builder_keeps_gateway_address() {
        let server: IpAddr = Ipv4Addr::new(203, 0, 113, 7).into();
        assert_eq!(TunBuilder::new(Some(server)).server, Some(server));
        assert_eq!(TunBuilder::default().server, None);
    }
}
