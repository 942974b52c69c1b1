//! Linux address and route setup through the `ip` command

use super::InterfaceParams;
use crate::error::{Result, VpnError};
use ipnet::IpNet;
use log::{debug, info, warn};
use std::net::IpAddr;
use std::process::Command;

/// Runs `ip` with `args`, failing with its stderr
fn ip(args: &[&str]) -> Result<String> {
    debug!("ip {}", args.join(" "));
    let output = Command::new("ip").args(args).output()?;
    if !output.status.success() {
        return Err(VpnError::Routing(format!(
            "ip {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Picks `via` and `dev` out of one line of `ip route get` output
pub fn parse_route_get(output: &str) -> (Option<String>, Option<String>) {
    let words: Vec<&str> = output.split_whitespace().collect();
    let after = |key: &str| {
        words
            .iter()
            .position(|word| *word == key)
            .and_then(|i| words.get(i + 1))
            .map(|word| word.to_string())
    };
    (after("via"), after("dev"))
}

fn command(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

/// Commands that bring up addresses and routes for `params`
pub fn setup_commands(
    params: &InterfaceParams,
    server: Option<(IpAddr, Option<String>, Option<String>)>,
) -> Vec<Vec<String>> {
    let dev = params.name.as_str();
    let mtu = params.mtu.to_string();
    let mut commands = vec![command(&["link", "set", "dev", dev, "mtu", mtu.as_str(), "up"])];

    if let Some(local) = params.ipv6_link_local() {
        let local = format!("{local}/64");
        let mut args = vec!["-6", "addr", "add", local.as_str()];
        let peer = params.peer_ipv6_link_local().map(|p| p.to_string());
        if let Some(peer) = &peer {
            args.extend(["peer", peer.as_str()]);
        }
        args.extend(["dev", dev]);
        commands.push(command(&args));
    }

    for route in &params.routes {
        let net = route.to_string();
        match route {
            IpNet::V4(_) => commands.push(command(&["route", "replace", net.as_str(), "dev", dev])),
            IpNet::V6(_) => {
                commands.push(command(&["-6", "route", "replace", net.as_str(), "dev", dev]))
            }
        }
    }

    if params.default_route && params.ipv4.is_some() {
        if let Some((server, via, out_dev)) = &server {
            let host = format!("{server}/32");
            let mut args = vec!["route", "replace", host.as_str()];
            if let Some(via) = via {
                args.extend(["via", via.as_str()]);
            }
            if let Some(out_dev) = out_dev {
                args.extend(["dev", out_dev.as_str()]);
            }
            commands.push(command(&args));
        }
        commands.push(command(&["route", "replace", "0.0.0.0/1", "dev", dev]));
        commands.push(command(&["route", "replace", "128.0.0.0/1", "dev", dev]));
    }
    commands
}

/// Applies addresses and routes; returns the host route to remove on close
pub fn configure(params: &InterfaceParams, server: Option<IpAddr>) -> Result<Option<String>> {
    let pinned = match server {
        Some(IpAddr::V4(address)) if params.default_route => {
            let output = ip(&["route", "get", &address.to_string()])?;
            let (via, dev) = parse_route_get(&output);
            Some((IpAddr::V4(address), via, dev))
        }
        Some(IpAddr::V6(_)) if params.default_route => {
            warn!("Default route over an IPv6 gateway connection is not pinned");
            None
        }
        _ => None,
    };
    let host_route = pinned.as_ref().map(|(server, ..)| format!("{server}/32"));

    for command in setup_commands(params, pinned) {
        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        ip(&args)?;
    }
    if let Some(dns) = params.dns {
        info!("Gateway DNS server {dns}; resolver configuration is left to the host");
    }
    info!("Interface {} configured", params.name);
    Ok(host_route)
}

/// Removes the gateway host route installed by [`configure`]
pub fn remove_host_route(route: &str) {
    if let Err(e) = ip(&["route", "del", route]) {
        warn!("Failed to remove route {route}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn params() -> InterfaceParams {
        InterfaceParams {
            name: "sstp0".to_string(),
            mtu: 1400,
            ipv4: Some(Ipv4Addr::new(10, 0, 0, 2)),
            peer_ipv4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            ipv6_identifier: None,
            peer_ipv6_identifier: None,
            dns: None,
            routes: vec!["192.168.10.0/24".parse().unwrap()],
            default_route: false,
        }
    }

    fn joined(commands: Vec<Vec<String>>) -> Vec<String> {
        commands.into_iter().map(|c| c.join(" ")).collect()
    }

    #[test]
    fn test_parse_route_get() {
        let output = "203.0.113.7 via 192.168.1.1 dev eth0 src 192.168.1.20 uid 0\n    cache";
        assert_eq!(
            parse_route_get(output),
            (Some("192.168.1.1".to_string()), Some("eth0".to_string()))
        );
        assert_eq!(
            parse_route_get("192.168.1.9 dev wlan0 src 192.168.1.20"),
            (None, Some("wlan0".to_string()))
        );
    }

    #[test]
    fn test_custom_routes_only() {
        assert_eq!(
            joined(setup_commands(&params(), None)),
            vec![
                "link set dev sstp0 mtu 1400 up",
                "route replace 192.168.10.0/24 dev sstp0",
            ]
        );
    }

    #[test]
    fn test_default_route_pins_gateway() {
        let mut params = params();
        params.default_route = true;
        params.routes.clear();
        params.ipv6_identifier = Some([0, 0, 0, 0, 0, 0, 0, 2]);
        params.peer_ipv6_identifier = Some([0, 0, 0, 0, 0, 0, 0, 1]);
        let server = (
            "203.0.113.7".parse().unwrap(),
            Some("192.168.1.1".to_string()),
            Some("eth0".to_string()),
        );
        assert_eq!(
            joined(setup_commands(&params, Some(server))),
            vec![
                "link set dev sstp0 mtu 1400 up",
                "-6 addr add fe80::2/64 peer fe80::1 dev sstp0",
                "route replace 203.0.113.7/32 via 192.168.1.1 dev eth0",
                "route replace 0.0.0.0/1 dev sstp0",
                "route replace 128.0.0.0/1 dev sstp0",
            ]
        );
    }
}
