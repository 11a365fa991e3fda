//! Port probing and local address discovery.

use std::net::{IpAddr, Ipv4Addr, TcpListener};

use tracing::debug;

/// True when a listener could be bound to `host:port` right now.
pub fn port_is_free(host: IpAddr, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// First port from `base` through 65535 for which `probe` says it is free.
pub fn find_free_port_with<F>(base: u16, mut probe: F) -> Option<u16>
where
    F: FnMut(u16) -> bool,
{
    (base.max(1)..=u16::MAX).find(|port| probe(*port))
}

/// Names and addresses this machine can likely be reached at.
///
/// Best effort: lookups that fail are skipped, so the list may be empty.
pub fn local_addresses(host: IpAddr) -> Vec<String> {
    if !host.is_unspecified() {
        return vec![host_for_url(host)];
    }
    collect_addresses(hostname(), interface_ipv4s())
}

/// `localhost` and loopback first, then the hostname, then every interface
/// address, without repeats.
fn collect_addresses(hostname: Option<String>, interfaces: Vec<IpAddr>) -> Vec<String> {
    let mut candidates = vec!["localhost".to_string(), Ipv4Addr::LOCALHOST.to_string()];
    candidates.extend(hostname);
    candidates.extend(interfaces.into_iter().map(host_for_url));

    let mut seen = Vec::new();
    for candidate in candidates {
        if !seen.contains(&candidate) {
            seen.push(candidate);
        }
    }
    seen
}

fn host_for_url(host: IpAddr) -> String {
    match host {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

fn hostname() -> Option<String> {
    let uname = rustix::system::uname();
    let name = uname.nodename().to_str().ok()?.trim().to_string();
    if name.is_empty() {
        return None;
    }
    Some(name)
}

/// IPv4 addresses of all network interfaces, in interface order.
fn interface_ipv4s() -> Vec<IpAddr> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .iter()
            .map(|iface| iface.ip())
            .filter(IpAddr::is_ipv4)
            .collect(),
        Err(e) => {
            debug!("Cannot enumerate network interfaces: {}", e);
            Vec::new()
        }
    }
}
