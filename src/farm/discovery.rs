//! Locating a farm master on the local network.
//!
//! Every host in a subnet gets a short status probe; the first one that
//! answers like a farm master wins and the rest are dropped. Nothing here
//! is fatal: `None` means "ask the operator for an address".

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use ipnetwork::IpNetwork;
use reqwest::Client;

use crate::error::{FarmError, Result};
use crate::farm::protocol::{StatusResponse, SERVICE_NAME};

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub port: u16,
    pub probe_timeout: Duration,
    /// Probes in flight at once.
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct DiscoveredMaster {
    pub url: String,
    pub status: StatusResponse,
}

/// Hosts worth probing in `network`. Network and broadcast addresses are
/// skipped for IPv4 prefixes shorter than /31.
pub fn candidate_hosts(network: IpNetwork) -> Vec<IpAddr> {
    match network {
        IpNetwork::V4(net) => {
            let skip_edges = net.prefix() < 31;
            let (first, last) = (net.network(), net.broadcast());
            net.iter()
                .filter(|ip| !skip_edges || (*ip != first && *ip != last))
                .map(IpAddr::V4)
                .collect()
        }
        IpNetwork::V6(net) => net.iter().map(IpAddr::V6).collect(),
    }
}

/// The /24 around this machine's outbound interface, if it has one.
pub fn local_subnet() -> Option<IpNetwork> {
    // Connecting a UDP socket sends nothing; it only picks a route.
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => {
            let [a, b, c, _] = ip.octets();
            IpNetwork::new(IpAddr::V4(Ipv4Addr::new(a, b, c, 0)), 24).ok()
        }
        _ => None,
    }
}

/// Probe `hosts` and return the first farm master that answers.
pub async fn discover(hosts: Vec<IpAddr>, options: &DiscoveryOptions) -> Result<Option<DiscoveredMaster>> {
    let client = Client::builder()
        .timeout(options.probe_timeout)
        .connect_timeout(options.probe_timeout)
        .build()?;
    let port = options.port;
    tracing::info!(
        hosts = hosts.len(),
        port,
        concurrency = options.concurrency,
        "Searching for farm master"
    );

    let mut probes = stream::iter(hosts)
        .map(|ip| {
            let client = client.clone();
            async move { probe(&client, ip, port).await }
        })
        .buffer_unordered(options.concurrency.max(1));

    while let Some(result) = probes.next().await {
        if let Some(found) = result {
            tracing::info!(url = %found.url, nodes = found.status.nodes.len(), "Farm master found");
            return Ok(Some(found));
        }
    }
    tracing::info!("No farm master answered");
    Ok(None)
}

/// Discover on this machine's own subnet.
pub async fn discover_local(options: &DiscoveryOptions) -> Result<Option<DiscoveredMaster>> {
    let network = local_subnet()
        .ok_or_else(|| FarmError::Network("no IPv4 network interface to search".to_string()))?;
    discover(candidate_hosts(network), options).await
}

async fn probe(client: &Client, ip: IpAddr, port: u16) -> Option<DiscoveredMaster> {
    let host = match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    };
    let url = format!("http://{}:{}", host, port);
    let resp = client.get(format!("{}/api/status", url)).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let status: StatusResponse = resp.json().await.ok()?;
    if status.service != SERVICE_NAME {
        tracing::debug!(url = %url, service = %status.service, "Ignoring unrelated service");
        return None;
    }
    Some(DiscoveredMaster { url, status })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_hosts_skip_network_and_broadcast() {
        let net: IpNetwork = "10.0.0.0/30".parse().unwrap();
        let hosts = candidate_hosts(net);
        assert_eq!(
            hosts,
            vec![
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            ]
        );
    }

    #[test]
    fn single_host_network() {
        let net: IpNetwork = "127.0.0.1/32".parse().unwrap();
        assert_eq!(candidate_hosts(net), vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
    }

    #[test]
    fn slash_24_has_254_hosts() {
        let net: IpNetwork = "192.168.1.0/24".parse().unwrap();
        assert_eq!(candidate_hosts(net).len(), 254);
    }
}
