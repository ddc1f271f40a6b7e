use std::net::Ipv6Addr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Port the cluster transport listens on.
pub const CLUSTER_PORT: u16 = 9000;

/// Figure out this host's global-unicast IPv6 address.
///
/// Opens a UDP socket toward a well-known v6 address and reads back the
/// local address the kernel chose; no packet is actually sent. Retried once
/// after five seconds since the address may not be configured yet at boot.
pub async fn my_ipv6() -> Result<Ipv6Addr> {
    for attempt in 0..2 {
        match probe_ipv6().await {
            Ok(addr) => return Ok(addr),
            Err(e) if attempt == 0 => {
                tracing::info!("no IPv6 address found, retrying in 5 seconds: {e}");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("probe loop always returns")
}

async fn probe_ipv6() -> Result<Ipv6Addr> {
    let socket = tokio::net::UdpSocket::bind("[::]:0").await?;
    socket.connect("[2001:4860:4860::8888]:53").await?;
    match socket.local_addr()? {
        std::net::SocketAddr::V6(v6) if is_global_unicast(v6.ip()) => Ok(*v6.ip()),
        other => Err(StoreError::Peers(format!("no global unicast IPv6 address (got {other})"))),
    }
}

fn is_global_unicast(ip: &Ipv6Addr) -> bool {
    !ip.is_loopback()
        && !ip.is_unspecified()
        && !ip.is_multicast()
        // link-local fe80::/10
        && (ip.segments()[0] & 0xffc0) != 0xfe80
        // unique-local fc00::/7
        && (ip.segments()[0] & 0xfe00) != 0xfc00
}

/// Parse a peers file into `host:9000` transport addresses.
///
/// One IPv6 address per line; blank lines and `#` comments are skipped, and
/// this node's own address is filtered out.
pub fn parse_peers(contents: &str, self_addr: Ipv6Addr) -> Vec<String> {
    let mut peers = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Ok(parsed) = trimmed.parse::<Ipv6Addr>() else {
            tracing::warn!("peers file: skipping unparseable line {trimmed:?}");
            continue;
        };
        if parsed == self_addr {
            continue;
        }
        peers.push(format!("[{parsed}]:{CLUSTER_PORT}"));
    }
    peers
}

/// Read and parse the peers file. A missing file means a single-node
/// deployment, not an error.
pub async fn read_peers_file(path: &Path, self_addr: Ipv6Addr) -> Result<Vec<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(parse_peers(&contents, self_addr)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StoreError::Peers(format!("failed to read {}: {e}", path.display()))),
    }
}
