//! SSDP search for TVs on the local network.

use crate::config::{DiscoveryConfig, TvConfig};
use crate::model::DiscoveredDevice;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

pub const SSDP_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900);
const MULTICAST_TTL: u32 = 2;
const DATAGRAM_BUFFER_SIZE: usize = 2048;

#[derive(Debug)]
pub enum DiscoveryError {
    Bind { ip: IpAddr, source: io::Error },
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { ip, source } => write!(f, "cannot open discovery socket on {ip}: {source}"),
        }
    }
}

impl std::error::Error for DiscoveryError {}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub search_target: String,
    /// Silence that ends one listening round.
    pub timeout: Duration,
    pub retries: u32,
    pub mx: u32,
    pub target: SocketAddr,
    /// Local address to search from; picked from the routing table when unset.
    pub bind_ip: Option<IpAddr>,
}

impl DiscoveryOptions {
    pub fn from_config(tv: &TvConfig, discovery: &DiscoveryConfig) -> Self {
        Self {
            search_target: tv.search_target.as_str().to_string(),
            timeout: Duration::from_millis(discovery.timeout_ms),
            retries: discovery.retries.max(1),
            mx: discovery.mx,
            target: SocketAddr::V4(SSDP_GROUP),
            bind_ip: None,
        }
    }
}

pub fn search_request(search_target: &str, mx: u32) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\nST: {search_target}\r\nMAN: \"ssdp:discover\"\r\nHOST: {SSDP_GROUP}\r\nMX: {mx}\r\nContent-Length: 0\r\n\r\n"
    )
}

/// Reads one search reply. Anything that is not an HTTP response with a
/// `LOCATION` header is rejected.
pub fn parse_response(datagram: &[u8]) -> Option<DiscoveredDevice> {
    let text = std::str::from_utf8(datagram).ok()?;
    let mut lines = text.lines();
    let status = lines.next()?.trim();
    if !status.starts_with("HTTP/") {
        return None;
    }

    let mut device = DiscoveredDevice::default();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_uppercase().as_str() {
            "LOCATION" => device.location = value.to_string(),
            "USN" => device.usn = Some(value.to_string()),
            "ST" => device.service_type = Some(value.to_string()),
            "CACHE-CONTROL" => device.cache_seconds = max_age(value),
            _ => {}
        }
    }

    if device.location.is_empty() {
        None
    } else {
        Some(device)
    }
}

fn max_age(cache_control: &str) -> Option<u32> {
    cache_control.split(',').find_map(|directive| {
        let (key, value) = directive.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("max-age") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Adds `device`, replacing an earlier reply for the same location.
pub fn merge(devices: &mut Vec<DiscoveredDevice>, device: DiscoveredDevice) {
    match devices.iter_mut().find(|d| d.location == device.location) {
        Some(existing) => *existing = device,
        None => devices.push(device),
    }
}

/// Address of the interface that routes broadcast traffic. Best effort; the
/// OS may pick a different NIC for multicast.
pub async fn outbound_ipv4() -> Option<Ipv4Addr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    probe.set_broadcast(true).ok()?;
    probe.connect((Ipv4Addr::BROADCAST, 1900)).await.ok()?;
    match probe.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

pub async fn discover(options: &DiscoveryOptions) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
    let bind_ip = match options.bind_ip {
        Some(ip) => ip,
        None => outbound_ipv4()
            .await
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
    };
    let request = search_request(&options.search_target, options.mx);
    let mut devices = Vec::new();

    for round in 1..=options.retries.max(1) {
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))
            .await
            .map_err(|source| DiscoveryError::Bind { ip: bind_ip, source })?;
        if let Err(err) = socket.set_multicast_ttl_v4(MULTICAST_TTL) {
            tracing::debug!(error = %err, "cannot set multicast ttl");
        }

        tracing::debug!(round, target = %options.target, st = %options.search_target, "sending search");
        if let Err(err) = socket.send_to(request.as_bytes(), options.target).await {
            tracing::warn!(error = %err, round, "search request not sent");
            continue;
        }

        let mut buf = [0u8; DATAGRAM_BUFFER_SIZE];
        loop {
            match timeout(options.timeout, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => match parse_response(&buf[..len]) {
                    Some(device) => {
                        tracing::debug!(%from, location = %device.location, "search reply");
                        merge(&mut devices, device);
                    }
                    None => tracing::debug!(%from, "ignoring unparseable datagram"),
                },
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, round, "receive failed");
                    break;
                }
                Err(_) => break,
            }
        }
    }

    tracing::info!(found = devices.len(), "discovery finished");
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = "HTTP/1.1 200 OK\r\n\
        CACHE-CONTROL: max-age=1800\r\n\
        EXT:\r\n\
        LOCATION: http://192.168.1.20:7676/smp_15_\r\n\
        ST: urn:samsung.com:device:RemoteControlReceiver:1\r\n\
        USN: uuid:1234::urn:samsung.com:device:RemoteControlReceiver:1\r\n\r\n";

    #[test]
    fn request_carries_required_headers() {
        let request = search_request("ssdp:all", 3);
        assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(request.contains("ST: ssdp:all\r\n"));
        assert!(request.contains("MAN: \"ssdp:discover\"\r\n"));
        assert!(request.contains("HOST: 239.255.255.250:1900\r\n"));
        assert!(request.contains("MX: 3\r\n"));
        assert!(request.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn reply_headers_are_extracted() {
        let device = parse_response(REPLY.as_bytes()).unwrap();
        assert_eq!(device.location, "http://192.168.1.20:7676/smp_15_");
        assert_eq!(
            device.service_type.as_deref(),
            Some("urn:samsung.com:device:RemoteControlReceiver:1")
        );
        assert_eq!(
            device.usn.as_deref(),
            Some("uuid:1234::urn:samsung.com:device:RemoteControlReceiver:1")
        );
        assert_eq!(device.cache_seconds, Some(1800));
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let reply = "HTTP/1.1 200 OK\r\nlocation: http://10.0.0.3/desc.xml\r\ncache-control: no-cache, Max-Age = 60\r\n\r\n";
        let device = parse_response(reply.as_bytes()).unwrap();
        assert_eq!(device.location, "http://10.0.0.3/desc.xml");
        assert_eq!(device.cache_seconds, Some(60));
        assert!(device.usn.is_none());
    }

    #[test]
    fn garbled_datagrams_are_rejected() {
        for junk in [
            &b""[..],
            &b"\xff\xfe\x00"[..],
            &b"NOTIFY * HTTP/1.1\r\nLOCATION: http://x/\r\n\r\n"[..],
            &b"HTTP/1.1 200 OK\r\nST: ssdp:all\r\n\r\n"[..],
        ] {
            assert!(parse_response(junk).is_none());
        }
    }

    #[test]
    fn same_location_keeps_last_reply() {
        let mut devices = Vec::new();
        let first = DiscoveredDevice {
            location: "http://10.0.0.3/desc.xml".to_string(),
            usn: Some("uuid:a".to_string()),
            ..Default::default()
        };
        let second = DiscoveredDevice {
            usn: Some("uuid:b".to_string()),
            ..first.clone()
        };
        merge(&mut devices, first);
        merge(&mut devices, second);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].usn.as_deref(), Some("uuid:b"));
    }

    #[tokio::test]
    async fn discover_collects_loopback_replies() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = responder.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (len, from) = responder.recv_from(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..len]).to_string();
            let replies = [
                REPLY.to_string(),
                REPLY.replace("uuid:1234", "uuid:5678"),
                "garbage".to_string(),
                REPLY.replace("192.168.1.20", "192.168.1.21"),
            ];
            for reply in replies {
                responder.send_to(reply.as_bytes(), from).await.unwrap();
            }
            request
        });

        let options = DiscoveryOptions {
            search_target: "urn:samsung.com:device:RemoteControlReceiver:1".to_string(),
            timeout: Duration::from_millis(300),
            retries: 1,
            mx: 1,
            target,
            bind_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        };
        let devices = discover(&options).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.contains("ST: urn:samsung.com:device:RemoteControlReceiver:1"));
        assert_eq!(devices.len(), 2);
        assert!(devices[0].usn.as_deref().unwrap().starts_with("uuid:5678"));
        assert_eq!(devices[1].location, "http://192.168.1.21:7676/smp_15_");
    }

    #[tokio::test]
    async fn silent_network_yields_nothing() {
        let quiet = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let options = DiscoveryOptions {
            search_target: "ssdp:all".to_string(),
            timeout: Duration::from_millis(100),
            retries: 2,
            mx: 1,
            target: quiet.local_addr().unwrap(),
            bind_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        };
        assert!(discover(&options).await.unwrap().is_empty());
    }
}
