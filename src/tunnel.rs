use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Opaque reference to one tunnel instance inside a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelHandle(u64);

impl TunnelHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single port forward: host socket -> tunnel-side dst, optionally
/// pinned to one source address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortForward {
    pub host: SocketAddr,
    pub src: Option<SocketAddr>,
    pub dst: SocketAddr,
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.src {
            Some(src) => write!(f, "{}→{} (from {})", self.host, self.dst, src),
            None => write!(f, "{}→{}", self.host, self.dst),
        }
    }
}

/// Tunnel configuration as accepted by `set_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelConfig {
    #[serde(default)]
    pub debug: bool,

    pub private_key: String,
    pub peer_key: String,
    pub peer_endpoint: Option<SocketAddr>,
    pub keepalive_interval: Option<u16>,
    pub bind_ip_port: SocketAddr,

    pub dns_addr: Option<SocketAddr>,
    pub pingable: Option<IpAddr>,
    pub mtu: usize,
    pub tcp_buffer_size: usize,
    pub incoming_udp: Vec<PortForward>,
    pub incoming_tcp: Vec<PortForward>,

    pub transmit_queue_capacity: usize,
}

impl TunnelConfig {
    /// Parse and validate config text. The error is the message shown to the
    /// user.
    pub fn parse(text: &str) -> Result<Self, String> {
        let config: Self = toml::from_str(text).map_err(|e| e.to_string())?;
        if parse_key(&config.private_key).is_none() {
            return Err("Invalid private_key".to_string());
        }
        if parse_key(&config.peer_key).is_none() {
            return Err("Invalid peer_key".to_string());
        }
        Ok(config)
    }

    /// Address the relay forwards datagrams to: the tunnel's own UDP port on
    /// loopback.
    pub fn local_udp_endpoint(&self) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), self.bind_ip_port.port())
    }

    pub fn sample() -> Self {
        Self {
            debug: true,
            private_key: "4E4npXgGTLPE/1o25Ewz6WzugXjj9fRA1sIdgGFwR38=".to_string(),
            peer_key: "c5Hiwoc50CTASEo8DvIcE0g2eJcUsNQdqrQ9ddMlxQo=".to_string(),
            peer_endpoint: Some(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 9797)),
            keepalive_interval: Some(15),
            bind_ip_port: SocketAddr::new(Ipv4Addr::new(192, 168, 12, 15).into(), 9798),
            dns_addr: Some(SocketAddr::new(Ipv4Addr::new(8, 8, 8, 8).into(), 53)),
            pingable: Some(Ipv4Addr::new(192, 168, 24, 2).into()),
            mtu: 1420,
            tcp_buffer_size: 65536,
            incoming_udp: vec![],
            incoming_tcp: vec![],
            transmit_queue_capacity: 128,
        }
    }
}

/// Decode a base64 key that must be exactly 32 bytes.
fn parse_key(s: &str) -> Option<[u8; 32]> {
    let bytes = STANDARD.decode(s.trim()).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_text() -> String {
        toml::to_string_pretty(&TunnelConfig::sample()).unwrap()
    }

    #[test]
    fn sample_config_validates() {
        let parsed = TunnelConfig::parse(&sample_text()).unwrap();
        assert_eq!(parsed, TunnelConfig::sample());
    }

    #[test]
    fn unknown_field_is_rejected() {
        let text = format!("{}\nbogus = 1\n", sample_text());
        let err = TunnelConfig::parse(&text).unwrap_err();
        assert!(err.contains("bogus"), "{}", err);
    }

    #[test]
    fn garbage_is_rejected_with_parser_message() {
        let err = TunnelConfig::parse("bad").unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn short_peer_key_is_rejected() {
        let mut cfg = TunnelConfig::sample();
        cfg.peer_key = "AAAA".to_string();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert_eq!(TunnelConfig::parse(&text).unwrap_err(), "Invalid peer_key");
    }

    #[test]
    fn private_key_is_reported_before_peer_key() {
        let mut cfg = TunnelConfig::sample();
        cfg.peer_key = "not base64!".to_string();
        cfg.private_key = "also not".to_string();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert_eq!(TunnelConfig::parse(&text).unwrap_err(), "Invalid private_key");
    }

    #[test]
    fn relay_forwards_to_loopback_on_bind_port() {
        let cfg = TunnelConfig::sample();
        assert_eq!(cfg.local_udp_endpoint(), "127.0.0.1:9798".parse().unwrap());
    }

    #[test]
    fn port_forward_display() {
        let fwd = PortForward {
            host: "0.0.0.0:8080".parse().unwrap(),
            src: None,
            dst: "10.0.2.15:80".parse().unwrap(),
        };
        assert_eq!(fwd.to_string(), "0.0.0.0:8080→10.0.2.15:80");
    }
}
