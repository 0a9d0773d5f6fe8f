use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::tunnel::TunnelConfig;

const MAX_DATAGRAM: usize = u16::MAX as usize;

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub tcp_listen: SocketAddr,
    pub udp_forward: SocketAddr,
    /// Local address for the per-client UDP socket; ephemeral when unset.
    pub udp_bind: Option<SocketAddr>,
    pub recv_buffer: usize,
}

impl RelayOptions {
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self {
            tcp_listen: config.bind_ip_port,
            udp_forward: config.local_udp_endpoint(),
            udp_bind: config.peer_endpoint,
            recv_buffer: config.tcp_buffer_size.clamp(1, MAX_DATAGRAM),
        }
    }
}

/// TCP to UDP relay run by a started tunnel. Each TCP client gets its own
/// UDP socket connected to the tunnel's local endpoint. On the TCP side every
/// datagram is framed with a 2-byte big-endian length.
pub struct Relay {
    listener: TcpListener,
    options: Arc<RelayOptions>,
}

impl Relay {
    pub async fn bind(options: RelayOptions) -> io::Result<Self> {
        let listener = TcpListener::bind(options.tcp_listen).await?;
        Ok(Self {
            listener,
            options: Arc::new(options),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until the listener fails. Dropping the returned future
    /// tears down every client as well.
    pub async fn run(self) -> io::Result<()> {
        tracing::info!(
            listen = %self.local_addr()?,
            forward = %self.options.udp_forward,
            "relay listening"
        );
        let mut clients = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let options = Arc::clone(&self.options);
                    clients.spawn(async move {
                        tracing::info!(%peer, "relay client connected");
                        match forward_client(stream, &options).await {
                            Ok(()) => tracing::info!(%peer, "relay client disconnected"),
                            Err(e) => tracing::warn!(%peer, "relay client failed: {}", e),
                        }
                    });
                }
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
            }
        }
    }
}

fn unspecified_like(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

/// ICMP port-unreachable surfaces as ECONNREFUSED on a connected UDP socket.
/// The endpoint may simply not be up yet, so the client is kept.
fn tolerate_refused(result: io::Result<usize>) -> io::Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            tracing::debug!("udp endpoint refused datagram");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn forward_client(stream: TcpStream, options: &RelayOptions) -> io::Result<()> {
    let bind = options
        .udp_bind
        .unwrap_or_else(|| unspecified_like(options.udp_forward));
    let udp = UdpSocket::bind(bind).await?;
    udp.connect(options.udp_forward).await?;
    stream.set_nodelay(true)?;

    let codec = LengthDelimitedCodec::builder()
        .length_field_length(2)
        .max_frame_length(MAX_DATAGRAM)
        .new_codec();
    let (mut sink, mut frames) = Framed::new(stream, codec).split();
    let mut buf = vec![0u8; options.recv_buffer];

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(frame) => tolerate_refused(udp.send(&frame?).await)?,
                None => return Ok(()),
            },
            received = udp.recv(&mut buf) => match received {
                Ok(len) => sink.send(Bytes::copy_from_slice(&buf[..len])).await?,
                Err(e) => tolerate_refused(Err(e))?,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_relay(udp_forward: SocketAddr) -> (SocketAddr, tokio::task::JoinHandle<io::Result<()>>) {
        let relay = Relay::bind(RelayOptions {
            tcp_listen: "127.0.0.1:0".parse().unwrap(),
            udp_forward,
            udp_bind: None,
            recv_buffer: 2048,
        })
        .await
        .unwrap();
        let addr = relay.local_addr().unwrap();
        (addr, tokio::spawn(relay.run()))
    }

    #[test]
    fn options_follow_tunnel_config() {
        let cfg = TunnelConfig::sample();
        let opts = RelayOptions::from_config(&cfg);
        assert_eq!(opts.tcp_listen, cfg.bind_ip_port);
        assert_eq!(opts.udp_forward, "127.0.0.1:9798".parse().unwrap());
        assert_eq!(opts.udp_bind, Some("127.0.0.1:9797".parse().unwrap()));
        assert_eq!(opts.recv_buffer, MAX_DATAGRAM);
    }

    #[tokio::test]
    async fn datagrams_cross_in_both_directions() {
        let endpoint = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (relay_addr, _relay) = start_relay(endpoint.local_addr().unwrap()).await;

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client.write_all(&[0, 5, b'h', b'e', b'l', b'l', b'o']).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = tokio::time::timeout(Duration::from_secs(5), endpoint.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"hello");

        endpoint.send_to(b"world", from).await.unwrap();
        let mut frame = [0u8; 7];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut frame))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&frame, &[0, 5, b'w', b'o', b'r', b'l', b'd']);
    }

    #[tokio::test]
    async fn aborting_the_relay_disconnects_clients() {
        let endpoint = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (relay_addr, relay) = start_relay(endpoint.local_addr().unwrap()).await;

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client.write_all(&[0, 1, b'x']).await.unwrap();
        let mut buf = [0u8; 8];
        endpoint.recv_from(&mut buf).await.unwrap();

        relay.abort();
        let _ = relay.await;

        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(read.map(|n| n == 0).unwrap_or(true));
    }
}
