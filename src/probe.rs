use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use clap::ValueEnum;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket, lookup_host};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ProbeSettings;
use crate::error::ProbeError;
use crate::guard::{Lease, SocketGuard, SocketKind};
use crate::pool::WorkerPool;
use crate::report::{ReportScope, Reporter, Source};

const SENT: &str = "Packet sent successfully!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum ProbeKind {
    /// Send one datagram to the configured target
    UdpSend,
    /// Wait for one datagram and send it back
    UdpEcho,
    /// Accept one connection and read from it until the deadline
    TcpEcho,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeKind::UdpSend => "udp-send",
            ProbeKind::UdpEcho => "udp-echo",
            ProbeKind::TcpEcho => "tcp-echo",
        };
        f.write_str(name)
    }
}

/// What one invocation produced.
#[derive(Debug)]
pub struct ProbeOutcome {
    pub kind: ProbeKind,
    pub transcript: Vec<String>,
    /// True if a newer probe closed this one's socket.
    pub superseded: bool,
}

/// Runs each probe as one task on the worker pool. Failures become the
/// terminal report line. A probe whose socket is taken over by a newer one
/// stops without a terminal line.
#[derive(Clone)]
pub struct ProbeRunner {
    settings: Arc<ProbeSettings>,
    guard: SocketGuard,
    reporter: Reporter,
    pool: WorkerPool,
}

impl ProbeRunner {
    pub fn new(settings: ProbeSettings, reporter: Reporter, pool: WorkerPool) -> Self {
        Self {
            settings: Arc::new(settings),
            guard: SocketGuard::new(),
            reporter,
            pool,
        }
    }

    /// Queue one probe on the worker pool and return without waiting.
    pub fn run_probe(&self, kind: ProbeKind) -> JoinHandle<ProbeOutcome> {
        let scope = self.reporter.scope(Source::Probe(kind));
        let settings = Arc::clone(&self.settings);
        let guard = self.guard.clone();
        self.pool.spawn(execute(kind, settings, guard, scope))
    }
}

async fn execute(
    kind: ProbeKind,
    settings: Arc<ProbeSettings>,
    guard: SocketGuard,
    mut scope: ReportScope,
) -> ProbeOutcome {
    let invocation = scope.invocation();
    tracing::debug!(%kind, invocation, "probe started");

    let result = match kind {
        ProbeKind::UdpSend => udp_send(&settings).await,
        ProbeKind::UdpEcho => udp_echo(&settings, &guard, &mut scope).await,
        ProbeKind::TcpEcho => tcp_echo(&settings, &guard, &mut scope).await,
    };

    let (transcript, superseded) = match result {
        Ok(line) => (scope.finish(line), false),
        Err(ProbeError::Superseded) => {
            tracing::debug!(%kind, invocation, "probe superseded");
            (scope.abandon(), true)
        }
        Err(e) => {
            tracing::debug!(%kind, invocation, error = %e, "probe failed");
            (scope.finish(failure_line(kind, &e)), false)
        }
    };
    ProbeOutcome {
        kind,
        transcript,
        superseded,
    }
}

fn failure_line(kind: ProbeKind, e: &ProbeError) -> String {
    match kind {
        ProbeKind::UdpSend => format!("Failed to send packet: {}", e),
        ProbeKind::UdpEcho | ProbeKind::TcpEcho => format!("error: {}", e),
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, ProbeError> {
    let resolve_error = |source| ProbeError::Resolve {
        addr: addr.to_string(),
        source,
    };
    lookup_host(addr)
        .await
        .map_err(resolve_error)?
        .next()
        .ok_or_else(|| resolve_error(io::Error::new(io::ErrorKind::NotFound, "no addresses found")))
}

fn bind_error(addr: SocketAddr) -> impl FnOnce(io::Error) -> ProbeError {
    move |source| ProbeError::Bind {
        addr: addr.to_string(),
        source,
    }
}

async fn udp_send(settings: &ProbeSettings) -> Result<String, ProbeError> {
    let target = resolve(&settings.udp_send_target).await?;
    let local: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await.map_err(bind_error(local))?;
    socket.send_to(settings.payload.as_bytes(), target).await?;
    drop(socket);
    Ok(SENT.to_string())
}

async fn udp_echo(
    settings: &ProbeSettings,
    guard: &SocketGuard,
    scope: &mut ReportScope,
) -> Result<String, ProbeError> {
    let ticket = guard.acquire(SocketKind::Udp, scope).await;
    let addr = resolve(&settings.udp_echo_bind).await?;
    let socket = UdpSocket::bind(addr).await.map_err(bind_error(addr))?;
    let mut lease = Lease::new(socket, ticket);

    let socket = lease.socket()?;
    scope.line(format!("created socket on {}", socket.local_addr()?));

    let mut buf = vec![0u8; settings.buffer_size];
    let (len, peer) = tokio::select! {
        received = socket.recv_from(&mut buf) => received?,
        _ = lease.superseded() => return Err(ProbeError::Superseded),
    };
    let payload = &buf[..len];
    scope.line(format!(
        "Received from {}: {}",
        peer.ip(),
        String::from_utf8_lossy(payload)
    ));

    socket.send_to(payload, peer).await?;
    lease.close();
    Ok(SENT.to_string())
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

async fn tcp_echo(
    settings: &ProbeSettings,
    guard: &SocketGuard,
    scope: &mut ReportScope,
) -> Result<String, ProbeError> {
    // A connection left by an earlier probe goes away with its listener.
    let listen_ticket = guard
        .acquire_closing(SocketKind::TcpListener, [SocketKind::TcpConnection], scope)
        .await;
    let addr = resolve(&settings.tcp_echo_bind).await?;
    let listener = bind_listener(addr, settings.backlog).map_err(bind_error(addr))?;
    let mut listener = Lease::new(listener, listen_ticket);
    scope.line(format!(
        "created socket on {}",
        listener.socket()?.local_addr()?
    ));

    let (stream, peer) = {
        let socket = listener.socket()?;
        tokio::select! {
            accepted = socket.accept() => accepted?,
            _ = listener.superseded() => return Err(ProbeError::Superseded),
        }
    };
    let conn_ticket = guard.acquire(SocketKind::TcpConnection, scope).await;
    let mut conn = Lease::new(stream, conn_ticket);
    scope.line(format!("accepting connection from {}", peer));

    let text = read_until_deadline(&mut conn, &listener, settings).await?;
    conn.close();
    listener.close();
    Ok(text)
}

/// Fill the buffer from `conn` until it is full, the peer closes, or the
/// deadline passes. Whatever arrived by then is the result.
async fn read_until_deadline(
    conn: &mut Lease<TcpStream>,
    listener: &Lease<TcpListener>,
    settings: &ProbeSettings,
) -> Result<String, ProbeError> {
    let deadline = Instant::now() + settings.tcp_read_deadline();
    let conn_closed = conn.superseded();
    let listener_closed = listener.superseded();
    tokio::pin!(conn_closed, listener_closed);

    let stream = conn.socket_mut()?;
    let mut buf = vec![0u8; settings.buffer_size];
    let mut filled = 0;
    while filled < buf.len() {
        tokio::select! {
            read = tokio::time::timeout_at(deadline, stream.read(&mut buf[filled..])) => match read {
                Err(_elapsed) => break,
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(e.into()),
            },
            _ = &mut conn_closed => return Err(ProbeError::Superseded),
            _ = &mut listener_closed => return Err(ProbeError::Superseded),
        }
    }
    Ok(String::from_utf8_lossy(&buf[..filled]).into_owned())
}
