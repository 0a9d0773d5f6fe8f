use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use crate::report::ReportScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Udp,
    TcpListener,
    TcpConnection,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketKind::Udp => "udp socket",
            SocketKind::TcpListener => "tcp listener",
            SocketKind::TcpConnection => "tcp connection",
        };
        f.write_str(name)
    }
}

struct Slot {
    generation: u64,
    close: watch::Sender<bool>,
    released: oneshot::Receiver<()>,
}

type Slots = Arc<Mutex<HashMap<SocketKind, Slot>>>;

/// One live socket per kind. An acquire that finds a slot held tells the
/// holder to close and returns only once the holder has dropped its socket,
/// so the new probe can bind the same address.
#[derive(Clone, Default)]
pub struct SocketGuard {
    slots: Slots,
    next_generation: Arc<AtomicU64>,
}

impl SocketGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the slot for `kind`, closing whoever held it first.
    pub async fn acquire(&self, kind: SocketKind, scope: &mut ReportScope) -> Ticket {
        self.acquire_closing(kind, [], scope).await
    }

    /// Reserve the slot for `kind` and also close any live holder of the
    /// `closing` kinds without reserving them. Every holder is signalled before
    /// any of them is waited on. One closure line is reported per socket
    /// that was actually open: the `closing` kinds in the order given, then
    /// `kind`.
    pub async fn acquire_closing<const N: usize>(
        &self,
        kind: SocketKind,
        closing: [SocketKind; N],
        scope: &mut ReportScope,
    ) -> Ticket {
        let mut evicted = Vec::new();
        let ticket = {
            let mut slots = self.slots.lock();
            for other in closing {
                if let Some(old) = slots.remove(&other) {
                    let _ = old.close.send(true);
                    evicted.push((other, old));
                }
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let (close, closed) = watch::channel(false);
            let (released_tx, released) = oneshot::channel();
            let slot = Slot {
                generation,
                close,
                released,
            };
            if let Some(old) = slots.insert(kind, slot) {
                let _ = old.close.send(true);
                evicted.push((kind, old));
            }
            Ticket {
                kind,
                generation,
                closed,
                slots: Arc::clone(&self.slots),
                _released: released_tx,
            }
        };

        for (kind, old) in evicted {
            // Resolves when the previous holder drops its ticket.
            let _ = old.released.await;
            tracing::debug!(%kind, generation = old.generation, "closed previous holder");
            scope.line(format!("{} was running, now closed", kind));
        }
        ticket
    }

    pub fn is_live(&self, kind: SocketKind) -> bool {
        self.slots.lock().contains_key(&kind)
    }
}

fn wait_closed(mut closed: watch::Receiver<bool>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        // An error means the guard side is gone, which also counts as closed.
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Ownership of one slot. Dropping it frees the slot.
pub struct Ticket {
    kind: SocketKind,
    generation: u64,
    closed: watch::Receiver<bool>,
    slots: Slots,
    _released: oneshot::Sender<()>,
}

impl Ticket {
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// Resolves once a newer acquire of the same kind wants this slot back.
    pub fn superseded(&self) -> impl Future<Output = ()> + Send + 'static {
        wait_closed(self.closed.clone())
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        if slots
            .get(&self.kind)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            slots.remove(&self.kind);
        }
    }
}

/// A socket bound to its slot. The socket is always dropped before the
/// ticket, so an evicting acquire only returns once the address is free.
pub struct Lease<S> {
    socket: Option<S>,
    ticket: Option<Ticket>,
    closed: watch::Receiver<bool>,
}

impl<S> Lease<S> {
    pub fn new(socket: S, ticket: Ticket) -> Self {
        Self {
            socket: Some(socket),
            closed: ticket.closed.clone(),
            ticket: Some(ticket),
        }
    }

    pub fn socket(&self) -> io::Result<&S> {
        self.socket.as_ref().ok_or_else(closed_error)
    }

    pub fn socket_mut(&mut self) -> io::Result<&mut S> {
        self.socket.as_mut().ok_or_else(closed_error)
    }

    pub fn superseded(&self) -> impl Future<Output = ()> + Send + 'static {
        wait_closed(self.closed.clone())
    }

    /// Close the socket and free the slot. Safe to call more than once.
    pub fn close(&mut self) {
        drop(self.socket.take());
        drop(self.ticket.take());
    }
}

impl<S> Drop for Lease<S> {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket already closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeKind;
    use crate::report::{self, Source};
    use std::time::Duration;

    fn scope(reporter: &report::Reporter) -> ReportScope {
        reporter.scope(Source::Probe(ProbeKind::UdpEcho))
    }

    #[tokio::test]
    async fn first_acquire_reports_nothing() {
        let (reporter, _sink) = report::channel();
        let guard = SocketGuard::new();
        let mut s = scope(&reporter);
        let ticket = guard.acquire(SocketKind::Udp, &mut s).await;
        assert_eq!(ticket.kind(), SocketKind::Udp);
        assert!(guard.is_live(SocketKind::Udp));
        assert!(s.abandon().is_empty());
    }

    #[tokio::test]
    async fn second_acquire_closes_the_first_holder() {
        let (reporter, _sink) = report::channel();
        let guard = SocketGuard::new();

        let mut first = scope(&reporter);
        let ticket = guard.acquire(SocketKind::Udp, &mut first).await;
        let holder = tokio::spawn(async move {
            ticket.superseded().await;
            drop(ticket);
        });

        let mut second = scope(&reporter);
        let _ticket = tokio::time::timeout(
            Duration::from_secs(5),
            guard.acquire(SocketKind::Udp, &mut second),
        )
        .await
        .expect("acquire should not hang");

        holder.await.unwrap();
        assert_eq!(second.abandon(), vec!["udp socket was running, now closed"]);
        assert!(guard.is_live(SocketKind::Udp));
    }

    #[tokio::test]
    async fn released_slot_does_not_report_closure() {
        let (reporter, _sink) = report::channel();
        let guard = SocketGuard::new();
        let mut s = scope(&reporter);

        let ticket = guard.acquire(SocketKind::TcpListener, &mut s).await;
        drop(ticket);
        assert!(!guard.is_live(SocketKind::TcpListener));

        let _ticket = guard.acquire(SocketKind::TcpListener, &mut s).await;
        assert!(s.abandon().is_empty());
    }

    #[tokio::test]
    async fn kinds_are_independent() {
        let (reporter, _sink) = report::channel();
        let guard = SocketGuard::new();
        let mut s = scope(&reporter);

        let _udp = guard.acquire(SocketKind::Udp, &mut s).await;
        let _listener = guard.acquire(SocketKind::TcpListener, &mut s).await;
        let _conn = guard.acquire(SocketKind::TcpConnection, &mut s).await;
        assert!(s.abandon().is_empty());
    }

    #[tokio::test]
    async fn closing_kinds_are_reported_before_the_reserved_kind() {
        let (reporter, _sink) = report::channel();
        let guard = SocketGuard::new();

        let mut first = scope(&reporter);
        let listener = guard.acquire(SocketKind::TcpListener, &mut first).await;
        let conn = guard.acquire(SocketKind::TcpConnection, &mut first).await;
        tokio::spawn(async move {
            conn.superseded().await;
            drop((conn, listener));
        });

        let mut second = scope(&reporter);
        let _listener = guard
            .acquire_closing(SocketKind::TcpListener, [SocketKind::TcpConnection], &mut second)
            .await;
        assert_eq!(
            second.abandon(),
            vec![
                "tcp connection was running, now closed",
                "tcp listener was running, now closed",
            ]
        );
        assert!(guard.is_live(SocketKind::TcpListener));
        assert!(!guard.is_live(SocketKind::TcpConnection));
    }

    #[tokio::test]
    async fn closing_an_empty_slot_reports_nothing() {
        let (reporter, _sink) = report::channel();
        let guard = SocketGuard::new();

        let mut first = scope(&reporter);
        let listener = guard.acquire(SocketKind::TcpListener, &mut first).await;
        tokio::spawn(async move {
            listener.superseded().await;
            drop(listener);
        });

        let mut second = scope(&reporter);
        let _listener = guard
            .acquire_closing(SocketKind::TcpListener, [SocketKind::TcpConnection], &mut second)
            .await;
        assert_eq!(second.abandon(), vec!["tcp listener was running, now closed"]);
        assert!(!guard.is_live(SocketKind::TcpConnection));
    }

    #[tokio::test]
    async fn lease_close_is_idempotent() {
        let (reporter, _sink) = report::channel();
        let guard = SocketGuard::new();
        let mut s = scope(&reporter);

        let ticket = guard.acquire(SocketKind::Udp, &mut s).await;
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut lease = Lease::new(socket, ticket);
        assert!(lease.socket().is_ok());

        lease.close();
        lease.close();
        assert_eq!(
            lease.socket().unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
        assert!(!guard.is_live(SocketKind::Udp));
    }

    #[tokio::test]
    async fn evicted_lease_frees_its_address() {
        let (reporter, _sink) = report::channel();
        let guard = SocketGuard::new();

        let mut first = scope(&reporter);
        let ticket = guard.acquire(SocketKind::Udp, &mut first).await;
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let lease = Lease::new(socket, ticket);
        tokio::spawn(async move {
            lease.superseded().await;
            drop(lease);
        });

        let mut second = scope(&reporter);
        let _ticket = guard.acquire(SocketKind::Udp, &mut second).await;
        tokio::net::UdpSocket::bind(addr)
            .await
            .expect("address should be free after eviction");
    }
}
