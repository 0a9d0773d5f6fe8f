use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::probe::ProbeKind;

/// What produced a report line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Probe(ProbeKind),
    Tunnel,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Probe(kind) => write!(f, "{}", kind),
            Source::Tunnel => write!(f, "tunnel"),
        }
    }
}

/// One unit of status text delivered to the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub invocation: u64,
    pub source: Source,
    pub line: String,
    /// Set on the last line an invocation will ever emit.
    pub terminal: bool,
}

/// Sending side. Cheap to clone and safe to use from any task.
#[derive(Clone)]
pub struct Reporter {
    tx: mpsc::UnboundedSender<Report>,
    next_invocation: Arc<AtomicU64>,
}

/// Receiving side. There is exactly one per [`channel`].
pub struct ReportSink {
    rx: mpsc::UnboundedReceiver<Report>,
}

/// Receives report lines on the observer side.
pub trait Observer {
    fn observe(&mut self, report: &Report);
}

impl Observer for Vec<Report> {
    fn observe(&mut self, report: &Report) {
        self.push(report.clone());
    }
}

/// Unbounded, so a worker never waits on the observer. Lines of one scope
/// arrive in the order they were written.
pub fn channel() -> (Reporter, ReportSink) {
    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = Reporter {
        tx,
        next_invocation: Arc::new(AtomicU64::new(1)),
    };
    (reporter, ReportSink { rx })
}

impl Reporter {
    /// Open the transcript of a new invocation.
    pub fn scope(&self, source: Source) -> ReportScope {
        ReportScope {
            invocation: self.next_invocation.fetch_add(1, Ordering::Relaxed),
            source,
            tx: self.tx.clone(),
            transcript: Vec::new(),
        }
    }
}

impl ReportSink {
    pub async fn recv(&mut self) -> Option<Report> {
        self.rx.recv().await
    }

    /// Feed every report to `observer` until all reporters are dropped.
    pub async fn run<O: Observer>(mut self, observer: &mut O) {
        while let Some(report) = self.rx.recv().await {
            observer.observe(&report);
        }
    }
}

/// The append-only transcript of one invocation.
pub struct ReportScope {
    invocation: u64,
    source: Source,
    tx: mpsc::UnboundedSender<Report>,
    transcript: Vec<String>,
}

impl ReportScope {
    pub fn invocation(&self) -> u64 {
        self.invocation
    }

    /// Append an intermediate line and flush it to the observer.
    pub fn line(&mut self, line: impl Into<String>) {
        self.emit(line.into(), false);
    }

    /// Append the terminal line and return the full transcript.
    pub fn finish(mut self, line: impl Into<String>) -> Vec<String> {
        self.emit(line.into(), true);
        self.transcript
    }

    /// Close the scope without a terminal line.
    pub fn abandon(self) -> Vec<String> {
        self.transcript
    }

    fn emit(&mut self, line: String, terminal: bool) {
        self.transcript.push(line.clone());
        let report = Report {
            invocation: self.invocation,
            source: self.source,
            line,
            terminal,
        };
        if self.tx.send(report).is_err() {
            tracing::trace!(invocation = self.invocation, "observer gone, dropping report");
        }
    }
}
