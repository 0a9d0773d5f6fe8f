use std::io;

use thiserror::Error;

use crate::tunnel::TunnelHandle;

/// Failures inside a single probe task. Converted to a report line at the
/// task boundary and never propagated further.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("cannot resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    /// The socket was closed by a newer probe of the same kind.
    #[error("socket closed by a newer probe")]
    Superseded,
}

/// Errors raised by a tunnel backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("cannot allocate tunnel instance: {limit} instances already live")]
    HandleExhausted { limit: usize },

    #[error("unknown tunnel handle {0}")]
    UnknownHandle(TunnelHandle),

    /// Human-readable validation message, shown to the user as-is.
    #[error("{0}")]
    InvalidConfig(String),

    #[error("setConfig should precede run")]
    NotConfigured,

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("tunnel handle allocation failed: {0}")]
    HandleAllocation(#[source] BackendError),

    #[error("{0}")]
    ConfigRejected(String),

    #[error("tunnel is not configured")]
    NotConfigured,

    #[error("tunnel {0} is already running")]
    AlreadyRunning(TunnelHandle),

    #[error(transparent)]
    Backend(#[from] BackendError),
}
