use std::sync::Arc;

use crate::backend::TunnelBackend;
use crate::error::{BackendError, LifecycleError};
use crate::report::{ReportScope, Reporter, Source};
use crate::tunnel::TunnelHandle;

/// Where the long-lived service carrying a started tunnel runs.
pub trait ServiceHost: Send {
    fn start_background_service(&mut self, handle: TunnelHandle);
    fn stop_background_service(&mut self);
    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Uninitialized,
    /// Created, waiting for an accepted configuration.
    Pending(TunnelHandle),
    Configured(TunnelHandle),
    Running(TunnelHandle),
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Drives one tunnel through its states. Every public operation reports
/// exactly one terminal line, and `stop` reports "stopped" from any state.
pub struct TunnelManager<B, H> {
    backend: Arc<B>,
    host: H,
    reporter: Reporter,
    state: TunnelState,
}

impl<B: TunnelBackend, H: ServiceHost> TunnelManager<B, H> {
    pub fn new(backend: Arc<B>, host: H, reporter: Reporter) -> Self {
        Self {
            backend,
            host,
            reporter,
            state: TunnelState::Uninitialized,
        }
    }

    /// Current state. A running tunnel whose service has died reads as
    /// `Stopped`.
    pub fn state(&mut self) -> TunnelState {
        self.refresh();
        self.state
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn sample_config(&self) -> String {
        self.backend.sample_config()
    }

    pub fn create(&mut self) -> Result<TunnelHandle, LifecycleError> {
        let scope = self.reporter.scope(Source::Tunnel);
        let result = self.create_in();
        match &result {
            Ok(handle) => scope.finish(format!("created tunnel {}", handle)),
            Err(e) => scope.finish(e.to_string()),
        };
        result
    }

    pub fn set_config(&mut self, handle: TunnelHandle, text: &str) -> Result<(), LifecycleError> {
        let scope = self.reporter.scope(Source::Tunnel);
        let result = self.set_config_in(handle, text);
        match &result {
            Ok(()) => scope.finish("configured"),
            Err(e) => scope.finish(e.to_string()),
        };
        result
    }

    pub fn start(&mut self, handle: TunnelHandle) -> Result<StartOutcome, LifecycleError> {
        let scope = self.reporter.scope(Source::Tunnel);
        let result = self.start_in(handle);
        match &result {
            Ok(outcome) => scope.finish(start_line(*outcome)),
            Err(e) => scope.finish(e.to_string()),
        };
        result
    }

    pub fn stop(&mut self) {
        let scope = self.reporter.scope(Source::Tunnel);
        self.host.stop_background_service();
        if let TunnelState::Pending(h) | TunnelState::Configured(h) | TunnelState::Running(h) =
            self.state
        {
            self.backend.destroy(h);
        }
        self.state = TunnelState::Stopped;
        scope.finish("stopped");
    }

    /// Create, configure and start in one step, with a single terminal line.
    /// A no-op when a tunnel is already running.
    pub fn launch(&mut self, text: &str) -> Result<TunnelHandle, LifecycleError> {
        let mut scope = self.reporter.scope(Source::Tunnel);
        let result = self.launch_in(&mut scope, text);
        match &result {
            Ok((_, outcome)) => scope.finish(start_line(*outcome)),
            Err(e) => scope.finish(e.to_string()),
        };
        result.map(|(handle, _)| handle)
    }

    fn launch_in(
        &mut self,
        scope: &mut ReportScope,
        text: &str,
    ) -> Result<(TunnelHandle, StartOutcome), LifecycleError> {
        self.refresh();
        if let TunnelState::Running(h) = self.state {
            return Ok((h, StartOutcome::AlreadyRunning));
        }
        let handle = self.create_in()?;
        scope.line(format!("created tunnel {}", handle));
        self.set_config_in(handle, text)?;
        let outcome = self.start_in(handle)?;
        Ok((handle, outcome))
    }

    fn create_in(&mut self) -> Result<TunnelHandle, LifecycleError> {
        self.refresh();
        match self.state {
            TunnelState::Running(h) => return Err(LifecycleError::AlreadyRunning(h)),
            TunnelState::Pending(h) | TunnelState::Configured(h) => {
                tracing::debug!(handle = %h, "dropping unstarted tunnel");
                self.backend.destroy(h);
            }
            TunnelState::Uninitialized | TunnelState::Stopped => {}
        }
        self.state = TunnelState::Uninitialized;

        let handle = self
            .backend
            .create()
            .map_err(LifecycleError::HandleAllocation)?;
        self.state = TunnelState::Pending(handle);
        Ok(handle)
    }

    fn set_config_in(&mut self, handle: TunnelHandle, text: &str) -> Result<(), LifecycleError> {
        match self.state {
            TunnelState::Pending(h) | TunnelState::Configured(h) if h == handle => {}
            TunnelState::Running(h) if h == handle => {
                return Err(LifecycleError::AlreadyRunning(h));
            }
            _ => return Err(BackendError::UnknownHandle(handle).into()),
        }

        match self.backend.set_config(handle, text) {
            Ok(()) => {
                self.state = TunnelState::Configured(handle);
                Ok(())
            }
            Err(BackendError::InvalidConfig(msg)) => {
                tracing::debug!(%handle, "config rejected: {}", msg);
                self.state = TunnelState::Pending(handle);
                Err(LifecycleError::ConfigRejected(msg))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn start_in(&mut self, handle: TunnelHandle) -> Result<StartOutcome, LifecycleError> {
        self.refresh();
        match self.state {
            TunnelState::Running(_) => Ok(StartOutcome::AlreadyRunning),
            TunnelState::Configured(h) if h == handle => {
                self.host.start_background_service(handle);
                self.state = TunnelState::Running(handle);
                tracing::info!(%handle, "tunnel started");
                Ok(StartOutcome::Started)
            }
            _ => Err(LifecycleError::NotConfigured),
        }
    }

    fn refresh(&mut self) {
        if let TunnelState::Running(h) = self.state {
            if !self.host.is_running() {
                tracing::debug!(handle = %h, "background service is gone");
                self.backend.destroy(h);
                self.state = TunnelState::Stopped;
            }
        }
    }
}

fn start_line(outcome: StartOutcome) -> &'static str {
    match outcome {
        StartOutcome::Started => "started",
        StartOutcome::AlreadyRunning => "already running",
    }
}
