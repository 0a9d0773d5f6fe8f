use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::backend::TunnelBackend;
use crate::lifecycle::ServiceHost;
use crate::report::{Reporter, Source};
use crate::tunnel::TunnelHandle;

struct RunningService {
    handle: TunnelHandle,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    started_at: Instant,
}

/// Runs a started tunnel as a background task of the current runtime.
pub struct TaskServiceHost<B> {
    backend: Arc<B>,
    reporter: Reporter,
    running: Option<RunningService>,
}

impl<B: TunnelBackend> TaskServiceHost<B> {
    pub fn new(backend: Arc<B>, reporter: Reporter) -> Self {
        Self {
            backend,
            reporter,
            running: None,
        }
    }

    pub fn handle(&self) -> Option<TunnelHandle> {
        self.running.as_ref().map(|s| s.handle)
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.running.as_ref().map(|s| s.started_at.elapsed())
    }

    /// Resolves when the running service ends on its own. Never resolves if
    /// nothing is running.
    pub async fn exited(&mut self) {
        match self.running.as_mut() {
            Some(service) => {
                let _ = (&mut service.task).await;
                self.running = None;
            }
            None => std::future::pending().await,
        }
    }
}

impl<B: TunnelBackend> ServiceHost for TaskServiceHost<B> {
    fn start_background_service(&mut self, handle: TunnelHandle) {
        self.stop_background_service();

        let (shutdown, rx) = oneshot::channel();
        let backend = Arc::clone(&self.backend);
        let reporter = self.reporter.clone();
        let task = tokio::spawn(async move {
            match backend.run(handle, rx).await {
                Ok(()) => tracing::info!(%handle, "background service stopped"),
                Err(e) => {
                    tracing::error!(%handle, "background service failed: {}", e);
                    reporter
                        .scope(Source::Tunnel)
                        .finish(format!("tunnel exited: {}", e));
                }
            }
        });
        self.running = Some(RunningService {
            handle,
            shutdown,
            task,
            started_at: Instant::now(),
        });
    }

    fn stop_background_service(&mut self) {
        if let Some(service) = self.running.take() {
            tracing::debug!(handle = %service.handle, "stopping background service");
            let _ = service.shutdown.send(());
        }
    }

    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|service| !service.task.is_finished())
    }
}

/// Format a duration as a human-readable string like "2h 14m" or "3d 1h".
pub fn format_uptime(elapsed: Duration) -> String {
    let elapsed = elapsed.as_secs();
    let days = elapsed / 86400;
    let hours = (elapsed % 86400) / 3600;
    let minutes = (elapsed % 3600) / 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes.max(1))
    }
}
