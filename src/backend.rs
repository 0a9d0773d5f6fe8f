use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::BackendError;
use crate::relay::{Relay, RelayOptions};
use crate::tunnel::{TunnelConfig, TunnelHandle};

/// What the lifecycle manager drives. A handle is opaque to everyone but
/// the backend that issued it.
#[async_trait]
pub trait TunnelBackend: Send + Sync + 'static {
    /// Allocate a new, unconfigured instance.
    fn create(&self) -> Result<TunnelHandle, BackendError>;

    /// Validate `text` and store it on the instance. Leaves the instance
    /// untouched on failure.
    fn set_config(&self, handle: TunnelHandle, text: &str) -> Result<(), BackendError>;

    /// A configuration template. Pure.
    fn sample_config(&self) -> String;

    /// Run the instance until `shutdown` fires or the tunnel fails.
    async fn run(
        &self,
        handle: TunnelHandle,
        shutdown: oneshot::Receiver<()>,
    ) -> Result<(), BackendError>;

    /// Forget the instance. Unknown handles are ignored.
    fn destroy(&self, handle: TunnelHandle);
}

#[derive(Default)]
struct Instance {
    config: Option<TunnelConfig>,
}

/// In-process backend. Validates configuration text and runs the TCP/UDP
/// relay for a started tunnel.
pub struct WgBackend {
    instances: Mutex<HashMap<TunnelHandle, Instance>>,
    next_id: AtomicU64,
    max_instances: usize,
}

impl WgBackend {
    pub fn new(max_instances: usize) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_instances,
        }
    }

    pub fn live_instances(&self) -> usize {
        self.instances.lock().len()
    }
}

#[async_trait]
impl TunnelBackend for WgBackend {
    fn create(&self) -> Result<TunnelHandle, BackendError> {
        let mut instances = self.instances.lock();
        if instances.len() >= self.max_instances {
            return Err(BackendError::HandleExhausted {
                limit: self.max_instances,
            });
        }
        let handle = TunnelHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        instances.insert(handle, Instance::default());
        tracing::debug!(%handle, "tunnel instance created");
        Ok(handle)
    }

    fn set_config(&self, handle: TunnelHandle, text: &str) -> Result<(), BackendError> {
        let config = TunnelConfig::parse(text).map_err(BackendError::InvalidConfig)?;
        let mut instances = self.instances.lock();
        let instance = instances
            .get_mut(&handle)
            .ok_or(BackendError::UnknownHandle(handle))?;
        instance.config = Some(config);
        Ok(())
    }

    fn sample_config(&self) -> String {
        toml::to_string_pretty(&TunnelConfig::sample()).unwrap_or_else(|e| {
            tracing::error!("cannot serialize sample config: {}", e);
            String::new()
        })
    }

    async fn run(
        &self,
        handle: TunnelHandle,
        shutdown: oneshot::Receiver<()>,
    ) -> Result<(), BackendError> {
        let config = {
            let mut instances = self.instances.lock();
            let instance = instances
                .get_mut(&handle)
                .ok_or(BackendError::UnknownHandle(handle))?;
            instance.config.take().ok_or(BackendError::NotConfigured)?
        };

        tracing::info!(
            %handle,
            bind = %config.bind_ip_port,
            mtu = config.mtu,
            incoming_udp = config.incoming_udp.len(),
            incoming_tcp = config.incoming_tcp.len(),
            "starting tunnel"
        );
        if config.debug {
            for fwd in config.incoming_udp.iter().chain(&config.incoming_tcp) {
                tracing::debug!(%handle, "port forward {}", fwd);
            }
        }

        let relay = Relay::bind(RelayOptions::from_config(&config)).await?;
        tokio::select! {
            result = relay.run() => {
                tracing::error!(%handle, "relay stopped unexpectedly");
                result?;
                Ok(())
            }
            _ = shutdown => {
                tracing::info!(%handle, "tunnel shut down");
                Ok(())
            }
        }
    }

    fn destroy(&self, handle: TunnelHandle) {
        if self.instances.lock().remove(&handle).is_some() {
            tracing::debug!(%handle, "tunnel instance destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local_config() -> String {
        let mut cfg = TunnelConfig::sample();
        cfg.bind_ip_port = "127.0.0.1:0".parse().unwrap();
        cfg.peer_endpoint = None;
        toml::to_string_pretty(&cfg).unwrap()
    }

    #[test]
    fn handles_are_never_reused() {
        let backend = WgBackend::new(4);
        let a = backend.create().unwrap();
        backend.destroy(a);
        let b = backend.create().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn create_fails_when_capacity_is_reached() {
        let backend = WgBackend::new(1);
        backend.create().unwrap();
        assert!(matches!(
            backend.create(),
            Err(BackendError::HandleExhausted { limit: 1 })
        ));
    }

    #[test]
    fn set_config_reports_validation_text() {
        let backend = WgBackend::new(4);
        let handle = backend.create().unwrap();
        let err = backend.set_config(handle, "bad").unwrap_err();
        assert!(matches!(err, BackendError::InvalidConfig(ref msg) if !msg.is_empty()));
    }

    #[test]
    fn set_config_on_unknown_handle_fails() {
        let backend = WgBackend::new(4);
        let handle = backend.create().unwrap();
        backend.destroy(handle);
        assert!(matches!(
            backend.set_config(handle, &backend.sample_config()),
            Err(BackendError::UnknownHandle(h)) if h == handle
        ));
    }

    #[test]
    fn sample_config_is_accepted() {
        let backend = WgBackend::new(4);
        let handle = backend.create().unwrap();
        backend.set_config(handle, &backend.sample_config()).unwrap();
    }

    #[test]
    fn sample_config_is_never_empty() {
        let sample = WgBackend::new(4).sample_config();
        assert!(sample.contains("private_key = "), "{}", sample);
        assert!(sample.contains("bind_ip_port = "), "{}", sample);
    }

    #[tokio::test]
    async fn run_without_config_fails() {
        let backend = WgBackend::new(4);
        let handle = backend.create().unwrap();
        let (_tx, rx) = oneshot::channel();
        let err = backend.run(handle, rx).await.unwrap_err();
        assert_eq!(err.to_string(), "setConfig should precede run");
    }

    #[tokio::test]
    async fn run_returns_cleanly_on_shutdown() {
        let backend = WgBackend::new(4);
        let handle = backend.create().unwrap();
        backend.set_config(handle, &local_config()).unwrap();

        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move { backend.run(handle, rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn run_consumes_the_config() {
        let backend = std::sync::Arc::new(WgBackend::new(4));
        let handle = backend.create().unwrap();
        backend.set_config(handle, &local_config()).unwrap();

        let (tx, rx) = oneshot::channel();
        let runner = std::sync::Arc::clone(&backend);
        let task = tokio::spawn(async move { runner.run(handle, rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (_tx2, rx2) = oneshot::channel();
        assert!(matches!(
            backend.run(handle, rx2).await,
            Err(BackendError::NotConfigured)
        ));
        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
