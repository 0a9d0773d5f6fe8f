use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

fn config_path() -> Result<PathBuf> {
    let dir = dirs::home_dir()
        .context("cannot determine home directory")?
        .join(".wgctl");
    fs::create_dir_all(&dir)?;
    Ok(dir.join("config.toml"))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shell for completions (bash, zsh, fish)
    pub shell: Option<String>,
    /// Editor for `wgctl config` (overrides $VISUAL/$EDITOR)
    pub editor: Option<String>,
    /// Worker pool size shared by probes
    pub workers: usize,
    /// Maximum number of live tunnel instances
    pub max_tunnels: usize,
    pub probes: ProbeSettings,
}

/// Addresses and limits used by the diagnostic probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Local `host:port` the UDP echo probe binds
    pub udp_echo_bind: String,
    /// Local `host:port` the TCP echo probe listens on
    pub tcp_echo_bind: String,
    /// Remote `host:port` the UDP send probe targets
    pub udp_send_target: String,
    /// Datagram body sent by the UDP send probe
    pub payload: String,
    /// How long the TCP echo probe reads after accepting, in milliseconds
    pub tcp_read_deadline_ms: u64,
    /// Receive buffer size for both echo probes
    pub buffer_size: usize,
    /// Listen backlog of the TCP echo probe
    pub backlog: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            editor: None,
            workers: 5,
            max_tunnels: 16,
            probes: ProbeSettings::default(),
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            udp_echo_bind: "192.168.12.15:4652".to_string(),
            tcp_echo_bind: "192.168.12.15:4652".to_string(),
            udp_send_target: "192.168.12.1:4500".to_string(),
            payload: "Hello, UDP!".to_string(),
            tcp_read_deadline_ms: 5000,
            buffer_size: 1024,
            backlog: 10,
        }
    }
}

impl ProbeSettings {
    pub fn tcp_read_deadline(&self) -> Duration {
        Duration::from_millis(self.tcp_read_deadline_ms)
    }
}

impl Config {
    /// Load config from ~/.wgctl/config.toml, falling back to defaults.
    pub fn load() -> Self {
        let path = match config_path() {
            Ok(p) => p,
            Err(_) => return Self::default(),
        };
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                tracing::warn!("cannot read {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    fn parse(content: &str) -> Self {
        toml::from_str(content).unwrap_or_else(|e| {
            tracing::warn!("ignoring invalid config: {}", e);
            Self::default()
        })
    }

    /// Resolve which editor to use: config > $VISUAL > $EDITOR > vi
    pub fn resolve_editor(&self) -> String {
        if let Some(ref e) = self.editor {
            return e.clone();
        }
        std::env::var("VISUAL")
            .or_else(|_| std::env::var("EDITOR"))
            .unwrap_or_else(|_| "vi".to_string())
    }

    /// Write a default config file if none exists. Returns the path.
    pub fn init() -> Result<PathBuf> {
        let path = config_path()?;
        if path.exists() {
            return Ok(path);
        }
        let default = Self::default();
        let content = toml::to_string_pretty(&default)
            .context("failed to serialize default config")?;
        fs::write(&path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = Config::parse(
            r#"
workers = 2

[probes]
udp_echo_bind = "127.0.0.1:9000"
"#,
        );
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.max_tunnels, 16);
        assert_eq!(cfg.probes.udp_echo_bind, "127.0.0.1:9000");
        assert_eq!(cfg.probes.tcp_echo_bind, "192.168.12.15:4652");
        assert_eq!(cfg.probes.buffer_size, 1024);
        assert_eq!(cfg.probes.backlog, 10);
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let cfg = Config::parse("workers = \"many\"");
        assert_eq!(cfg.workers, 5);
        assert_eq!(cfg.probes.payload, "Hello, UDP!");
    }

    #[test]
    fn default_deadline_is_five_seconds() {
        let probes = ProbeSettings::default();
        assert_eq!(probes.tcp_read_deadline(), Duration::from_secs(5));
    }

    #[test]
    fn defaults_survive_serialization() {
        let content = toml::to_string_pretty(&Config::default()).unwrap();
        let cfg = Config::parse(&content);
        assert_eq!(cfg.probes.udp_send_target, "192.168.12.1:4500");
        assert_eq!(cfg.probes.tcp_read_deadline_ms, 5000);
    }
}
