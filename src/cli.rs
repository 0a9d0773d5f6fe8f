use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::probe::ProbeKind;

#[derive(Parser)]
#[command(name = "wgctl", about = "Userspace tunnel controller with network probes", version)]
pub struct Cli {
    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Log filter used when RUST_LOG is unset (e.g. "debug", "wgctl=trace")
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start a tunnel and keep it running until Ctrl-C
    Up {
        /// Tunnel configuration file (TOML)
        config: PathBuf,
    },
    /// Validate a tunnel configuration without starting it
    Check {
        /// Tunnel configuration file (TOML)
        config: PathBuf,
    },
    /// Print a sample tunnel configuration
    #[command(alias = "sample")]
    SampleConfig,
    /// Run one network probe
    Probe {
        /// Probe to run (interactive picker if omitted)
        kind: Option<ProbeKind>,
    },
    /// Interactive session: run probes and manage a tunnel
    Shell,
    /// Initialize or edit ~/.wgctl/config.toml
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for (reads from config if omitted)
        shell: Option<clap_complete::Shell>,
    },
}
