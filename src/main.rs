mod backend;
mod cli;
mod config;
mod display;
mod error;
mod guard;
mod lifecycle;
mod picker;
mod pool;
mod probe;
mod relay;
mod report;
mod service;
mod shell;
mod tunnel;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use colored::Colorize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use backend::{TunnelBackend, WgBackend};
use cli::{Cli, Command};
use config::Config;
use display::ConsoleObserver;
use lifecycle::TunnelManager;
use pool::WorkerPool;
use probe::{ProbeKind, ProbeRunner};
use service::TaskServiceHost;

fn main() -> Result<()> {
    clap_complete::CompleteEnv::with_factory(Cli::command).complete();

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let cfg = Config::load();

    if cli.no_color {
        colored::control::set_override(false);
    }

    match cli.command {
        Command::Check { config } => cmd_check(&config, &cfg),
        Command::SampleConfig => cmd_sample_config(&cfg),
        Command::Config => cmd_config(&cfg),
        Command::Completions { shell } => cmd_completions(shell, &cfg),
        Command::Up { config } => {
            let text = read_tunnel_config(&config)?;
            block_on(&cfg, cmd_up(text, &cfg))
        }
        Command::Probe { kind } => {
            let kind = match kind {
                Some(k) => k,
                None => picker::pick_probe()?,
            };
            block_on(&cfg, cmd_probe(kind, &cfg))
        }
        Command::Shell => block_on(&cfg, cmd_shell(&cfg)),
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

/// Run `fut` on a runtime with one worker thread per pool slot. Tasks still
/// blocked on sockets or stdin are dropped on the way out.
fn block_on<F: std::future::Future<Output = Result<()>>>(cfg: &Config, fut: F) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.workers.max(1))
        .enable_all()
        .build()
        .context("failed to build async runtime")?;
    let result = runtime.block_on(fut);
    runtime.shutdown_background();
    result
}

fn read_tunnel_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

async fn cmd_up(text: String, cfg: &Config) -> Result<()> {
    let (reporter, sink) = report::channel();
    let printer = tokio::spawn(async move {
        let mut observer = ConsoleObserver::default();
        sink.run(&mut observer).await;
    });

    let backend = Arc::new(WgBackend::new(cfg.max_tunnels));
    let host = TaskServiceHost::new(Arc::clone(&backend), reporter.clone());
    let mut manager = TunnelManager::new(backend, host, reporter);

    let launched = manager.launch(&text);
    if launched.is_ok() {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                tracing::info!("interrupted");
            }
            _ = manager.host_mut().exited() => {}
        }
        manager.stop();
    }
    drop(manager);
    let _ = printer.await;

    launched.map(|_| ()).context("tunnel did not start")
}

fn cmd_check(path: &Path, cfg: &Config) -> Result<()> {
    let text = read_tunnel_config(path)?;
    let backend = WgBackend::new(cfg.max_tunnels);
    let handle = backend.create()?;
    let result = backend.set_config(handle, &text);
    backend.destroy(handle);

    match result {
        Ok(()) => {
            println!("{} {}", "✓".green(), "ok".green());
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "✗".red(), e.to_string().red());
            anyhow::bail!("{} is not a valid tunnel configuration", path.display())
        }
    }
}

fn cmd_sample_config(cfg: &Config) -> Result<()> {
    let backend = WgBackend::new(cfg.max_tunnels);
    print!("{}", backend.sample_config());
    Ok(())
}

async fn cmd_probe(kind: ProbeKind, cfg: &Config) -> Result<()> {
    let (reporter, sink) = report::channel();
    let runner = ProbeRunner::new(cfg.probes.clone(), reporter, WorkerPool::new(cfg.workers));
    let outcome = runner.run_probe(kind);
    drop(runner);

    let mut observer = ConsoleObserver::default();
    sink.run(&mut observer).await;
    let outcome = outcome.await.context("probe task failed")?;
    tracing::debug!(
        kind = %outcome.kind,
        lines = outcome.transcript.len(),
        printed = observer.printed(),
        superseded = outcome.superseded,
        "probe finished"
    );
    Ok(())
}

async fn cmd_shell(cfg: &Config) -> Result<()> {
    let (reporter, sink) = report::channel();
    let backend = Arc::new(WgBackend::new(cfg.max_tunnels));
    let host = TaskServiceHost::new(Arc::clone(&backend), reporter.clone());
    let manager = TunnelManager::new(backend, host, reporter.clone());
    let runner = ProbeRunner::new(cfg.probes.clone(), reporter, WorkerPool::new(cfg.workers));

    shell::Session::new(runner, manager).run(sink).await
}

fn cmd_config(cfg: &Config) -> Result<()> {
    let path = Config::init()?;
    let editor = cfg.resolve_editor();

    let status = std::process::Command::new(&editor)
        .arg(&path)
        .status()
        .with_context(|| format!("failed to launch editor '{}'", editor))?;

    if !status.success() {
        anyhow::bail!("editor exited with {}", status);
    }

    Ok(())
}

fn cmd_completions(shell: Option<clap_complete::Shell>, cfg: &Config) -> Result<()> {
    let shell = match shell {
        Some(s) => s,
        None => {
            let name = cfg.shell.as_deref().ok_or_else(|| {
                anyhow::anyhow!(
                    "no shell specified, use `wgctl completions <shell>` or set `shell` in ~/.wgctl/config.toml"
                )
            })?;
            name.parse::<clap_complete::Shell>()
                .map_err(|_| anyhow::anyhow!("unknown shell '{}' in config", name))?
        }
    };

    let shell_name = match shell {
        clap_complete::Shell::Bash => "bash",
        clap_complete::Shell::Zsh => "zsh",
        clap_complete::Shell::Fish => "fish",
        clap_complete::Shell::Elvish => "elvish",
        clap_complete::Shell::PowerShell => "powershell",
        _ => anyhow::bail!("unsupported shell"),
    };
    unsafe { std::env::set_var("COMPLETE", shell_name) };
    clap_complete::CompleteEnv::with_factory(Cli::command).complete();
    Ok(())
}
