use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::ValueEnum;
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::backend::WgBackend;
use crate::display::{self, ConsoleObserver};
use crate::lifecycle::{TunnelManager, TunnelState};
use crate::probe::{ProbeKind, ProbeRunner};
use crate::report::ReportSink;
use crate::service::TaskServiceHost;

const DRAIN_GRACE: Duration = Duration::from_millis(200);

const HELP: &str = "\
commands:
  start <file>   start a tunnel from a configuration file
  stop           stop the tunnel
  probe <kind>   run a probe (udp-send, udp-echo, tcp-echo)
  sample         print a sample tunnel configuration
  status         show the tunnel state
  help           show this help
  quit           stop the tunnel and leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Start(PathBuf),
    Stop,
    Probe(ProbeKind),
    Sample,
    Status,
    Help,
    Quit,
    Empty,
}

pub fn parse_command(line: &str) -> Result<ShellCommand, String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(ShellCommand::Empty);
    };
    let arg = words.next();
    if words.next().is_some() {
        return Err(format!("too many arguments for '{}'", command));
    }

    let cmd = match (command, arg) {
        ("start", Some(path)) => ShellCommand::Start(PathBuf::from(path)),
        ("start", None) => return Err("usage: start <file>".to_string()),
        ("probe", Some(kind)) => ShellCommand::Probe(
            ProbeKind::from_str(kind, true).map_err(|_| format!("unknown probe '{}'", kind))?,
        ),
        ("probe", None) => return Err("usage: probe <kind>".to_string()),
        ("stop", None) => ShellCommand::Stop,
        ("sample", None) => ShellCommand::Sample,
        ("status", None) => ShellCommand::Status,
        ("help" | "?", None) => ShellCommand::Help,
        ("quit" | "exit", None) => ShellCommand::Quit,
        (_, Some(_)) if matches!(command, "stop" | "sample" | "status" | "help" | "quit") => {
            return Err(format!("'{}' takes no arguments", command));
        }
        _ => return Err(format!("unknown command '{}', try 'help'", command)),
    };
    Ok(cmd)
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// One tunnel manager and one probe runner for as long as stdin stays open.
pub struct Session {
    runner: ProbeRunner,
    manager: TunnelManager<WgBackend, TaskServiceHost<WgBackend>>,
}

impl Session {
    pub fn new(runner: ProbeRunner, manager: TunnelManager<WgBackend, TaskServiceHost<WgBackend>>) -> Self {
        Self { runner, manager }
    }

    /// Read commands from stdin until `quit` or end of input.
    pub async fn run(mut self, sink: ReportSink) -> Result<()> {
        let printer = tokio::spawn(async move {
            let mut observer = ConsoleObserver::default();
            sink.run(&mut observer).await;
        });

        println!("{}", HELP.dimmed());
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    match parse_command(&line) {
                        Ok(cmd) => {
                            if self.execute(cmd).await == Flow::Quit {
                                break;
                            }
                        }
                        Err(msg) => eprintln!("{}", msg.red()),
                    }
                }
                _ = self.manager.host_mut().exited() => {
                    tracing::debug!("background service exited");
                }
            }
        }

        if matches!(self.manager.state(), TunnelState::Running(_)) {
            self.manager.stop();
        }
        // Probes still waiting on their sockets keep the channel open.
        drop(self);
        let _ = tokio::time::timeout(DRAIN_GRACE, printer).await;
        Ok(())
    }

    async fn execute(&mut self, cmd: ShellCommand) -> Flow {
        match cmd {
            ShellCommand::Start(path) => match tokio::fs::read_to_string(&path).await {
                Ok(text) => {
                    if let Err(e) = self.manager.launch(&text) {
                        tracing::debug!("launch failed: {}", e);
                    }
                }
                Err(e) => eprintln!("{}", format!("cannot read {}: {}", path.display(), e).red()),
            },
            ShellCommand::Stop => self.manager.stop(),
            ShellCommand::Probe(kind) => {
                drop(self.runner.run_probe(kind));
            }
            ShellCommand::Sample => println!("{}", self.manager.sample_config()),
            ShellCommand::Status => {
                let state = self.manager.state();
                display::print_status(state, self.manager.host().uptime());
            }
            ShellCommand::Help => println!("{}", HELP),
            ShellCommand::Quit => return Flow::Quit,
            ShellCommand::Empty => {}
        }
        Flow::Continue
    }
}
