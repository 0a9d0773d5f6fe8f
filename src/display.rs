use colored::Colorize;
use console::Alignment;

use crate::lifecycle::TunnelState;
use crate::probe::ProbeKind;
use crate::report::{Observer, Report, Source};
use crate::service::format_uptime;

/// Width of the source column, wide enough for every probe name.
const SOURCE_WIDTH: usize = 8;

/// Prints every report line to stdout, one line per report.
#[derive(Default)]
pub struct ConsoleObserver {
    printed: usize,
}

impl ConsoleObserver {
    pub fn printed(&self) -> usize {
        self.printed
    }
}

impl Observer for ConsoleObserver {
    fn observe(&mut self, report: &Report) {
        println!("{}", render(report));
        self.printed += 1;
    }
}

/// Format one report: bullet, source column, then the line itself. Terminal
/// lines are green, or red when they carry an error.
pub fn render(report: &Report) -> String {
    let source = pad(&report.source.to_string().cyan().to_string(), SOURCE_WIDTH);
    let (bullet, line) = if !report.terminal {
        ("·".dimmed().to_string(), report.line.normal().to_string())
    } else if is_failure(report) {
        ("✗".red().to_string(), report.line.red().to_string())
    } else {
        ("●".green().to_string(), report.line.green().to_string())
    };
    format!("{} {} {}", bullet, source, line)
}

fn is_failure(report: &Report) -> bool {
    let line = report.line.as_str();
    match report.source {
        Source::Probe(ProbeKind::UdpSend) => line.starts_with("Failed to send packet:"),
        Source::Probe(_) => line.starts_with("error:"),
        Source::Tunnel => !matches!(
            line,
            "configured" | "started" | "already running" | "stopped"
        ) && !line.starts_with("created tunnel"),
    }
}

/// Print the tunnel state for `status` in the shell.
pub fn print_status(state: TunnelState, uptime: Option<std::time::Duration>) {
    match state {
        TunnelState::Running(handle) => {
            let up = uptime.map(format_uptime).unwrap_or_default();
            println!(
                "{} tunnel {} {}",
                "●".green(),
                handle.to_string().green().bold(),
                format!("up {}", up).green()
            );
        }
        TunnelState::Pending(handle) => {
            println!("{} tunnel {} {}", "○".dimmed(), handle, "not configured".yellow());
        }
        TunnelState::Configured(handle) => {
            println!("{} tunnel {} {}", "○".dimmed(), handle, "configured".dimmed());
        }
        TunnelState::Uninitialized | TunnelState::Stopped => {
            println!("{} {}", "○".dimmed(), "no tunnel running".dimmed());
        }
    }
}

/// Pad an ANSI-colored string to a visible width using console's awareness of escape codes.
fn pad(s: &str, width: usize) -> String {
    console::pad_str(s, width, Alignment::Left, None).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(source: Source, line: &str, terminal: bool) -> Report {
        Report {
            invocation: 1,
            source,
            line: line.to_string(),
            terminal,
        }
    }

    #[test]
    fn source_column_is_aligned() {
        colored::control::set_override(false);
        let a = render(&report(Source::Tunnel, "started", true));
        let b = render(&report(Source::Probe(ProbeKind::TcpEcho), "hi", true));
        assert_eq!(a.find("started"), b.find("hi"));
    }

    #[test]
    fn failures_are_recognised_per_source() {
        assert!(is_failure(&report(
            Source::Probe(ProbeKind::UdpSend),
            "Failed to send packet: nope",
            true
        )));
        assert!(is_failure(&report(Source::Probe(ProbeKind::UdpEcho), "error: x", true)));
        assert!(!is_failure(&report(
            Source::Probe(ProbeKind::UdpSend),
            "Packet sent successfully!",
            true
        )));
        assert!(is_failure(&report(Source::Tunnel, "Invalid peer_key", true)));
        assert!(!is_failure(&report(Source::Tunnel, "created tunnel #3", true)));
        assert!(!is_failure(&report(Source::Tunnel, "already running", true)));
    }

    #[test]
    fn observer_counts_lines() {
        let mut observer = ConsoleObserver::default();
        observer.observe(&report(Source::Tunnel, "stopped", true));
        assert_eq!(observer.printed(), 1);
    }
}
