//! Discovery of running debugger processes.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::error::TransportError;
use crate::prompt::is_debugger_command;
use crate::transport::external;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebuggerProcess {
    pub pid: u32,
    /// Controlling terminal as `ps` prints it, e.g. `pts/3` or `ttys001`.
    pub tty: Option<String>,
    pub command: String,
}

#[async_trait]
pub trait ProcessSource: Send + Sync {
    async fn list(&self) -> Result<Vec<DebuggerProcess>, TransportError>;
}

/// Lists processes with `ps -eo pid,tty,command`.
#[derive(Debug, Clone)]
pub struct PsProcessSource {
    timeout: Duration,
}

impl PsProcessSource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for PsProcessSource {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl ProcessSource for PsProcessSource {
    async fn list(&self) -> Result<Vec<DebuggerProcess>, TransportError> {
        let output = external::run("ps", &["-eo", "pid,tty,command"], self.timeout).await?;
        let processes = parse_ps_output(&output);
        debug!(count = processes.len(), "Listed debugger processes");
        Ok(processes)
    }
}

pub fn parse_ps_output(output: &str) -> Vec<DebuggerProcess> {
    output
        .lines()
        .skip(1)
        .filter_map(parse_ps_line)
        .filter(|p| is_debugger_command(&p.command))
        .collect()
}

fn parse_ps_line(line: &str) -> Option<DebuggerProcess> {
    let mut fields = line.split_whitespace();
    let pid = fields.next()?.parse::<u32>().ok()?;
    let tty = fields.next()?;
    let command = fields.collect::<Vec<_>>().join(" ");
    if command.is_empty() {
        return None;
    }
    let tty = match tty {
        "?" | "??" | "-" => None,
        other => Some(other.to_string()),
    };
    Some(DebuggerProcess { pid, tty, command })
}
