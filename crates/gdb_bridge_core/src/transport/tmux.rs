use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use super::external;
use super::{LocateHint, Platform, SessionLocator, Transport, TransportCapability, TransportKind};
use crate::error::TransportError;
use crate::prompt::is_debugger_command;

const LIST_FORMAT: &str =
    "#{session_name}:#{window_index}.#{pane_index}\t#{session_name}\t#{pane_pid}\t#{pane_tty}\t#{pane_current_command}";

#[derive(Debug, Clone, PartialEq, Eq)]
struct PaneInfo {
    target: String,
    session_name: String,
    pid: Option<u32>,
    tty: String,
    current_command: String,
}

/// Addresses a pane inside a tmux server by `session:window.pane`.
pub struct TmuxTransport {
    binary: String,
    call_timeout: Duration,
}

impl TmuxTransport {
    pub fn new(binary: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            call_timeout,
        }
    }

    async fn tmux(&self, args: &[&str]) -> Result<String, TransportError> {
        external::run(&self.binary, args, self.call_timeout).await
    }

    async fn list_panes(&self) -> Result<Vec<PaneInfo>, TransportError> {
        let output = self.tmux(&["list-panes", "-a", "-F", LIST_FORMAT]).await?;
        Ok(parse_panes(&output))
    }
}

fn parse_panes(output: &str) -> Vec<PaneInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(5, '\t');
            let target = fields.next()?.trim();
            let session_name = fields.next()?.trim();
            let pid = fields.next()?.trim().parse::<u32>().ok();
            let tty = fields.next()?.trim();
            let current_command = fields.next().unwrap_or_default().trim();
            if target.is_empty() {
                return None;
            }
            Some(PaneInfo {
                target: target.to_string(),
                session_name: session_name.to_string(),
                pid,
                tty: tty.to_string(),
                current_command: current_command.to_string(),
            })
        })
        .collect()
}

/// Picks the pane the hint refers to. Without any hint the first pane whose
/// foreground command is a debugger wins.
fn select_pane<'a>(panes: &'a [PaneInfo], hint: &LocateHint) -> Option<&'a PaneInfo> {
    if let Some(wanted) = hint.locator.as_deref() {
        return panes
            .iter()
            .find(|p| p.target == wanted || p.session_name == wanted);
    }

    if hint.tty.is_some() || hint.process_id.is_some() {
        return panes.iter().find(|p| {
            hint.matches_tty(&p.tty) || (hint.process_id.is_some() && p.pid == hint.process_id)
        });
    }

    panes.iter().find(|p| is_debugger_command(&p.current_command))
}

#[async_trait]
impl Transport for TmuxTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Multiplexer
    }

    fn capability(&self) -> TransportCapability {
        TransportCapability {
            can_capture: true,
            can_interrupt: true,
            platform_applicable: Platform::is_unix,
        }
    }

    async fn locate(&self, hint: &LocateHint) -> Option<SessionLocator> {
        let panes = match self.list_panes().await {
            Ok(panes) => panes,
            Err(e) => {
                warn!(error = %e, "tmux pane listing failed");
                return None;
            }
        };

        let pane = select_pane(&panes, hint)?;
        debug!(target = %pane.target, command = %pane.current_command, "Located tmux pane");
        Some(
            SessionLocator::new(TransportKind::Multiplexer, pane.target.clone())
                .with_process(hint.process_id.or(pane.pid), Some(pane.tty.clone())),
        )
    }

    async fn send(&self, locator: &SessionLocator, text: &str) -> Result<(), TransportError> {
        self.tmux(&["send-keys", "-t", &locator.target, "-l", text]).await?;
        self.tmux(&["send-keys", "-t", &locator.target, "Enter"]).await?;
        Ok(())
    }

    async fn capture(&self, locator: &SessionLocator) -> Result<String, TransportError> {
        self.tmux(&["capture-pane", "-p", "-J", "-t", &locator.target, "-S", "-", "-E", "-"])
            .await
    }

    async fn interrupt(&self, locator: &SessionLocator) -> Result<(), TransportError> {
        self.tmux(&["send-keys", "-t", &locator.target, "C-c"]).await?;
        Ok(())
    }
}
