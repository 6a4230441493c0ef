use serde::Serialize;

use crate::processes::DebuggerProcess;
use crate::transport::{Platform, TransportKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachResponse {
    pub session_id: String,
    pub transport: TransportKind,
    pub process_id: Option<u32>,
    pub tty: Option<String>,
    /// Backend address of the session: pane target, terminal session id or
    /// spawned-process key.
    pub locator: String,
    /// False when an existing session for the same debugger was returned.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecResponse {
    pub success: bool,
    pub output: String,
    pub blocked: bool,
    /// False when the command was typed through a transport that cannot
    /// read output back.
    pub captured: bool,
    pub transport: Option<TransportKind>,
    /// What happened, when `output` alone does not say. Never debugger text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ExecResponse {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            blocked: false,
            captured: false,
            transport: None,
            note: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BlockedStatus {
    pub blocked: bool,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchResponse {
    pub session_id: String,
    pub process_id: Option<u32>,
    pub locator: String,
    /// Output of `target remote`, when a remote target was requested.
    pub remote_output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub process_id: Option<u32>,
    pub tty: Option<String>,
    pub transport: Option<TransportKind>,
    pub locator: Option<String>,
    pub blocked: bool,
    pub busy: bool,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportStatus {
    pub kind: TransportKind,
    pub can_capture: bool,
    pub can_interrupt: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusResponse {
    pub platform: Platform,
    /// Transports available on this platform, in priority order.
    pub transports: Vec<TransportStatus>,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessListResponse {
    pub count: usize,
    pub processes: Vec<DebuggerProcess>,
}

impl From<Vec<DebuggerProcess>> for ProcessListResponse {
    fn from(processes: Vec<DebuggerProcess>) -> Self {
        Self {
            count: processes.len(),
            processes,
        }
    }
}
