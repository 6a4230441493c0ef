//! Public entry point: attaches to debugger sessions and runs commands on
//! them with transport failover.
//!
//! A [`Dispatcher`] is cheap to clone. Every clone shares the same registry,
//! transports and marker source.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, TokioClock};
use crate::command::Command;
use crate::config::BridgeConfig;
use crate::detector::{DetectFailure, Detector, ExecOutcome};
use crate::error::BridgeError;
use crate::marker::MarkerGenerator;
use crate::processes::{DebuggerProcess, ProcessSource, PsProcessSource};
use crate::prompt::PromptPatterns;
use crate::registry::{Session, SessionEntry, SessionRegistry};
use crate::transport::{
    LocateHint, PipeTransport, Platform, SessionLocator, Transport, TransportKind, TransportSet,
};
use crate::types::{
    AttachResponse, BlockedStatus, ExecResponse, LaunchResponse, StatusResponse, TransportStatus,
};
use crate::Result;

/// What the caller knows about the debugger to attach to. Both fields empty
/// means "the first debugger process found".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachRequest {
    pub process_id: Option<u32>,
    pub locator: Option<String>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: BridgeConfig,
    prompts: PromptPatterns,
    transports: TransportSet,
    pipe: Option<Arc<PipeTransport>>,
    processes: Arc<dyn ProcessSource>,
    clock: Arc<dyn Clock>,
    markers: MarkerGenerator,
    registry: SessionRegistry,
}

impl Dispatcher {
    /// Dispatcher with the default backends for the current platform.
    pub fn new(config: BridgeConfig) -> Self {
        let pipe = Arc::new(PipeTransport::new(&config));
        let transports = TransportSet::for_platform(Platform::current(), &config, Arc::clone(&pipe));
        let processes = Arc::new(PsProcessSource::new(config.call_timeout));
        Self::from_parts(config, transports, Some(pipe), processes, Arc::new(TokioClock))
    }

    pub fn from_parts(
        config: BridgeConfig,
        transports: TransportSet,
        pipe: Option<Arc<PipeTransport>>,
        processes: Arc<dyn ProcessSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let prompts = PromptPatterns::new(config.prompt_patterns.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                prompts,
                transports,
                pipe,
                processes,
                clock,
                markers: MarkerGenerator::new(),
                registry: SessionRegistry::new(),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub async fn find_processes(&self) -> Result<Vec<DebuggerProcess>> {
        Ok(self.inner.processes.list().await?)
    }

    /// Resolves a debugger session and registers it. Attaching twice to the
    /// same process returns the existing session.
    pub async fn attach(&self, request: AttachRequest) -> Result<AttachResponse> {
        let hint = self.resolve_hint(&request).await;

        if let Some(entry) = self.inner.registry.find_matching(&hint) {
            let session = entry.snapshot();
            debug!(session = %session.session_id, "Reusing existing session");
            if let Some(locator) = session.locator.clone() {
                return Ok(attach_response(&session, &locator, false));
            }
            let (transport, locator) = self.locate_any(&session.hint()).await?;
            let mut session = entry.lock();
            session.record_success(locator.clone());
            info!(session = %session.session_id, transport = %transport.kind(), "Re-resolved session");
            return Ok(attach_response(&session, &locator, false));
        }

        let (transport, locator) = self.locate_any(&hint).await?;
        let session_id = self.inner.registry.next_session_id();
        let session = Session::new(session_id, &hint, locator.clone());
        let response = attach_response(&session, &locator, true);
        self.inner.registry.insert(session);

        info!(
            session = %response.session_id,
            transport = %transport.kind(),
            target = %locator.target,
            "Attached to debugger"
        );
        Ok(response)
    }

    async fn resolve_hint(&self, request: &AttachRequest) -> LocateHint {
        let mut hint = LocateHint {
            process_id: request.process_id,
            tty: None,
            locator: request.locator.clone(),
            process_confirmed: false,
        };
        if hint.locator.is_some() && hint.process_id.is_none() {
            return hint;
        }

        let processes = match self.inner.processes.list().await {
            Ok(processes) => processes,
            Err(e) => {
                warn!(error = %e, "Could not list debugger processes");
                return hint;
            }
        };

        let found = match hint.process_id {
            Some(pid) => processes.into_iter().find(|p| p.pid == pid),
            None => processes.into_iter().next(),
        };
        if let Some(process) = found {
            debug!(pid = process.pid, tty = ?process.tty, "Resolved debugger process");
            hint.process_id = Some(process.pid);
            hint.tty = process.tty;
            hint.process_confirmed = true;
        }
        hint
    }

    async fn locate_any(&self, hint: &LocateHint) -> Result<(Arc<dyn Transport>, SessionLocator)> {
        for transport in self.inner.transports.iter() {
            if let Some(locator) = transport.locate(hint).await {
                return Ok((Arc::clone(transport), locator));
            }
            debug!(transport = %transport.kind(), "Transport could not locate session");
        }
        Err(BridgeError::SessionNotFound(describe_hint(hint)))
    }

    pub async fn execute(&self, session_id: &str, text: &str) -> Result<ExecResponse> {
        self.execute_with_budget(session_id, text, self.inner.config.command_budget)
            .await
    }

    /// Runs one command. A second command on the same session while this
    /// one is in flight fails with [`BridgeError::SessionBusy`].
    pub async fn execute_with_budget(
        &self,
        session_id: &str,
        text: &str,
        budget: Duration,
    ) -> Result<ExecResponse> {
        let entry = self.inner.registry.get(session_id)?;
        let cancel = CancellationToken::new();
        let guard = entry.try_begin(cancel.clone())?;
        let command = Command::new(text, budget);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _guard = guard;
            inner.run_pipeline(&entry, &command, &cancel).await
        });

        task.await
            .map_err(|e| BridgeError::TaskFailed(e.to_string()))?
    }

    /// Whether the last command left the debuggee running. Reads session
    /// state only; never touches a transport.
    pub fn check_blocked(&self, session_id: &str) -> Result<BlockedStatus> {
        let entry = self.inner.registry.get(session_id)?;
        let session = entry.lock();
        let elapsed_seconds = match (session.blocked, session.blocked_since) {
            (true, Some(since)) => self
                .inner
                .clock
                .now()
                .saturating_duration_since(since)
                .as_secs_f64(),
            _ => 0.0,
        };
        Ok(BlockedStatus {
            blocked: session.blocked,
            elapsed_seconds,
        })
    }

    /// Cancels the command in flight on `session_id`. Returns false when
    /// nothing was running.
    pub fn cancel(&self, session_id: &str) -> Result<bool> {
        let entry = self.inner.registry.get(session_id)?;
        let cancelled = entry.cancel();
        if cancelled {
            info!(session = %session_id, "Cancellation requested");
        }
        Ok(cancelled)
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            platform: self.inner.transports.platform(),
            transports: self
                .inner
                .transports
                .iter()
                .map(|t| {
                    let capability = t.capability();
                    TransportStatus {
                        kind: t.kind(),
                        can_capture: capability.can_capture,
                        can_interrupt: capability.can_interrupt,
                    }
                })
                .collect(),
            sessions: self.inner.registry.summaries(),
        }
    }

    /// Starts a debugger on pipes and registers it as a session. With
    /// `remote_target`, connects it to a stub first.
    pub async fn launch(
        &self,
        executable: Option<&str>,
        remote_target: Option<&str>,
    ) -> Result<LaunchResponse> {
        let pipe = self
            .inner
            .pipe
            .as_ref()
            .ok_or_else(|| BridgeError::Launch("direct pipe transport is not available".to_string()))?;
        let locator = pipe
            .launch_debugger(executable)
            .await
            .map_err(|e| BridgeError::Launch(e.to_string()))?;

        let session_id = self.inner.registry.next_session_id();
        let hint = LocateHint {
            process_id: locator.process_id,
            tty: None,
            locator: Some(locator.target.clone()),
            process_confirmed: false,
        };
        self.inner
            .registry
            .insert(Session::new(session_id.clone(), &hint, locator.clone()));
        info!(session = %session_id, target = %locator.target, "Launched debugger");

        let remote_output = match remote_target {
            Some(address) => {
                let response = self
                    .execute(&session_id, &format!("target remote {address}"))
                    .await?;
                Some(response.output)
            }
            None => None,
        };

        Ok(LaunchResponse {
            session_id,
            process_id: locator.process_id,
            locator: locator.target,
            remote_output,
        })
    }

    /// Stops every debugger this dispatcher launched.
    pub async fn shutdown(&self) {
        if let Some(pipe) = &self.inner.pipe {
            pipe.shutdown_all().await;
        }
    }
}

impl Inner {
    /// Tries the session's active transport first, then every other one in
    /// priority order. A transport that failed is never retried for the same
    /// command.
    async fn run_pipeline(
        &self,
        entry: &SessionEntry,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<ExecResponse> {
        let session = entry.snapshot();
        let hint = session.hint();
        let mut attempts = 0;
        let mut last_error = String::from("no transport could locate the session");

        for transport in self.transports.order_from(session.active_transport) {
            let kind = transport.kind();
            let locator = match session.locator_for(kind) {
                Some(locator) => locator,
                None => match transport.locate(&hint).await {
                    Some(locator) => locator,
                    None => {
                        debug!(transport = %kind, "Skipping transport: session not located");
                        continue;
                    }
                },
            };
            attempts += 1;

            let mut detector = Detector::new(
                transport.as_ref(),
                &locator,
                &self.config,
                &self.prompts,
                &self.markers,
                self.clock.as_ref(),
                cancel,
            );

            match detector.run(command).await {
                Ok(outcome) => {
                    let mut session = entry.lock();
                    session.record_success(locator);
                    return Ok(self.respond(&mut session, command, kind, outcome));
                }
                Err(DetectFailure::Cancelled) => {
                    info!(session = %session.session_id, command = %command.text, "Command cancelled");
                    return Err(BridgeError::Cancelled);
                }
                Err(failure) => {
                    warn!(
                        session = %session.session_id,
                        transport = %kind,
                        error = %failure,
                        "Transport failed; trying next"
                    );
                    last_error = match failure {
                        DetectFailure::NonResponsive => {
                            BridgeError::NonResponsive { transport: kind }.to_string()
                        }
                        other => format!("{kind}: {other}"),
                    };
                    if entry.lock().record_failure(kind) {
                        info!(session = %session.session_id, transport = %kind, "Evicted cached locator");
                    }
                }
            }
        }

        warn!(session = %session.session_id, attempts, "All transports failed");
        Err(BridgeError::all_failed(attempts, last_error))
    }

    fn respond(
        &self,
        session: &mut Session,
        command: &Command,
        kind: TransportKind,
        outcome: ExecOutcome,
    ) -> ExecResponse {
        match outcome {
            ExecOutcome::Complete { output } => {
                session.clear_blocked();
                ExecResponse {
                    success: true,
                    output,
                    blocked: false,
                    captured: true,
                    transport: Some(kind),
                    note: None,
                }
            }
            ExecOutcome::Interrupted { partial } => {
                session.mark_blocked(self.clock.now());
                info!(session = %session.session_id, command = %command.text, "Command left the debuggee running");
                ExecResponse {
                    success: true,
                    output: partial,
                    blocked: true,
                    captured: true,
                    transport: Some(kind),
                    note: Some(format!(
                        "'{}' did not return to the prompt and was interrupted",
                        command.text
                    )),
                }
            }
            ExecOutcome::Delivered => ExecResponse {
                success: true,
                output: String::new(),
                blocked: session.blocked,
                captured: false,
                transport: Some(kind),
                note: Some(format!(
                    "'{}' was typed into the focused window; output cannot be captured from {kind}",
                    command.text
                )),
            },
        }
    }
}

fn attach_response(session: &Session, locator: &SessionLocator, created: bool) -> AttachResponse {
    AttachResponse {
        session_id: session.session_id.clone(),
        transport: locator.kind,
        process_id: session.process_id,
        tty: session.tty.clone(),
        locator: locator.target.clone(),
        created,
    }
}

fn describe_hint(hint: &LocateHint) -> String {
    let mut parts = Vec::new();
    if let Some(pid) = hint.process_id {
        parts.push(format!("pid {pid}"));
    }
    if let Some(tty) = &hint.tty {
        parts.push(format!("tty {tty}"));
    }
    if let Some(locator) = &hint.locator {
        parts.push(format!("locator {locator}"));
    }
    if parts.is_empty() {
        "no debugger visible to any transport".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_hint_lists_known_fields() {
        let hint = LocateHint {
            process_id: Some(42),
            tty: Some("pts/3".to_string()),
            ..Default::default()
        };
        assert_eq!(describe_hint(&hint), "pid 42, tty pts/3");
        assert_eq!(
            describe_hint(&LocateHint::default()),
            "no debugger visible to any transport"
        );
    }
}
