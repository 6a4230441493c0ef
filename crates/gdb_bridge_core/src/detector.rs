//! Blocking detector: runs one command through one transport using the
//! marker protocol and decides how it ended.
//!
//! ```text
//! Sent -> PollingForStart -> PollingForEnd -> Complete
//!              |                  |
//!              |                  +-> InterruptSent   (command may block)
//!              |                  +-> GaveUp          (command may not block)
//!              +-> liveness probe -> NonResponsive | GaveUp
//! ```
//!
//! The end marker is only written once the start marker is visible, so it
//! is never queued behind a debuggee that already took over the terminal.

use std::future::Future;
use std::time::Instant;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::command::Command;
use crate::config::BridgeConfig;
use crate::error::TransportError;
use crate::marker::{self, Extraction, MarkerGenerator, MarkerPair};
use crate::prompt::PromptPatterns;
use crate::transport::{SessionLocator, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Sent,
    PollingForStart,
    PollingForEnd,
    Complete,
    InterruptSent,
    GaveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Complete { output: String },
    /// The debuggee kept running and was interrupted. `partial` is whatever
    /// appeared after the start marker, not the command's real result.
    Interrupted { partial: String },
    /// Sent through a transport that cannot read output back.
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DetectFailure {
    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("transport did not echo a liveness probe")]
    NonResponsive,

    #[error("no response: end marker never appeared")]
    GaveUp,

    #[error("cancelled")]
    Cancelled,
}

impl DetectFailure {
    /// Whether the dispatcher should move on to the next transport.
    pub fn triggers_failover(&self) -> bool {
        !matches!(self, DetectFailure::Cancelled)
    }
}

pub struct Detector<'a> {
    transport: &'a dyn Transport,
    locator: &'a SessionLocator,
    config: &'a BridgeConfig,
    prompts: &'a PromptPatterns,
    markers: &'a MarkerGenerator,
    clock: &'a dyn Clock,
    cancel: &'a CancellationToken,
    state: DetectorState,
    history: Vec<DetectorState>,
}

impl<'a> Detector<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: &'a dyn Transport,
        locator: &'a SessionLocator,
        config: &'a BridgeConfig,
        prompts: &'a PromptPatterns,
        markers: &'a MarkerGenerator,
        clock: &'a dyn Clock,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            transport,
            locator,
            config,
            prompts,
            markers,
            clock,
            cancel,
            state: DetectorState::Sent,
            history: vec![DetectorState::Sent],
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    /// Every state visited, in order.
    pub fn history(&self) -> &[DetectorState] {
        &self.history
    }

    fn transition(&mut self, next: DetectorState) {
        debug!(transport = %self.transport.kind(), from = ?self.state, to = ?next, "Detector transition");
        self.state = next;
        self.history.push(next);
    }

    pub async fn run(&mut self, command: &Command) -> Result<ExecOutcome, DetectFailure> {
        if !self.transport.capability().can_capture {
            self.send(&command.text).await?;
            self.transition(DetectorState::Complete);
            return Ok(ExecOutcome::Delivered);
        }

        let pair = self.markers.make_markers();
        let deadline = self.clock.now() + command.timeout_budget;

        self.send(&marker::echo_line(&pair.start_token)).await?;
        self.send(&command.text).await?;
        self.transition(DetectorState::PollingForStart);

        let attempts = self.config.attempts_for(command.may_block);
        let mut buffer = String::new();
        let mut end_sent = false;

        for attempt in 0..attempts {
            if attempt > 0 && self.clock.now() >= deadline {
                debug!(attempt, "Command budget exhausted");
                break;
            }
            self.pause(self.config.poll_interval).await?;
            buffer = self.capture().await?;

            if self.state == DetectorState::PollingForStart && buffer.contains(&pair.start_token) {
                self.transition(DetectorState::PollingForEnd);
            }
            if self.state != DetectorState::PollingForEnd {
                debug!(attempt = attempt + 1, attempts, "Start marker not visible yet");
                continue;
            }

            if !end_sent {
                self.send(&marker::echo_line(&pair.end_token)).await?;
                end_sent = true;
                self.pause(self.config.settle_delay).await?;
                buffer = self.capture().await?;
            }

            if let Extraction::Complete(raw) = marker::extract(&buffer, &pair, &command.text) {
                self.transition(DetectorState::Complete);
                return Ok(ExecOutcome::Complete {
                    output: self.clean(&raw, &pair),
                });
            }
            debug!(attempt = attempt + 1, attempts, "End marker not visible yet");
        }

        let state = self.state;
        match state {
            DetectorState::PollingForStart => self.probe_liveness().await,
            _ if command.may_block => self.interrupt(command, &pair, &buffer).await,
            _ => {
                self.transition(DetectorState::GaveUp);
                Err(DetectFailure::GaveUp)
            }
        }
    }

    /// The start marker never showed up. A transport that cannot echo a
    /// disposable probe either is broken; otherwise the command was lost.
    async fn probe_liveness(&mut self) -> Result<ExecOutcome, DetectFailure> {
        let probe = self.markers.make_probe();
        self.send(&marker::echo_line(&probe)).await?;
        self.pause(self.config.settle_delay).await?;
        let buffer = self.capture().await?;

        self.transition(DetectorState::GaveUp);
        if buffer.contains(&probe) {
            warn!(transport = %self.transport.kind(), "Start marker missing although transport responds");
            Err(DetectFailure::GaveUp)
        } else {
            warn!(transport = %self.transport.kind(), "Transport failed liveness probe");
            Err(DetectFailure::NonResponsive)
        }
    }

    async fn interrupt(
        &mut self,
        command: &Command,
        pair: &MarkerPair,
        buffer: &str,
    ) -> Result<ExecOutcome, DetectFailure> {
        let partial = marker::partial_after_start(buffer, pair, &command.text)
            .map(|text| self.clean(text, pair))
            .unwrap_or_default();

        self.transition(DetectorState::InterruptSent);
        info!(transport = %self.transport.kind(), command = %command.text, "Debuggee is running; sending interrupt");

        if self.transport.capability().can_interrupt {
            if let Err(e) = self.call(|| self.transport.interrupt(self.locator)).await {
                if e == DetectFailure::Cancelled {
                    return Err(e);
                }
                warn!(error = %e, "Interrupt delivery failed");
            }
        }
        self.pause(self.config.interrupt_settle).await?;

        let sentinel = self.markers.make_interrupt_sentinel();
        if let Err(e) = self.send(&marker::echo_line(&sentinel)).await {
            if e == DetectFailure::Cancelled {
                return Err(e);
            }
            warn!(error = %e, "Failed to write post-interrupt sentinel");
        }

        Ok(ExecOutcome::Interrupted { partial })
    }

    fn clean(&self, raw: &str, pair: &MarkerPair) -> String {
        let end_echo = marker::echo_line(&pair.end_token);
        let without_echo: Vec<&str> = raw
            .lines()
            .filter(|line| !line.trim_end().ends_with(end_echo.as_str()))
            .collect();
        self.prompts.clean_output(&without_echo.join("\n"))
    }

    async fn send(&self, text: &str) -> Result<(), DetectFailure> {
        self.call(|| self.transport.send(self.locator, text)).await
    }

    async fn capture(&self) -> Result<String, DetectFailure> {
        self.call(|| self.transport.capture(self.locator)).await
    }

    async fn pause(&self, duration: std::time::Duration) -> Result<(), DetectFailure> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DetectFailure::Cancelled),
            _ = self.clock.sleep(duration) => Ok(()),
        }
    }

    /// Runs one transport call under the per-call deadline and the command's
    /// cancellation token. Timeouts are retried a bounded number of times.
    async fn call<T, F, Fut>(&self, op: F) -> Result<T, DetectFailure>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut retries = 0;
        loop {
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DetectFailure::Cancelled),
                result = timeout(self.config.call_timeout, op()) => result,
            };

            let err = match result {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(TransportError::Timeout(d))) => TransportError::Timeout(d),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => TransportError::Timeout(self.config.call_timeout),
            };

            if retries >= self.config.timeout_retries {
                return Err(err.into());
            }
            retries += 1;
            warn!(
                transport = %self.transport.kind(),
                elapsed = ?started.elapsed(),
                retry = retries,
                "Transport call timed out; retrying"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::{FakeBehavior, FakeTransport};
    use crate::transport::TransportKind;
    use std::time::Duration;

    struct Harness {
        config: BridgeConfig,
        prompts: PromptPatterns,
        markers: MarkerGenerator,
        clock: ManualClock,
        cancel: CancellationToken,
        locator: SessionLocator,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                config: BridgeConfig::default(),
                prompts: PromptPatterns::default(),
                markers: MarkerGenerator::new(),
                clock: ManualClock::new(),
                cancel: CancellationToken::new(),
                locator: SessionLocator::new(TransportKind::Multiplexer, "debug:0.0"),
            }
        }

        async fn run(&self, transport: &FakeTransport, text: &str) -> (Result<ExecOutcome, DetectFailure>, Vec<DetectorState>) {
            let command = Command::new(text, self.config.command_budget);
            let mut detector = Detector::new(
                transport,
                &self.locator,
                &self.config,
                &self.prompts,
                &self.markers,
                &self.clock,
                &self.cancel,
            );
            let result = detector.run(&command).await;
            (result, detector.history().to_vec())
        }
    }

    #[tokio::test]
    async fn completes_when_both_markers_appear() {
        let harness = Harness::new();
        let transport = FakeTransport::new(TransportKind::Multiplexer, FakeBehavior::Responsive {
            output: "x = 1\n(gdb)".to_string(),
        });

        let (result, history) = harness.run(&transport, "info locals").await;

        assert_eq!(result, Ok(ExecOutcome::Complete { output: "x = 1".to_string() }));
        assert_eq!(
            history,
            vec![
                DetectorState::Sent,
                DetectorState::PollingForStart,
                DetectorState::PollingForEnd,
                DetectorState::Complete,
            ]
        );
        assert_eq!(transport.capture_count(), 2);
    }

    #[tokio::test]
    async fn output_glued_to_prompt_without_echo_is_kept() {
        let harness = Harness::new();
        let transport = FakeTransport::new(TransportKind::DirectPipe, FakeBehavior::Responsive {
            output: "$1 = 42".to_string(),
        })
        .without_echo();

        let (result, _) = harness.run(&transport, "print x").await;
        assert_eq!(result, Ok(ExecOutcome::Complete { output: "$1 = 42".to_string() }));

        let transport = FakeTransport::new(TransportKind::DirectPipe, FakeBehavior::Responsive {
            output: "x = 1\ny = 2".to_string(),
        })
        .without_echo();

        let (result, _) = harness.run(&transport, "info locals").await;
        assert_eq!(result, Ok(ExecOutcome::Complete { output: "x = 1\ny = 2".to_string() }));
    }

    #[tokio::test]
    async fn end_marker_is_sent_only_after_start_is_visible() {
        let harness = Harness::new();
        let transport = FakeTransport::new(TransportKind::Multiplexer, FakeBehavior::Responsive {
            output: "ok".to_string(),
        });

        harness.run(&transport, "info frame").await.0.expect("command should complete");

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].starts_with("echo <<<GDB\\_OUTPUT_START_"));
        assert_eq!(sent[1], "info frame");
        assert!(sent[2].starts_with("echo <<<GDB\\_OUTPUT_END_"));
        assert_eq!(transport.sends_before_first_capture(), 2);
    }

    #[tokio::test]
    async fn blocking_command_without_end_marker_is_interrupted() {
        let harness = Harness::new();
        let transport = FakeTransport::new(TransportKind::Multiplexer, FakeBehavior::Blocks {
            partial: "Continuing.".to_string(),
        });
        let started = harness.clock.now();

        let (result, history) = harness.run(&transport, "continue").await;

        assert_eq!(
            result,
            Ok(ExecOutcome::Interrupted { partial: "Continuing.".to_string() })
        );
        assert_eq!(history.last(), Some(&DetectorState::InterruptSent));
        assert_eq!(transport.interrupt_count(), 1);
        assert_eq!(transport.capture_count(), 4, "three polls plus one after the end marker");
        assert!(harness.clock.now() - started >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn finish_that_keeps_running_is_interrupted() {
        let harness = Harness::new();
        let transport = FakeTransport::new(TransportKind::Multiplexer, FakeBehavior::Blocks {
            partial: "Run till exit from #0  read_input ()".to_string(),
        });

        let (result, history) = harness.run(&transport, "finish").await;

        assert_eq!(
            result,
            Ok(ExecOutcome::Interrupted {
                partial: "Run till exit from #0  read_input ()".to_string()
            })
        );
        assert_eq!(history.last(), Some(&DetectorState::InterruptSent));
        assert_eq!(transport.interrupt_count(), 1);
    }

    #[tokio::test]
    async fn non_blocking_command_gives_up_without_interrupt() {
        let harness = Harness::new();
        let transport = FakeTransport::new(TransportKind::Multiplexer, FakeBehavior::Blocks {
            partial: "still thinking".to_string(),
        });

        let (result, history) = harness.run(&transport, "info sharedlibrary").await;

        assert_eq!(result, Err(DetectFailure::GaveUp));
        assert!(!history.contains(&DetectorState::InterruptSent));
        assert_eq!(history.last(), Some(&DetectorState::GaveUp));
        assert_eq!(transport.interrupt_count(), 0);
    }

    #[tokio::test]
    async fn missing_start_and_failed_probe_is_non_responsive() {
        let harness = Harness::new();
        let transport = FakeTransport::new(TransportKind::Multiplexer, FakeBehavior::Silent);

        let (result, _) = harness.run(&transport, "continue").await;

        assert_eq!(result, Err(DetectFailure::NonResponsive));
        assert_eq!(transport.interrupt_count(), 0);
    }

    #[tokio::test]
    async fn non_timeout_transport_errors_are_not_retried() {
        let harness = Harness::new();
        let transport = FakeTransport::new(
            TransportKind::Multiplexer,
            FakeBehavior::Fails(TransportError::BackendMissing("tmux".to_string())),
        );

        let (result, _) = harness.run(&transport, "bt").await;

        assert_eq!(
            result,
            Err(DetectFailure::Transport(TransportError::BackendMissing("tmux".to_string())))
        );
        assert_eq!(transport.send_count(), 1);
    }

    #[tokio::test]
    async fn timed_out_calls_are_retried_then_reported() {
        let mut harness = Harness::new();
        harness.config.call_timeout = Duration::from_millis(10);
        harness.config.timeout_retries = 2;
        let transport = FakeTransport::new(TransportKind::Multiplexer, FakeBehavior::Hangs);

        let (result, _) = harness.run(&transport, "bt").await;

        assert_eq!(
            result,
            Err(DetectFailure::Transport(TransportError::Timeout(Duration::from_millis(10))))
        );
        assert_eq!(transport.send_count(), 3);
    }

    #[tokio::test]
    async fn keystroke_transport_only_delivers() {
        let harness = Harness::new();
        let transport = FakeTransport::new(TransportKind::Keystroke, FakeBehavior::Responsive {
            output: String::new(),
        })
        .without_capture();

        let (result, _) = harness.run(&transport, "continue").await;

        assert_eq!(result, Ok(ExecOutcome::Delivered));
        assert_eq!(transport.sent(), vec!["continue".to_string()]);
        assert_eq!(transport.capture_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        let harness = Harness::new();
        harness.cancel.cancel();
        let transport = FakeTransport::new(TransportKind::Multiplexer, FakeBehavior::Responsive {
            output: "x".to_string(),
        });

        let (result, _) = harness.run(&transport, "bt").await;

        assert_eq!(result, Err(DetectFailure::Cancelled));
        assert_eq!(transport.send_count(), 0);
    }
}
