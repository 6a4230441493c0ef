//! Scriptable in-memory transport and process source for exercising the
//! detector and dispatcher without a terminal.
//!
//! [`FakeTransport`] behaves like a terminal running a debugger: typed lines
//! are echoed after a `(gdb) ` prompt and `echo` lines print their token
//! unless the simulated debuggee is running. [`FakeTransport::without_echo`]
//! models a debugger on pipes instead, where input is never echoed and each
//! prompt is followed directly by the next output.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::TransportError;
use crate::processes::{DebuggerProcess, ProcessSource};
use crate::transport::{
    LocateHint, Platform, SessionLocator, Transport, TransportCapability, TransportKind,
};

#[derive(Debug, Clone)]
pub enum FakeBehavior {
    /// Every command prints `output` and returns to the prompt.
    Responsive { output: String },
    /// The first non-echo command prints `partial` and leaves the debuggee
    /// running until an interrupt arrives.
    Blocks { partial: String },
    /// Accepts input but never prints anything.
    Silent,
    /// Every call fails with this error.
    Fails(TransportError),
    /// Every call hangs until the caller's deadline.
    Hangs,
}

#[derive(Debug, Default)]
struct Screen {
    buffer: String,
    running: bool,
    sent: Vec<String>,
    sends_before_first_capture: Option<usize>,
}

pub struct FakeTransport {
    kind: TransportKind,
    behavior: FakeBehavior,
    can_capture: bool,
    echoes_input: bool,
    locatable: bool,
    screen: Mutex<Screen>,
    gate: Mutex<Option<Arc<Notify>>>,
    sends: AtomicUsize,
    captures: AtomicUsize,
    interrupts: AtomicUsize,
}

impl FakeTransport {
    pub fn new(kind: TransportKind, behavior: FakeBehavior) -> Self {
        Self {
            kind,
            behavior,
            can_capture: true,
            echoes_input: true,
            locatable: true,
            screen: Mutex::new(Screen::default()),
            gate: Mutex::new(None),
            sends: AtomicUsize::new(0),
            captures: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
        }
    }

    pub fn without_capture(mut self) -> Self {
        self.can_capture = false;
        self
    }

    pub fn without_echo(mut self) -> Self {
        self.echoes_input = false;
        self
    }

    /// `locate` will report nothing, as if the backend were not running.
    pub fn unlocatable(mut self) -> Self {
        self.locatable = false;
        self
    }

    /// The first `send` waits until `gate` is notified.
    pub fn gated(self, gate: Arc<Notify>) -> Self {
        *self.gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(gate);
        self
    }

    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.screen().sent.clone()
    }

    /// How many lines had been written when the buffer was first read.
    pub fn sends_before_first_capture(&self) -> usize {
        self.screen().sends_before_first_capture.unwrap_or(0)
    }

    fn screen(&self) -> std::sync::MutexGuard<'_, Screen> {
        self.screen.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn misbehave(&self) -> Result<(), TransportError> {
        match &self.behavior {
            FakeBehavior::Fails(e) => Err(e.clone()),
            FakeBehavior::Hangs => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(TransportError::Timeout(Duration::from_secs(3600)))
            }
            _ => Ok(()),
        }
    }

    fn type_line(&self, text: &str) {
        let mut screen = self.screen();
        screen.sent.push(text.to_string());

        if screen.running {
            if self.echoes_input {
                screen.buffer.push_str(text);
                screen.buffer.push('\n');
            }
            return;
        }
        if matches!(self.behavior, FakeBehavior::Silent) {
            return;
        }

        screen.buffer.push_str("(gdb) ");
        if self.echoes_input {
            screen.buffer.push_str(text);
            screen.buffer.push('\n');
        }

        if let Some(token) = text
            .strip_prefix("echo ")
            .and_then(|rest| rest.strip_suffix("\\n"))
        {
            let printed = token.replace("\\_", "_");
            screen.buffer.push_str(&printed);
            screen.buffer.push('\n');
            return;
        }

        match &self.behavior {
            FakeBehavior::Responsive { output } => {
                screen.buffer.push_str(output);
                screen.buffer.push('\n');
            }
            FakeBehavior::Blocks { partial } => {
                screen.buffer.push_str(partial);
                screen.buffer.push('\n');
                screen.running = true;
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn capability(&self) -> TransportCapability {
        TransportCapability {
            can_capture: self.can_capture,
            can_interrupt: true,
            platform_applicable: Platform::any,
        }
    }

    async fn locate(&self, hint: &LocateHint) -> Option<SessionLocator> {
        if !self.locatable {
            return None;
        }
        let target = hint
            .locator
            .clone()
            .unwrap_or_else(|| format!("{}:0", self.kind));
        Some(SessionLocator::new(self.kind, target).with_process(hint.process_id, hint.tty.clone()))
    }

    async fn send(&self, _locator: &SessionLocator, text: &str) -> Result<(), TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.misbehave().await?;
        self.type_line(text);
        Ok(())
    }

    async fn capture(&self, _locator: &SessionLocator) -> Result<String, TransportError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        self.misbehave().await?;
        let mut screen = self.screen();
        if screen.sends_before_first_capture.is_none() {
            screen.sends_before_first_capture = Some(screen.sent.len());
        }
        Ok(screen.buffer.clone())
    }

    async fn interrupt(&self, _locator: &SessionLocator) -> Result<(), TransportError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        self.misbehave().await?;
        let mut screen = self.screen();
        if screen.running {
            screen.running = false;
            screen.buffer.push_str("^C\nProgram received signal SIGINT, Interrupt.\n");
        }
        Ok(())
    }
}

/// Process listing that returns a fixed set of debuggers.
#[derive(Debug, Default, Clone)]
pub struct StaticProcesses(pub Vec<DebuggerProcess>);

#[async_trait]
impl ProcessSource for StaticProcesses {
    async fn list(&self) -> Result<Vec<DebuggerProcess>, TransportError> {
        Ok(self.0.clone())
    }
}
