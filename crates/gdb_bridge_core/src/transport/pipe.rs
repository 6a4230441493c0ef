use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::external;
use super::{LocateHint, Platform, SessionLocator, Transport, TransportCapability, TransportKind};
use crate::config::BridgeConfig;
use crate::error::TransportError;
use crate::prompt::PromptPatterns;

const MAX_BUFFER_BYTES: usize = 1024 * 1024;
const CAPTURE_PROMPT_WAIT: Duration = Duration::from_millis(500);
const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(20);
const STARTUP_PROMPT_WAIT: Duration = Duration::from_secs(5);
const INTERRUPT_TIMEOUT: Duration = Duration::from_secs(2);

struct PipeProcess {
    pid: u32,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    buffer: Arc<StdMutex<String>>,
    readers: Vec<JoinHandle<()>>,
}

impl PipeProcess {
    fn snapshot(&self) -> String {
        self.buffer
            .lock()
            .map(|b| b.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    async fn is_running(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn shutdown(&self) {
        for reader in &self.readers {
            reader.abort();
        }
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

/// Owns debugger processes spawned by this bridge and talks to them over
/// their stdio pipes. The only transport whose output is read directly
/// rather than scraped from a terminal.
pub struct PipeTransport {
    gdb_binary: String,
    prompts: PromptPatterns,
    processes: Mutex<HashMap<String, Arc<PipeProcess>>>,
    launch_order: StdMutex<Vec<String>>,
}

impl PipeTransport {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            gdb_binary: config.gdb_binary.clone(),
            prompts: PromptPatterns::new(config.prompt_patterns.clone()),
            processes: Mutex::new(HashMap::new()),
            launch_order: StdMutex::new(Vec::new()),
        }
    }

    /// Starts the configured debugger in quiet mode, optionally loading
    /// `executable`, and waits for its first prompt.
    pub async fn launch_debugger(&self, executable: Option<&str>) -> Result<SessionLocator, TransportError> {
        let mut args = vec!["-q"];
        if let Some(executable) = executable {
            args.push(executable);
        }
        let gdb = self.gdb_binary.clone();
        self.spawn_process(&gdb, &args).await
    }

    pub async fn spawn_process(&self, program: &str, args: &[&str]) -> Result<SessionLocator, TransportError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| external::spawn_error(program, e))?;

        let pid = child
            .id()
            .ok_or_else(|| TransportError::Unreachable(format!("{program} exited during spawn")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Unreachable(format!("{program}: missing stdin pipe")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Unreachable(format!("{program}: missing stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Unreachable(format!("{program}: missing stderr pipe")))?;

        let buffer = Arc::new(StdMutex::new(String::new()));
        let readers = vec![
            tokio::spawn(pump_output(stdout, buffer.clone())),
            tokio::spawn(pump_output(stderr, buffer.clone())),
        ];

        let process = Arc::new(PipeProcess {
            pid,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            buffer,
            readers,
        });

        let key = format!("pipe:{pid}");
        info!(program = %program, pid, "Spawned debugger over stdio pipes");

        self.wait_for_startup(&process, program).await?;

        self.processes.lock().await.insert(key.clone(), process);
        self.launch_order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.clone());

        Ok(SessionLocator::new(TransportKind::DirectPipe, key).with_process(Some(pid), None))
    }

    async fn wait_for_startup(&self, process: &Arc<PipeProcess>, program: &str) -> Result<(), TransportError> {
        let started = Instant::now();
        loop {
            if !process.is_running().await {
                let output = process.snapshot();
                process.shutdown().await;
                return Err(TransportError::Unreachable(format!(
                    "{program} exited during startup: {}",
                    output.trim()
                )));
            }
            if self.prompts.ends_with_prompt(&process.snapshot()) {
                return Ok(());
            }
            if started.elapsed() >= STARTUP_PROMPT_WAIT {
                warn!(program = %program, "No prompt seen during startup; continuing");
                return Ok(());
            }
            sleep(CAPTURE_POLL_INTERVAL).await;
        }
    }

    async fn process(&self, locator: &SessionLocator) -> Result<Arc<PipeProcess>, TransportError> {
        self.processes
            .lock()
            .await
            .get(&locator.target)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(format!("no spawned debugger {}", locator.target)))
    }

    async fn write(&self, locator: &SessionLocator, bytes: &[u8]) -> Result<(), TransportError> {
        let process = self.process(locator).await?;
        let mut stdin = process.stdin.lock().await;
        stdin
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::Unreachable(format!("write to {} failed: {e}", locator.target)))?;
        stdin
            .flush()
            .await
            .map_err(|e| TransportError::Unreachable(format!("flush to {} failed: {e}", locator.target)))
    }

    /// Drops processes that have exited.
    async fn reap(&self) {
        let mut processes = self.processes.lock().await;
        let mut dead = Vec::new();
        for (key, process) in processes.iter() {
            if !process.is_running().await {
                dead.push(key.clone());
            }
        }
        for key in dead {
            if let Some(process) = processes.remove(&key) {
                debug!(key = %key, "Reaping exited debugger");
                process.shutdown().await;
            }
        }
        let mut order = self.launch_order.lock().unwrap_or_else(|e| e.into_inner());
        order.retain(|k| processes.contains_key(k));
    }

    pub async fn shutdown_all(&self) {
        let mut processes = self.processes.lock().await;
        for (_, process) in processes.drain() {
            process.shutdown().await;
        }
        self.launch_order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

async fn pump_output<R: AsyncRead + Unpin>(mut reader: R, buffer: Arc<StdMutex<String>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]);
                let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
                push_bounded(&mut buffer, &text);
            }
            Err(e) => {
                warn!(error = %e, "Debugger pipe read failed");
                break;
            }
        }
    }
}

/// Appends `text`, dropping the oldest bytes once the buffer exceeds
/// `MAX_BUFFER_BYTES`.
fn push_bounded(buffer: &mut String, text: &str) {
    buffer.push_str(text);
    if buffer.len() > MAX_BUFFER_BYTES {
        let mut cut = buffer.len() - MAX_BUFFER_BYTES;
        while !buffer.is_char_boundary(cut) {
            cut += 1;
        }
        buffer.drain(..cut);
    }
}

#[async_trait]
impl Transport for PipeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::DirectPipe
    }

    fn capability(&self) -> TransportCapability {
        TransportCapability {
            can_capture: true,
            can_interrupt: cfg!(unix),
            platform_applicable: Platform::any,
        }
    }

    async fn locate(&self, hint: &LocateHint) -> Option<SessionLocator> {
        self.reap().await;
        let processes = self.processes.lock().await;

        let key = if let Some(wanted) = hint.locator.as_deref() {
            processes.contains_key(wanted).then(|| wanted.to_string())
        } else if let Some(pid) = hint.process_id {
            processes
                .iter()
                .find(|(_, p)| p.pid == pid)
                .map(|(key, _)| key.clone())
        } else if hint.tty.is_none() {
            self.launch_order
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .last()
                .cloned()
        } else {
            None
        };
        let key = key?;

        let pid = processes.get(&key).map(|p| p.pid);
        Some(SessionLocator::new(TransportKind::DirectPipe, key).with_process(pid, None))
    }

    async fn send(&self, locator: &SessionLocator, text: &str) -> Result<(), TransportError> {
        let mut line = text.to_string();
        line.push('\n');
        self.write(locator, line.as_bytes()).await
    }

    async fn capture(&self, locator: &SessionLocator) -> Result<String, TransportError> {
        let process = self.process(locator).await?;
        let started = Instant::now();
        loop {
            let snapshot = process.snapshot();
            if self.prompts.ends_with_prompt(&snapshot) || started.elapsed() >= CAPTURE_PROMPT_WAIT {
                return Ok(snapshot);
            }
            if !process.is_running().await {
                return Err(TransportError::Unreachable(format!("{} has exited", locator.target)));
            }
            sleep(CAPTURE_POLL_INTERVAL).await;
        }
    }

    async fn interrupt(&self, locator: &SessionLocator) -> Result<(), TransportError> {
        if !cfg!(unix) {
            return Err(TransportError::Unsupported("interrupt"));
        }
        // A control byte on a pipe is just input; the debugger only stops
        // the inferior on a real SIGINT.
        let process = self.process(locator).await?;
        let pid = process.pid.to_string();
        external::run("kill", &["-INT", &pid], INTERRUPT_TIMEOUT).await?;
        Ok(())
    }
}
