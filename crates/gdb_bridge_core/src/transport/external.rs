//! Running the external helper programs (`tmux`, `osascript`, `xdotool`,
//! `ps`) that the terminal backends are built on.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::TransportError;

/// Runs `program` with `args` and returns its stdout.
///
/// A missing binary maps to `BackendMissing`, a non-zero exit to
/// `Unreachable` carrying stderr, and an overrun of `deadline` to `Timeout`.
/// The child is killed if the deadline expires.
pub async fn run(program: &str, args: &[&str], deadline: Duration) -> Result<String, TransportError> {
    let mut cmd = Command::new(program);
    cmd.kill_on_drop(true);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = cmd.spawn().map_err(|e| spawn_error(program, e))?;

    let output = match timeout(deadline, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(TransportError::Unreachable(format!("{program}: {e}"))),
        Err(_) => return Err(TransportError::Timeout(deadline)),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let details = if stderr.trim().is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr.trim().to_string()
        };
        return Err(TransportError::Unreachable(format!("{program}: {details}")));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub fn spawn_error(program: &str, e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::NotFound {
        TransportError::BackendMissing(program.to_string())
    } else {
        TransportError::Unreachable(format!("{program}: {e}"))
    }
}

/// Quotes `s` as an AppleScript string literal.
pub fn applescript_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}
