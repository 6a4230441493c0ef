use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use super::external::{self, applescript_string};
use super::{LocateHint, Platform, SessionLocator, Transport, TransportCapability, TransportKind};
use crate::error::TransportError;
use crate::prompt::PromptPatterns;

const OSASCRIPT: &str = "osascript";

/// Drives iTerm2 sessions through AppleScript, addressing each by its
/// session id.
pub struct ItermTransport {
    prompts: PromptPatterns,
    call_timeout: Duration,
}

impl ItermTransport {
    pub fn new(prompts: PromptPatterns, call_timeout: Duration) -> Self {
        Self {
            prompts,
            call_timeout,
        }
    }

    async fn osascript(&self, script: &str) -> Result<String, TransportError> {
        external::run(OSASCRIPT, &["-e", script], self.call_timeout).await
    }

    fn locate_condition(&self, hint: &LocateHint) -> Option<String> {
        if let Some(id) = hint.locator.as_deref() {
            return Some(format!("(id of aSession) is {}", applescript_string(id)));
        }
        if let Some(tty) = hint.tty.as_deref() {
            let tty = format!("/dev/{}", super::normalize_tty(tty));
            return Some(format!("(tty of aSession) is {}", applescript_string(&tty)));
        }
        // Sessions are only addressable by tty; a prompt search could pick
        // another debugger than the requested process.
        if hint.process_id.is_some() || self.prompts.patterns().is_empty() {
            return None;
        }
        Some(
            self.prompts
                .patterns()
                .iter()
                .map(|p| format!("sessionText contains {}", applescript_string(p)))
                .collect::<Vec<_>>()
                .join(" or "),
        )
    }
}

/// Walks every session of every tab and runs `body` on the first one for
/// which `condition` holds. `body` refers to the session as `aSession`.
fn for_each_session(condition: &str, body: &str, fallback: &str) -> String {
    format!(
        r#"tell application "iTerm2"
    repeat with aWindow in windows
        repeat with aTab in tabs of aWindow
            repeat with aSession in sessions of aTab
                try
                    set sessionText to text of aSession
                on error
                    set sessionText to ""
                end try
                if {condition} then
                    {body}
                end if
            end repeat
        end repeat
    end repeat
    {fallback}
end tell"#
    )
}

fn session_script(session_id: &str, body: &str) -> String {
    for_each_session(
        &format!("(id of aSession) is {}", applescript_string(session_id)),
        body,
        r#"error "iTerm2 session not found""#,
    )
}

fn locate_script(condition: &str) -> String {
    for_each_session(
        condition,
        "return (id of aSession) & tab & (tty of aSession)",
        r#"return """#,
    )
}

fn write_script(session_id: &str, text: &str) -> String {
    session_script(
        session_id,
        &format!(
            "tell aSession to write text {}\n                    return \"ok\"",
            applescript_string(text)
        ),
    )
}

fn capture_script(session_id: &str) -> String {
    session_script(session_id, "return sessionText")
}

fn interrupt_script(session_id: &str) -> String {
    session_script(
        session_id,
        "tell aSession to write text (character id 3) newline no\n                    return \"ok\"",
    )
}

fn parse_locate_output(output: &str) -> Option<(String, Option<String>)> {
    let line = output.trim();
    if line.is_empty() {
        return None;
    }
    let (id, tty) = match line.split_once('\t') {
        Some((id, tty)) => (id.trim(), Some(tty.trim()).filter(|t| !t.is_empty())),
        None => (line, None),
    };
    Some((id.to_string(), tty.map(String::from)))
}

#[async_trait]
impl Transport for ItermTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::TerminalScripting
    }

    fn capability(&self) -> TransportCapability {
        TransportCapability {
            can_capture: true,
            can_interrupt: true,
            platform_applicable: Platform::is_macos,
        }
    }

    async fn locate(&self, hint: &LocateHint) -> Option<SessionLocator> {
        let condition = self.locate_condition(hint)?;
        let output = match self.osascript(&locate_script(&condition)).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "iTerm2 session search failed");
                return None;
            }
        };

        let (id, tty) = parse_locate_output(&output)?;
        debug!(session = %id, tty = ?tty, "Located iTerm2 session");
        Some(
            SessionLocator::new(TransportKind::TerminalScripting, id)
                .with_process(hint.process_id, tty),
        )
    }

    async fn send(&self, locator: &SessionLocator, text: &str) -> Result<(), TransportError> {
        self.osascript(&write_script(&locator.target, text)).await?;
        Ok(())
    }

    async fn capture(&self, locator: &SessionLocator) -> Result<String, TransportError> {
        self.osascript(&capture_script(&locator.target)).await
    }

    async fn interrupt(&self, locator: &SessionLocator) -> Result<(), TransportError> {
        self.osascript(&interrupt_script(&locator.target)).await?;
        Ok(())
    }
}
