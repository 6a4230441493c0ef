use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use super::external::{self, applescript_string};
use super::{LocateHint, Platform, SessionLocator, Transport, TransportCapability, TransportKind};
use crate::error::TransportError;

const XDOTOOL: &str = "xdotool";
const OSASCRIPT: &str = "osascript";

/// Types into whatever window has keyboard focus. Output cannot be read
/// back, so success only means the keystrokes were delivered.
pub struct KeystrokeTransport {
    platform: Platform,
    call_timeout: Duration,
}

impl KeystrokeTransport {
    pub fn new(platform: Platform, call_timeout: Duration) -> Self {
        Self {
            platform,
            call_timeout,
        }
    }

    async fn system_events(&self, body: &str) -> Result<String, TransportError> {
        let script = format!("tell application \"System Events\"\n{body}\nend tell");
        external::run(OSASCRIPT, &["-e", &script], self.call_timeout).await
    }

    async fn xdotool(&self, args: &[&str]) -> Result<String, TransportError> {
        external::run(XDOTOOL, args, self.call_timeout).await
    }

    async fn focused_window(&self) -> Result<String, TransportError> {
        if self.platform == Platform::MacOs {
            let name = self
                .system_events("return name of first process whose frontmost is true")
                .await?;
            Ok(format!("app:{}", name.trim()))
        } else {
            let id = self.xdotool(&["getactivewindow"]).await?;
            Ok(format!("window:{}", id.trim()))
        }
    }
}

#[async_trait]
impl Transport for KeystrokeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Keystroke
    }

    fn capability(&self) -> TransportCapability {
        TransportCapability {
            can_capture: false,
            can_interrupt: true,
            platform_applicable: Platform::is_unix,
        }
    }

    /// Only used for a debugger process the listing has confirmed; without
    /// one the focused window could be anything.
    async fn locate(&self, hint: &LocateHint) -> Option<SessionLocator> {
        if !hint.process_confirmed {
            debug!("No confirmed debugger process; not typing into the focused window");
            return None;
        }
        match self.focused_window().await {
            Ok(target) => {
                debug!(target = %target, "Keystrokes will go to the focused window");
                Some(
                    SessionLocator::new(TransportKind::Keystroke, target)
                        .with_process(hint.process_id, hint.tty.clone()),
                )
            }
            Err(e) => {
                warn!(error = %e, "No focused window for keystroke injection");
                None
            }
        }
    }

    async fn send(&self, _locator: &SessionLocator, text: &str) -> Result<(), TransportError> {
        if self.platform == Platform::MacOs {
            // Escape first clears any pending input-method composition.
            self.system_events(&format!(
                "key code 53\ndelay 0.1\nkeystroke {}\nkeystroke return",
                applescript_string(text)
            ))
            .await?;
        } else {
            self.xdotool(&["key", "Escape"]).await?;
            self.xdotool(&["type", "--delay", "1", "--", text]).await?;
            self.xdotool(&["key", "Return"]).await?;
        }
        Ok(())
    }

    async fn capture(&self, _locator: &SessionLocator) -> Result<String, TransportError> {
        Err(TransportError::Unsupported("capture"))
    }

    async fn interrupt(&self, _locator: &SessionLocator) -> Result<(), TransportError> {
        if self.platform == Platform::MacOs {
            self.system_events("keystroke \"c\" using control down").await?;
        } else {
            self.xdotool(&["key", "ctrl+c"]).await?;
        }
        Ok(())
    }
}
