//! Backends that move text into and out of a terminal-hosted debugger.
//!
//! Each backend implements [`Transport`]. The dispatcher never branches on
//! the platform itself: it walks a [`TransportSet`] built once at startup in
//! platform priority order.

pub mod external;
pub mod iterm;
pub mod keystroke;
pub mod pipe;
pub mod tmux;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::config::BridgeConfig;
use crate::error::TransportError;
use crate::prompt::PromptPatterns;

pub use iterm::ItermTransport;
pub use keystroke::KeystrokeTransport;
pub use pipe::PipeTransport;
pub use tmux::TmuxTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    DirectPipe,
    TerminalScripting,
    Multiplexer,
    Keystroke,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::DirectPipe => "pipe",
            TransportKind::TerminalScripting => "iterm",
            TransportKind::Multiplexer => "tmux",
            TransportKind::Keystroke => "keystroke",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    MacOs,
    Linux,
    OtherUnix,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(unix) {
            Platform::OtherUnix
        } else {
            Platform::Other
        }
    }

    pub fn is_unix(self) -> bool {
        matches!(self, Platform::MacOs | Platform::Linux | Platform::OtherUnix)
    }

    pub fn is_macos(platform: Platform) -> bool {
        platform == Platform::MacOs
    }

    pub fn any(_platform: Platform) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TransportCapability {
    pub can_capture: bool,
    pub can_interrupt: bool,
    #[serde(skip)]
    pub platform_applicable: fn(Platform) -> bool,
}

/// Backend-specific address of a located debugger session: a pane name, a
/// terminal session id, a spawned-process key or a focused window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionLocator {
    pub kind: TransportKind,
    pub target: String,
    pub process_id: Option<u32>,
    pub tty: Option<String>,
}

impl SessionLocator {
    pub fn new(kind: TransportKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            process_id: None,
            tty: None,
        }
    }

    pub fn with_process(mut self, process_id: Option<u32>, tty: Option<String>) -> Self {
        self.process_id = process_id;
        self.tty = tty;
        self
    }
}

/// What the caller knows about the debugger it wants to reach.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocateHint {
    pub process_id: Option<u32>,
    pub tty: Option<String>,
    /// Backend-specific locator such as a tmux target or an iTerm session id.
    pub locator: Option<String>,
    /// Set when `process_id` was found in the debugger process listing.
    pub process_confirmed: bool,
}

impl LocateHint {
    pub fn is_empty(&self) -> bool {
        self.process_id.is_none() && self.tty.is_none() && self.locator.is_none()
    }

    /// Whether a tty reported by a backend refers to the hinted one. `ps`
    /// prints `pts/3` where terminals report `/dev/pts/3`.
    pub fn matches_tty(&self, tty: &str) -> bool {
        match &self.tty {
            Some(wanted) => normalize_tty(wanted) == normalize_tty(tty),
            None => false,
        }
    }
}

pub fn normalize_tty(tty: &str) -> &str {
    tty.trim().trim_start_matches("/dev/")
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn capability(&self) -> TransportCapability;

    /// Finds a debugger session this backend can reach. `None` means the
    /// backend is not applicable right now, which is not an error.
    async fn locate(&self, hint: &LocateHint) -> Option<SessionLocator>;

    async fn send(&self, locator: &SessionLocator, text: &str) -> Result<(), TransportError>;

    async fn capture(&self, locator: &SessionLocator) -> Result<String, TransportError>;

    /// Fire-and-forget; safe to call more than once.
    async fn interrupt(&self, locator: &SessionLocator) -> Result<(), TransportError>;
}

/// Transports in platform priority order, owned by the dispatcher.
#[derive(Clone)]
pub struct TransportSet {
    platform: Platform,
    transports: Vec<Arc<dyn Transport>>,
}

impl TransportSet {
    pub fn new(platform: Platform, transports: Vec<Arc<dyn Transport>>) -> Self {
        let transports = transports
            .into_iter()
            .filter(|t| (t.capability().platform_applicable)(platform))
            .collect();
        Self {
            platform,
            transports,
        }
    }

    /// The default backends for `platform`, most trustworthy first.
    pub fn for_platform(platform: Platform, config: &BridgeConfig, pipe: Arc<PipeTransport>) -> Self {
        let prompts = PromptPatterns::new(config.prompt_patterns.clone());
        let transports: Vec<Arc<dyn Transport>> = vec![
            pipe as Arc<dyn Transport>,
            Arc::new(ItermTransport::new(prompts, config.call_timeout)),
            Arc::new(TmuxTransport::new(config.tmux_binary.clone(), config.call_timeout)),
            Arc::new(KeystrokeTransport::new(platform, config.call_timeout)),
        ];
        Self::new(platform, transports)
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn get(&self, kind: TransportKind) -> Option<&Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.kind() == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Transport>> {
        self.transports.iter()
    }

    pub fn kinds(&self) -> Vec<TransportKind> {
        self.transports.iter().map(|t| t.kind()).collect()
    }

    /// Priority order starting at `first`, followed by every other transport
    /// in its usual position.
    pub fn order_from(&self, first: Option<TransportKind>) -> Vec<Arc<dyn Transport>> {
        let mut ordered: Vec<Arc<dyn Transport>> = Vec::with_capacity(self.transports.len());
        if let Some(t) = first.and_then(|kind| self.get(kind)) {
            ordered.push(t.clone());
        }
        for t in &self.transports {
            if Some(t.kind()) != first {
                ordered.push(t.clone());
            }
        }
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds_for(platform: Platform) -> Vec<TransportKind> {
        let config = BridgeConfig::default();
        let pipe = Arc::new(PipeTransport::new(&config));
        TransportSet::for_platform(platform, &config, pipe).kinds()
    }

    #[test]
    fn macos_priority_prefers_terminal_scripting_over_tmux() {
        assert_eq!(
            kinds_for(Platform::MacOs),
            vec![
                TransportKind::DirectPipe,
                TransportKind::TerminalScripting,
                TransportKind::Multiplexer,
                TransportKind::Keystroke,
            ]
        );
    }

    #[test]
    fn linux_priority_skips_terminal_scripting() {
        assert_eq!(
            kinds_for(Platform::Linux),
            vec![
                TransportKind::DirectPipe,
                TransportKind::Multiplexer,
                TransportKind::Keystroke,
            ]
        );
    }

    #[test]
    fn other_platforms_only_get_the_direct_pipe() {
        assert_eq!(kinds_for(Platform::Other), vec![TransportKind::DirectPipe]);
    }

    #[test]
    fn order_from_moves_preferred_transport_first() {
        let config = BridgeConfig::default();
        let pipe = Arc::new(PipeTransport::new(&config));
        let set = TransportSet::for_platform(Platform::Linux, &config, pipe);
        let order: Vec<_> = set
            .order_from(Some(TransportKind::Multiplexer))
            .iter()
            .map(|t| t.kind())
            .collect();
        assert_eq!(
            order,
            vec![
                TransportKind::Multiplexer,
                TransportKind::DirectPipe,
                TransportKind::Keystroke,
            ]
        );
    }

    #[test]
    fn hint_tty_matching_normalizes_dev_prefix() {
        let hint = LocateHint {
            tty: Some("pts/3".to_string()),
            ..Default::default()
        };
        assert!(hint.matches_tty("/dev/pts/3"));
        assert!(!hint.matches_tty("/dev/pts/30"));
        assert!(!LocateHint::default().matches_tty("/dev/pts/3"));
    }
}
