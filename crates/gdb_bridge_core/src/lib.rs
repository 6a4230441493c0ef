//! GDB Bridge Core
//!
//! Drives a debugger that lives in someone's terminal. Commands go in through
//! whichever transport can reach the session (spawned pipes, iTerm2, tmux or
//! raw keystrokes) and output comes back delimited by printed markers, with
//! detection of commands that leave the debuggee running.

pub mod clock;
pub mod command;
pub mod config;
pub mod detector;
pub mod dispatcher;
pub mod error;
pub mod marker;
pub mod processes;
pub mod prompt;
pub mod registry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use config::BridgeConfig;
pub use dispatcher::{AttachRequest, Dispatcher};
pub use error::{BridgeError, TransportError};
pub use transport::{Platform, TransportKind};

/// Result type alias using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;
