use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportKind;

/// Failure of a single transport call. Never surfaced to the caller directly:
/// the dispatcher logs it and fails over to the next transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Backend program '{0}' is not installed")]
    BackendMissing(String),

    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Transport call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation '{0}' is not supported by this transport")]
    Unsupported(&'static str),
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("No debugger session found: {0}")]
    SessionNotFound(String),

    #[error("Unknown session id: {0}")]
    UnknownSession(String),

    #[error("Session {0} is busy with another command")]
    SessionBusy(String),

    #[error("Transport {transport} did not respond to a liveness probe")]
    NonResponsive { transport: TransportKind },

    #[error("All transports failed after {attempts} attempt(s); last error: {last}")]
    AllTransportsFailed { attempts: usize, last: String },

    #[error("Command was cancelled")]
    Cancelled,

    #[error("Command task failed: {0}")]
    TaskFailed(String),

    #[error("Failed to launch debugger: {0}")]
    Launch(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn all_failed(attempts: usize, last: impl Into<String>) -> Self {
        Self::AllTransportsFailed {
            attempts,
            last: last.into(),
        }
    }

    /// Whether the caller may simply retry the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SessionBusy(_) | Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_failed_construction() {
        let err = BridgeError::all_failed(3, "tmux: Backend program 'tmux' is not installed");
        match err {
            BridgeError::AllTransportsFailed { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.contains("tmux"));
            }
            _ => panic!("Expected AllTransportsFailed variant"),
        }
    }

    #[test]
    fn test_error_display_messages() {
        let timeout_err = TransportError::Timeout(Duration::from_secs(3));
        assert_eq!(timeout_err.to_string(), "Transport call timed out after 3s");

        let missing = TransportError::BackendMissing("xdotool".to_string());
        assert_eq!(missing.to_string(), "Backend program 'xdotool' is not installed");

        let busy = BridgeError::SessionBusy("session-1".to_string());
        assert_eq!(busy.to_string(), "Session session-1 is busy with another command");

        let non_responsive = BridgeError::NonResponsive {
            transport: TransportKind::Multiplexer,
        };
        assert_eq!(
            non_responsive.to_string(),
            "Transport tmux did not respond to a liveness probe"
        );
    }

    #[test]
    fn test_transport_error_conversion() {
        let err: BridgeError = TransportError::Unsupported("capture").into();
        assert!(matches!(
            err,
            BridgeError::Transport(TransportError::Unsupported("capture"))
        ));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gdb not found");
        let err: BridgeError = io_err.into();
        match err {
            BridgeError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            _ => panic!("Expected Io variant"),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(BridgeError::SessionBusy("s".into()).is_transient());
        assert!(BridgeError::Cancelled.is_transient());
        assert!(!BridgeError::all_failed(1, "x").is_transient());
    }
}
