//! Session bookkeeping shared by every request.
//!
//! Each session carries its own lock and in-flight flag, so work on one
//! session never waits on another. The registry map itself is only locked
//! for lookups and inserts, never across a transport call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::transport::{LocateHint, SessionLocator, TransportKind};
use crate::types::SessionSummary;

/// Consecutive failures on the active transport after which its cached
/// locator is dropped and re-resolved on the next command.
pub const EVICT_AFTER_FAILURES: u32 = 2;

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub process_id: Option<u32>,
    pub tty: Option<String>,
    /// Caller-supplied locator, kept for re-resolution.
    pub requested_locator: Option<String>,
    pub process_confirmed: bool,
    pub active_transport: Option<TransportKind>,
    pub locator: Option<SessionLocator>,
    pub blocked: bool,
    pub blocked_since: Option<Instant>,
    pub consecutive_failures: u32,
}

impl Session {
    pub fn new(session_id: String, hint: &LocateHint, located: SessionLocator) -> Self {
        Self {
            session_id,
            process_id: hint.process_id.or(located.process_id),
            tty: hint.tty.clone().or_else(|| located.tty.clone()),
            requested_locator: hint.locator.clone(),
            process_confirmed: hint.process_confirmed,
            active_transport: Some(located.kind),
            locator: Some(located),
            blocked: false,
            blocked_since: None,
            consecutive_failures: 0,
        }
    }

    /// Hint used when the cached locator has to be resolved again.
    pub fn hint(&self) -> LocateHint {
        LocateHint {
            process_id: self.process_id,
            tty: self.tty.clone(),
            locator: self.requested_locator.clone(),
            process_confirmed: self.process_confirmed,
        }
    }

    pub fn mark_blocked(&mut self, now: Instant) {
        self.blocked = true;
        self.blocked_since = Some(now);
    }

    pub fn clear_blocked(&mut self) {
        self.blocked = false;
        self.blocked_since = None;
    }

    /// Records a failure on `kind`. Returns true when the cached locator was
    /// evicted as a result.
    pub fn record_failure(&mut self, kind: TransportKind) -> bool {
        if self.active_transport != Some(kind) {
            return false;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= EVICT_AFTER_FAILURES && self.locator.is_some() {
            self.locator = None;
            return true;
        }
        false
    }

    pub fn record_success(&mut self, locator: SessionLocator) {
        self.active_transport = Some(locator.kind);
        if self.process_id.is_none() {
            self.process_id = locator.process_id;
        }
        if self.tty.is_none() {
            self.tty = locator.tty.clone();
        }
        self.locator = Some(locator);
        self.consecutive_failures = 0;
    }

    /// The cached locator, if it belongs to `kind`.
    pub fn locator_for(&self, kind: TransportKind) -> Option<SessionLocator> {
        self.locator.clone().filter(|l| l.kind == kind)
    }
}

#[derive(Debug)]
pub struct SessionEntry {
    session: Mutex<Session>,
    in_flight: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
}

impl SessionEntry {
    fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(session),
            in_flight: AtomicBool::new(false),
            cancel: Mutex::new(None),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> Session {
        self.lock().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Claims the session for one command. A second caller is rejected
    /// rather than queued.
    pub fn try_begin(self: &Arc<Self>, cancel: CancellationToken) -> Result<InFlightGuard, BridgeError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BridgeError::SessionBusy(self.lock().session_id.clone()));
        }
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(cancel);
        Ok(InFlightGuard {
            entry: Arc::clone(self),
        })
    }

    /// Cancels the in-flight command, if any.
    pub fn cancel(&self) -> bool {
        match self.cancel.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn summary(&self) -> SessionSummary {
        let session = self.lock();
        SessionSummary {
            session_id: session.session_id.clone(),
            process_id: session.process_id,
            tty: session.tty.clone(),
            transport: session.active_transport,
            locator: session.locator.as_ref().map(|l| l.target.clone()),
            blocked: session.blocked,
            busy: self.is_busy(),
            consecutive_failures: session.consecutive_failures,
        }
    }
}

/// Releases the in-flight flag when the command finishes, however it ends.
#[derive(Debug)]
pub struct InFlightGuard {
    entry: Arc<SessionEntry>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        *self.entry.cancel.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.entry.in_flight.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SessionEntry>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionEntry>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn next_session_id(&self) -> String {
        format!("session-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn insert(&self, session: Session) -> Arc<SessionEntry> {
        let id = session.session_id.clone();
        let entry = Arc::new(SessionEntry::new(session));
        self.sessions().insert(id, Arc::clone(&entry));
        entry
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<SessionEntry>, BridgeError> {
        self.sessions()
            .get(session_id)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownSession(session_id.to_string()))
    }

    /// An existing session for the same debugger, matched by process id or
    /// by the caller-supplied locator.
    pub fn find_matching(&self, hint: &LocateHint) -> Option<Arc<SessionEntry>> {
        if hint.is_empty() {
            return None;
        }
        self.sessions()
            .values()
            .find(|entry| {
                let session = entry.lock();
                match (hint.process_id, session.process_id) {
                    (Some(wanted), Some(have)) => wanted == have,
                    (Some(_), None) => false,
                    (None, _) => {
                        hint.locator.is_some() && hint.locator == session.requested_locator
                    }
                }
            })
            .cloned()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let entries: Vec<Arc<SessionEntry>> = self.sessions().values().cloned().collect();
        let mut summaries: Vec<SessionSummary> = entries.iter().map(|e| e.summary()).collect();
        summaries.sort_by_key(|s| {
            s.session_id
                .trim_start_matches("session-")
                .parse::<u64>()
                .unwrap_or(u64::MAX)
        });
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn located(kind: TransportKind) -> SessionLocator {
        SessionLocator::new(kind, "debug:0.0").with_process(Some(42), Some("pts/3".to_string()))
    }

    fn registry_with_session() -> (SessionRegistry, Arc<SessionEntry>) {
        let registry = SessionRegistry::new();
        let id = registry.next_session_id();
        let hint = LocateHint {
            process_id: Some(42),
            ..Default::default()
        };
        let entry = registry.insert(Session::new(id, &hint, located(TransportKind::Multiplexer)));
        (registry, entry)
    }

    #[test]
    fn session_ids_are_sequential() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.next_session_id(), "session-1");
        assert_eq!(registry.next_session_id(), "session-2");
    }

    #[test]
    fn hint_keeps_process_confirmation() {
        let hint = LocateHint {
            process_id: Some(42),
            tty: Some("pts/3".to_string()),
            process_confirmed: true,
            ..Default::default()
        };
        let session = Session::new("session-1".to_string(), &hint, located(TransportKind::Keystroke));
        assert!(session.hint().process_confirmed);

        let (_registry, entry) = registry_with_session();
        assert!(!entry.snapshot().hint().process_confirmed);
    }

    #[test]
    fn second_begin_is_rejected_until_guard_drops() {
        let (_registry, entry) = registry_with_session();

        let guard = entry.try_begin(CancellationToken::new()).expect("first claim succeeds");
        let err = entry.try_begin(CancellationToken::new()).expect_err("second claim must fail");
        assert!(matches!(err, BridgeError::SessionBusy(id) if id == "session-1"));
        assert!(entry.is_busy());

        drop(guard);
        assert!(!entry.is_busy());
        entry.try_begin(CancellationToken::new()).expect("claim after release succeeds");
    }

    #[test]
    fn cancel_reaches_in_flight_token_only() {
        let (_registry, entry) = registry_with_session();
        assert!(!entry.cancel());

        let token = CancellationToken::new();
        let guard = entry.try_begin(token.clone()).expect("claim succeeds");
        assert!(entry.cancel());
        assert!(token.is_cancelled());

        drop(guard);
        assert!(!entry.cancel());
    }

    #[test]
    fn locator_is_evicted_after_repeated_failures() {
        let (_registry, entry) = registry_with_session();
        let mut session = entry.lock();

        assert!(!session.record_failure(TransportKind::DirectPipe));
        assert_eq!(session.consecutive_failures, 0);

        assert!(!session.record_failure(TransportKind::Multiplexer));
        assert!(session.locator.is_some());
        assert!(session.record_failure(TransportKind::Multiplexer));
        assert!(session.locator.is_none());

        session.record_success(located(TransportKind::DirectPipe));
        assert_eq!(session.consecutive_failures, 0);
        assert_eq!(session.active_transport, Some(TransportKind::DirectPipe));
    }

    #[test]
    fn find_matching_by_process_id_or_locator() {
        let (registry, _entry) = registry_with_session();

        let same_pid = LocateHint {
            process_id: Some(42),
            ..Default::default()
        };
        assert!(registry.find_matching(&same_pid).is_some());

        let other_pid = LocateHint {
            process_id: Some(7),
            ..Default::default()
        };
        assert!(registry.find_matching(&other_pid).is_none());
        assert!(registry.find_matching(&LocateHint::default()).is_none());
    }

    #[test]
    fn unknown_session_lookup_fails() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.get("session-9"),
            Err(BridgeError::UnknownSession(id)) if id == "session-9"
        ));
    }
}
