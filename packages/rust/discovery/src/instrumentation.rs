//! Discovery telemetry: scoped attempts collected into sealed sessions.
//!
//! Every tracked operation produces exactly one [`DiscoveryAttempt`], emitted
//! from [`ScopedAttempt`]'s `Drop`. Calling `succeed` or `fail` only sets the
//! outcome; a guard dropped without one (early `?` return, panic, or a
//! cancelled future) is recorded as a failure.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use genpipe_shared::{
    AttemptErrorKind, DiscoveryAttempt, DiscoverySession, GenPipeError, HintType, SessionId,
};

#[derive(Debug)]
struct ActiveSession {
    id: SessionId,
    started_at: DateTime<Utc>,
    attempts: Vec<DiscoveryAttempt>,
}

impl ActiveSession {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            attempts: Vec::new(),
        }
    }
}

/// Handle to a per-session attempt collector. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryTracker {
    active: Arc<Mutex<Option<ActiveSession>>>,
}

impl DiscoveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        // A panic inside a tracked scope must not lose the attempts already recorded.
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start collecting attempts. If a session is already active its id is
    /// returned and no new session is opened.
    pub fn start_session(&self, id: Option<SessionId>) -> SessionId {
        let mut active = self.lock();
        if let Some(current) = active.as_ref() {
            if id.as_ref().is_some_and(|requested| requested != &current.id) {
                warn!(
                    active = %current.id,
                    "discovery session already active, ignoring requested id"
                );
            }
            return current.id.clone();
        }

        let id = id.unwrap_or_default();
        info!(session = %id, "discovery session started");
        *active = Some(ActiveSession::new(id.clone()));
        id
    }

    /// Id of the active session, if any.
    pub fn active_session(&self) -> Option<SessionId> {
        self.lock().as_ref().map(|s| s.id.clone())
    }

    /// Open a scoped attempt. The attempt is recorded when the guard drops.
    pub fn track(
        &self,
        method: impl Into<String>,
        query: impl Into<String>,
        hint: Option<&str>,
    ) -> ScopedAttempt {
        ScopedAttempt {
            tracker: self.clone(),
            method: method.into(),
            query: query.into(),
            hint: hint.map(String::from),
            started: Instant::now(),
            searched_locations: Vec::new(),
            expected_location: None,
            actual_location: None,
            result_count: 0,
            outcome: None,
        }
    }

    /// Seal the active session and return it. With no active session an
    /// empty sealed session is returned.
    pub fn end_session(&self) -> DiscoverySession {
        let finished = self.lock().take();
        let session = match finished {
            Some(s) => DiscoverySession::seal(s.id, s.started_at, s.attempts),
            None => {
                debug!("end_session with no active session, sealing empty session");
                DiscoverySession::seal(SessionId::new(), Utc::now(), Vec::new())
            }
        };

        let agg = session.aggregates();
        info!(
            session = %session.id(),
            attempts = agg.total_attempts,
            failed = agg.failed_attempts,
            success_rate = agg.success_rate,
            "discovery session sealed"
        );
        session
    }

    fn record(&self, attempt: DiscoveryAttempt) {
        let mut active = self.lock();
        let session = active.get_or_insert_with(|| {
            let id = SessionId::new();
            debug!(session = %id, "attempt recorded without a session, auto-starting one");
            ActiveSession::new(id)
        });
        session.attempts.push(attempt);
    }
}

#[derive(Debug)]
enum Outcome {
    Success,
    Failure {
        kind: AttemptErrorKind,
        message: String,
    },
}

/// Guard for one tracked operation.
#[derive(Debug)]
#[must_use = "an attempt is recorded when the guard is dropped"]
pub struct ScopedAttempt {
    tracker: DiscoveryTracker,
    method: String,
    query: String,
    hint: Option<String>,
    started: Instant,
    searched_locations: Vec<String>,
    expected_location: Option<String>,
    actual_location: Option<String>,
    result_count: usize,
    outcome: Option<Outcome>,
}

impl ScopedAttempt {
    /// Note a location that was searched.
    pub fn searched(&mut self, location: impl Into<String>) {
        self.searched_locations.push(location.into());
    }

    pub fn expect_location(&mut self, location: impl Into<String>) {
        self.expected_location = Some(location.into());
    }

    pub fn found_location(&mut self, location: impl Into<String>) {
        self.actual_location = Some(location.into());
    }

    /// Record success. The attempt is emitted immediately.
    pub fn succeed(mut self, result_count: usize) {
        self.result_count = result_count;
        self.outcome = Some(Outcome::Success);
    }

    /// Record failure. The attempt is emitted immediately.
    pub fn fail(mut self, kind: AttemptErrorKind, message: impl Into<String>) {
        self.outcome = Some(Outcome::Failure {
            kind,
            message: message.into(),
        });
    }

    /// Record failure from a pipeline error.
    pub fn fail_with(self, err: &GenPipeError) {
        self.fail(error_kind_for(err), err.to_string());
    }
}

impl Drop for ScopedAttempt {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            if std::thread::panicking() {
                Outcome::Failure {
                    kind: AttemptErrorKind::Panic,
                    message: "panicked inside tracked scope".into(),
                }
            } else {
                Outcome::Failure {
                    kind: AttemptErrorKind::Abandoned,
                    message: "scope exited without an outcome".into(),
                }
            }
        });

        let (success, error_kind, error_message) = match outcome {
            Outcome::Success => (true, None, None),
            Outcome::Failure { kind, message } => (false, Some(kind), Some(message)),
        };

        let missing_hint_type = HintType::derive(
            error_kind.as_ref(),
            self.expected_location.as_deref(),
            self.actual_location.as_deref(),
            self.searched_locations.len(),
        );

        let attempt = DiscoveryAttempt {
            method: std::mem::take(&mut self.method),
            query: std::mem::take(&mut self.query),
            hint: self.hint.take(),
            success,
            duration_ms: self.started.elapsed().as_millis() as u64,
            searched_locations: std::mem::take(&mut self.searched_locations),
            expected_location: self.expected_location.take(),
            actual_location: self.actual_location.take(),
            error_kind,
            error_message,
            result_count: self.result_count,
            missing_hint_type,
            recorded_at: Utc::now(),
        };

        debug!(
            method = %attempt.method,
            success = attempt.success,
            duration_ms = attempt.duration_ms,
            hint = %attempt.missing_hint_type,
            "discovery attempt recorded"
        );
        self.tracker.record(attempt);
    }
}

/// Map a pipeline error onto the attempt taxonomy.
pub fn error_kind_for(err: &GenPipeError) -> AttemptErrorKind {
    match err {
        GenPipeError::Timeout { .. } => AttemptErrorKind::Timeout,
        GenPipeError::Protocol { .. } | GenPipeError::Network(_) => AttemptErrorKind::Protocol,
        GenPipeError::Validation { .. } | GenPipeError::Parse { .. } => {
            AttemptErrorKind::PatternMismatch
        }
        other => AttemptErrorKind::Other(other.to_string()),
    }
}
