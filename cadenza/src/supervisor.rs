//! Per-session stream supervision.
//!
//! At most one stream may be in flight per session id. The guard handed
//! out by [`StreamSupervisor::begin`] carries the cancellation token the
//! turn loop selects on, and removes the session entry when dropped, so
//! a panicking or early-returning turn never wedges its session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use config::{StreamPolicy, TurnOptions};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::TurnError;

static NEXT_STREAM: AtomicU64 = AtomicU64::new(1);

struct ActiveStream {
    id: u64,
    token: CancellationToken,
}

/// Tracks in-flight streams and enforces the concurrency policy.
pub struct StreamSupervisor {
    active: Arc<DashMap<String, ActiveStream>>,
    policy: StreamPolicy,
    idle_timeout: Duration,
    turn_timeout: Duration,
}

impl StreamSupervisor {
    pub fn new(options: &TurnOptions) -> Self {
        Self {
            active: Arc::new(DashMap::new()),
            policy: options.stream_policy,
            idle_timeout: Duration::from_millis(options.idle_timeout_ms),
            turn_timeout: Duration::from_millis(options.turn_timeout_ms),
        }
    }

    /// Claim the session for a new stream.
    pub fn begin(&self, session_id: &str) -> Result<StreamGuard, TurnError> {
        let id = NEXT_STREAM.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        use dashmap::mapref::entry::Entry;

        match self.active.entry(session_id.to_string()) {
            Entry::Occupied(mut entry) => match self.policy {
                StreamPolicy::Reject => {
                    return Err(TurnError::StreamInProgress(session_id.to_string()));
                }
                StreamPolicy::CancelPrevious => {
                    log::debug!("Cancelling previous stream for session {session_id}");
                    entry.get().token.cancel();
                    entry.insert(ActiveStream {
                        id,
                        token: token.clone(),
                    });
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(ActiveStream {
                    id,
                    token: token.clone(),
                });
            }
        }

        Ok(StreamGuard {
            active: self.active.clone(),
            session_id: session_id.to_string(),
            id,
            token,
            idle_timeout: self.idle_timeout,
            turn_timeout: self.turn_timeout,
        })
    }

    /// Cancel the in-flight stream for a session, if any.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.active.get(session_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of sessions with an in-flight stream.
    pub fn in_flight(&self) -> usize {
        self.active.len()
    }
}

/// Ownership of a session's stream slot.
pub struct StreamGuard {
    active: Arc<DashMap<String, ActiveStream>>,
    session_id: String,
    id: u64,
    token: CancellationToken,
    idle_timeout: Duration,
    turn_timeout: Duration,
}

impl StreamGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn turn_timeout(&self) -> Duration {
        self.turn_timeout
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        // Only remove the entry if it is still ours; a CancelPrevious
        // replacement may already own the slot.
        self.active
            .remove_if(&self.session_id, |_, stream| stream.id == self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(policy: StreamPolicy) -> TurnOptions {
        TurnOptions {
            stream_policy: policy,
            ..TurnOptions::default()
        }
    }

    #[test]
    fn reject_policy_blocks_the_second_stream() {
        let supervisor = StreamSupervisor::new(&options(StreamPolicy::Reject));

        let guard = supervisor.begin("session-a").unwrap();
        assert!(matches!(
            supervisor.begin("session-a"),
            Err(TurnError::StreamInProgress(_))
        ));

        // Other sessions are unaffected.
        let other = supervisor.begin("session-b").unwrap();
        assert_eq!(supervisor.in_flight(), 2);

        drop(guard);
        drop(other);
        assert_eq!(supervisor.in_flight(), 0);
    }

    #[test]
    fn dropping_the_guard_frees_the_session() {
        let supervisor = StreamSupervisor::new(&options(StreamPolicy::Reject));

        let guard = supervisor.begin("session-a").unwrap();
        drop(guard);

        assert!(supervisor.begin("session-a").is_ok());
    }

    #[test]
    fn cancel_previous_policy_cancels_and_replaces() {
        let supervisor = StreamSupervisor::new(&options(StreamPolicy::CancelPrevious));

        let first = supervisor.begin("session-a").unwrap();
        let second = supervisor.begin("session-a").unwrap();

        assert!(first.token().is_cancelled());
        assert!(!second.token().is_cancelled());

        // The stale guard's drop must not evict the replacement.
        drop(first);
        assert_eq!(supervisor.in_flight(), 1);
        drop(second);
        assert_eq!(supervisor.in_flight(), 0);
    }

    #[test]
    fn cancel_reaches_the_active_guard() {
        let supervisor = StreamSupervisor::new(&options(StreamPolicy::Reject));

        let guard = supervisor.begin("session-a").unwrap();
        assert!(supervisor.cancel("session-a"));
        assert!(guard.token().is_cancelled());
        assert!(!supervisor.cancel("session-missing"));
    }
}
