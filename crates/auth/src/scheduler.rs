//! Background token refresh.
//!
//! One job per `(provider, session_name)`: scheduling the same key again
//! replaces the previous job. The refresh fires at 80% of the token's
//! lifetime, with a five-minute safety margin and a 24-hour lookahead
//! cap; tokens without a known expiry refresh after 45 minutes. Workers
//! retry up to five times with exponential backoff and stop permanently
//! when the provider rejects the refresh token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use config::ProviderKind;
use jiff::Timestamp;
use tokio::task::JoinHandle;

use crate::oauth::OauthEngine;

/// Safety margin floor: never refresh closer than this to expiry.
const MIN_MARGIN: Duration = Duration::from_secs(5 * 60);
/// Never sleep further out than this; long-lived tokens get revisited.
const MAX_LOOKAHEAD: Duration = Duration::from_secs(24 * 60 * 60);
/// Tokens with no expiry hint refresh on this cadence.
const DEFAULT_DELAY: Duration = Duration::from_secs(45 * 60);

const MAX_ATTEMPTS: u32 = 5;

/// When to refresh a token that expires at `expires_at`, seen from `now`.
///
/// `refresh_at = expires_at - max(0.2 * lifetime, 5 min)`, clamped into
/// `[now, now + 24h]`.
pub fn compute_refresh_delay(now: Timestamp, expires_at: Option<Timestamp>) -> Duration {
    let Some(expires_at) = expires_at else {
        return DEFAULT_DELAY;
    };

    let lifetime = expires_at.as_second().saturating_sub(now.as_second());
    if lifetime <= 0 {
        return Duration::ZERO;
    }

    let margin = std::cmp::max(Duration::from_secs(lifetime as u64 / 5), MIN_MARGIN);
    let delay = Duration::from_secs(lifetime as u64).saturating_sub(margin);

    std::cmp::min(delay, MAX_LOOKAHEAD)
}

type JobKey = (ProviderKind, String);

/// Schedules and runs refresh jobs on the tokio runtime.
pub struct RefreshScheduler {
    engine: Arc<OauthEngine>,
    jobs: Arc<Mutex<HashMap<JobKey, JoinHandle<()>>>>,
}

impl RefreshScheduler {
    pub fn new(engine: Arc<OauthEngine>) -> Self {
        Self {
            engine,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedule (or reschedule) the refresh job for a session.
    pub fn schedule(&self, provider: ProviderKind, session_name: &str, expires_at: Option<Timestamp>) {
        let delay = compute_refresh_delay(Timestamp::now(), expires_at);
        self.schedule_after(provider, session_name, delay);
    }

    fn schedule_after(&self, provider: ProviderKind, session_name: &str, delay: Duration) {
        let engine = self.engine.clone();
        let jobs = self.jobs.clone();
        let name = session_name.to_string();

        log::debug!("Scheduling refresh for {provider}/{name} in {delay:?}");

        let job_key = (provider, session_name.to_string());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            run_refresh(engine, jobs, provider, name).await;
        });

        let mut jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = jobs.insert(job_key, handle) {
            previous.abort();
        }
    }

    /// Drop the job for a session (after `delete_session`).
    pub fn cancel(&self, provider: ProviderKind, session_name: &str) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = jobs.remove(&(provider, session_name.to_string())) {
            handle.abort();
        }
    }

    /// Abort every outstanding job.
    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, handle) in jobs.drain() {
            handle.abort();
        }
    }

    /// Number of live jobs (for tests and introspection).
    pub fn job_count(&self) -> usize {
        let mut jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.retain(|_, handle| !handle.is_finished());
        jobs.len()
    }
}

async fn run_refresh(
    engine: Arc<OauthEngine>,
    jobs: Arc<Mutex<HashMap<JobKey, JoinHandle<()>>>>,
    provider: ProviderKind,
    session_name: String,
) {
    let mut backoff = Duration::from_secs(1);

    for attempt in 1..=MAX_ATTEMPTS {
        match engine.refresh(provider, &session_name).await {
            Ok(tokens) => {
                log::info!("Refreshed tokens for {provider}/{session_name}");

                // Chain the next refresh from the rotated expiry.
                let delay = compute_refresh_delay(Timestamp::now(), tokens.expires_at);
                let scheduler = RefreshScheduler { engine, jobs };
                scheduler.schedule_after(provider, &session_name, delay);
                return;
            }
            Err(crate::AuthError::InvalidRefreshToken) => {
                // The engine already marked the record; nothing to retry.
                log::warn!("Refresh token for {provider}/{session_name} rejected; giving up");
                return;
            }
            Err(e) => {
                log::warn!(
                    "Refresh attempt {attempt}/{MAX_ATTEMPTS} for {provider}/{session_name} failed: {e}"
                );
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    log::error!("Giving up on refresh for {provider}/{session_name} after {MAX_ATTEMPTS} attempts");
}
